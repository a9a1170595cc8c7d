//! Event types broadcast to engine subscribers.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a GUI or IPC
//! layer can forward them over whatever event bus it uses.

pub mod events;
