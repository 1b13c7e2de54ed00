//! Typed messages. Type names are fixed wire strings; unknown
//! fields are ignored on read and never produced on write.

pub mod change;
pub mod client;
pub mod server;

pub use change::{ChangeRecord, Operation};
pub use client::ClientMessage;
pub use server::{CloseCode, Sequence, ServerMessage};
