//! Wire protocol between the server and client replicas.

pub mod error;
pub mod messages;
pub mod transport;

pub use error::Error;
pub use messages::{ChangeRecord, ClientMessage, CloseCode, Operation, Sequence, ServerMessage};
pub use transport::{ChannelTransport, Transport, WebSocketTransport};
