//! Everything that faces connected client replicas.

pub mod batch;
pub mod dispatcher;
pub mod error;
pub mod listener;
pub mod session;

pub use dispatcher::{Dispatcher, DispatcherOptions, SessionHandle, SessionInbound};
pub use error::Error;
pub use listener::Listener;
pub use session::Session;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backend::cursors::CursorStore;
use crate::backend::history::ChangeStore;
use crate::backend::tracker::ChangeTracker;

/// Process-lifetime context handed to the ingestor, the
/// dispatcher and every session at startup.
#[derive(Clone)]
pub struct Context {
    pub history: Arc<dyn ChangeStore>,
    pub cursors: Arc<dyn CursorStore>,
    pub tracker: Arc<ChangeTracker>,
    pub dispatcher: Dispatcher,
    pub shutdown: CancellationToken,
}
