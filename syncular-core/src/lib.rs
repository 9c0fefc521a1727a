pub mod dialect;
pub mod errors;
pub mod handler;
pub mod models;
pub mod plugin;
pub mod protocol;
pub mod snapshot;

pub use errors::{SyncError, SyncResult};
pub use models::*;
pub use protocol::*;
