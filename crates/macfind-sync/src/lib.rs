//! Client-side sync for MacFind: unread notifications and chat threads kept
//! consistent across polling and the realtime change feed.

pub mod backend;
pub mod error;
#[cfg(any(test, feature = "local"))]
pub mod local;
pub mod remote;
pub mod thread;
pub mod unread;

pub use backend::{ChangeFeed, MessageStore, Subscription};
pub use error::SyncError;
#[cfg(any(test, feature = "local"))]
pub use local::LocalBackend;
pub use remote::RemoteBackend;
pub use thread::ThreadSession;
pub use unread::{UnreadSet, UnreadTracker};
