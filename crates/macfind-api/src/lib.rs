pub mod auth;
pub mod error;
pub mod items;
pub mod messages;
pub mod middleware;
pub mod state;
pub mod storage;
pub mod upload;
pub mod vision;

pub use error::ApiError;
pub use state::{AppState, AppStateInner};
