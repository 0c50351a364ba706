use std::sync::Arc;

use macfind_db::{Database, StoreError};
use macfind_gateway::dispatcher::Dispatcher;
use macfind_types::api::Claims;
use tracing::info;

use crate::error::ApiError;
use crate::storage::Storage;
use crate::vision::VisionClient;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Database,
    pub dispatcher: Dispatcher,
    pub storage: Storage,
    /// `None` when no vision API key is configured.
    pub vision: Option<Arc<dyn VisionClient>>,
    pub jwt_secret: String,
    /// Base URL of the web client, used for magic links.
    pub site_url: String,
    /// Only addresses in this domain may sign in.
    pub email_domain: String,
}

/// Run a store call off the async runtime.
pub async fn db_call<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> macfind_db::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    let result = tokio::task::spawn_blocking(move || f(&state.db)).await?;
    Ok(result?)
}

/// Like [`db_call`], but a write that trips over a missing profile row
/// creates the row for the caller and is retried once.
pub async fn db_call_as_user<T, F>(state: &AppState, claims: &Claims, f: F) -> Result<T, ApiError>
where
    F: Fn(&Database) -> macfind_db::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    let user_id = claims.sub;
    let email = claims.email.clone();

    let result = tokio::task::spawn_blocking(move || match f(&state.db) {
        Err(StoreError::MissingUser(missing)) if missing == user_id => {
            info!("Creating missing profile row for {} and retrying", user_id);
            state.db.ensure_user(user_id, &email, None)?;
            f(&state.db)
        }
        other => other,
    })
    .await?;
    Ok(result?)
}
