pub mod clock;
pub mod context;
pub mod error;
pub mod matchmaking;
mod notify;
pub mod polls;
pub mod reminders;
pub mod retry;
pub mod sink;
mod tasks;
pub mod treasure;
pub mod wallet;

use std::sync::Arc;

use guildhall_db::Database;

pub use context::{EngineConfig, Engines};
pub use error::{Error, ErrorKind, Result};

/// Run a synchronous store call off the async workers.
pub(crate) async fn blocking<F, T>(db: &Arc<Database>, f: F) -> Result<T>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    Ok(tokio::task::spawn_blocking(move || f(&db)).await??)
}

/// Non-empty, trimmed text of at most `max` characters.
pub(crate) fn required_text(field: &str, value: &str, max: usize) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::invalid(format!("{} must not be empty", field)));
    }
    if value.chars().count() > max {
        return Err(Error::invalid(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(value.to_string())
}
