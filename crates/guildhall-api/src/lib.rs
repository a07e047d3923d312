pub mod auth;
pub mod error;
pub mod events;
pub mod middleware;
pub mod polls;
pub mod reminders;
pub mod routes;
pub mod treasures;
pub mod wallet;

pub use auth::{AppState, AppStateInner};
pub use routes::router;
