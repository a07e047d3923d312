pub mod address;
pub mod api;
pub mod events;
pub mod models;

pub use address::{Address, MessageHandle};
