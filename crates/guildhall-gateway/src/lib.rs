pub mod connection;
pub mod dispatcher;
pub mod sink;
pub mod webhook;

pub use dispatcher::Dispatcher;
pub use sink::GatewaySink;
pub use webhook::WebhookSink;
