mod config;
mod forwarder;
mod server;
mod store;

pub use config::{load_models, Config};
pub use forwarder::{Fanout, Forwarder};
pub use server::Broker;
pub use store::{JsonlStore, MessageStore};
