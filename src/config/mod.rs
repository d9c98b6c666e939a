//! Relay configuration: serde schema plus a JSON file loader

mod schema;
mod store;

pub use schema::{AppConfig, HubConfig, SourceConfig, WebConfig};
pub use store::ConfigStore;
