pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod merge;
pub mod model;
pub mod server;
pub mod session;
pub mod store;

pub use client::PulseClient;
pub use config::Config;
pub use error::{PulseError, Result};
pub use model::Event;
pub use store::EventStore;
