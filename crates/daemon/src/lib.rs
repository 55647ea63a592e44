pub mod allocator;
pub mod api;
pub mod config;
pub mod db;
pub mod dns;
pub mod error;
pub mod gc;
pub mod keys;
pub mod notify;
pub mod orchestrator;
pub mod platform;
pub mod routing;

pub use error::BrokerError;
pub use orchestrator::Broker;
