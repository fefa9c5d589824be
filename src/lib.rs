pub mod config;
pub mod error;
pub mod relay;
pub mod stats;

pub mod firehose;
pub mod kafka;
pub mod nozzle;

pub use config::Config;
pub use error::{Error, Result};
pub use nozzle::NozzleProducer;
pub use relay::Relay;
