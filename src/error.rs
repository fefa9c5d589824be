//! Error types and result handling for the nozzle.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate. Per-record delivery
//! failures are reported separately as
//! [`DeliveryError`](crate::kafka::DeliveryError), which wraps an [`Error`]
//! together with the record that could not be delivered.
//!
//! # Example
//!
//! ```rust
//! use kafka_firehose_nozzle::{Error, Result};
//!
//! fn check_brokers(brokers: &[String]) -> Result<()> {
//!     if brokers.is_empty() {
//!         return Err(Error::NoBrokers);
//!     }
//!     Ok(())
//! }
//!
//! match check_brokers(&[]) {
//!     Ok(()) => println!("Brokers configured"),
//!     Err(Error::NoBrokers) => eprintln!("No brokers"),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for nozzle operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The Kafka configuration does not name a single broker.
    #[error("brokers are not provided")]
    NoBrokers,

    /// Kafka client or producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error when encoding or decoding envelopes.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from reading the upstream event source.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The brokers could not be reached while constructing the producer.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A record was handed to the broker client but never acknowledged.
    #[error("Delivery error: {message}")]
    Delivery {
        /// Description of what happened to the record
        message: String,
    },

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },
}

/// A convenient Result type alias for nozzle operations.
///
/// This is equivalent to `std::result::Result<T, kafka_firehose_nozzle::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

