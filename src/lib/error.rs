//! ## Server Error Module
//!
//! Defines the custom error types used throughout the stratum server.
//!
//! This module centralizes error handling by providing a primary
//! [`SserverError`] enum encompassing error kinds from different sources
//! (I/O, config, Kafka, HTTP, channels) and the `From` conversions that let
//! the rest of the code propagate them with `?`.

use std::{fmt, sync::PoisonError};
use tokio::sync::broadcast;

pub type SserverResult<T> = core::result::Result<T, SserverError>;

#[derive(Debug)]
pub enum SserverError {
    /// Errors on bad CLI argument input.
    BadCliArgs(String),
    /// Errors on bad `toml` config deserialize.
    BadConfigToml(toml::de::Error),
    /// Errors on an invalid or incomplete configuration value.
    Config(String),
    /// Errors on bad `serde_json` serialize/deserialize.
    BadSerdeJson(serde_json::Error),
    /// Errors on bad `TcpStream` connection.
    Io(std::io::Error),
    /// Errors on bad `String` to `int` conversion.
    ParseInt(std::num::ParseIntError),
    /// Errors from the Kafka client.
    Kafka(rdkafka::error::KafkaError),
    /// Errors from the user-list HTTP API.
    Http(reqwest::Error),
    /// Errors from the ZooKeeper client during server-id acquisition.
    Zookeeper(zookeeper::ZkError),
    /// Errors loading the TLS certificate or key.
    Tls(tokio_rustls::rustls::Error),
    /// Errors registering or rendering Prometheus metrics.
    Metrics(prometheus::Error),
    /// A job payload that could not be decoded.
    JobDecode(String),
    /// The session-id bitset has no free slot.
    SessionIdsExhausted,
    // Locking errors
    PoisonLock,
    // Channel receiver errors
    ChannelErrorReceiver(async_channel::RecvError),
    ChannelErrorSender,
    TokioChannelErrorRecv(broadcast::error::RecvError),
    Shutdown,
    General(String),
}

impl fmt::Display for SserverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SserverError::*;
        match self {
            BadCliArgs(ref m) => write!(f, "Bad CLI arg input: {}", m),
            BadConfigToml(ref e) => write!(f, "Bad `toml` config deserialize: `{}`", e),
            Config(ref m) => write!(f, "Config error: {}", m),
            BadSerdeJson(ref e) => write!(f, "Bad serde json: `{:?}`", e),
            Io(ref e) => write!(f, "I/O error: `{:?}`", e),
            ParseInt(ref e) => write!(f, "Bad convert from `String` to `int`: `{:?}`", e),
            Kafka(ref e) => write!(f, "Kafka error: `{:?}`", e),
            Http(ref e) => write!(f, "HTTP error: `{:?}`", e),
            Zookeeper(ref e) => write!(f, "ZooKeeper error: `{:?}`", e),
            Tls(ref e) => write!(f, "TLS error: `{:?}`", e),
            Metrics(ref e) => write!(f, "Metrics error: `{:?}`", e),
            JobDecode(ref m) => write!(f, "Job decode error: {}", m),
            SessionIdsExhausted => write!(f, "Session ids exhausted"),
            PoisonLock => write!(f, "Poison Lock error"),
            ChannelErrorReceiver(ref e) => write!(f, "Channel receive error: `{:?}`", e),
            ChannelErrorSender => write!(f, "Channel send error"),
            TokioChannelErrorRecv(ref e) => write!(f, "Channel receive error: `{:?}`", e),
            Shutdown => write!(f, "Shutdown signal"),
            General(ref m) => write!(f, "{}", m),
        }
    }
}

impl From<toml::de::Error> for SserverError {
    fn from(e: toml::de::Error) -> Self {
        SserverError::BadConfigToml(e)
    }
}

impl From<serde_json::Error> for SserverError {
    fn from(e: serde_json::Error) -> Self {
        SserverError::BadSerdeJson(e)
    }
}

impl From<std::io::Error> for SserverError {
    fn from(e: std::io::Error) -> Self {
        SserverError::Io(e)
    }
}

impl From<std::num::ParseIntError> for SserverError {
    fn from(e: std::num::ParseIntError) -> Self {
        SserverError::ParseInt(e)
    }
}

impl From<rdkafka::error::KafkaError> for SserverError {
    fn from(e: rdkafka::error::KafkaError) -> Self {
        SserverError::Kafka(e)
    }
}

impl From<reqwest::Error> for SserverError {
    fn from(e: reqwest::Error) -> Self {
        SserverError::Http(e)
    }
}

impl From<zookeeper::ZkError> for SserverError {
    fn from(e: zookeeper::ZkError) -> Self {
        SserverError::Zookeeper(e)
    }
}

impl From<tokio_rustls::rustls::Error> for SserverError {
    fn from(e: tokio_rustls::rustls::Error) -> Self {
        SserverError::Tls(e)
    }
}

impl From<prometheus::Error> for SserverError {
    fn from(e: prometheus::Error) -> Self {
        SserverError::Metrics(e)
    }
}

impl From<async_channel::RecvError> for SserverError {
    fn from(e: async_channel::RecvError) -> Self {
        SserverError::ChannelErrorReceiver(e)
    }
}

impl From<broadcast::error::RecvError> for SserverError {
    fn from(e: broadcast::error::RecvError) -> Self {
        SserverError::TokioChannelErrorRecv(e)
    }
}

impl<T> From<async_channel::SendError<T>> for SserverError {
    fn from(_: async_channel::SendError<T>) -> Self {
        SserverError::ChannelErrorSender
    }
}

impl<T> From<PoisonError<T>> for SserverError {
    fn from(_: PoisonError<T>) -> Self {
        SserverError::PoisonLock
    }
}
