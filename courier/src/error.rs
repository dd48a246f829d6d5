//! Crate-wide error types.

use serde_json::Value;
use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Channel '{channel}' is not configured")]
    ChannelNotConfigured { channel: String },

    #[error("Channel '{channel}' is already loaded; unregister it before registering again")]
    ChannelAlreadyLoaded { channel: String },

    #[error(
        "Channel '{channel}' requires routing information; add a '{channel}' route to the notifiable"
    )]
    MissingRoutingInformation { channel: String },

    #[error("Channel '{channel}' is missing required credential: {credential}")]
    MissingCredential { channel: String, credential: String },

    #[error("{message}")]
    ServiceRespondedWithError {
        channel: String,
        message: String,
        response: Value,
    },

    #[error("Invalid notification payload: {0}")]
    InvalidPayload(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn channel_not_configured(channel: impl Into<String>) -> Self {
        Self::ChannelNotConfigured {
            channel: channel.into(),
        }
    }

    pub fn missing_routing(channel: impl Into<String>) -> Self {
        Self::MissingRoutingInformation {
            channel: channel.into(),
        }
    }

    pub fn missing_credential(channel: impl Into<String>, credential: impl Into<String>) -> Self {
        Self::MissingCredential {
            channel: channel.into(),
            credential: credential.into(),
        }
    }

    /// Remote service error carrying the raw response for diagnostics.
    pub fn service_error(channel: impl Into<String>, response: Value) -> Self {
        let channel = channel.into();
        Self::ServiceRespondedWithError {
            message: format!("Channel '{}' service responded with an error", channel),
            channel,
            response,
        }
    }

    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Channel name attached to channel-level errors.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::ChannelNotConfigured { channel }
            | Self::ChannelAlreadyLoaded { channel }
            | Self::MissingRoutingInformation { channel }
            | Self::MissingCredential { channel, .. }
            | Self::ServiceRespondedWithError { channel, .. } => Some(channel),
            _ => None,
        }
    }

    /// Raw remote response, only present on `ServiceRespondedWithError`.
    pub fn response(&self) -> Option<&Value> {
        match self {
            Self::ServiceRespondedWithError { response, .. } => Some(response),
            _ => None,
        }
    }

    /// Errors that will never succeed on retry.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::InvalidPayload(_) | Self::InvalidArgument(_))
    }
}
