//! Shared error type used across all Synapse Hub crates.
//!
//! Every failure the hub can surface maps onto a fixed taxonomy of error
//! codes. Internal layers construct variants; only the HTTP edge turns
//! them into status codes and response bodies.

use serde::Serialize;

/// Machine-readable error code, serialized into API error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    #[serde(rename = "AUTHENTICATION_ERROR")]
    Authentication,
    #[serde(rename = "AUTHORIZATION_ERROR")]
    Authorization,
    #[serde(rename = "NOT_FOUND")]
    NotFound,
    #[serde(rename = "DUPLICATE_RESOURCE")]
    Duplicate,
    #[serde(rename = "BUSINESS_LOGIC_ERROR")]
    BusinessLogic,
    #[serde(rename = "RATE_LIMIT_EXCEEDED")]
    RateLimit,
    #[serde(rename = "EXTERNAL_SERVICE_ERROR")]
    ExternalService,
    #[serde(rename = "DATABASE_ERROR")]
    Database,
    #[serde(rename = "CONFIGURATION_ERROR")]
    Configuration,
    #[serde(rename = "INTERNAL_ERROR")]
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Authentication => "AUTHENTICATION_ERROR",
            Self::Authorization => "AUTHORIZATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Duplicate => "DUPLICATE_RESOURCE",
            Self::BusinessLogic => "BUSINESS_LOGIC_ERROR",
            Self::RateLimit => "RATE_LIMIT_EXCEEDED",
            Self::ExternalService => "EXTERNAL_SERVICE_ERROR",
            Self::Database => "DATABASE_ERROR",
            Self::Configuration => "CONFIGURATION_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("insufficient permissions: {0}")]
    Authorization(String),

    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },

    #[error("{0}")]
    Duplicate(String),

    #[error("{0}")]
    BusinessLogic(String),

    #[error("rate limit exceeded")]
    RateLimit { retry_after_secs: u64 },

    #[error("{service}: {message}")]
    ExternalService {
        service: &'static str,
        message: String,
    },

    #[error("database: {0}")]
    Database(String),

    #[error("config: {0}")]
    Configuration(String),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a [`Error::NotFound`] with the given resource kind.
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }

    /// Shorthand for a [`Error::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Illegal state-machine move. Never retried; surfaced as business logic.
    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::BusinessLogic(message.into())
    }

    /// External dependency failure after the retry budget is exhausted.
    pub fn external(service: &'static str, message: impl Into<String>) -> Self {
        Self::ExternalService {
            service,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::Validation,
            Self::Authentication(_) => ErrorCode::Authentication,
            Self::Authorization(_) => ErrorCode::Authorization,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Duplicate(_) => ErrorCode::Duplicate,
            Self::BusinessLogic(_) => ErrorCode::BusinessLogic,
            Self::RateLimit { .. } => ErrorCode::RateLimit,
            Self::ExternalService { .. } => ErrorCode::ExternalService,
            Self::Database(_) => ErrorCode::Database,
            Self::Configuration(_) => ErrorCode::Configuration,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Structured details for the API error body.
    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::NotFound { resource, id } => serde_json::json!({
                "resource_type": resource,
                "resource_id": id,
            }),
            Self::RateLimit { retry_after_secs } => serde_json::json!({
                "retry_after": retry_after_secs,
            }),
            Self::ExternalService { service, .. } => serde_json::json!({
                "service": service,
            }),
            _ => serde_json::json!({}),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
