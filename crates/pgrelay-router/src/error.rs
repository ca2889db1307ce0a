//! Router error types.

use thiserror::Error;

/// Errors returned by router admission and lookup operations.
#[derive(Debug, Error)]
pub enum RouterError {
    /// No routing rule matches the client's startup `(database, user)`.
    #[error("no routing rule matches {database}/{user}")]
    RuleNotFound { database: String, user: String },

    /// The pooler-wide client cap is reached.
    #[error("global client limit reached ({limit})")]
    ClientLimit { limit: u32 },

    /// The matched route's client cap is reached.
    #[error("route client limit reached ({limit})")]
    RouteLimit { limit: u32 },

    /// A cancel key matched no active server on any route.
    #[error("no active server matches the cancel key")]
    ServerNotFound,
}

pub type RouterResult<T> = Result<T, RouterError>;
