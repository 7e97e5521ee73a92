//! Domain model and intake rules for the contact form.
//!
//! This crate is free of I/O. It owns:
//! - [`Submission`] and [`validate_submission`], the authoritative field checks.
//! - [`RateLimiter`] and [`client_identifier`], the per-client throttle.
//! - [`NewMessage`] and [`MessageRecord`], the shapes handed to and returned by storage.

mod rate_limit;
mod submission;

pub use rate_limit::{
    client_identifier, RateLimiter, SWEEP_RETENTION_FACTOR, THROTTLE_WINDOW, UNKNOWN_CLIENT,
};
pub use submission::{
    join_field_errors, validate_submission, Field, FieldErrors, NormalizedSubmission, Submission,
    MESSAGE_MAX_CHARS, MESSAGE_MIN_CHARS, NAME_MAX_CHARS, NAME_MIN_CHARS,
};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ContactError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("timestamp error: {0}")]
    Timestamp(String),
}

/// An accepted submission ready to be appended to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub name: String,
    pub email: String,
    pub message: String,
    pub client_ip: String,
    pub created_at: OffsetDateTime,
}

impl NewMessage {
    #[must_use]
    pub fn from_submission(
        normalized: NormalizedSubmission,
        client_ip: impl Into<String>,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            name: normalized.name,
            email: normalized.email,
            message: normalized.message,
            client_ip: client_ip.into(),
            created_at,
        }
    }

    /// Checks the invariants storage relies on.
    ///
    /// # Errors
    /// Returns [`ContactError::Validation`] when a field would not pass
    /// [`validate_submission`], or [`ContactError::Timestamp`] when
    /// `created_at` is not UTC.
    pub fn validate(&self) -> Result<(), ContactError> {
        let as_submission = Submission {
            name: Some(self.name.clone()),
            email: Some(self.email.clone()),
            message: Some(self.message.clone()),
            hp: None,
        };
        let errors = validate_submission(&as_submission);
        if !errors.is_empty() {
            return Err(ContactError::Validation(join_field_errors(&errors)));
        }

        if self.created_at.offset() != UtcOffset::UTC {
            return Err(ContactError::Timestamp(
                "created_at MUST be UTC (offset Z)".to_string(),
            ));
        }

        Ok(())
    }
}

/// A row of `contact_messages`. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub message: String,
    pub client_ip: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ContactError::Timestamp`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ContactError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ContactError::Timestamp(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ContactError::Timestamp(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ContactError::Timestamp`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ContactError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| ContactError::Timestamp(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
