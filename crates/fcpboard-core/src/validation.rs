//! # Validation Module
//!
//! Sanity checks for messages the node delivered successfully.
//!
//! The node only guarantees that the bytes at a key are the bytes someone
//! inserted there. Anyone can insert anything at a keyword key, so a
//! downloaded envelope is accepted only if it plausibly belongs to the slot it
//! was fetched from:
//!
//! - message id has a sane shape
//! - envelope date lies within one day of the slot's day bucket
//! - board name matches the board being scanned

use chrono::{Duration, NaiveDate};

use crate::error::ValidationError;
use crate::types::{Board, BoardMessage};
use crate::{MAX_MESSAGE_ID_LEN, MIN_MESSAGE_ID_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates the shape of a message identifier.
///
/// ## Example
/// ```rust
/// use fcpboard_core::validation::validate_message_id;
///
/// assert!(validate_message_id("5f0c6d1e-2b7a-4c1d-9e8f-0a1b2c3d4e5f").is_ok());
/// assert!(validate_message_id("").is_err());
/// assert!(validate_message_id("has space in it").is_err());
/// ```
pub fn validate_message_id(id: &str) -> ValidationResult<()> {
    if id.is_empty() {
        return Err(ValidationError::Required {
            field: "message_id".to_string(),
        });
    }

    if id.len() < MIN_MESSAGE_ID_LEN {
        return Err(ValidationError::TooShort {
            field: "message_id".to_string(),
            min: MIN_MESSAGE_ID_LEN,
        });
    }

    if id.len() > MAX_MESSAGE_ID_LEN {
        return Err(ValidationError::TooLong {
            field: "message_id".to_string(),
            max: MAX_MESSAGE_ID_LEN,
        });
    }

    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::InvalidFormat {
            field: "message_id".to_string(),
            reason: "must not contain whitespace or control characters".to_string(),
        });
    }

    Ok(())
}

/// Validates that an envelope date is within one day of its bucket.
pub fn validate_envelope_date(date: NaiveDate, bucket: NaiveDate) -> ValidationResult<()> {
    let distance = (date - bucket).num_days().abs();
    if distance > Duration::days(1).num_days() {
        return Err(ValidationError::DateOutOfWindow {
            date: date.to_string(),
            bucket: bucket.to_string(),
        });
    }
    Ok(())
}

/// Validates that a message names the board it was fetched for.
pub fn validate_board_name(message_board: &str, board: &Board) -> ValidationResult<()> {
    if !message_board.trim().eq_ignore_ascii_case(board.name().trim()) {
        return Err(ValidationError::Mismatch {
            field: "board".to_string(),
            expected: board.name().to_string(),
            actual: message_board.to_string(),
        });
    }
    Ok(())
}

/// Runs every check a downloaded message must pass.
pub fn validate_message(
    message: &BoardMessage,
    board: &Board,
    bucket: NaiveDate,
) -> ValidationResult<()> {
    validate_message_id(&message.message_id)?;
    validate_envelope_date(message.date.date_naive(), bucket)?;
    validate_board_name(&message.board, board)?;
    Ok(())
}
