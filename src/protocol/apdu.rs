//! Generic APDU command validation
//!
//! The transport never interprets command semantics. It only checks the
//! classic length prefix: byte 4 holds the number of data bytes that follow
//! the 5-byte header.

use thiserror::Error;

/// Length of the class/instruction/parameter/length header
pub const APDU_HEADER_SIZE: usize = 5;

/// Offset of the data length byte
const LENGTH_OFFSET: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApduError {
    #[error("Command too short: {0} bytes (min: {min})", min = APDU_HEADER_SIZE)]
    TooShort(usize),

    #[error("Length prefix mismatch: {declared} data bytes declared, {actual} present")]
    LengthMismatch { declared: u8, actual: usize },
}

/// Check that `command` is a well-formed length-prefixed APDU
pub fn check_length_prefix(command: &[u8]) -> Result<(), ApduError> {
    if command.len() < APDU_HEADER_SIZE {
        return Err(ApduError::TooShort(command.len()));
    }

    let declared = command[LENGTH_OFFSET];
    let actual = command.len() - APDU_HEADER_SIZE;
    if declared as usize != actual {
        return Err(ApduError::LengthMismatch { declared, actual });
    }

    Ok(())
}
