//! Status word interpretation
//!
//! Every reassembled response ends with a 2-byte big-endian status word.

use std::fmt;

/// Length of the trailing status word
pub const STATUS_WORD_SIZE: usize = 2;

pub const SW_OK: u16 = 0x9000;
pub const SW_SECURITY_NOT_SATISFIED: u16 = 0x6982;
pub const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
pub const SW_INSUFFICIENT_SPACE: u16 = 0x6a84;
pub const SW_FILE_NOT_FOUND: u16 = 0x6a85;
pub const SW_WRONG_TARGET: u16 = 0x6484;

/// Typed outcome of a status word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWord {
    Ok,
    SecurityNotSatisfied,
    UserDenied,
    InsufficientSpace(u16),
    WrongTarget,
    Unknown(u16),
}

impl StatusWord {
    pub fn from_code(code: u16) -> Self {
        match code {
            SW_OK => StatusWord::Ok,
            SW_SECURITY_NOT_SATISFIED => StatusWord::SecurityNotSatisfied,
            SW_CONDITIONS_NOT_SATISFIED => StatusWord::UserDenied,
            SW_INSUFFICIENT_SPACE | SW_FILE_NOT_FOUND => StatusWord::InsufficientSpace(code),
            SW_WRONG_TARGET => StatusWord::WrongTarget,
            other => StatusWord::Unknown(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            StatusWord::Ok => SW_OK,
            StatusWord::SecurityNotSatisfied => SW_SECURITY_NOT_SATISFIED,
            StatusWord::UserDenied => SW_CONDITIONS_NOT_SATISFIED,
            StatusWord::InsufficientSpace(code) => *code,
            StatusWord::WrongTarget => SW_WRONG_TARGET,
            StatusWord::Unknown(code) => *code,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, StatusWord::Ok)
    }

    /// Short human-readable explanation
    pub fn hint(&self) -> &'static str {
        match self {
            StatusWord::Ok => "success",
            StatusWord::SecurityNotSatisfied => {
                "security status not satisfied (is the device unlocked and the app open?)"
            }
            StatusWord::UserDenied => "condition of use not satisfied (denied by user?)",
            StatusWord::InsufficientSpace(_) => "not enough space",
            StatusWord::WrongTarget => "wrong target id",
            StatusWord::Unknown(_) => "unknown reason",
        }
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x} ({})", self.code(), self.hint())
    }
}

/// Split a response into its payload and big-endian status word
///
/// Returns `None` if the response cannot hold a status word.
pub fn split_status(response: &[u8]) -> Option<(&[u8], StatusWord)> {
    if response.len() < STATUS_WORD_SIZE {
        return None;
    }

    let offset = response.len() - STATUS_WORD_SIZE;
    let high = response[offset] as u16;
    let low = response[offset + 1] as u16;
    let code = (high << 8) | low;

    Some((&response[..offset], StatusWord::from_code(code)))
}
