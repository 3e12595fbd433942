use std::io;
use thiserror::Error;

/// The primary error type for the `p110-rs` library.
#[derive(Error, Debug)]
pub enum TapoError {
    #[error("no Tapo devices found on the network")]
    DeviceNotFound,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP transport error: {0}")]
    Http(reqwest::Error),

    #[error("deadline elapsed before the device replied")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("server hash verification failed (invalid credentials?)")]
    AuthFailed,

    #[error("response signature verification failed")]
    SignatureInvalid,

    #[error("device returned error code {code}")]
    DeviceError { code: i32 },

    #[error("request returned status {status}")]
    TransportFailed { status: u16, body: String },

    #[error("device at {host} advertises encryption scheme {scheme}, not KLAP")]
    UnsupportedScheme { host: String, scheme: String },

    #[error("request counter exhausted; a new session is required")]
    SequenceExhausted,
}

impl TapoError {
    /// Whether retrying the same call on the same session may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TapoError::Io(_) | TapoError::Http(_) | TapoError::Timeout)
    }

    /// Whether a fresh handshake is likely to clear the error.
    ///
    /// Devices answer requests on an expired session with HTTP 403 or with
    /// the session-timeout device error code.
    pub fn is_session_expired(&self) -> bool {
        match self {
            TapoError::TransportFailed { status: 403, .. } => true,
            TapoError::DeviceError { code } => {
                DeviceErrorKind::from_code(*code) == DeviceErrorKind::SessionExpired
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for TapoError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TapoError::Timeout
        } else {
            TapoError::Http(err)
        }
    }
}

impl From<serde_json::Error> for TapoError {
    fn from(err: serde_json::Error) -> Self {
        TapoError::Malformed(err.to_string())
    }
}

/// Coarse classification of non-zero device error codes.
///
/// The raw code is always surfaced verbatim in
/// [`TapoError::DeviceError`]; this only groups the codes with known
/// meaning so callers can decide whether to re-handshake or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// Request envelope, method or parameters rejected
    InvalidRequest,
    /// Credentials rejected at the application layer
    InvalidCredentials,
    /// Session no longer valid; a new handshake may succeed
    SessionExpired,
    Unknown,
}

impl DeviceErrorKind {
    pub fn from_code(code: i32) -> Self {
        match code {
            -1002 | -1003 | -1008 => DeviceErrorKind::InvalidRequest,
            -1501 => DeviceErrorKind::InvalidCredentials,
            9999 => DeviceErrorKind::SessionExpired,
            _ => DeviceErrorKind::Unknown,
        }
    }
}
