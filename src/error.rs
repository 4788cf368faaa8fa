// ===============================
// src/error.rs
// ===============================
use std::fmt;
use thiserror::Error;

use crate::validator::ValidationError;

/// Kategori error yang dipakai lintas komponen.
/// Tiap boundary mengklasifikasikan error-nya sebelum diteruskan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    InputInvalid,
    AuthFailed,
    RiskBlocked,
    Exhausted,
    Inconsistent,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::InputInvalid => "input_invalid",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::RiskBlocked => "risk_blocked",
            ErrorKind::Exhausted => "exhausted",
            ErrorKind::Inconsistent => "inconsistent",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// MEXC error codes that mean "slow down" rather than "wrong request".
const TRANSIENT_CODES: &[i64] = &[-1003, -1015];
// Signature / key problems.
const AUTH_CODES: &[i64] = &[-1022, -2014, -2015, 10072, 700001, 700002, 700003];

/// Errors surfaced by an `ExchangeGateway`.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("rate limit wait exceeded deadline")]
    RateLimited,

    #[error("http {status} (code {code:?}): {msg}")]
    Http {
        status: u16,
        code: Option<i64>,
        msg: String,
    },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("signed calls disabled until re-keyed")]
    SigningDisabled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Network(_) | GatewayError::DeadlineExceeded | GatewayError::RateLimited => {
                ErrorKind::Transient
            }
            GatewayError::Http { status, code, .. } => classify_http(*status, *code),
            GatewayError::AuthFailed(_) | GatewayError::SigningDisabled => ErrorKind::AuthFailed,
            GatewayError::InvalidRequest(_) | GatewayError::Decode(_) => ErrorKind::InputInvalid,
            GatewayError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// True when the request may or may not have reached the matching engine.
    pub fn is_ambiguous(&self) -> bool {
        match self {
            GatewayError::Network(_) | GatewayError::DeadlineExceeded => true,
            GatewayError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub fn classify_http(status: u16, code: Option<i64>) -> ErrorKind {
    if let Some(c) = code {
        if TRANSIENT_CODES.contains(&c) {
            return ErrorKind::Transient;
        }
        if AUTH_CODES.contains(&c) {
            return ErrorKind::AuthFailed;
        }
    }
    match status {
        429 => ErrorKind::Transient,
        s if s >= 500 => ErrorKind::Transient,
        401 | 403 => ErrorKind::AuthFailed,
        s if (400..500).contains(&s) => ErrorKind::InputInvalid,
        // 2xx with an error body, or something odd: treat as a bad request
        _ => ErrorKind::InputInvalid,
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            GatewayError::DeadlineExceeded
        } else if e.is_decode() {
            GatewayError::Decode(e.to_string())
        } else {
            GatewayError::Network(e.to_string())
        }
    }
}

/// Crate-wide error.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("store: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Exhausted: {attempts} attempts, last error: {last}")]
    Exhausted { attempts: u32, last: GatewayError },

    #[error("Inconsistent: {0}")]
    Inconsistent(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Gateway(g) => g.kind(),
            // DB hiccups are retried by the next cycle
            CoreError::Store(_) => ErrorKind::Transient,
            CoreError::Validation(v) => v.kind(),
            CoreError::Exhausted { .. } => ErrorKind::Exhausted,
            CoreError::Inconsistent(_) => ErrorKind::Inconsistent,
            CoreError::NotFound(_) | CoreError::InvalidState(_) => ErrorKind::InputInvalid,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
