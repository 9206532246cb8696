use thiserror::Error;

/// Raised when a raw wire response cannot be turned into an `HttpResponse`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Header block is not terminated by an empty line")]
    NoHeaderTerminator,

    #[error("Malformed status line: {0}")]
    BadStatusLine(String),
}

#[derive(Error, Debug)]
pub enum OriginError {
    #[error("Invalid origin url: {0}")]
    InvalidUrl(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Did not receive data")]
    EmptyResponse,

    #[error("TLS is not supported by this transport")]
    TlsUnsupported,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Response parse error: {0}")]
    Parse(#[from] ParseError),
}

impl OriginError {
    /// Numeric code kept alongside the message for diagnostics.
    pub fn code(&self) -> i32 {
        match self {
            OriginError::EmptyResponse => -1,
            OriginError::InvalidUrl(_) => -2,
            OriginError::Timeout(_) => -3,
            OriginError::Connect(_) => -4,
            OriginError::TlsUnsupported => -5,
            OriginError::Io(e) => e.raw_os_error().unwrap_or(-6),
            OriginError::Transport(e) => {
                e.status().map(|s| s.as_u16() as i32).unwrap_or(-7)
            }
            OriginError::Parse(_) => -8,
        }
    }
}
