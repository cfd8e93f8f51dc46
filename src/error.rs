use thiserror::Error;

/// Library result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when using the core client.
#[derive(Error, Debug)]
pub enum Error {
    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),

    #[error("pairing: {0}")]
    Pairing(#[from] PairingError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("signal: {0}")]
    Signal(#[from] SignalError),

    #[error("binary protocol: {0}")]
    Binary(#[from] BinaryError),

    #[error("server error {code}: {text}")]
    Server { code: u16, text: String },

    #[error("request timed out")]
    Timeout,

    #[error("not connected")]
    NotConnected,

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Server errors whose code indicates the session itself is gone.
    pub fn is_session_loss(&self) -> bool {
        matches!(self, Self::Server { code, .. } if *code == 401 || *code == 403 || *code == 406)
    }
}

/// Binary node codec errors. All of them mean the frame cannot be used.
#[derive(Error, Debug)]
pub enum BinaryError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame too large ({0} bytes)")]
    FrameTooLarge(usize),

    #[error("non-utf8 string in node")]
    InvalidString,
}

/// Connection-related errors.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("websocket: {0}")]
    WebSocket(String),

    #[error("noise handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("frame decrypt failed")]
    DecryptFailure,

    #[error("write attempted in {0:?} state")]
    NotOpen(crate::socket::ConnectionState),

    #[error("connection closed")]
    Closed,

    #[error("connect failure: {0}")]
    ConnectFailure(DisconnectReason),
}

/// Reason code carried on a `stream:error` / connect failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DisconnectReason {
    Generic = 400,
    LoggedOut = 401,
    TempBanned = 402,
    MainDeviceGone = 403,
    ClientOutdated = 405,
    UnknownLogout = 406,
    BadUserAgent = 409,
    NotFound = 415,
    InternalServerError = 500,
    ServiceUnavailable = 503,
}

impl DisconnectReason {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            400 => Some(Self::Generic),
            401 => Some(Self::LoggedOut),
            402 => Some(Self::TempBanned),
            403 => Some(Self::MainDeviceGone),
            405 => Some(Self::ClientOutdated),
            406 => Some(Self::UnknownLogout),
            409 => Some(Self::BadUserAgent),
            415 => Some(Self::NotFound),
            500 => Some(Self::InternalServerError),
            503 => Some(Self::ServiceUnavailable),
            _ => None,
        }
    }

    /// Whether the reason means the session is unrecoverable and the
    /// orchestrator must not reconnect.
    pub fn is_logged_out(&self) -> bool {
        matches!(
            self,
            Self::LoggedOut | Self::MainDeviceGone | Self::UnknownLogout
        )
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::LoggedOut => "logged out from another device",
            Self::TempBanned => "account temporarily banned",
            Self::MainDeviceGone => "primary device was logged out",
            Self::UnknownLogout => "logged out for unknown reason",
            Self::ClientOutdated => "client is out of date",
            Self::BadUserAgent => "client user agent was rejected",
            _ => "connection failure",
        };
        write!(f, "{} (code {})", msg, *self as u16)
    }
}

/// Pairing-related errors.
#[derive(Error, Debug)]
pub enum PairingError {
    #[error("invalid device identity HMAC")]
    InvalidDeviceIdentityHmac,

    #[error("invalid device signature")]
    InvalidDeviceSignature,

    #[error("protocol: {0}")]
    Protocol(String),
}

/// Key store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("load failed: {0}")]
    Load(String),

    #[error("save failed: {0}")]
    Save(String),

    #[error("commit failed after {attempts} attempts: {last}")]
    CommitFailure { attempts: u32, last: String },

    #[error("record for {0} is corrupt: {1}")]
    Corrupt(String, String),
}

/// Signal protocol errors.
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("no session with {0}")]
    NoSession(String),

    #[error("no sender key for {0}")]
    NoSenderKey(String),

    #[error("invalid prekey bundle: {0}")]
    InvalidBundle(String),

    #[error("message authentication failed")]
    BadMac,

    #[error("counter {0} too far ahead of chain")]
    CounterTooFar(u32),

    #[error("duplicate or replayed message counter {0}")]
    DuplicateCounter(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logged_out_codes() {
        assert!(DisconnectReason::LoggedOut.is_logged_out());
        assert!(DisconnectReason::MainDeviceGone.is_logged_out());
        assert!(!DisconnectReason::TempBanned.is_logged_out());
        assert_eq!(
            DisconnectReason::from_code(401),
            Some(DisconnectReason::LoggedOut)
        );
        assert_eq!(DisconnectReason::from_code(999), None);
    }

    #[test]
    fn session_loss_detection() {
        let e = Error::Server {
            code: 401,
            text: "unauthorized".into(),
        };
        assert!(e.is_session_loss());
        let e = Error::Server {
            code: 404,
            text: "not found".into(),
        };
        assert!(!e.is_session_loss());
    }
}
