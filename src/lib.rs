#[macro_use]
extern crate serde_derive;
extern crate colored;

pub mod backoff;
pub mod channel;
pub mod connection;
pub mod crypto;
pub mod discovery;
pub mod flow;
pub mod message;
pub mod protocol;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod sync;
pub mod transport;
pub mod zfx_id;

#[cfg(test)]
mod integration_test;

use crypto::SecurityFault;
use zfx_id::Id;

#[derive(Debug)]
pub enum Error {
    IO(std::io::Error),
    Dalek(ed25519_dalek::ed25519::Error),
    Bincode(bincode::Error),
    Actix(actix::MailboxError),
    Config(config::ConfigError),

    // codec errors
    MalformedMessage(&'static str),
    UnsupportedVersion(u16),

    // security errors
    Security(SecurityFault),
    RateLimitExceeded(Id),

    // connection errors
    HandshakeFailed(String),
    ConnectionDraining(Id),
    ConnectionClosed(Id),
    NotConnected(Id),
    ProtocolViolation(&'static str),

    // transport errors
    AckTimeout(Id),
    InsufficientFlowBudget { requested: usize, available: usize },
    ReassemblyTimeout(Id),
    Cancelled,
    DeadlineExceeded,

    // state sync errors
    StateConflictUnresolved(String),
    ProposalRejected,

    // registry errors
    InvalidService(&'static str),

    // rpc errors
    Timeout,
    EmptyResponse,

    /// Error caused by converting from a `String` to an `Id`
    TryFromStringError,
    /// Error when parsing a peer description `ID@IP`
    PeerParseError,
    /// Error when parsing a shared key entry `ID:KEY`
    SharedKeyParseError,
}

impl Error {
    /// Transport timeouts may be retried by the caller when the original send was
    /// idempotent. Everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::AckTimeout(_) | Error::ReassemblyTimeout(_))
    }

    /// Codec and security failures point at a bug or an attack and are never retried.
    pub fn is_security_fault(&self) -> bool {
        matches!(
            self,
            Error::MalformedMessage(_)
                | Error::UnsupportedVersion(_)
                | Error::Security(_)
                | Error::RateLimitExceeded(_)
        )
    }
}

impl std::error::Error for Error {}

impl std::convert::From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

impl std::convert::From<ed25519_dalek::ed25519::Error> for Error {
    fn from(error: ed25519_dalek::ed25519::Error) -> Self {
        Error::Dalek(error)
    }
}

impl std::convert::From<bincode::Error> for Error {
    fn from(error: bincode::Error) -> Self {
        Error::Bincode(error)
    }
}

impl std::convert::From<actix::MailboxError> for Error {
    fn from(error: actix::MailboxError) -> Self {
        Error::Actix(error)
    }
}

impl std::convert::From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Error::Config(error)
    }
}

impl std::convert::From<SecurityFault> for Error {
    fn from(fault: SecurityFault) -> Self {
        Error::Security(fault)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_timeouts_are_retryable() {
        assert!(Error::AckTimeout(Id::one()).is_retryable());
        assert!(Error::ReassemblyTimeout(Id::one()).is_retryable());
        assert!(!Error::MalformedMessage("short").is_retryable());
        assert!(!Error::Security(SecurityFault::BadSignature).is_retryable());
        assert!(!Error::ConnectionDraining(Id::one()).is_retryable());
    }

    #[test]
    fn codec_and_security_failures_are_faults() {
        assert!(Error::UnsupportedVersion(0x0200).is_security_fault());
        assert!(Error::Security(SecurityFault::DecryptionFailed).is_security_fault());
        assert!(!Error::AckTimeout(Id::one()).is_security_fault());
    }
}
