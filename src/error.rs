//! Crate-wide error type.
//!
//! Mirrors the distinction the design draws between three kinds of failure:
//! programmer misuse (fail loudly), protocol invariant violations (fatal,
//! the peer set is no longer coherent), and benign races, which are never
//! represented as an [`Error`] at all -- they're logged and dropped at the
//! point they're detected.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A caller violated a documented precondition, e.g. called
    /// [`crate::sync_primitives::DistributedConditionVariable::wait`]
    /// without holding the associated mutex.
    #[error("misuse: {0}")]
    Misuse(String),

    /// A packet violated a protocol invariant: an agreement for a mutex we
    /// never requested, or a packet matching no subscription. The peer set
    /// is no longer known to be coherent once this happens.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A monitor or mutex name exceeded the 255-byte limit imposed by the
    /// single-byte length prefix used to frame `SYNC` payloads.
    #[error("name {0:?} is {1} bytes, exceeds the 255-byte limit")]
    NameTooLong(String, usize),

    /// The underlying channel failed to deliver or receive a packet.
    #[error("channel error: {0}")]
    Channel(#[from] io::Error),
}

impl Error {
    pub fn misuse(msg: impl Into<String>) -> Self {
        Self::Misuse(msg.into())
    }

    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// A short, stable name for the error variant, useful for logging and
    /// metrics without matching on the full message.
    pub fn variant_name(&self) -> &'static str {
        match self {
            Error::Misuse(_) => "Misuse",
            Error::ProtocolViolation(_) => "ProtocolViolation",
            Error::NameTooLong(..) => "NameTooLong",
            Error::Channel(_) => "Channel",
        }
    }
}

const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<Error>;
};
