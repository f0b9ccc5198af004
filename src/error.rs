//! Typed error model for the broker.
//!
//! Every fallible subsystem gets its own error enum; all of them roll up
//! into [`BrokerError`] so callers that don't care about the subsystem can
//! propagate with `?` all the way up to `main`.

use derive_more::{Display, From};
use failure::Fail;

/// Error raised while parsing or encoding a Guacamole / `guacg` instruction.
#[derive(Debug, Display, Fail)]
pub enum CodecError {
    /// Instruction did not follow the `<len>.<value>` framing grammar.
    #[display(fmt = "malformed instruction framing: {}", _0)]
    MalformedFraming(String),

    /// A `guacg` instruction's first argument was not valid JSON.
    #[display(fmt = "invalid JSON in guacg argument: {}", _0)]
    InvalidJson(#[cause] serde_json::Error),

    /// Instruction claimed to be `guacg`-framed but wasn't.
    #[display(fmt = "not a guacg instruction")]
    NotGuacg,
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidJson(e)
    }
}

/// Error raised while performing the `guacd` handshake.
#[derive(Debug, Display, Fail)]
pub enum HandshakeError {
    /// The TCP connection to `guacd` could not be established.
    #[display(fmt = "failed to connect to guacd: {}", _0)]
    Connect(String),

    /// `guacd` closed the connection, or sent a malformed reply, during
    /// the `select`/`size`/`connect` exchange.
    #[display(fmt = "guacd rejected handshake: {}", _0)]
    Rejected(String),

    /// Underlying instruction framing error.
    #[display(fmt = "{}", _0)]
    Codec(CodecError),
}

impl From<CodecError> for HandshakeError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

/// Error raised by [`crate::registry::SessionDirectory`] operations.
#[derive(Debug, Display, Fail)]
pub enum DirectoryError {
    /// No master is registered under the requested session ID.
    #[display(fmt = "session not found: {}", _0)]
    NotFound(String),
}

/// Error raised by [`crate::parking::ParkingLot`] operations.
#[derive(Debug, Display, Fail)]
pub enum ParkingError {
    /// `park` was called with a session ID that is already parked.
    #[display(fmt = "session already parked: {}", _0)]
    AlreadyParked(String),

    /// `unpark`/`evict` was called with a session ID that isn't parked.
    #[display(fmt = "session not parked: {}", _0)]
    NotParked(String),
}

/// Root error type unifying every subsystem error.
///
/// Only used at the boundary (CLI bootstrap, top-level request handlers);
/// internal code propagates the specific subsystem error so callers can
/// match on it and decide whether it's recoverable.
#[derive(Debug, Display, From, Fail)]
pub enum BrokerError {
    #[display(fmt = "{}", _0)]
    Codec(CodecError),

    #[display(fmt = "{}", _0)]
    Handshake(HandshakeError),

    #[display(fmt = "{}", _0)]
    Directory(DirectoryError),

    #[display(fmt = "{}", _0)]
    Parking(ParkingError),

    #[display(fmt = "I/O error: {}", _0)]
    Io(std::io::Error),

    #[display(fmt = "configuration error: {}", _0)]
    Config(config::ConfigError),
}
