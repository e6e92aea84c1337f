//! Protocol-level error taxonomy.
//!
//! Decode failures are per-message: the message is dropped, a diagnostic
//! is emitted, and the reader loop continues. Transport failures stay
//! `io::Result` and are the caller's retry decision.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("address '{addr}' does not belong to scene '{scene}'")]
    WrongScene { scene: String, addr: String },

    #[error("unknown address '{0}'")]
    UnknownAddress(String),

    #[error("bad arguments at '{addr}': {detail}")]
    BadArguments { addr: String, detail: String },

    #[error("unsupported argument type at '{0}'")]
    UnsupportedType(String),

    #[error("malformed packet: {0}")]
    Malformed(String),
}
