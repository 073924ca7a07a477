use thiserror::Error;

use crate::consensus::ProcessId;

/// Errors raised while decoding a datagram or an agreement payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of buffer")]
    EndOfBuffer,
    #[error("unknown message kind: {0}")]
    UnknownKind(u8),
    #[error("invalid ack flag: {0}")]
    InvalidFlag(u8),
    #[error("trailing bytes: {0}")]
    TrailingBytes(usize),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config at line {line}: {reason}")]
    Config { line: usize, reason: String },
    #[error("unknown process: {0}")]
    UnknownProcess(ProcessId),
    #[error("link stopped")]
    Stopped,
    #[error("sink failed: {0}")]
    Sink(String),
}

impl Error {
    pub fn config(line: usize, reason: impl Into<String>) -> Self {
        Error::Config {
            line,
            reason: reason.into(),
        }
    }
}
