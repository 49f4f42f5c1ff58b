use std::fmt;
use std::io;

pub type CommResult<T> = Result<T, CommError>;

/// Fatal conditions in the communications layer. Transient "no complete data
/// buffered yet" states are not errors; the parsing primitives report those
/// as `Ok(None)` so callers can suspend and resume when more bytes arrive.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CommError {
    /// An accumulating message would exceed the configured size limit.
    MessageTooLarge { limit: usize },
    /// Inbound bytes are not a valid encoding of text.
    BadUtf8Encoding,
    /// End of input arrived with an unterminated line still buffered.
    UnterminatedInput,
    /// End of input reached cleanly.
    EndOfInput,
    /// The peer requested a handshake revision this end does not speak.
    UnsupportedHandshakeVersion,
    /// The protocol in use cannot carry the given outbound message.
    UnwritableMessage(&'static str),
    Io(io::ErrorKind),
}

impl From<io::Error> for CommError {
    #[inline]
    fn from(error: io::Error) -> CommError {
        CommError::Io(error.kind())
    }
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommError::MessageTooLarge { limit } => write!(f, "message exceeds the {} byte limit", limit),
            CommError::BadUtf8Encoding => write!(f, "input bytes are not valid UTF-8"),
            CommError::UnterminatedInput => write!(f, "end of input with an unterminated line buffered"),
            CommError::EndOfInput => write!(f, "end of input"),
            CommError::UnsupportedHandshakeVersion => write!(f, "unsupported handshake version"),
            CommError::UnwritableMessage(kind) => write!(f, "protocol cannot carry a {} message", kind),
            CommError::Io(kind) => write!(f, "io error: {:?}", kind),
        }
    }
}
