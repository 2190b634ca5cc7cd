use std::io;

pub type EngineResult<T> = Result<T, EngineError>;

/// Engine-wide error plumbing. `Wait` means the operation could not make progress right now
/// (queue full, buffer full, socket would block) and may be retried; everything else is fatal
/// for the operation at hand, never for the process.
#[derive(Debug, Eq, PartialEq)]
pub enum EngineError {
    Wait,
    Fatal(ErrorKind),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorKind {
    QueueFull,
    BufferFull,
    Malformed,
    UnknownPeer,
    WrongRole,
    Overload,
    Decode,
    Encode,
    DepthExceeded,
    ChannelClosed,
    UnknownChannel,
    UnknownModule,
    Config,
    Io(io::ErrorKind),
}

impl From<io::Error> for EngineError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => EngineError::Wait,
            kind => EngineError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for EngineResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(EngineError::Wait) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_is_wait() {
        let err: EngineError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, EngineError::Wait);
    }

    #[test]
    fn test_other_io_is_fatal() {
        let err: EngineError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(err, EngineError::Fatal(ErrorKind::Io(io::ErrorKind::BrokenPipe)));
    }

    #[test]
    fn test_has_failed() {
        let wait: EngineResult<()> = Err(EngineError::Wait);
        let fatal: EngineResult<()> = Err(EngineError::Fatal(ErrorKind::QueueFull));

        assert!(!Ok::<(), EngineError>(()).has_failed());
        assert!(!wait.has_failed());
        assert!(fatal.has_failed());
    }
}
