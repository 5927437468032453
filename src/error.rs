use thiserror::Error;

/// Errors surfaced by the public API.
///
/// `Usage` errors are recoverable: the engine's tables are not modified on
/// any path that returns one. `Backend` wraps a driver or compiler message.
/// `Alloc` is fatal for the computation that triggered it; the engine itself
/// stays consistent but the requested buffer does not exist.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Usage(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("allocation of {0} bytes failed")]
    Alloc(usize),
}

impl Error {
    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }

    pub(crate) fn backend(msg: impl std::fmt::Display) -> Self {
        Error::Backend(msg.to_string())
    }
}

impl From<cudarc::driver::DriverError> for Error {
    fn from(err: cudarc::driver::DriverError) -> Self {
        Error::Backend(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
