//! Error taxonomy (spec §7).

use std::fmt;

/// One VM exception, captured at the interpreter bridge boundary and
/// translated once so it never unwinds through foreign frames.
#[derive(Debug, Clone)]
pub struct VmFailure {
    pub message: String,
    pub traceback: Option<String>,
}

impl fmt::Display for VmFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(tb) = &self.traceback {
            write!(f, "\n{tb}")?;
        }
        Ok(())
    }
}

/// The runtime's error kinds. `Ok` is not represented here — it is simply
/// the `Ok` arm of `Result<T, Error>`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unspecified failure.
    #[error("{0}")]
    Generic(String),

    /// Allocation failure.
    #[error("allocation failure")]
    Alloc,

    /// Caller violated a contract (bad argument, unknown id, malformed
    /// shape, stacking cycle, etc).
    #[error("argument error: {0}")]
    ArgError(String),

    /// Exception raised by the embedded VM.
    #[error("vm error: {0}")]
    VmError(#[from] VmFailure),

    /// A decoder search-path directory could not be read.
    #[error("search path error: {path}: {source}")]
    SearchPathError {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn arg(msg: impl Into<String>) -> Self {
        Error::ArgError(msg.into())
    }

    pub fn generic(msg: impl Into<String>) -> Self {
        Error::Generic(msg.into())
    }
}

impl From<mlua::Error> for Error {
    fn from(e: mlua::Error) -> Self {
        let traceback = match &e {
            mlua::Error::CallbackError { traceback, .. } => Some(traceback.clone()),
            _ => None,
        };
        Error::VmError(VmFailure {
            message: e.to_string(),
            traceback,
        })
    }
}
