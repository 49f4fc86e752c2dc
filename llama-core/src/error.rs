use std::path::PathBuf;

use thiserror::Error;

/// Every failure mode the worker can report back to a caller.
///
/// Variants map directly onto the error kinds a response envelope's `err`
/// field carries; there is no separate "internal" error type hiding behind
/// these — whatever fails inside a control's execution becomes one of these.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open native library at {path}")]
    LibraryOpen {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    /// `load_model_from_file` returned a null handle.
    #[error("native model load returned a null handle")]
    NativeLoadFailure,

    /// `new_context_with_model` returned a null handle.
    #[error("native context allocation returned a null handle")]
    NativeAllocFailure,

    /// decode/tokenize/etc. returned a non-zero or negative status.
    #[error("native call failed with status {0}")]
    NativeCallFailure(i32),

    /// A model or context id was not found in the worker's registry.
    #[error("unknown handle id {0}")]
    UnknownHandle(u64),

    /// Free-model was requested while `contextsForModel` is non-empty.
    #[error("model {model} still referenced by {live_contexts} context(s)")]
    HandleStillReferenced { model: u64, live_contexts: usize },

    /// A parameter was out of range, e.g. `edit(L)` with `L` beyond the
    /// current token buffer length.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Generate was called while `needsIngesting` still holds.
    #[error("state violation: {0}")]
    StateViolation(String),

    /// A non-terminal sampler followed a terminal one in a chain.
    #[error("sampler misuse: terminal sampler followed by unused sampler(s): {0:?}")]
    SamplerMisuse(Vec<String>),

    #[error("unknown log level {0}")]
    UnknownLogLevel(i32),

    #[error("string contained an interior NUL byte at index {0}")]
    NulByteInString(usize),

    #[error("native string was not valid UTF-8")]
    InvalidUtf8,
}

impl From<std::ffi::NulError> for Error {
    fn from(e: std::ffi::NulError) -> Self {
        Error::NulByteInString(e.nul_position())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidUtf8
    }
}

pub type Result<T> = std::result::Result<T, Error>;
