//! Error types and the thread-local error stack.
//!
//! Client-facing operations return [`Result`]. Paths that cannot propagate a
//! failure upward (anything running inside the audio callback) record errors
//! on a bounded, thread-local stack instead and continue producing silence;
//! the stack is inspectable with [`pop_error`] / [`has_error`] from the same
//! thread.

use std::cell::RefCell;

use crate::constants::MAX_ERROR_STACK_DEPTH;

/// Failure kinds reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ErrorCode {
    /// Audio backend (device layer) failure.
    Backend,
    /// Ran out of system resources.
    OutOfMemory,
    /// Index or position out of range.
    OutOfRange,
    /// Engine runtime error.
    Runtime,
    /// Caller logic error (e.g. releasing the master bus).
    Logic,
    /// Invalid argument passed to a function.
    InvalidArgument,
    /// Attempted to use a stale or null handle.
    InvalidHandle,
    /// Engine was not open when depended on.
    EngineUninit,
    /// Decoder was not opened when attempted to use it.
    DecoderUninit,
    /// Stream source was not opened when attempted to use it.
    StreamUninit,
    /// Feature is not supported.
    Unsupported,
    /// Failed to open a file.
    FileOpen,
    /// SoundBuffer was unloaded or empty.
    InvalidSoundBuffer,
    /// Malformed data encountered while reading.
    UnexpectedData,
    /// Attempted to read past the end of a buffer.
    EndOfBuffer,
    /// Something unexpected happened.
    Unknown,
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(detail) => format!(": {detail}"),
        None => String::new(),
    }
}

/// An engine error: a code plus optional context (usually the operation name).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}{}", detail_suffix(.detail))]
pub struct Error {
    pub code: ErrorCode,
    pub detail: Option<String>,
}

impl Error {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: Some(detail.into()),
        }
    }

    pub fn bare(code: ErrorCode) -> Self {
        Self { code, detail: None }
    }

    pub fn invalid_handle(op: &str) -> Self {
        Self::new(ErrorCode::InvalidHandle, op)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

thread_local! {
    static ERROR_STACK: RefCell<Vec<Error>> = const { RefCell::new(Vec::new()) };
}

/// Record an error on this thread's stack. Silently drops the error once the
/// stack is at capacity; the oldest entries are the ones worth keeping.
pub fn push_error(error: Error) {
    #[cfg(not(feature = "rt-safe"))]
    tracing::warn!(code = %error.code, detail = error.detail.as_deref(), "engine error");

    ERROR_STACK.with_borrow_mut(|stack| {
        if stack.len() < MAX_ERROR_STACK_DEPTH {
            stack.push(error);
        }
    });
}

/// Pop the most recent error recorded on this thread, if any.
pub fn pop_error() -> Option<Error> {
    ERROR_STACK.with_borrow_mut(Vec::pop)
}

/// Whether this thread has recorded errors that have not been popped.
pub fn has_error() -> bool {
    ERROR_STACK.with_borrow(|stack| !stack.is_empty())
}

/// Code of the most recent error without popping it.
pub fn peek_error_code() -> Option<ErrorCode> {
    ERROR_STACK.with_borrow(|stack| stack.last().map(|e| e.code))
}
