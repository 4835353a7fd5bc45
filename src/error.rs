//! Error types.
//!
//! Two kinds of failure live here:
//!
//! - [`Error`] surfaces infrastructure failures of the server itself: binding
//!   to a port or accepting a connection.
//! - [`HttpError`] is what handlers return. It pairs any error with the HTTP
//!   status the client should see, 500 unless stated otherwise.

use std::fmt;

use http::StatusCode;
use http::header::{CONTENT_TYPE, HeaderValue};

use crate::writer::ResponseWriter;

/// The error type returned by the server's fallible operations.
#[derive(Debug)]
pub struct Error(std::io::Error);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "io: {}", self.0)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self(e)
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A handler error with an associated HTTP status.
///
/// Any `std::error::Error` converts into an `HttpError` with status 500, so
/// `?` works inside handlers. Use [`HttpError::new`] to pick another status:
///
/// ```rust
/// use http::StatusCode;
/// use toolkit::HttpError;
///
/// let err = HttpError::new(StatusCode::CONFLICT, "name already taken");
/// assert_eq!(err.status(), StatusCode::CONFLICT);
/// assert_eq!(err.to_string(), "name already taken");
/// ```
///
/// `HttpError` must not implement `std::error::Error` itself: the blanket
/// `From` impl would then overlap with `From<T> for T`.
pub struct HttpError {
    status: StatusCode,
    inner: BoxError,
}

impl HttpError {
    pub fn new(status: StatusCode, err: impl Into<BoxError>) -> Self {
        Self { status, inner: err.into() }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The wrapped error.
    pub fn get_ref(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.inner
    }

    pub fn into_inner(self) -> BoxError {
        self.inner
    }
}

impl<E> From<E> for HttpError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl fmt::Debug for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpError")
            .field("status", &self.status)
            .field("inner", &self.inner)
            .finish()
    }
}

/// Writes an error to the client. Installed with
/// [`Router::error_handler`](crate::Router::error_handler).
pub type ErrorHandler = fn(&ResponseWriter, &HttpError);

/// Sends the error's status and its message as a plain-text body.
pub fn default_error_handler(w: &ResponseWriter, err: &HttpError) {
    w.headers_mut()
        .append(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    w.write_header(err.status());
    let _ = w.write(err.to_string().as_bytes());
}
