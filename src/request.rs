//! Incoming HTTP request type.

use std::collections::HashMap;

use bytes::Bytes;
use http::request::Parts;
use http::{Extensions, HeaderMap, Method, Uri};
use hyper::upgrade::OnUpgrade;

use crate::context::{Context, Key};

/// An incoming HTTP request with its body already collected.
pub struct Request {
    pub(crate) parts: Parts,
    pub(crate) body: Bytes,
    pub(crate) params: HashMap<String, String>,
    pub(crate) context: Context,
}

impl Request {
    pub(crate) fn new(parts: Parts, body: Bytes) -> Self {
        Self { parts, body, params: HashMap::new(), context: Context::new() }
    }

    pub fn method(&self) -> &Method { &self.parts.method }
    pub fn uri(&self) -> &Uri { &self.parts.uri }
    pub fn path(&self) -> &str { self.parts.uri.path() }
    pub fn query(&self) -> Option<&str> { self.parts.uri.query() }
    pub fn headers(&self) -> &HeaderMap { &self.parts.headers }
    pub fn body(&self) -> &Bytes { &self.body }

    /// Header lookup. Values that are not visible ASCII are treated as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Extensions set by the server on the incoming request.
    pub fn extensions(&self) -> &Extensions { &self.parts.extensions }
    pub fn extensions_mut(&mut self) -> &mut Extensions { &mut self.parts.extensions }

    /// Claims the connection for a protocol switch.
    ///
    /// The returned future resolves to the raw connection once the handler
    /// has returned (or flushed) a `101 Switching Protocols` head, so await
    /// it on a separate task. `None` if the request cannot be upgraded or the
    /// connection was already claimed.
    pub fn upgrade(&mut self) -> Option<OnUpgrade> {
        self.parts.extensions.remove::<OnUpgrade>()
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// The values attached to this request so far.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Attaches `value` to this request's context.
    pub fn attach<T>(&mut self, key: Key<T>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.context = self.context.with_value(key, value);
    }

    /// Replaces the request context.
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }
}

#[cfg(test)]
pub(crate) fn test_request(method: &str, uri: &str, content_type: Option<&str>, body: &str) -> Request {
    let mut builder = http::Request::builder().method(method).uri(uri);
    if let Some(ct) = content_type {
        builder = builder.header(http::header::CONTENT_TYPE, ct);
    }
    let (parts, ()) = builder.body(()).unwrap().into_parts();
    Request::new(parts, Bytes::copy_from_slice(body.as_bytes()))
}
