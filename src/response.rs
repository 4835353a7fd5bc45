//! Response encoding helpers.
//!
//! Thin conveniences over [`ResponseWriter`] for the common cases: a status
//! with a content type, a plain string, or a pretty-printed JSON document.

use std::io;

use http::StatusCode;
use http::header::{CONTENT_TYPE, HeaderValue};
use serde::Serialize;

use crate::writer::ResponseWriter;

// ── ContentType ───────────────────────────────────────────────────────────────

/// Common content-type values for use with [`write_status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    Csv,          // text/csv
    EventStream,  // text/event-stream  (SSE)
    FormData,     // application/x-www-form-urlencoded
    Html,         // text/html; charset=utf-8
    Json,         // application/json; charset=utf-8
    OctetStream,  // application/octet-stream
    Pdf,          // application/pdf
    Text,         // text/plain; charset=utf-8
    Xml,          // application/xml
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv         => "text/csv",
            Self::EventStream => "text/event-stream",
            Self::FormData    => "application/x-www-form-urlencoded",
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json; charset=utf-8",
            Self::OctetStream => "application/octet-stream",
            Self::Pdf         => "application/pdf",
            Self::Text        => "text/plain; charset=utf-8",
            Self::Xml         => "application/xml",
        }
    }
}

impl From<ContentType> for HeaderValue {
    fn from(ct: ContentType) -> Self {
        HeaderValue::from_static(ct.as_str())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Sets `Content-Type` (when given) and writes the status line.
pub fn write_status(w: &ResponseWriter, status: StatusCode, content_type: Option<ContentType>) {
    if let Some(ct) = content_type {
        w.set_header(CONTENT_TYPE, ct.into());
    }
    w.write_header(status);
}

/// `200 OK` with `s` as the body. The content type is left to the client.
pub fn render_string(w: &ResponseWriter, s: &str) -> io::Result<()> {
    write_status(w, StatusCode::OK, None);
    w.write(s.as_bytes()).map(drop)
}

/// `200 OK` with `value` as indented JSON.
///
/// Serialization happens before anything is written, so a failure leaves the
/// response untouched for the error handler.
pub fn render_json<T>(w: &ResponseWriter, value: &T) -> Result<(), serde_json::Error>
where
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec_pretty(value)?;
    write_status(w, StatusCode::OK, Some(ContentType::Json));
    w.write(&body).map_err(serde_json::Error::io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bytes::Bytes;
    use http_body_util::BodyExt;

    use super::*;
    use crate::writer::Sink;

    async fn finish(w: ResponseWriter, head: tokio::sync::oneshot::Receiver<http::Response<crate::Body>>)
        -> (http::Response<()>, Bytes)
    {
        w.finish().await;
        let (parts, body) = head.await.unwrap().into_parts();
        (http::Response::from_parts(parts, ()), body.collect().await.unwrap().to_bytes())
    }

    #[tokio::test]
    async fn write_status_sets_content_type() {
        let (sink, head) = Sink::channel();
        let w = ResponseWriter::new(sink);
        write_status(&w, StatusCode::CREATED, Some(ContentType::Csv));
        assert_eq!(w.status(), Some(StatusCode::CREATED));

        let (response, body) = finish(w, head).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/csv");
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn render_string_writes_ok() {
        let (sink, head) = Sink::channel();
        let w = ResponseWriter::new(sink);
        render_string(&w, "pong").unwrap();
        assert_eq!(w.bytes_written(), 4);

        let (response, body) = finish(w, head).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(CONTENT_TYPE).is_none());
        assert_eq!(body, "pong");
    }

    #[tokio::test]
    async fn render_json_is_indented() {
        let (sink, head) = Sink::channel();
        let w = ResponseWriter::new(sink);
        let value = BTreeMap::from([("id", 7)]);
        render_json(&w, &value).unwrap();

        let (response, body) = finish(w, head).await;
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json; charset=utf-8");
        assert_eq!(body, "{\n  \"id\": 7\n}");
    }

    #[tokio::test]
    async fn render_json_failure_writes_nothing() {
        let (sink, _head) = Sink::channel();
        let w = ResponseWriter::new(sink);
        let bad = BTreeMap::from([(vec![1u8], 1)]);
        assert!(render_json(&w, &bad).is_err());
        assert_eq!(w.status(), None);
    }
}
