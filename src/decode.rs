//! Request body and query decoding.

use std::convert::Infallible;

use futures::{FutureExt, stream};
use http::header::CONTENT_TYPE;
use http::{Method, StatusCode};
use multer::Multipart;
use serde::de::DeserializeOwned;

use crate::error::HttpError;
use crate::request::Request;

/// Decodes a request into `T`.
///
/// `GET` requests decode the query string. Everything else dispatches on the
/// media type of `Content-Type`:
///
/// | Content-Type | Decoder |
/// |---|---|
/// | `application/json` | `serde_json` |
/// | `application/x-www-form-urlencoded` | `serde_urlencoded` |
/// | `multipart/form-data` | `multer`, text fields only |
///
/// Any other content type is a `415 Unsupported Media Type`; input the
/// decoder rejects is a `400 Bad Request`. Field names follow the same serde
/// attributes for every format, so one struct serves JSON and forms alike.
pub fn decode<T: DeserializeOwned>(req: &Request) -> Result<T, HttpError> {
    if req.method() == Method::GET {
        return serde_urlencoded::from_str(req.query().unwrap_or("")).map_err(bad_request);
    }

    let content_type = req.header(CONTENT_TYPE.as_str()).unwrap_or("");
    let media_type = content_type.split(';').next().unwrap_or("").trim();

    match media_type {
        "application/json" => serde_json::from_slice(req.body()).map_err(bad_request),
        "application/x-www-form-urlencoded" => {
            serde_urlencoded::from_bytes(req.body()).map_err(bad_request)
        }
        "multipart/form-data" => decode_multipart(req, content_type),
        _ => Err(HttpError::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("unable to handle Content-Type {media_type:?}"),
        )),
    }
}

/// Multipart text fields decode exactly like the same fields sent as a form.
/// File parts are skipped.
fn decode_multipart<T: DeserializeOwned>(req: &Request, content_type: &str) -> Result<T, HttpError> {
    let boundary = multer::parse_boundary(content_type).map_err(bad_request)?;
    let body = req.body().clone();
    let mut multipart = Multipart::new(stream::once(async move { Ok::<_, Infallible>(body) }), boundary);

    let fields = async move {
        let mut fields = Vec::new();
        while let Some(field) = multipart.next_field().await? {
            if field.file_name().is_some() {
                continue;
            }
            let Some(name) = field.name().map(str::to_owned) else {
                continue;
            };
            fields.push((name, field.text().await?));
        }
        Ok::<_, multer::Error>(fields)
    }
    // The body is already in memory, so parsing never has to wait.
    .now_or_never()
    .ok_or_else(|| HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, "multipart body stalled"))?
    .map_err(bad_request)?;

    let form = serde_urlencoded::to_string(&fields)?;
    serde_urlencoded::from_str(&form).map_err(bad_request)
}

fn bad_request<E>(err: E) -> HttpError
where
    E: std::error::Error + Send + Sync + 'static,
{
    HttpError::new(StatusCode::BAD_REQUEST, err)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::request::test_request;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Payload {
        a: i64,
    }

    #[test]
    fn json_body() {
        let req = test_request("POST", "/", Some("application/json"), r#"{"a":1}"#);
        assert_eq!(decode::<Payload>(&req).unwrap(), Payload { a: 1 });
    }

    #[test]
    fn content_type_parameters_are_ignored() {
        let req = test_request("PUT", "/", Some("application/json; charset=utf-8"), r#"{"a":2}"#);
        assert_eq!(decode::<Payload>(&req).unwrap(), Payload { a: 2 });
    }

    #[test]
    fn form_body() {
        let req = test_request("POST", "/", Some("application/x-www-form-urlencoded"), "a=3");
        assert_eq!(decode::<Payload>(&req).unwrap(), Payload { a: 3 });
    }

    const MULTIPART: &str = "--XyZ\r\n\
        Content-Disposition: form-data; name=\"a\"\r\n\
        \r\n\
        4\r\n\
        --XyZ\r\n\
        Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        not a field\r\n\
        --XyZ--\r\n";

    #[test]
    fn multipart_text_fields() {
        let req = test_request("POST", "/", Some("multipart/form-data; boundary=XyZ"), MULTIPART);
        assert_eq!(decode::<Payload>(&req).unwrap(), Payload { a: 4 });
    }

    #[test]
    fn multipart_file_parts_are_not_fields() {
        #[derive(Debug, Deserialize)]
        struct WithUpload {
            #[allow(dead_code)]
            a: i64,
            upload: Option<String>,
        }

        let req = test_request("POST", "/", Some("multipart/form-data; boundary=XyZ"), MULTIPART);
        assert_eq!(decode::<WithUpload>(&req).unwrap().upload, None);
    }

    #[test]
    fn malformed_multipart_is_400() {
        let req = test_request("POST", "/", Some("multipart/form-data"), MULTIPART);
        assert_eq!(decode::<Payload>(&req).unwrap_err().status(), StatusCode::BAD_REQUEST);

        let req = test_request("POST", "/", Some("multipart/form-data; boundary=XyZ"), "--XyZ\r\ngarbage");
        assert_eq!(decode::<Payload>(&req).unwrap_err().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn get_uses_query_string() {
        let req = test_request("GET", "/items?a=5", Some("application/json"), r#"{"a":1}"#);
        assert_eq!(decode::<Payload>(&req).unwrap(), Payload { a: 5 });
    }

    #[test]
    fn unknown_content_type_is_415() {
        let req = test_request("POST", "/", Some("text/csv"), "a\n1");
        let err = decode::<Payload>(&req).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(err.to_string(), r#"unable to handle Content-Type "text/csv""#);

        let req = test_request("POST", "/", None, "");
        assert_eq!(decode::<Payload>(&req).unwrap_err().status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[test]
    fn malformed_input_is_400() {
        let req = test_request("POST", "/", Some("application/json"), r#"{"a":"#);
        assert_eq!(decode::<Payload>(&req).unwrap_err().status(), StatusCode::BAD_REQUEST);

        let req = test_request("GET", "/?a=five", None, "");
        assert_eq!(decode::<Payload>(&req).unwrap_err().status(), StatusCode::BAD_REQUEST);
    }
}
