use std::time::Instant;

use tracing::{Instrument, info, info_span};

use super::{Next, from_fn};
use crate::handler::BoxedHandler;
use crate::logging::{LOGGER, Logger};
use crate::request::Request;
use crate::writer::ResponseWriter;

/// Per-request span, context [`Logger`], and one `request complete` event
/// with method, URL, body size, status and duration.
///
/// Install it before [`recoverer`](super::recoverer) so that panicking
/// requests are logged as well.
pub fn request_logger() -> impl Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static {
    from_fn(|w: ResponseWriter, mut req: Request, next: Next| async move {
        let method = req.method().clone();
        let url = req.uri().clone();
        let span = info_span!("request", %method, %url);
        req.attach(LOGGER, Logger::new(span.clone()));

        let start = Instant::now();
        let result = next.run(w.clone(), req).instrument(span.clone()).await;

        info!(
            parent: &span,
            %method,
            %url,
            size = w.bytes_written(),
            status = w.status().map_or(0, |s| s.as_u16()),
            duration = ?start.elapsed(),
            "request complete"
        );
        result
    })
}
