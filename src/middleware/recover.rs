use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::Once;

use futures::FutureExt;
use http::StatusCode;
use tracing::{Span, error};

use super::{Next, from_fn};
use crate::handler::BoxedHandler;
use crate::logging::LOGGER;
use crate::request::Request;
use crate::writer::ResponseWriter;

/// Panic payload that aborts the response instead of turning it into a 500.
///
/// `std::panic::panic_any(AbortHandler)` passes straight through
/// [`recoverer`]; the server then drops the connection without a response.
#[derive(Debug, Clone, Copy)]
pub struct AbortHandler;

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static BACKTRACE_HOOK: Once = Once::new();

/// Wraps the process panic hook so every panic leaves its backtrace in
/// [`LAST_BACKTRACE`] on the panicking thread. The previous hook still runs.
fn install_backtrace_hook() {
    BACKTRACE_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            LAST_BACKTRACE.with(|slot| {
                if let Ok(mut slot) = slot.try_borrow_mut() {
                    *slot = Some(Backtrace::force_capture());
                }
            });
            previous(info);
        }));
    });
}

fn take_backtrace() -> Option<Backtrace> {
    LAST_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

/// Catches panics from the rest of the chain, logs them and responds `500`.
///
/// The event carries the panic message and, under `stack`, the backtrace
/// captured at the panic site, logged under the request's logger. Building
/// this layer installs a process panic hook (once) to capture that backtrace.
pub fn recoverer() -> impl Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static {
    install_backtrace_hook();
    from_fn(|w: ResponseWriter, req: Request, next: Next| async move {
        let span = req
            .context()
            .value(LOGGER)
            .map(|logger| logger.span().clone())
            .unwrap_or_else(Span::current);

        match AssertUnwindSafe(next.run(w.clone(), req)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) if payload.is::<AbortHandler>() => std::panic::resume_unwind(payload),
            Err(payload) => {
                let stack = take_backtrace().map(|bt| bt.to_string()).unwrap_or_default();
                error!(
                    parent: &span,
                    panic = panic_message(&*payload),
                    stack = %stack,
                    "panic while handling request"
                );
                w.write_header(StatusCode::INTERNAL_SERVER_ERROR);
                Ok(())
            }
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::Full;

    use super::*;
    use crate::Router;
    use crate::error::HttpError;

    async fn boom(_w: ResponseWriter, _req: Request) -> Result<(), HttpError> {
        panic!("boom");
    }

    async fn abort(_w: ResponseWriter, _req: Request) -> Result<(), HttpError> {
        std::panic::panic_any(AbortHandler);
    }

    fn get(uri: &str) -> http::Request<Full<bytes::Bytes>> {
        http::Request::get(uri).body(Full::new(bytes::Bytes::new())).unwrap()
    }

    #[tokio::test]
    async fn panics_become_500() {
        let app = Router::new().layer(recoverer()).get("/", boom).build();
        let response = app.call(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        // The handler ran on this thread and its backtrace went into the log.
        assert!(take_backtrace().is_none());
    }

    #[test]
    fn the_hook_keeps_one_backtrace_per_panic() {
        install_backtrace_hook();
        take_backtrace();

        assert!(std::panic::catch_unwind(|| panic!("traced")).is_err());
        let stack = take_backtrace().unwrap();
        assert_eq!(stack.status(), std::backtrace::BacktraceStatus::Captured);
        assert!(take_backtrace().is_none());
    }

    #[tokio::test]
    async fn abort_passes_through() {
        let app = Router::new().layer(recoverer()).get("/", abort).build();
        assert!(app.call(get("/")).await.is_err());
    }

    #[tokio::test]
    async fn unrecovered_panic_aborts_the_response() {
        let app = Router::new().get("/", boom).build();
        assert!(app.call(get("/")).await.is_err());
    }

    #[test]
    fn panic_messages() {
        let text: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*text), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*owned), "owned");
        let other: Box<dyn Any + Send> = Box::new(5_u8);
        assert_eq!(panic_message(&*other), "non-string panic payload");
    }
}
