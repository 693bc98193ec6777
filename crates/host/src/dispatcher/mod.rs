//! Transport dispatchers: turn protocol exchanges into executed calls.
//!
//! Both transports share [`run_call`]: execute the host pipeline, then make
//! sure the peer gets an answer for a call nobody answered.

mod http1;
mod http2;

pub use http1::Http1Connection;
pub use http2::Http2Dispatcher;

use std::time::Duration;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use micro_host_core::{ApplicationCall, CancelHandle, CancelReason, Execution, ExecutionError, ExecutionOutcome, Pipeline};
use tracing::{debug, error, warn};

/// Executes `call` through `host_pipeline`, then answers it if nobody did.
///
/// With a `timeout`, a watchdog cancels the execution once it elapses.
pub(crate) async fn run_call(
    mut call: ApplicationCall,
    host_pipeline: &Pipeline,
    cancel: CancelHandle,
    timeout: Option<Duration>,
) -> ExecutionOutcome {
    let watchdog = timeout.map(|timeout| {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            cancel.cancel(CancelReason::TimedOut);
        })
    });

    let outcome = Execution::with_cancel(cancel).execute(&mut call, host_pipeline).await;

    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }

    respond_unanswered(&mut call, &outcome);
    outcome
}

/// Commits a fallback response for a call that ended without one.
///
/// - a failed call gets `500 Internal Server Error`
/// - a call nobody handled gets `404 Not Found` naming the URI
/// - a call cancelled because its peer is gone gets nothing
pub(crate) fn respond_unanswered(call: &mut ApplicationCall, outcome: &ExecutionOutcome) {
    if call.response().is_committed() {
        if let ExecutionOutcome::Failed(e) = outcome {
            error!(uri = %call.request().uri(), cause = %e, "call failed after its response was committed, body aborted");
        }
        return;
    }

    let (status, body) = match outcome {
        ExecutionOutcome::Failed(e) if peer_is_gone(e) => {
            debug!(uri = %call.request().uri(), cause = %e, "call cancelled, peer gone");
            return;
        }
        ExecutionOutcome::Failed(e) => {
            error!(uri = %call.request().uri(), cause = %e, "call failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Bytes::new())
        }
        ExecutionOutcome::Unhandled | ExecutionOutcome::Finished => {
            if outcome.is_finished() {
                warn!(uri = %call.request().uri(), "call finished without responding");
            }
            let message = format!("Cannot find resource with the requested URI: {}", call.request().uri());
            (StatusCode::NOT_FOUND, Bytes::from(message))
        }
    };

    let response = call.response_mut();
    let result = response.set_status(status).and_then(|()| {
        if !body.is_empty() {
            response.insert_header(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"))?;
        }
        response.respond(body)
    });
    if let Err(e) = result {
        debug!(cause = %e, "fallback response not delivered");
    }
}

fn peer_is_gone(e: &ExecutionError) -> bool {
    matches!(e.cancel_reason(), Some(CancelReason::ConnectionClosed | CancelReason::StreamReset { .. }))
}
