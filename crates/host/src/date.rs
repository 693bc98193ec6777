//! The `Date` response header.
//!
//! Formatting an HTTP date for every response is wasteful under load, so a
//! single [`DateService`] keeps the current value and a background task
//! refreshes it a little more often than once a second. [`SendDate`] is the
//! host interceptor that stamps it on each call before the application runs.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::HeaderValue;
use http::header::DATE;
use micro_host_core::{ApplicationCall, BoxError, Execution, Interceptor, async_trait};
use once_cell::sync::Lazy;
use tracing::warn;

/// Keeps the current HTTP date string, refreshed in the background.
#[derive(Debug)]
pub struct DateService {
    current: Arc<ArcSwap<Bytes>>,
    handle: tokio::task::JoinHandle<()>,
}

static DATE_SERVICE: Lazy<DateService> = Lazy::new(|| DateService::new_with_update_interval(Duration::from_millis(800)));

impl DateService {
    /// The process wide instance. The first call must happen inside a tokio
    /// runtime, which spawns the refresh task.
    pub fn get_global_instance() -> &'static DateService {
        &DATE_SERVICE
    }

    fn new_with_update_interval(update_interval: Duration) -> Self {
        let current = Arc::new(ArcSwap::from_pointee(Self::now()));
        let current_arc = Arc::clone(&current);

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(update_interval).await;
                current_arc.store(Arc::new(Self::now()));
            }
        });

        DateService { current, handle }
    }

    fn now() -> Bytes {
        let mut buf = faf_http_date::get_date_buff_no_key();
        faf_http_date::get_date_no_key(&mut buf);
        Bytes::from_owner(buf)
    }

    pub fn http_date(&self) -> Option<HeaderValue> {
        let date = self.current.load().as_ref().clone();
        match HeaderValue::from_maybe_shared(date) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(cause = %e, "formatted date is not a valid header value");
                None
            }
        }
    }
}

impl Drop for DateService {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Sets the `Date` header on every response.
///
/// It runs before the application, so an application that sets its own
/// `Date` still wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendDate;

#[async_trait]
impl Interceptor for SendDate {
    async fn intercept(&self, call: &mut ApplicationCall, _execution: &mut Execution) -> Result<(), BoxError> {
        if let Some(date) = DateService::get_global_instance().http_date() {
            call.response_mut().insert_header(DATE, date)?;
        }
        Ok(())
    }
}
