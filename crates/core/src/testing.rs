use std::sync::Arc;

use async_trait::async_trait;
use http::request::Builder;

use crate::{
    Application, ApplicationCall, ApplicationRequest, ApplicationResponse, AttributeKey, BoxError, Execution, Interceptor, Pipeline,
    RequestBody,
};
use micro_host_http::protocol::RequestHeader;

const LOG: AttributeKey<Vec<String>> = AttributeKey::new("test-log");

pub(crate) fn request_with(f: impl FnOnce(Builder) -> Builder) -> ApplicationRequest {
    let request = f(http::Request::builder()).body(()).unwrap();
    ApplicationRequest::new(RequestHeader::from(request), RequestBody::empty())
}

pub(crate) fn test_call() -> ApplicationCall {
    let application = Arc::new(Application::new(Pipeline::application()));
    let (response, _rx) = ApplicationResponse::channel();
    ApplicationCall::new(application, request_with(|builder| builder.uri("/")), response)
}

/// Appends its name to the call's log, then proceeds or finishes.
pub(crate) struct LogInterceptor {
    name: &'static str,
    finish: bool,
}

impl LogInterceptor {
    pub(crate) fn proceed(name: &'static str) -> Self {
        Self { name, finish: false }
    }

    pub(crate) fn finish(name: &'static str) -> Self {
        Self { name, finish: true }
    }

    pub(crate) fn append(call: &mut ApplicationCall, entry: &str) {
        call.attributes_mut().compute_if_absent(LOG, Vec::new).unwrap().push(entry.to_owned());
    }

    pub(crate) fn log(call: &ApplicationCall) -> Vec<String> {
        call.attributes().get(LOG).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Interceptor for LogInterceptor {
    async fn intercept(&self, call: &mut ApplicationCall, execution: &mut Execution) -> Result<(), BoxError> {
        Self::append(call, self.name);
        if self.finish {
            execution.finish();
        }
        Ok(())
    }
}
