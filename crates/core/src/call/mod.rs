//! The per-exchange state threaded through every interceptor.

mod attributes;
mod body;
mod push;
mod request;
mod response;

use std::sync::Arc;

pub use attributes::{AttributeError, AttributeKey, Attributes};
pub use body::{BodyAborted, BodySender, BodyWriter, RequestBody, ResponseBody};
pub use push::{PushBuilder, PushError, ResponsePusher};
pub use request::ApplicationRequest;
pub use response::{ApplicationResponse, ResponseError};

use tracing::debug;

use crate::Application;

/// One HTTP exchange: an HTTP/1.1 request, or one HTTP/2 stream.
#[derive(Debug)]
pub struct ApplicationCall {
    application: Arc<Application>,
    request: ApplicationRequest,
    response: ApplicationResponse,
    attributes: Attributes,
}

impl ApplicationCall {
    pub fn new(application: Arc<Application>, request: ApplicationRequest, response: ApplicationResponse) -> Self {
        Self { application, request, response, attributes: Attributes::new() }
    }

    pub fn application(&self) -> &Arc<Application> {
        &self.application
    }

    pub fn request(&self) -> &ApplicationRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut ApplicationRequest {
        &mut self.request
    }

    pub fn response(&self) -> &ApplicationResponse {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut ApplicationResponse {
        &mut self.response
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    /// Asks the transport to push another resource alongside this response.
    ///
    /// Transports without push support ignore the request.
    pub fn push(&self, builder: PushBuilder) -> Result<(), PushError> {
        match self.response.pusher() {
            Some(pusher) => pusher.push(self, builder),
            None => {
                debug!(?builder, "transport does not support push, ignoring");
                Ok(())
            }
        }
    }
}
