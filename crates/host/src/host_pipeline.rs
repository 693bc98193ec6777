//! The host-level pipeline every call enters first.
//!
//! Host interceptors run before the application: they can decorate the
//! response, wrap the application with `proceed`, or refuse the call. The
//! last interceptor of the `Infrastructure` phase forks into the
//! application's own pipeline, so anything the application finishes or
//! fails is reflected in the host execution.

use std::sync::Arc;

use micro_host_core::{ApplicationCall, BoxError, Execution, Interceptor, Phase, PhaseError, Pipeline, async_trait};
use tracing::trace;

use crate::date::SendDate;

/// Forks the call into its application's pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnterApplication;

#[async_trait]
impl Interceptor for EnterApplication {
    async fn intercept(&self, call: &mut ApplicationCall, execution: &mut Execution) -> Result<(), BoxError> {
        let application = Arc::clone(call.application());
        trace!(path = call.request().path(), "entering application pipeline");
        execution.fork(call, application.pipeline()).await?;
        Ok(())
    }
}

/// Builds the host pipeline, appending [`EnterApplication`] last.
#[derive(Debug)]
pub struct HostPipelineBuilder {
    pipeline: Pipeline,
}

impl HostPipelineBuilder {
    pub fn new() -> Self {
        Self { pipeline: Pipeline::application() }
    }

    /// Adds [`SendDate`] to the `Plugins` phase.
    #[must_use]
    pub fn send_date(mut self) -> Self {
        self.pipeline.intercept_or_define(&Pipeline::PLUGINS, SendDate);
        self
    }

    pub fn intercept(mut self, phase: &Phase, interceptor: impl Interceptor + 'static) -> Result<Self, PhaseError> {
        self.pipeline.intercept(phase, interceptor)?;
        Ok(self)
    }

    pub fn build(mut self) -> Pipeline {
        self.pipeline.intercept_or_define(&Pipeline::INFRASTRUCTURE, EnterApplication);
        self.pipeline
    }
}

impl Default for HostPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
