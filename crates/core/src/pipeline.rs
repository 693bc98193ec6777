//! Interceptors grouped by phase.
//!
//! The execution order of a [`Pipeline`] is the phase order of its
//! [`PhaseGraph`], and within one phase the order interceptors were
//! registered in. The flattened order is computed once and cached until the
//! pipeline is modified again; a pipeline that is already shared behind an
//! `Arc` can no longer be modified at all.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use once_cell::sync::OnceCell;

use crate::call::ApplicationCall;
use crate::execution::Execution;
use crate::phase::{Phase, PhaseError, PhaseGraph, PhaseRelation};

pub type BoxError = Box<dyn Error + Send + Sync>;

/// A unit of request processing bound to one phase.
///
/// Returning `Ok(())` proceeds to the next interceptor, returning an error
/// fails the whole execution. See [`Execution`] for finishing early,
/// wrapping the rest of the pipeline and forking.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(&self, call: &mut ApplicationCall, execution: &mut Execution) -> Result<(), BoxError>;
}

#[async_trait]
impl<I: Interceptor + ?Sized> Interceptor for Arc<I> {
    async fn intercept(&self, call: &mut ApplicationCall, execution: &mut Execution) -> Result<(), BoxError> {
        (**self).intercept(call, execution).await
    }
}

/// An [`Interceptor`] built from a closure returning a boxed future.
///
/// ```ignore
/// pipeline.intercept(&Pipeline::CALL, interceptor_fn(|call, execution| {
///     async move {
///         call.response_mut().respond("hello")?;
///         execution.finish();
///         Ok(())
///     }
///     .boxed()
/// }))?;
/// ```
pub struct InterceptorFn<F> {
    f: F,
}

pub fn interceptor_fn<F>(f: F) -> InterceptorFn<F>
where
    F: for<'a> Fn(&'a mut ApplicationCall, &'a mut Execution) -> BoxFuture<'a, Result<(), BoxError>> + Send + Sync,
{
    InterceptorFn { f }
}

impl<F> fmt::Debug for InterceptorFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorFn").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> Interceptor for InterceptorFn<F>
where
    F: for<'a> Fn(&'a mut ApplicationCall, &'a mut Execution) -> BoxFuture<'a, Result<(), BoxError>> + Send + Sync,
{
    async fn intercept(&self, call: &mut ApplicationCall, execution: &mut Execution) -> Result<(), BoxError> {
        (self.f)(call, execution).await
    }
}

pub(crate) type InterceptorList = Arc<[Arc<dyn Interceptor>]>;

#[derive(Default)]
pub struct Pipeline {
    phases: PhaseGraph,
    interceptors: HashMap<Phase, Vec<Arc<dyn Interceptor>>>,
    flattened: OnceCell<InterceptorList>,
}

impl Pipeline {
    pub const SETUP: Phase = Phase::new("Setup");
    pub const MONITORING: Phase = Phase::new("Monitoring");
    pub const PLUGINS: Phase = Phase::new("Plugins");
    pub const INFRASTRUCTURE: Phase = Phase::new("Infrastructure");
    pub const CALL: Phase = Phase::new("Call");
    pub const FALLBACK: Phase = Phase::new("Fallback");

    pub fn new() -> Self {
        Self::default()
    }

    /// A pipeline with the given phases defined in order.
    pub fn with_phases(phases: impl IntoIterator<Item = Phase>) -> Result<Self, PhaseError> {
        let mut pipeline = Self::new();
        for phase in phases {
            pipeline.add_phase(phase)?;
        }
        Ok(pipeline)
    }

    /// The phases every application and host pipeline starts with:
    /// `Setup`, `Monitoring`, `Plugins`, `Infrastructure`, `Call`, `Fallback`.
    pub fn application() -> Self {
        Self { phases: PhaseGraph::from_ordered(&STANDARD_PHASES), ..Self::default() }
    }

    pub fn add_phase(&mut self, phase: Phase) -> Result<(), PhaseError> {
        self.phases.define_phase(phase)?;
        self.invalidate();
        Ok(())
    }

    pub fn insert_phase_before(&mut self, reference: &Phase, phase: Phase) -> Result<(), PhaseError> {
        self.phases.define_phase_relative(phase, PhaseRelation::Before, reference)?;
        self.invalidate();
        Ok(())
    }

    pub fn insert_phase_after(&mut self, reference: &Phase, phase: Phase) -> Result<(), PhaseError> {
        self.phases.define_phase_relative(phase, PhaseRelation::After, reference)?;
        self.invalidate();
        Ok(())
    }

    pub fn require_order(&mut self, before: &Phase, after: &Phase) -> Result<(), PhaseError> {
        self.phases.require_order(before, after)?;
        self.invalidate();
        Ok(())
    }

    /// Appends `interceptor` to `phase`, which must already be defined.
    pub fn intercept(&mut self, phase: &Phase, interceptor: impl Interceptor + 'static) -> Result<(), PhaseError> {
        self.intercept_shared(phase, Arc::new(interceptor))
    }

    pub fn intercept_shared(&mut self, phase: &Phase, interceptor: Arc<dyn Interceptor>) -> Result<(), PhaseError> {
        if !self.phases.contains(phase) {
            return Err(PhaseError::unknown(phase));
        }
        self.interceptors.entry(phase.clone()).or_default().push(interceptor);
        self.invalidate();
        Ok(())
    }

    /// Appends `interceptor` to `phase`, first appending `phase` itself
    /// after every other phase when it is not defined yet.
    pub fn intercept_or_define(&mut self, phase: &Phase, interceptor: impl Interceptor + 'static) {
        if !self.phases.contains(phase) {
            self.phases.push_distinct(phase.clone());
        }
        self.interceptors.entry(phase.clone()).or_default().push(Arc::new(interceptor));
        self.invalidate();
    }

    pub fn phases(&self) -> &[Phase] {
        self.phases.order()
    }

    /// Interceptors in execution order: phase order first, registration
    /// order within a phase.
    pub fn interceptors(&self) -> InterceptorList {
        Arc::clone(self.flattened.get_or_init(|| {
            self.phases
                .order()
                .iter()
                .filter_map(|phase| self.interceptors.get(phase))
                .flat_map(|list| list.iter().cloned())
                .collect()
        }))
    }

    pub fn interceptors_in(&self, phase: &Phase) -> &[Arc<dyn Interceptor>] {
        self.interceptors.get(phase).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.values().all(Vec::is_empty)
    }

    /// Merges `other` into this pipeline.
    ///
    /// Both pipelines keep their internal phase order. Phases missing here
    /// are placed right after the closest preceding phase both pipelines
    /// share, or before the closest following one when nothing precedes them,
    /// and `other`'s order is recorded as constraints. Shared phases ordered
    /// differently by the two pipelines are a [`PhaseError::Cycle`], and
    /// leave this pipeline unchanged. The interceptors of each phase of
    /// `other` are appended after this pipeline's own interceptors for that
    /// phase.
    pub fn merge(&mut self, other: &Pipeline) -> Result<(), PhaseError> {
        let other_order = other.phases();

        let shared: Vec<(&Phase, usize)> =
            other_order.iter().filter_map(|phase| self.phases.index_of(phase).map(|index| (phase, index))).collect();
        if let Some(pair) = shared.windows(2).find(|pair| pair[0].1 > pair[1].1) {
            return Err(PhaseError::Cycle { before: pair[0].0.clone(), after: pair[1].0.clone() });
        }

        let mut phases = self.phases.clone();
        for (position, phase) in other_order.iter().enumerate() {
            if phases.contains(phase) {
                continue;
            }

            let anchor_after = other_order[..position].iter().rev().find_map(|p| phases.index_of(p));
            let index = match anchor_after {
                Some(index) => index + 1,
                None => other_order[position + 1..].iter().find_map(|p| phases.index_of(p)).unwrap_or(phases.len()),
            };
            phases.insert_at(index, phase.clone())?;
        }
        for pair in other_order.windows(2) {
            phases.require_order(&pair[0], &pair[1])?;
        }
        self.phases = phases;

        for phase in other_order {
            for interceptor in other.interceptors_in(phase) {
                self.interceptors.entry(phase.clone()).or_default().push(Arc::clone(interceptor));
            }
        }
        self.invalidate();
        Ok(())
    }

    fn invalidate(&mut self) {
        self.flattened.take();
    }
}

const STANDARD_PHASES: [Phase; 6] = [
    Pipeline::SETUP,
    Pipeline::MONITORING,
    Pipeline::PLUGINS,
    Pipeline::INFRASTRUCTURE,
    Pipeline::CALL,
    Pipeline::FALLBACK,
];

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: Vec<_> = self.phases().iter().map(|phase| (phase.name(), self.interceptors_in(phase).len())).collect();
        f.debug_struct("Pipeline").field("phases", &counts).finish()
    }
}
