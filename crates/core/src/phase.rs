//! Named execution phases and their relative ordering.
//!
//! A [`PhaseGraph`] keeps its phases as an ordered list plus the explicit
//! "a runs before b" constraints that produced that order. Relative inserts
//! place the new phase directly, while [`PhaseGraph::require_order`] adds a
//! constraint between two existing phases and moves as few phases as it
//! takes to honor it. Every
//! operation validates eagerly: an unknown reference, a duplicate name or a
//! cycle is reported immediately and leaves the graph unchanged.

use std::borrow::Cow;
use std::fmt;

use thiserror::Error;

/// A named ordering bucket for interceptors.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Phase {
    name: Cow<'static, str>,
}

impl Phase {
    pub const fn new(name: &'static str) -> Self {
        Self { name: Cow::Borrowed(name) }
    }

    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Phase({})", self.name)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseRelation {
    Before,
    After,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PhaseError {
    #[error("phase `{phase}` is already defined")]
    Duplicate { phase: Phase },

    #[error("phase `{phase}` is not defined")]
    Unknown { phase: Phase },

    #[error("ordering `{before}` before `{after}` would create a cycle")]
    Cycle { before: Phase, after: Phase },
}

impl PhaseError {
    pub fn duplicate(phase: &Phase) -> Self {
        Self::Duplicate { phase: phase.clone() }
    }

    pub fn unknown(phase: &Phase) -> Self {
        Self::Unknown { phase: phase.clone() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PhaseGraph {
    phases: Vec<Phase>,
    /// `(a, b)`: `a` must run before `b`
    constraints: Vec<(Phase, Phase)>,
}

impl PhaseGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `phase` after every phase defined so far.
    pub fn define_phase(&mut self, phase: Phase) -> Result<(), PhaseError> {
        self.ensure_absent(&phase)?;
        self.phases.push(phase);
        Ok(())
    }

    /// Defines `phase` directly before or after `reference`.
    ///
    /// Several phases inserted after the same reference keep their insertion
    /// order: each lands after the ones placed there earlier.
    pub fn define_phase_relative(&mut self, phase: Phase, relation: PhaseRelation, reference: &Phase) -> Result<(), PhaseError> {
        self.ensure_absent(&phase)?;
        let reference_index = self.index_of(reference).ok_or_else(|| PhaseError::unknown(reference))?;

        match relation {
            PhaseRelation::Before => {
                self.phases.insert(reference_index, phase.clone());
                self.constraints.push((phase, reference.clone()));
            }
            PhaseRelation::After => {
                let last_after = self
                    .constraints
                    .iter()
                    .filter(|(before, _)| before == reference)
                    .filter_map(|(_, after)| self.index_of(after))
                    .fold(reference_index, usize::max);
                self.phases.insert(last_after + 1, phase.clone());
                self.constraints.push((reference.clone(), phase));
            }
        }
        Ok(())
    }

    /// Requires `before` to run ahead of `after`.
    ///
    /// When `before` currently runs later, it moves directly in front of
    /// `after`, together with every phase between them that is constrained
    /// to run ahead of it. No other phase changes its relative position.
    pub fn require_order(&mut self, before: &Phase, after: &Phase) -> Result<(), PhaseError> {
        let before_index = self.index_of(before).ok_or_else(|| PhaseError::unknown(before))?;
        let after_index = self.index_of(after).ok_or_else(|| PhaseError::unknown(after))?;

        let predecessors = self.predecessors(before);
        if before == after || predecessors.contains(&after) {
            return Err(PhaseError::Cycle { before: before.clone(), after: after.clone() });
        }

        if before_index > after_index {
            let moved: Vec<Phase> = self.phases[after_index..]
                .iter()
                .filter(|phase| *phase == before || predecessors.contains(phase))
                .cloned()
                .collect();
            // every moved phase sits behind `after`, so its index is unchanged
            self.phases.retain(|phase| !moved.contains(phase));
            self.phases.splice(after_index..after_index, moved);
        }
        self.constraints.push((before.clone(), after.clone()));
        Ok(())
    }

    /// The total execution order of the phases.
    pub fn order(&self) -> &[Phase] {
        &self.phases
    }

    pub fn contains(&self, phase: &Phase) -> bool {
        self.phases.contains(phase)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub(crate) fn index_of(&self, phase: &Phase) -> Option<usize> {
        self.phases.iter().position(|p| p == phase)
    }

    /// A graph over `phases`, in that order, without constraints.
    ///
    /// The caller guarantees the names are distinct.
    pub(crate) fn from_ordered(phases: &[Phase]) -> Self {
        debug_assert!(
            phases.iter().enumerate().all(|(i, phase)| !phases[..i].contains(phase)),
            "phase names must be distinct"
        );
        Self { phases: phases.to_vec(), constraints: Vec::new() }
    }

    /// Appends `phase`, which the caller has checked is not defined yet.
    pub(crate) fn push_distinct(&mut self, phase: Phase) {
        debug_assert!(!self.contains(&phase), "phase `{phase}` is already defined");
        self.phases.push(phase);
    }

    /// Places `phase` at `index` without recording a constraint.
    pub(crate) fn insert_at(&mut self, index: usize, phase: Phase) -> Result<(), PhaseError> {
        self.ensure_absent(&phase)?;
        self.phases.insert(index.min(self.phases.len()), phase);
        Ok(())
    }

    fn ensure_absent(&self, phase: &Phase) -> Result<(), PhaseError> {
        if self.contains(phase) { Err(PhaseError::duplicate(phase)) } else { Ok(()) }
    }

    /// Every phase constrained, directly or transitively, to run ahead of
    /// `phase`.
    fn predecessors(&self, phase: &Phase) -> Vec<&Phase> {
        let mut found: Vec<&Phase> = Vec::new();
        let mut pending = vec![phase];
        while let Some(current) = pending.pop() {
            for (before, after) in &self.constraints {
                if after == current && !found.contains(&before) {
                    found.push(before);
                    pending.push(before);
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETUP: Phase = Phase::new("Setup");
    const MONITORING: Phase = Phase::new("Monitoring");
    const PLUGINS: Phase = Phase::new("Plugins");
    const CALL: Phase = Phase::new("Call");
    const FALLBACK: Phase = Phase::new("Fallback");

    fn names(graph: &PhaseGraph) -> Vec<&str> {
        graph.order().iter().map(Phase::name).collect()
    }

    fn base() -> PhaseGraph {
        let mut graph = PhaseGraph::new();
        for phase in [SETUP, CALL, FALLBACK] {
            graph.define_phase(phase).unwrap();
        }
        graph
    }

    #[test]
    fn define_keeps_insertion_order() {
        assert_eq!(names(&base()), ["Setup", "Call", "Fallback"]);
    }

    #[test]
    fn relative_before_and_after() {
        let mut graph = base();
        graph.define_phase_relative(PLUGINS, PhaseRelation::Before, &CALL).unwrap();
        graph.define_phase_relative(MONITORING, PhaseRelation::After, &SETUP).unwrap();

        assert_eq!(names(&graph), ["Setup", "Monitoring", "Plugins", "Call", "Fallback"]);
    }

    #[test]
    fn several_after_same_reference_keep_insertion_order() {
        let mut graph = base();
        graph.define_phase_relative(Phase::new("First"), PhaseRelation::After, &SETUP).unwrap();
        graph.define_phase_relative(Phase::new("Second"), PhaseRelation::After, &SETUP).unwrap();

        assert_eq!(names(&graph), ["Setup", "First", "Second", "Call", "Fallback"]);
    }

    #[test]
    fn unknown_reference_and_duplicate_are_errors() {
        let mut graph = base();

        assert_eq!(
            graph.define_phase_relative(PLUGINS, PhaseRelation::After, &MONITORING),
            Err(PhaseError::unknown(&MONITORING))
        );
        assert_eq!(graph.define_phase(CALL), Err(PhaseError::duplicate(&CALL)));
        assert_eq!(names(&graph), ["Setup", "Call", "Fallback"]);
    }

    #[test]
    fn require_order_resorts_stably() {
        let mut graph = base();
        graph.define_phase(MONITORING).unwrap();
        graph.require_order(&MONITORING, &CALL).unwrap();

        assert_eq!(names(&graph), ["Setup", "Monitoring", "Call", "Fallback"]);
    }

    #[test]
    fn require_order_moves_constrained_predecessors_along() {
        let mut graph = base();
        graph.define_phase(Phase::new("Auth")).unwrap();
        graph.define_phase(Phase::new("Session")).unwrap();
        graph.require_order(&Phase::new("Auth"), &Phase::new("Session")).unwrap();
        graph.require_order(&Phase::new("Session"), &CALL).unwrap();

        assert_eq!(names(&graph), ["Setup", "Auth", "Session", "Call", "Fallback"]);
    }

    #[test]
    fn require_order_already_satisfied_moves_nothing() {
        let mut graph = base();
        graph.require_order(&SETUP, &FALLBACK).unwrap();

        assert_eq!(names(&graph), ["Setup", "Call", "Fallback"]);
    }

    #[test]
    fn transitive_cycle_is_rejected() {
        let mut graph = base();
        graph.require_order(&SETUP, &CALL).unwrap();
        graph.require_order(&CALL, &FALLBACK).unwrap();

        let result = graph.require_order(&FALLBACK, &SETUP);

        assert_eq!(result, Err(PhaseError::Cycle { before: FALLBACK, after: SETUP }));
        assert_eq!(names(&graph), ["Setup", "Call", "Fallback"]);
    }

    #[test]
    fn cycle_is_rejected_and_rolled_back() {
        let mut graph = base();
        graph.require_order(&SETUP, &CALL).unwrap();

        let result = graph.require_order(&CALL, &SETUP);

        assert_eq!(result, Err(PhaseError::Cycle { before: CALL, after: SETUP }));
        assert_eq!(names(&graph), ["Setup", "Call", "Fallback"]);
    }
}
