// SPDX-License-Identifier: MIT
//! Planner port — asked for a new task when the focus queue runs dry.
//!
//! The planner itself (goal-gap analysis, spec synthesis) lives outside this
//! crate; the tick controller only consumes this interface.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::Task;
use crate::store::FocusScope;

/// Outcome of a planning request.
#[derive(Debug)]
pub enum PlanOutcome {
    /// A new queued task, ready for the dispatcher on this same tick.
    Planned(Task),
    /// The planner has nothing to offer; surfaced as a `needs_planning` event
    /// so an operator can see the gap.
    NeedsPlanning,
}

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan_next_task(&self, scope: &FocusScope) -> Result<PlanOutcome>;
}

/// Planner that never plans. Default wiring until a real planner is attached.
pub struct NoopPlanner;

#[async_trait]
impl Planner for NoopPlanner {
    async fn plan_next_task(&self, _scope: &FocusScope) -> Result<PlanOutcome> {
        Ok(PlanOutcome::NeedsPlanning)
    }
}
