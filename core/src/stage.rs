//! Stage trait.
//!
//! RULE: Every pipeline step implements PipelineStage.
//! The library exposes stages; callers decide the order they run in
//! and whether to continue after a failure.

use crate::{clock::RunClock, error::VelocityResult, event::StageEvent};

pub trait PipelineStage {
    /// Stable name for logs, e.g. "historical_update" or "flag_detection".
    fn name(&self) -> &'static str;

    /// The rule this stage belongs to, if any.
    fn rule(&self) -> Option<&str> {
        None
    }

    /// Run to completion against `clock`'s date.
    ///
    /// A stage checks its own preconditions and returns an error before
    /// touching any persisted file when they do not hold.
    fn run(&self, clock: &RunClock) -> VelocityResult<StageEvent>;
}
