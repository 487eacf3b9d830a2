//! Domain façade: re-exports the data-model types the core operates on.
//!
//! Each type is defined in the component module that owns its lifecycle —
//! scripts in [`crate::script`], guider wire shapes in [`crate::guider`],
//! sequencer documents in [`crate::sequencer`] — and surfaced here so
//! callers outside those modules have one place to look instead of reaching
//! into component internals.

pub use crate::bus::{SubscriptionHandle, SubscriptionMode};
pub use crate::dispatcher::{CommandOptions, Handler, MiddlewareOutcome};
pub use crate::event_loop::{TaskHandle, TaskId, TaskStatus};
pub use crate::guider::{ConnectionConfig, GuideStar, GuideStats, GuiderSnapshot, GuiderState};
pub use crate::script::{RunOutcome, ScriptInfo, ScriptKind};
pub use crate::sequencer::{
    RecoveryPolicy, SchedulingPolicy, SequenceDocument, SequencePolicy, Target, TargetStatus, TaskSpec,
};
