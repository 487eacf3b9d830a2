//! Concurrency and orchestration core for an automated-imaging host
//! process.
//!
//! Every asynchronous operation is scheduled through the [`event_loop`]
//! (component A); the [`bus`] and [`dispatcher`] build a command/event
//! layer on top of it (B, C); [`script`] and [`guider`] wrap external
//! processes and an external control protocol in the same uniform
//! completion/cancellation idiom (D, E, F); [`sequencer`] composes
//! dispatcher calls into multi-target imaging runs (G); [`registry`] is a
//! weak-referencing lookup used to wire components together at process
//! start without becoming an ownership root (H); [`adapters`] translates
//! wire requests into calls on A-H (I).
//!
//! # Modules
//!
//! - [`error`] - shared error taxonomy for every completion channel
//! - [`event_loop`] - priority/delay/periodic task scheduler
//! - [`bus`] - hierarchical-topic publish/subscribe fabric
//! - [`dispatcher`] - named command registry with middleware and undo
//! - [`script`] - script registration, execution, and safety analysis
//! - [`guider`] - guiding-protocol client (calibration, dither, settle)
//! - [`sequencer`] - multi-target exposure sequence execution
//! - [`registry`] - process-wide weak-reference service lookup
//! - [`adapters`] - controller and event-stream boundary translation
//! - [`domain`] - façade re-exporting the data-model types above
//! - [`config`] - configuration sections and the load fallback chain
//! - [`cli`] - command-line surface of the host process

pub mod adapters;
pub mod bus;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod event_loop;
pub mod guider;
pub mod registry;
pub mod script;
pub mod sequencer;

pub use bus::{MessageBus, SubscriptionHandle, SubscriptionMode};
pub use config::Config;
pub use dispatcher::{CommandDispatcher, CommandOptions, MiddlewareOutcome};
pub use error::{CoreError, CoreResult};
pub use event_loop::{EventLoop, EventLoopConfig, TaskHandle, TaskId, TaskStatus};
pub use guider::{ConnectionConfig as GuiderConnectionConfig, GuiderClient, GuiderSnapshot, GuiderState};
pub use registry::ServiceRegistry;
pub use script::{ScriptAnalyzer, ScriptManager, ScriptManagerConfig};
pub use sequencer::{RecoveryPolicy, SchedulingPolicy, Sequencer, Target, TaskSpec};
