//! `stagehand-events`: outbound job notifications.
//!
//! Mechanics only (no IO, no async): event types, owner-addressed envelopes,
//! a transport-agnostic bus and the `JobNotifier` sink the job context calls.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod notifier;
pub mod owner;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::JobEvent;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use notifier::{BusNotifier, JobEventEnvelope, JobNotifier, NoopNotifier, NotifyError};
pub use owner::OwnerScoped;
