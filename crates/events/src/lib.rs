//! Job outcome events and the bus that carries them.
//!
//! Downstream persistence/notification components subscribe here; nothing in
//! this crate knows how results are stored.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;
pub mod job_event;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use job_event::JobEvent;
