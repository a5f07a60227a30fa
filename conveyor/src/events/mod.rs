//! Event plumbing.
//!
//! Two flows live here: execution events travelling from backends to the
//! engine over [`event_channel`], and lifecycle events the scheduler emits
//! to an [`EventSink`] for observability.

mod channel;
mod sink;

pub use channel::{event_channel, EventPublisher, EventStream};
pub use sink::{names, CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
