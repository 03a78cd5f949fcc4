//! Core shared types
//!
//! - `Frame`: one inbound link-layer packet
//! - `Event` / `EventSink`: telemetry leaving the sensor
//! - `Knock`: probe record used for scan detection

pub mod event;
pub mod frame;
pub mod knock;

pub use event::{Event, EventSink, NullSink};
pub use frame::{EtherType, Frame, LinkHeader, MacAddr, NicId};
pub use knock::{Knock, KnockKind};
