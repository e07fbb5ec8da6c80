pub mod bus;
pub mod config;
pub mod crypto;
pub mod error;
pub mod lifeline;
pub mod message;
pub mod node;
pub mod pulse;
pub mod record;
pub mod reference;

pub use bus::{ExecutionContext, MessageBus};
pub use error::CoreError;
pub use pulse::{Pulse, PulseNumber};
pub use reference::{JetId, NodeRef, ObjectId, RecordId, ShortNodeId};
