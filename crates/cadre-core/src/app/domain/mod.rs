pub mod checkpoint;
pub mod event;
pub mod event_log;
pub mod slice;
pub mod slices;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore, InMemoryCheckpointStore};
pub use event::{AgentEvent, EventPayload, HumanRequest, HumanResponse, InputStatus, ResetScope};
pub use event_log::{EventCursor, EventLog, EventSubscription};
pub use slice::{SliceError, SliceKind, SliceRegistry, StateSlice};
pub use types::{AgentId, CheckpointId, RequestId};
