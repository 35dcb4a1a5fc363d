// QueueSnapshotPoller: ordered queue snapshots with optimistic vote overlay.

pub mod optimistic;
pub mod poller;
pub mod snapshot;

pub use optimistic::{DeltaResolution, OptimisticBook, OptimisticDelta};
pub use poller::{PollerControl, PollerEvent, QueuePoller, RosterUpdate};
pub use snapshot::{QueueSnapshot, Track};
