pub mod ids;
pub mod job;
pub mod work;
pub mod priority;
pub mod events;

pub use ids::{JobId, OwnerId, ReceiptHandle, UnitId, WorkerId};
pub use job::{Job, JobFailure, JobResult, JobStatus, Progress};
pub use work::{Delivery, WorkItem};
pub use priority::JobPriority;
pub use events::JobEvent;
