pub mod assigner;
pub mod bucket;
pub mod job;
pub mod queue;
pub mod reenqueuer;
pub mod split;

pub use assigner::{DequeueResult, DequeueScheduler, NothingToDequeueBehavior};
pub use job::{JobRegistry, JobResults, JobState};
pub use queue::{BucketQueueHolder, Completion, QueueState};
pub use reenqueuer::{StuckBucket, StuckBucketReason, StuckBucketsReenqueuer};
pub use split::{BucketEnqueuer, BucketSplitInfo, QueueBucketEnqueuer, ScheduleStrategy};
