pub mod history;
pub mod models;
pub mod notifications;
pub mod probe;
pub mod rotation;
pub mod runner;
pub mod scheduler;
pub mod transfer_engine;
pub mod worker;

pub use history::SnapshotStore;
pub use models::{EPOCH_LABEL, Job, JobSpec, STAGING_DIR, today_label};
pub use probe::{PingProbe, ReachabilityProbe, StaticProbe};
pub use rotation::{Prepared, Rotator, clone_tree};
pub use runner::{Outcome, TransferRunner};
pub use scheduler::{Scheduler, SchedulerOptions};
pub use worker::{Worker, WorkerSlot};
