pub mod ids;
pub mod job;
pub mod probe;
pub mod record;

pub use ids::{FileId, JobId};
pub use job::{JobAction, JobDescriptor, JobKind, RunningJob};
pub use probe::{AudioStreamInfo, ProbeResult, SubtitleStreamInfo, VideoStreamInfo};
pub use record::{ErrorInfo, FileRecord, FileStatus, SortFields, MIN_COMPUTE_SCORE};
