mod auth;
mod history;
mod http;
mod jobs;
mod paged;
mod retry;

pub use auth::{root_host, AuthFlow, TokenStore};
pub use history::{normalize_history, HistoryFeed, HistoryRecord, HISTORY_COLUMNS};
pub use http::{HttpJobClient, Outcome, Transport};
pub use jobs::{
    AnalyzeJob, AsyncJobPoller, CompareJob, JobKind, JobPage, JobResult, JobTracker, PageCursor,
    SectionMask, COMPARE_SECTIONS,
};
pub use paged::{column_visibility, ColumnSpec, Dataset, LoadEvent, PagedLoader};
pub use retry::RetryPolicy;
