mod requests;
mod responses;

pub use requests::{JobRequest, Method};
pub use responses::{
    is_auth_error, CheckPayload, HistoryRow, JobStatus, JobTicket, PageCtrl, PagedResponse,
    SystemRecord,
};
