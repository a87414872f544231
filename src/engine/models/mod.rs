mod events;
mod status;
mod system;
mod tree;

pub use events::{SystemEvent, TreeEvent};
pub use status::{SystemKind, SystemStatus};
pub use system::RemoteSystem;
pub use tree::{ReconcileReport, SystemTree};
