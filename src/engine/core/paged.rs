use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::engine::api::{JobRequest, PagedResponse};
use crate::engine::helpers::{random_token, truthy};

use super::http::Transport;

const VISIBILITY_SAMPLES: usize = 10;

/// Column declared by a table view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub id: String,
    pub mandatory: bool,
    pub visible: bool,
}

impl ColumnSpec {
    pub fn optional(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mandatory: false,
            visible: true,
        }
    }

    pub fn mandatory(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mandatory: true,
            visible: true,
        }
    }

    pub fn hidden(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mandatory: false,
            visible: false,
        }
    }
}

/// A fully loaded table.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub rows: Vec<Value>,
    pub columns: Vec<(String, bool)>,
}

impl Dataset {
    pub fn is_visible(&self, column: &str) -> bool {
        self.columns
            .iter()
            .any(|(id, visible)| id == column && *visible)
    }
}

#[derive(Debug, Clone)]
pub enum LoadEvent {
    Batch { loaded: usize, size: u64 },
    Complete(Arc<Dataset>),
}

pub type RowParser = Arc<dyn Fn(&mut Vec<Value>) + Send + Sync>;

/// Loads a whole table page by page under one random token.
///
/// Starting a new load replaces the active token, so pages still in flight
/// for an older load are discarded when they arrive.
pub struct PagedLoader {
    transport: Arc<dyn Transport>,
    columns: Vec<ColumnSpec>,
    timeout: Duration,
    active_token: Mutex<Option<String>>,
    parser: Option<RowParser>,
    progress: Option<UnboundedSender<LoadEvent>>,
}

impl PagedLoader {
    pub fn new(transport: Arc<dyn Transport>, columns: Vec<ColumnSpec>, timeout: Duration) -> Self {
        Self {
            transport,
            columns,
            timeout,
            active_token: Mutex::new(None),
            parser: None,
            progress: None,
        }
    }

    pub fn with_parser(mut self, parser: RowParser) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn with_progress(mut self, progress: UnboundedSender<LoadEvent>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn active_token(&self) -> Option<String> {
        self.active_token.lock().clone()
    }

    /// Load every page of `url`. Returns `None` when the load stopped early
    /// (transport failure, malformed page or superseded by a newer load).
    pub async fn load(&self, url: &str) -> Option<Dataset> {
        let token = random_token();
        *self.active_token.lock() = Some(token.clone());

        let mut rows: Vec<Value> = Vec::new();
        let mut next: Option<String> = None;
        loop {
            let mut request = JobRequest::get(url)
                .timeout(self.timeout)
                .param("token", token.as_str());
            if let Some(cursor) = &next {
                request = request.param("next", cursor.as_str());
            }

            let value = match self.transport.send(request).await.into_result() {
                Ok(value) => value,
                Err(err) => {
                    debug!(url, error = %err, "Paged load stopped");
                    return None;
                }
            };

            let page = PagedResponse::from_value(&value);
            let Some(ctrl) = page.ctrl else {
                debug!(url, "Dropping page without control block");
                return None;
            };
            if !self.is_current(&token, ctrl.token.as_deref()) {
                debug!(url, "Dropping page from a superseded load");
                return None;
            }
            let Some(mut data) = page.data else {
                debug!(url, "Dropping page without data");
                return None;
            };

            if let Some(parser) = &self.parser {
                parser(&mut data);
            }
            rows.extend(data);
            self.emit(LoadEvent::Batch {
                loaded: rows.len(),
                size: ctrl.size,
            });

            match ctrl.next {
                Some(cursor) => next = Some(cursor),
                None => break,
            }
        }

        let columns = column_visibility(&rows, &self.columns, &mut rand::thread_rng());
        let dataset = Dataset { rows, columns };
        self.emit(LoadEvent::Complete(Arc::new(dataset.clone())));
        Some(dataset)
    }

    fn is_current(&self, own: &str, reply: Option<&str>) -> bool {
        let active = self.active_token.lock();
        reply == Some(own) && active.as_deref() == Some(own)
    }

    fn emit(&self, event: LoadEvent) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(event);
        }
    }
}

/// Decide column visibility from a sample of at most ten rows, one drawn
/// at random from each of up to ten equal strata of the table.
///
/// Mandatory columns are always shown; other columns are shown when
/// declared visible and populated in a sampled row.
pub fn column_visibility<R: Rng + ?Sized>(
    rows: &[Value],
    columns: &[ColumnSpec],
    rng: &mut R,
) -> Vec<(String, bool)> {
    let samples = sample_indices(rows.len(), rng);
    columns
        .iter()
        .map(|column| {
            let populated = samples.iter().any(|&idx| {
                rows[idx]
                    .get(column.id.as_str())
                    .map(truthy)
                    .unwrap_or(false)
            });
            let visible = column.mandatory || (column.visible && populated);
            (column.id.clone(), visible)
        })
        .collect()
}

fn sample_indices<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Vec<usize> {
    if len == 0 {
        return Vec::new();
    }
    let strata = len.min(VISIBILITY_SAMPLES);
    (0..strata)
        .map(|i| {
            let start = i * len / strata;
            let end = ((i + 1) * len / strata).max(start + 1);
            rng.gen_range(start..end)
        })
        .collect()
}
