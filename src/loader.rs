use std::cmp::Ordering;
use std::sync::Arc;

use backoff::backoff::Backoff;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{QueryError, QueryOptions, QueryResponse};
use crate::existence::ExistenceSet;
use crate::progress::{ProgressSink, RateClock, SilentProgress};
use crate::query::{count_query, page_query, scan_query, GremlinQuery, CURSOR_FIELD};
use crate::record::KeyProjection;
use crate::remote::Remote;

/// How the loader walks the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Paging {
    /// Order by the sort key and filter strictly after the last value seen.
    #[default]
    Keyset,
    /// Scan without ordering and follow the server's continuation tokens.
    Continuation,
}

#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub page_size: usize,
    pub min_page_size: usize,
    pub sort_key: String,
    pub paging: Paging,
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            page_size: 1000,
            min_page_size: 100,
            sort_key: "graph_id".to_string(),
            paging: Paging::Keyset,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub existing: ExistenceSet,
    pub rows: usize,
    pub pages: usize,
    /// Page size in effect when the sweep ended.
    pub page_size: usize,
    pub last_cursor: Option<Value>,
    /// True only when the sweep reached an empty page.
    pub complete: bool,
    pub cancelled: bool,
}

#[derive(Debug)]
enum PageFailure {
    Fatal(QueryError),
    Exhausted { page_size: usize, last: QueryError },
    Cancelled,
}

/// Sweeps the remote store in sort-key order, one keyset page at a time,
/// collecting the composite key of every entity it sees.
pub struct CursorLoader {
    remote: Remote,
    projection: KeyProjection,
    settings: LoaderSettings,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl CursorLoader {
    pub fn new(remote: Remote, projection: KeyProjection, settings: LoaderSettings) -> Self {
        Self {
            remote,
            projection,
            settings,
            progress: Arc::new(SilentProgress),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Best-effort entity count for progress reporting.
    pub async fn count(&self) -> Option<usize> {
        let query = count_query(self.projection.kind());
        match self.remote.call(&query, &QueryOptions::page(1)).await {
            Ok(response) => response
                .rows
                .first()
                .and_then(|row| row.get("value"))
                .and_then(Value::as_u64)
                .map(|count| count as usize),
            Err(err) => {
                debug!(error = %err, "count query failed; progress will be indeterminate");
                None
            }
        }
    }

    /// Never fails: on a fatal page error, exhausted retries at the minimum
    /// page size or cancellation it returns what has been confirmed so far.
    pub async fn load_existing(&self) -> LoadOutcome {
        let kind = self.projection.kind();
        let total = self.count().await;
        let clock = RateClock::start();
        let mut outcome = LoadOutcome {
            existing: ExistenceSet::new(),
            rows: 0,
            pages: 0,
            page_size: self.settings.page_size.max(1),
            last_cursor: None,
            complete: false,
            cancelled: false,
        };

        let mut continuation: Option<String> = None;
        loop {
            let response = match self
                .fetch_page(
                    outcome.last_cursor.as_ref(),
                    continuation.as_deref(),
                    &mut outcome.page_size,
                )
                .await
            {
                Ok(response) => response,
                Err(PageFailure::Cancelled) => {
                    outcome.cancelled = true;
                    break;
                }
                Err(PageFailure::Fatal(err)) => {
                    warn!(error = %err, loaded = outcome.rows, "page fetch failed; returning partial {}", kind.plural());
                    break;
                }
                Err(PageFailure::Exhausted { page_size, last }) => {
                    warn!(
                        error = %last,
                        page_size,
                        loaded = outcome.rows,
                        "retries exhausted at minimum page size; returning partial {}",
                        kind.plural()
                    );
                    break;
                }
            };

            let rows = response.rows;
            if rows.is_empty() {
                outcome.complete = true;
                break;
            }
            for row in &rows {
                if let Some(key) = self.projection.key_from_row(row) {
                    outcome.existing.insert(key);
                }
            }
            outcome.rows += rows.len();
            outcome.pages += 1;
            self.progress.update(&clock.snapshot(outcome.rows, total));
            debug!(page = outcome.pages, rows = rows.len(), "loaded page");

            let advanced = match self.settings.paging {
                Paging::Keyset => {
                    let next_cursor = rows
                        .last()
                        .and_then(|row| row.get(CURSOR_FIELD))
                        .filter(|value| !value.is_null())
                        .cloned();
                    match next_cursor {
                        Some(next) if cursor_advances(outcome.last_cursor.as_ref(), &next) => {
                            outcome.last_cursor = Some(next);
                            true
                        }
                        other => {
                            warn!(
                                previous = ?outcome.last_cursor,
                                next = ?other,
                                "sort key did not advance; stopping sweep"
                            );
                            false
                        }
                    }
                }
                Paging::Continuation => match response.continuation {
                    None => {
                        outcome.complete = true;
                        false
                    }
                    Some(token) if continuation.as_deref() == Some(token.as_str()) => {
                        warn!("continuation token did not change; stopping sweep");
                        false
                    }
                    Some(token) => {
                        continuation = Some(token);
                        true
                    }
                },
            };
            if !advanced {
                break;
            }
        }

        self.progress.finish();
        info!(
            keys = outcome.existing.len(),
            rows = outcome.rows,
            pages = outcome.pages,
            complete = outcome.complete,
            "loaded existing {}",
            kind.plural()
        );
        outcome
    }

    fn page_request(
        &self,
        cursor: Option<&Value>,
        continuation: Option<&str>,
        page_size: usize,
    ) -> (GremlinQuery, QueryOptions) {
        match self.settings.paging {
            Paging::Keyset => (
                page_query(&self.projection, &self.settings.sort_key, page_size, cursor),
                QueryOptions::page(page_size),
            ),
            Paging::Continuation => (
                scan_query(&self.projection),
                QueryOptions {
                    page_size: Some(page_size),
                    continuation: continuation.map(str::to_string),
                },
            ),
        }
    }

    /// Fetches one page, retrying retryable failures with backoff. When a page
    /// size runs out of attempts it is halved (down to the minimum) and the
    /// page is tried again with a fresh attempt budget.
    async fn fetch_page(
        &self,
        cursor: Option<&Value>,
        continuation: Option<&str>,
        page_size: &mut usize,
    ) -> Result<QueryResponse, PageFailure> {
        let min_page_size = self.settings.min_page_size.max(1);
        loop {
            let (query, options) = self.page_request(cursor, continuation, *page_size);
            let mut backoff = self.remote.policy.backoff();

            let last = loop {
                if self.cancel.is_cancelled() {
                    return Err(PageFailure::Cancelled);
                }
                match self.remote.call(&query, &options).await {
                    Ok(response) => return Ok(response),
                    Err(err) if err.is_retryable() => match backoff.next_backoff() {
                        Some(delay) => {
                            self.remote.tracker.record(err.kind());
                            debug!(error = %err, page_size = *page_size, delay_ms = delay.as_millis() as u64, "retrying page");
                            tokio::select! {
                                _ = self.cancel.cancelled() => return Err(PageFailure::Cancelled),
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => break err,
                    },
                    Err(err) => return Err(PageFailure::Fatal(err)),
                }
            };

            if *page_size <= min_page_size {
                return Err(PageFailure::Exhausted {
                    page_size: *page_size,
                    last,
                });
            }
            let reduced = (*page_size / 2).max(min_page_size);
            warn!(from = *page_size, to = reduced, error = %last, "retries exhausted; shrinking page size");
            *page_size = reduced;
        }
    }
}

fn compare_cursor(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                return Some(a.cmp(&b));
            }
            if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
                return Some(a.cmp(&b));
            }
            a.as_f64()?.partial_cmp(&b.as_f64()?)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn cursor_advances(previous: Option<&Value>, next: &Value) -> bool {
    match previous {
        None => true,
        Some(previous) => compare_cursor(previous, next) == Some(Ordering::Less),
    }
}
