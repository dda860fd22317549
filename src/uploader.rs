use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use backoff::future::{Retry, Sleeper};
use backoff::Error as BackoffError;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{QueryError, QueryOptions};
use crate::delta::DeltaItem;
use crate::dispatch::Dispatcher;
use crate::existence::ExistenceSet;
use crate::progress::{ProgressSink, RateClock, SilentProgress};
use crate::query::{drop_edge, drop_vertex, insert_edge, insert_vertex, GremlinQuery};
use crate::record::{EntityKind, KeyProjection};
use crate::remote::Remote;
use crate::retry::FailureKind;

/// The write a batch worker performs for each delta item, and how confirmed
/// items change the existence set.
pub trait WriteOp: Send + Sync {
    fn query(&self, item: &DeltaItem) -> GremlinQuery;

    fn settle(&self, existing: &mut ExistenceSet, confirmed: &[DeltaItem]) {
        existing.extend(confirmed.iter().map(|item| item.key.clone()));
    }

    fn verb(&self) -> &'static str {
        "wrote"
    }
}

/// Creates vertices or edges, letting the dispatcher extend each base query.
#[derive(Debug, Clone)]
pub struct InsertOp {
    projection: KeyProjection,
    sort_key: String,
    dispatcher: Dispatcher,
}

impl InsertOp {
    pub fn new(projection: KeyProjection, sort_key: impl Into<String>, dispatcher: Dispatcher) -> Self {
        Self {
            projection,
            sort_key: sort_key.into(),
            dispatcher,
        }
    }
}

impl WriteOp for InsertOp {
    fn query(&self, item: &DeltaItem) -> GremlinQuery {
        let base = match self.projection.kind() {
            EntityKind::Vertex => insert_vertex(&item.record, &self.projection, &self.sort_key),
            EntityKind::Edge => insert_edge(&item.record, &item.key, &self.sort_key),
        };
        self.dispatcher.apply(&item.record, base)
    }

    fn verb(&self) -> &'static str {
        "inserted"
    }
}

/// Drops vertices by id or edges by their stored key.
#[derive(Debug, Clone)]
pub struct DropOp {
    projection: KeyProjection,
    sort_key: String,
}

impl DropOp {
    pub fn new(projection: KeyProjection, sort_key: impl Into<String>) -> Self {
        Self {
            projection,
            sort_key: sort_key.into(),
        }
    }
}

impl WriteOp for DropOp {
    fn query(&self, item: &DeltaItem) -> GremlinQuery {
        match self.projection.kind() {
            EntityKind::Vertex => drop_vertex(&item.record),
            EntityKind::Edge => drop_edge(&item.key, &self.sort_key),
        }
    }

    /// A vertex drop removes the vertex whatever else its key held, so every
    /// key carrying a dropped id goes.
    fn settle(&self, existing: &mut ExistenceSet, confirmed: &[DeltaItem]) {
        for item in confirmed {
            existing.remove(&item.key);
        }
        if self.projection.kind() != EntityKind::Vertex {
            return;
        }
        let dropped: HashSet<&str> = confirmed
            .iter()
            .map(|item| item.record.get("id"))
            .filter(|id| !id.is_empty())
            .collect();
        if !dropped.is_empty() {
            existing.retain(|key| {
                self.projection
                    .segment(key, "id")
                    .is_none_or(|id| !dropped.contains(id))
            });
        }
    }

    fn verb(&self) -> &'static str {
        "dropped"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub key: String,
    pub reason: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub existing: ExistenceSet,
    pub written: usize,
    /// Items the store acknowledged, in completion order.
    pub confirmed: Vec<DeltaItem>,
    pub failures: Vec<Failure>,
    /// Items never attempted because the run was cancelled.
    pub skipped: usize,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct Ledger {
    existing: ExistenceSet,
    confirmed: Vec<DeltaItem>,
    processed: usize,
    failures: Vec<Failure>,
}

#[derive(Debug, Clone, Copy)]
pub struct UploadSettings {
    pub workers: usize,
    pub batch_size: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 100,
        }
    }
}

/// Writes a delta in fixed-size batches on a bounded pool of workers.
pub struct BatchUploader {
    remote: Remote,
    op: Arc<dyn WriteOp>,
    settings: UploadSettings,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

struct BatchWorker {
    remote: Remote,
    op: Arc<dyn WriteOp>,
    ledger: Arc<Mutex<Ledger>>,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    clock: RateClock,
    total: usize,
}

/// Backoff sleeps that end early once the run is cancelled.
struct CancellableSleeper {
    cancel: CancellationToken,
}

impl Sleeper for CancellableSleeper {
    type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

    fn sleep(&self, dur: Duration) -> Self::Sleep {
        let cancel = self.cancel.clone();
        Box::pin(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(dur) => {}
            }
        })
    }
}

impl BatchUploader {
    pub fn new(remote: Remote, op: Arc<dyn WriteOp>, settings: UploadSettings) -> Self {
        Self {
            remote,
            op,
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

    /// Takes the existence set in and hands it back with every confirmed key
    /// merged in (or removed, for drops). A failed record never stops the
    /// rest of its batch.
    pub async fn upload(&self, delta: Vec<DeltaItem>, existing: ExistenceSet) -> UploadOutcome {
        let total = delta.len();
        let worker_count = self.settings.workers.max(1);
        let ledger = Arc::new(Mutex::new(Ledger {
            existing,
            ..Ledger::default()
        }));
        let worker = Arc::new(BatchWorker {
            remote: self.remote.clone(),
            op: Arc::clone(&self.op),
            ledger: Arc::clone(&ledger),
            progress: Arc::clone(&self.progress),
            cancel: self.cancel.clone(),
            clock: RateClock::start(),
            total,
        });

        let mut skipped = 0usize;
        let mut join_set = JoinSet::new();
        for batch in into_batches(delta, self.settings.batch_size.max(1)) {
            if self.cancel.is_cancelled() {
                skipped += batch.len();
                continue;
            }
            let worker = Arc::clone(&worker);
            join_set.spawn(async move { worker.run_isolated(batch).await });
            while join_set.len() >= worker_count {
                if let Some(joined) = join_set.join_next().await {
                    skipped += settle_join(joined);
                }
            }
        }
        while let Some(joined) = join_set.join_next().await {
            skipped += settle_join(joined);
        }
        drop(worker);
        self.progress.finish();

        let ledger = match Arc::try_unwrap(ledger) {
            Ok(ledger) => ledger.into_inner(),
            Err(shared) => std::mem::take(&mut *shared.lock().await),
        };
        let cancelled = self.cancel.is_cancelled();
        let written = ledger.confirmed.len();
        info!(
            written,
            failed = ledger.failures.len(),
            skipped,
            cancelled,
            "{} {} of {} pending",
            self.op.verb(),
            written,
            total
        );
        UploadOutcome {
            existing: ledger.existing,
            written,
            confirmed: ledger.confirmed,
            failures: ledger.failures,
            skipped,
            cancelled,
        }
    }
}

fn settle_join(joined: Result<usize, tokio::task::JoinError>) -> usize {
    match joined {
        Ok(skipped) => skipped,
        Err(err) => {
            error!(error = %err, "upload worker failed");
            0
        }
    }
}

fn into_batches<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(size).collect());
    }
    batches
}

impl BatchWorker {
    /// Runs a batch on its own task. If that task panics, every record of the
    /// batch is reported as a fatal failure.
    async fn run_isolated(self: Arc<Self>, batch: Vec<DeltaItem>) -> usize {
        let keys: Vec<String> = batch.iter().map(|item| item.key.clone()).collect();
        let worker = Arc::clone(&self);
        match tokio::spawn(async move { worker.run(batch).await }).await {
            Ok(skipped) => skipped,
            Err(err) => {
                error!(error = %err, records = keys.len(), "upload worker failed; reporting its batch as failed");
                let message = format!("upload worker failed: {err}");
                let mut ledger = self.ledger.lock().await;
                ledger.processed += keys.len();
                ledger.failures.extend(keys.into_iter().map(|key| Failure {
                    key,
                    reason: FailureKind::Fatal,
                    message: message.clone(),
                }));
                self.progress
                    .update(&self.clock.snapshot(ledger.processed, Some(self.total)));
                0
            }
        }
    }

    /// Processes one batch in order and returns how many items it skipped
    /// after cancellation.
    async fn run(&self, batch: Vec<DeltaItem>) -> usize {
        let size = batch.len();
        let mut confirmed = Vec::with_capacity(size);
        let mut failures = Vec::new();
        let mut skipped = 0;

        for (index, item) in batch.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                skipped += size - index;
                break;
            }
            match self.write(&item).await {
                Ok(true) => confirmed.push(item),
                Ok(false) => skipped += 1,
                Err(err) => {
                    if err.kind() == FailureKind::Fatal {
                        error!(key = %item.key, error = %err, "abandoning record");
                    } else {
                        warn!(key = %item.key, reason = err.kind().as_str(), error = %err, "abandoning record");
                    }
                    failures.push(Failure {
                        key: item.key,
                        reason: err.kind(),
                        message: err.to_string(),
                    });
                }
            }
        }

        let mut ledger = self.ledger.lock().await;
        ledger.processed += confirmed.len() + failures.len();
        self.op.settle(&mut ledger.existing, &confirmed);
        ledger.confirmed.extend(confirmed);
        ledger.failures.extend(failures);
        self.progress
            .update(&self.clock.snapshot(ledger.processed, Some(self.total)));
        skipped
    }

    /// `Ok(false)` when cancellation arrived while waiting to retry.
    async fn write(&self, item: &DeltaItem) -> Result<bool, QueryError> {
        let query = self.op.query(item);
        let options = QueryOptions::default();
        let remote = &self.remote;
        let cancel = &self.cancel;
        let (query, options) = (&query, &options);
        let mut attempt = 0usize;

        Retry::new(
            CancellableSleeper {
                cancel: self.cancel.clone(),
            },
            remote.policy.backoff(),
            |err: QueryError, delay: Duration| {
                remote.tracker.record(err.kind());
                debug!(key = %item.key, error = %err, delay_ms = delay.as_millis() as u64, "retrying write");
            },
            move || {
                attempt += 1;
                let retrying = attempt > 1;
                async move {
                    if retrying && cancel.is_cancelled() {
                        return Ok(false);
                    }
                    match remote.call(query, options).await {
                        Ok(_) => Ok(true),
                        Err(err) if err.is_retryable() && !cancel.is_cancelled() => {
                            Err(BackoffError::transient(err))
                        }
                        Err(err) => Err(BackoffError::permanent(err)),
                    }
                }
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::client::testing::{rows, ScriptedClient};
    use crate::client::QueryResponse;
    use crate::delta::compute_delta;
    use crate::progress::testing::RecordingProgress;
    use crate::record::Record;
    use crate::retry::RetryPolicy;
    use crate::throttle::Unthrottled;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
        }
    }

    fn remote(client: Arc<ScriptedClient>) -> Remote {
        Remote::new(client, Arc::new(Unthrottled), policy())
    }

    fn projection() -> KeyProjection {
        KeyProjection::default_for(EntityKind::Vertex)
    }

    fn inserts() -> Arc<dyn WriteOp> {
        Arc::new(InsertOp::new(projection(), "graph_id", Dispatcher::default()))
    }

    fn settings(workers: usize, batch_size: usize) -> UploadSettings {
        UploadSettings {
            workers,
            batch_size,
        }
    }

    fn people(ids: &[&str]) -> Vec<Record> {
        ids.iter()
            .map(|id| Record::from_pairs([("id", *id), ("label", "Person")]))
            .collect()
    }

    fn accept_all(_query: &GremlinQuery, _call: usize) -> Result<QueryResponse, QueryError> {
        Ok(rows(vec![]))
    }

    fn ids_written(client: &ScriptedClient) -> Vec<String> {
        client
            .submitted()
            .iter()
            .filter_map(|(query, _)| query.binding("_p2").and_then(|v| v.as_str()).map(str::to_string))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn uploads_delta_and_merges_keys() {
        let client = Arc::new(ScriptedClient::new(accept_all));
        let uploader = BatchUploader::new(remote(Arc::clone(&client)), inserts(), settings(2, 1));
        let delta = compute_delta(people(&["a", "b"]), &projection(), &ExistenceSet::new());

        let outcome = uploader.upload(delta, ExistenceSet::new()).await;

        let expected: ExistenceSet = ["a|Person||", "b|Person||"].into_iter().collect();
        assert_eq!(outcome.existing, expected);
        assert_eq!(outcome.written, 2);
        assert!(outcome.failures.is_empty());
        assert!(!outcome.cancelled);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_writes_nothing() {
        let client = Arc::new(ScriptedClient::new(accept_all));
        let uploader = BatchUploader::new(remote(Arc::clone(&client)), inserts(), settings(2, 2));
        let records = people(&["a", "b", "c"]);

        let first = uploader
            .upload(
                compute_delta(records.clone(), &projection(), &ExistenceSet::new()),
                ExistenceSet::new(),
            )
            .await;
        assert_eq!(client.calls(), 3);

        let delta = compute_delta(records, &projection(), &first.existing);
        assert!(delta.is_empty());
        let second = uploader.upload(delta, first.existing.clone()).await;
        assert_eq!(second.written, 0);
        assert_eq!(second.existing, first.existing);
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn existing_keys_are_never_written() {
        let client = Arc::new(ScriptedClient::new(accept_all));
        let uploader = BatchUploader::new(remote(Arc::clone(&client)), inserts(), settings(1, 10));
        let existing: ExistenceSet = ["a|Person||"].into_iter().collect();
        let delta = compute_delta(people(&["a", "b", "a"]), &projection(), &existing);

        let outcome = uploader.upload(delta, existing).await;

        assert_eq!(ids_written(&client), vec!["b".to_string()]);
        assert_eq!(outcome.existing.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_record_does_not_stop_its_batch() {
        let client = Arc::new(ScriptedClient::new(|query, _call| {
            if query.binds_str("b") {
                Err(QueryError::Fatal("Script compilation error".to_string()))
            } else {
                Ok(rows(vec![]))
            }
        }));
        let uploader = BatchUploader::new(remote(Arc::clone(&client)), inserts(), settings(1, 3));
        let delta = compute_delta(people(&["a", "b", "c"]), &projection(), &ExistenceSet::new());

        let outcome = uploader.upload(delta, ExistenceSet::new()).await;

        assert_eq!(ids_written(&client), vec!["a", "b", "c"]);
        assert_eq!(outcome.written, 2);
        assert!(outcome.existing.contains("a|Person||"));
        assert!(!outcome.existing.contains("b|Person||"));
        assert!(outcome.existing.contains("c|Person||"));
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].key, "b|Person||");
        assert_eq!(outcome.failures[0].reason, FailureKind::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_are_retried_then_succeed() {
        let attempts: Arc<StdMutex<HashMap<String, usize>>> = Arc::default();
        let seen = Arc::clone(&attempts);
        let client = Arc::new(ScriptedClient::new(move |query, _call| {
            let id = query.binding("_p2").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let mut seen = seen.lock().unwrap();
            let count = seen.entry(id.clone()).or_insert(0);
            *count += 1;
            if id == "a" && *count <= 2 {
                Err(QueryError::RateLimited("429 Too Many Requests".to_string()))
            } else {
                Ok(rows(vec![]))
            }
        }));
        let remote = remote(Arc::clone(&client));
        let tracker = Arc::clone(&remote.tracker);
        let uploader = BatchUploader::new(remote, inserts(), settings(2, 1));
        let delta = compute_delta(people(&["a", "b"]), &projection(), &ExistenceSet::new());

        let outcome = uploader.upload(delta, ExistenceSet::new()).await;

        assert_eq!(outcome.written, 2);
        assert!(outcome.failures.is_empty());
        assert_eq!(attempts.lock().unwrap().get("a"), Some(&3));
        assert_eq!(tracker.total(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_abandon_the_record() {
        let client = Arc::new(ScriptedClient::new(|_query, _call| {
            Err(QueryError::Timeout("GraphTimeoutException".to_string()))
        }));
        let uploader = BatchUploader::new(remote(Arc::clone(&client)), inserts(), settings(1, 1));
        let delta = compute_delta(people(&["a"]), &projection(), &ExistenceSet::new());

        let outcome = uploader.upload(delta, ExistenceSet::new()).await;

        assert_eq!(client.calls(), 3);
        assert!(outcome.existing.is_empty());
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].reason, FailureKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn many_batches_on_a_bounded_pool_land_every_key() {
        let client = Arc::new(ScriptedClient::new(accept_all));
        let progress = Arc::new(RecordingProgress::default());
        let uploader = BatchUploader::new(remote(Arc::clone(&client)), inserts(), settings(3, 2))
            .with_progress(progress.clone());
        let ids: Vec<String> = (0..11).map(|n| format!("v{n}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let delta = compute_delta(people(&id_refs), &projection(), &ExistenceSet::new());

        let outcome = uploader.upload(delta, ExistenceSet::new()).await;

        assert_eq!(outcome.written, 11);
        assert_eq!(outcome.existing.len(), 11);
        assert_eq!(progress.loaded().len(), 6);
        assert_eq!(progress.last().map(|u| u.loaded), Some(11));
        assert_eq!(progress.last().and_then(|u| u.total), Some(11));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_upload_writes_nothing() {
        let client = Arc::new(ScriptedClient::new(accept_all));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let uploader = BatchUploader::new(remote(Arc::clone(&client)), inserts(), settings(2, 2))
            .with_cancellation(cancel);
        let delta = compute_delta(people(&["a", "b", "c"]), &projection(), &ExistenceSet::new());

        let outcome = uploader.upload(delta, ExistenceSet::new()).await;

        assert!(outcome.cancelled);
        assert_eq!(outcome.skipped, 3);
        assert_eq!(client.calls(), 0);
        assert!(outcome.existing.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drops_remove_confirmed_keys() {
        let client = Arc::new(ScriptedClient::new(accept_all));
        let drops: Arc<dyn WriteOp> = Arc::new(DropOp::new(projection(), "graph_id"));
        let uploader = BatchUploader::new(remote(Arc::clone(&client)), drops, settings(1, 5));
        let existing: ExistenceSet = ["a|Person||", "b|Person||"].into_iter().collect();
        let delta = compute_delta(people(&["a"]), &projection(), &ExistenceSet::new());

        let outcome = uploader.upload(delta, existing).await;

        assert_eq!(outcome.written, 1);
        let remaining: ExistenceSet = ["b|Person||"].into_iter().collect();
        assert_eq!(outcome.existing, remaining);
        assert_eq!(client.submitted()[0].0.text(), "g.V(_p0).drop()");
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_by_id_clears_every_key_of_that_vertex() {
        let client = Arc::new(ScriptedClient::new(accept_all));
        let drops: Arc<dyn WriteOp> = Arc::new(DropOp::new(projection(), "graph_id"));
        let uploader = BatchUploader::new(remote(Arc::clone(&client)), drops, settings(1, 5));
        let existing: ExistenceSet = ["a|Person|t|c", "ab|Person||", "b|Person||"]
            .into_iter()
            .collect();
        let listed = vec![Record::from_pairs([("id", "a")])];
        let delta = compute_delta(listed, &projection(), &ExistenceSet::new());
        assert_eq!(delta[0].key, "a|||");

        let outcome = uploader.upload(delta, existing).await;

        assert_eq!(outcome.written, 1);
        let remaining: ExistenceSet = ["ab|Person||", "b|Person||"].into_iter().collect();
        assert_eq!(outcome.existing, remaining);
    }

    #[tokio::test(start_paused = true)]
    async fn edge_drops_remove_only_their_own_key() {
        let client = Arc::new(ScriptedClient::new(accept_all));
        let edges = KeyProjection::default_for(EntityKind::Edge);
        let drops: Arc<dyn WriteOp> = Arc::new(DropOp::new(edges.clone(), "graph_id"));
        let uploader = BatchUploader::new(remote(Arc::clone(&client)), drops, settings(1, 5));
        let existing: ExistenceSet = ["a|knows|b", "a|likes|b"].into_iter().collect();
        let listed = vec![Record::from_pairs([("out", "a"), ("label", "knows"), ("in", "b")])];
        let delta = compute_delta(listed, &edges, &ExistenceSet::new());

        let outcome = uploader.upload(delta, existing).await;

        let remaining: ExistenceSet = ["a|likes|b"].into_iter().collect();
        assert_eq!(outcome.existing, remaining);
    }

    struct PanicsOn(&'static str);

    impl WriteOp for PanicsOn {
        fn query(&self, item: &DeltaItem) -> GremlinQuery {
            if item.record.get("id") == self.0 {
                panic!("cannot build a query for {}", self.0);
            }
            GremlinQuery::new("g.V()")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_batch_is_reported_as_failed() {
        let client = Arc::new(ScriptedClient::new(accept_all));
        let uploader =
            BatchUploader::new(remote(Arc::clone(&client)), Arc::new(PanicsOn("b")), settings(2, 1));
        let delta = compute_delta(people(&["a", "b", "c"]), &projection(), &ExistenceSet::new());

        let outcome = uploader.upload(delta, ExistenceSet::new()).await;

        assert_eq!(outcome.written, 2);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].key, "b|Person||");
        assert_eq!(outcome.failures[0].reason, FailureKind::Fatal);
        assert!(outcome.failures[0].message.contains("upload worker failed"));
        assert!(!outcome.existing.contains("b|Person||"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_a_backoff_wait_short() {
        let client = Arc::new(ScriptedClient::new(|_query, _call| {
            Err(QueryError::RateLimited("429".to_string()))
        }));
        let slow = RetryPolicy {
            max_retries: 5,
            base: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        };
        let remote = Remote::new(client.clone(), Arc::new(Unthrottled), slow);
        let cancel = CancellationToken::new();
        let uploader = BatchUploader::new(remote, inserts(), settings(1, 2))
            .with_cancellation(cancel.clone());
        let delta = compute_delta(people(&["a", "b"]), &projection(), &ExistenceSet::new());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        let start = tokio::time::Instant::now();
        let outcome = uploader.upload(delta, ExistenceSet::new()).await;

        assert!(start.elapsed() < Duration::from_secs(30));
        assert!(outcome.cancelled);
        assert_eq!(client.calls(), 1);
        assert_eq!(outcome.skipped, 2);
        assert!(outcome.failures.is_empty());
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<StdMutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_records_are_logged_by_failure_kind() {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let client = Arc::new(ScriptedClient::new(|query, _call| {
            if query.binds_str("a") {
                Err(QueryError::Fatal("Script compilation error".to_string()))
            } else {
                Err(QueryError::Timeout("GraphTimeoutException".to_string()))
            }
        }));
        let uploader = BatchUploader::new(remote(client), inserts(), settings(1, 2));
        let delta = compute_delta(people(&["a", "b"]), &projection(), &ExistenceSet::new());
        uploader.upload(delta, ExistenceSet::new()).await;

        let text = String::from_utf8(log.0.lock().unwrap().clone()).unwrap();
        let level_of = |key: &str| {
            text.lines()
                .find(|line| line.contains("abandoning record") && line.contains(key))
                .map(|line| line.split_whitespace().nth(1).unwrap_or_default().to_string())
        };
        assert_eq!(level_of("a|Person||").as_deref(), Some("ERROR"));
        assert_eq!(level_of("b|Person||").as_deref(), Some("WARN"));
    }

    #[test]
    fn batches_are_fixed_size_with_a_short_tail() {
        let batches = into_batches((0..7).collect::<Vec<_>>(), 3);
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
        assert!(into_batches(Vec::<u8>::new(), 3).is_empty());
    }
}
