//! Integration tests for the run driver.
//!
//! Every test runs the full state machine (plan, produce, worker pool,
//! checkpoint, assemble, write) against an in-memory renderer and a
//! scripted inference client, so no pdfium library or API key is needed.
//! Tests that involve backoff or random completion order run with a paused
//! tokio clock.

use async_trait::async_trait;
use lexiscan::checkpoint::{CheckpointStore, RunProgress};
use lexiscan::pipeline::parse::JsonArrayParser;
use lexiscan::pipeline::producer::{PageProducer, SegmentProducer};
use lexiscan::{
    CallError, ExtractError, ExtractionConfig, ExtractionConfigBuilder,
    ExtractionProgressCallback, FailureReason, InferenceClient, PageRange, PageRenderer, Payload,
    Pipeline, Record, RenderError, RunPaths, RunReport, RunState, UnitKey, UnitResult,
};
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

// ── Test doubles ─────────────────────────────────────────────────────────────

/// Renders page `p` as the text `"page p"`; listed pages fail to render.
struct FakeRenderer {
    pages: usize,
    broken: HashSet<usize>,
}

impl FakeRenderer {
    fn new(pages: usize) -> Arc<Self> {
        Arc::new(Self {
            pages,
            broken: HashSet::new(),
        })
    }

    fn with_broken(pages: usize, broken: &[usize]) -> Arc<Self> {
        Arc::new(Self {
            pages,
            broken: broken.iter().copied().collect(),
        })
    }
}

#[async_trait]
impl PageRenderer for FakeRenderer {
    fn page_count(&self) -> usize {
        self.pages
    }

    async fn render(&self, page: usize) -> Result<Payload, RenderError> {
        if self.broken.contains(&page) {
            return Err(RenderError {
                page,
                detail: "corrupt content stream".into(),
            });
        }
        Ok(Payload::Text(format!("page {page}")))
    }
}

/// Answers `"page p"` with `p % 3 + 1` entries after a pseudo-random delay.
struct MockClient {
    seed: u64,
    max_delay_ms: u64,
    scripted: Mutex<HashMap<usize, VecDeque<CallError>>>,
    malformed: HashSet<usize>,
    calls: Mutex<HashMap<usize, u32>>,
}

impl MockClient {
    fn new(seed: u64) -> Self {
        Self {
            seed,
            max_delay_ms: 500,
            scripted: Mutex::new(HashMap::new()),
            malformed: HashSet::new(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn no_delay(mut self) -> Self {
        self.max_delay_ms = 0;
        self
    }

    fn failing(self, page: usize, errors: Vec<CallError>) -> Self {
        self.scripted.lock().unwrap().insert(page, errors.into());
        self
    }

    fn malformed_on(mut self, page: usize) -> Self {
        self.malformed.insert(page);
        self
    }

    fn calls_for(&self, page: usize) -> u32 {
        self.calls.lock().unwrap().get(&page).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    fn delay(&self, page: usize) -> Duration {
        if self.max_delay_ms == 0 {
            return Duration::ZERO;
        }
        let mixed = self
            .seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add((page as u64).wrapping_mul(1_442_695_040_888_963_407));
        Duration::from_millis((mixed >> 33) % self.max_delay_ms)
    }
}

fn entries_for(page: usize) -> serde_json::Value {
    let entries: Vec<_> = (0..page % 3 + 1)
        .map(|i| json!({ "headword": format!("w{page}-{i}") }))
        .collect();
    serde_json::Value::Array(entries)
}

#[async_trait]
impl InferenceClient for MockClient {
    async fn call(&self, payload: &Payload, _instruction: &str) -> Result<String, CallError> {
        let page: usize = match payload {
            Payload::Text(t) => t
                .strip_prefix("page ")
                .and_then(|n| n.parse().ok())
                .unwrap_or(0),
            Payload::Image { .. } => 0,
        };

        tokio::time::sleep(self.delay(page)).await;
        *self.calls.lock().unwrap().entry(page).or_insert(0) += 1;

        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&page)
            .and_then(|q| q.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }
        if self.malformed.contains(&page) {
            return Ok("I'm sorry, this page appears to be blank.".into());
        }
        Ok(entries_for(page).to_string())
    }
}

/// Wakes the test after the first durable checkpoint.
struct CheckpointSignal {
    notify: Arc<Notify>,
}

impl ExtractionProgressCallback for CheckpointSignal {
    fn on_checkpoint(&self, _completed: usize, _records: usize) {
        self.notify.notify_one();
    }
}

/// Records every state transition.
#[derive(Default)]
struct StateLog {
    transitions: Mutex<Vec<(RunState, RunState)>>,
}

impl ExtractionProgressCallback for StateLog {
    fn on_state_change(&self, from: RunState, to: RunState) {
        self.transitions.lock().unwrap().push((from, to));
    }
}

/// After the first flush, moves the checkpoint directory aside and leaves a
/// plain file in its place, so every later flush fails.
struct BrokenCheckpointDir {
    dir: PathBuf,
    moved: PathBuf,
    first_flush: Mutex<Option<Vec<u8>>>,
    states: StateLog,
}

impl BrokenCheckpointDir {
    fn new(dir: PathBuf, moved: PathBuf) -> Self {
        Self {
            dir,
            moved,
            first_flush: Mutex::new(None),
            states: StateLog::default(),
        }
    }
}

impl ExtractionProgressCallback for BrokenCheckpointDir {
    fn on_checkpoint(&self, _completed: usize, _records: usize) {
        let mut first = self.first_flush.lock().unwrap();
        if first.is_some() {
            return;
        }
        std::fs::rename(&self.dir, &self.moved).unwrap();
        std::fs::write(&self.dir, "not a directory").unwrap();
        *first = Some(std::fs::read(self.moved.join("entries.progress.json")).unwrap());
    }

    fn on_state_change(&self, from: RunState, to: RunState) {
        self.states.on_state_change(from, to);
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn base_config(pages: PageRange) -> ExtractionConfigBuilder {
    ExtractionConfig::builder()
        .pages(pages)
        .workers(4)
        .max_retries(3)
        .retry_backoff_ms(1_000)
        .call_timeout_secs(60)
        .checkpoint_every(2)
}

fn pipeline(
    config: ExtractionConfig,
    renderer: Arc<FakeRenderer>,
    client: Arc<MockClient>,
) -> Pipeline {
    let producer = Arc::new(PageProducer::new(renderer, config.pages, "extract".into()));
    Pipeline::new(config, producer, client, Arc::new(JsonArrayParser))
}

fn paths_in(dir: &Path) -> RunPaths {
    RunPaths::for_output(dir.join("entries.json"))
}

fn expected_records(pages: impl IntoIterator<Item = usize>) -> Vec<Record> {
    pages
        .into_iter()
        .flat_map(|page| {
            (0..page % 3 + 1).map(move |index| Record {
                key: UnitKey::page(page),
                index,
                value: json!({ "headword": format!("w{page}-{index}"), "page_number": page }),
            })
        })
        .collect()
}

fn read_output(path: &Path) -> Vec<Record> {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

async fn run_once(pages: usize, seed: u64, dir: &Path) -> RunReport {
    let config = base_config(PageRange::default()).build().unwrap();
    let client = Arc::new(MockClient::new(seed));
    pipeline(config, FakeRenderer::new(pages), client)
        .run(&paths_in(dir))
        .await
        .unwrap()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn full_run_writes_sorted_output_and_removes_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());

    let report = run_once(12, 1, dir.path()).await;

    assert_eq!(report.outcome.records, expected_records(1..=12));
    assert_eq!(read_output(&paths.output), report.outcome.records);
    assert!(!paths.checkpoint.exists());

    let s = &report.summary;
    assert_eq!(s.total_units, 12);
    assert_eq!(s.processed_units, 12);
    assert_eq!(s.resumed_units, 0);
    assert!(s.failed.is_empty());
    assert_eq!(s.total_records, report.outcome.records.len());
    assert!(s.checkpoint_flushes >= 6);
}

#[tokio::test(start_paused = true)]
async fn successful_run_walks_every_state() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(StateLog::default());
    let config = base_config(PageRange::new(1, 4))
        .progress_callback(Arc::clone(&log) as Arc<dyn ExtractionProgressCallback>)
        .build()
        .unwrap();
    pipeline(config, FakeRenderer::new(4), Arc::new(MockClient::new(7)))
        .run(&paths_in(dir.path()))
        .await
        .unwrap();

    assert_eq!(
        *log.transitions.lock().unwrap(),
        vec![
            (RunState::Idle, RunState::Loading),
            (RunState::Loading, RunState::Running),
            (RunState::Running, RunState::Draining),
            (RunState::Draining, RunState::Finalizing),
            (RunState::Finalizing, RunState::Done),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn completion_order_does_not_change_output() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();

    let first = run_once(15, 11, a.path()).await;
    let second = run_once(15, 97, b.path()).await;

    assert_eq!(first.outcome.records, second.outcome.records);
    assert_eq!(
        std::fs::read(paths_in(a.path()).output).unwrap(),
        std::fs::read(paths_in(b.path()).output).unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn page_range_limits_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(PageRange::new(4, 6)).build().unwrap();
    let client = Arc::new(MockClient::new(3));
    let report = pipeline(config, FakeRenderer::new(10), Arc::clone(&client))
        .run(&paths_in(dir.path()))
        .await
        .unwrap();

    assert_eq!(report.outcome.records, expected_records(4..=6));
    assert_eq!(client.total_calls(), 3);
    assert_eq!(client.calls_for(1), 0);
}

#[tokio::test(start_paused = true)]
async fn resume_skips_completed_units() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());

    // A prior run got through pages 1-5.
    let mut store = CheckpointStore::open(&paths.checkpoint, 100).unwrap();
    for page in 1..=5 {
        let records = expected_records([page]);
        store.record(UnitResult {
            key: UnitKey::page(page),
            records,
            status: lexiscan::UnitStatus::Success,
            attempts: 1,
            duration_ms: 10,
        });
    }
    store.flush().unwrap();

    let config = base_config(PageRange::default()).build().unwrap();
    let client = Arc::new(MockClient::new(5));
    let report = pipeline(config, FakeRenderer::new(10), Arc::clone(&client))
        .run(&paths)
        .await
        .unwrap();

    for page in 1..=5 {
        assert_eq!(client.calls_for(page), 0, "page {page} was re-dispatched");
    }
    for page in 6..=10 {
        assert_eq!(client.calls_for(page), 1);
    }
    assert_eq!(report.summary.resumed_units, 5);
    assert_eq!(report.summary.processed_units, 5);
    assert_eq!(report.outcome.records, expected_records(1..=10));
}

#[tokio::test(start_paused = true)]
async fn complete_checkpoint_reproduces_output_without_calls() {
    let reference_dir = tempfile::tempdir().unwrap();
    let reference = run_once(8, 2, reference_dir.path()).await;

    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    let mut store = CheckpointStore::open(&paths.checkpoint, 100).unwrap();
    for page in 1..=8 {
        store.record(UnitResult {
            key: UnitKey::page(page),
            records: expected_records([page]),
            status: lexiscan::UnitStatus::Success,
            attempts: 1,
            duration_ms: 1,
        });
    }
    store.flush().unwrap();

    let log = Arc::new(StateLog::default());
    let config = base_config(PageRange::default())
        .progress_callback(Arc::clone(&log) as Arc<dyn ExtractionProgressCallback>)
        .build()
        .unwrap();
    let client = Arc::new(MockClient::new(2));
    let report = pipeline(config, FakeRenderer::new(8), Arc::clone(&client))
        .run(&paths)
        .await
        .unwrap();

    assert_eq!(client.total_calls(), 0);
    assert_eq!(report.outcome.records, reference.outcome.records);
    assert!(!paths.checkpoint.exists());

    let states: Vec<RunState> = log.transitions.lock().unwrap().iter().map(|(_, to)| *to).collect();
    assert_eq!(
        states,
        vec![
            RunState::Loading,
            RunState::Finalizing,
            RunState::Done
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn interrupted_run_loses_nothing_and_resumes() {
    let reference_dir = tempfile::tempdir().unwrap();
    let reference = run_once(12, 4, reference_dir.path()).await;

    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());

    // First attempt: cancelled right after the first durable checkpoint.
    let notify = Arc::new(Notify::new());
    let config = base_config(PageRange::default())
        .progress_callback(Arc::new(CheckpointSignal {
            notify: Arc::clone(&notify),
        }) as Arc<dyn ExtractionProgressCallback>)
        .build()
        .unwrap();
    let interrupted = pipeline(config, FakeRenderer::new(12), Arc::new(MockClient::new(4)));
    tokio::select! {
        biased;
        _ = notify.notified() => {}
        result = interrupted.run(&paths) => panic!("run finished before interruption: {result:?}"),
    }
    drop(interrupted);

    assert!(!paths.output.exists());
    let saved: RunProgress = CheckpointStore::load(&paths.checkpoint).unwrap();
    assert!(!saved.completed_keys.is_empty());
    assert!(saved.completed_keys.len() < 12);
    // Every completed key has all of its records, and no record is orphaned.
    let saved_pages: Vec<usize> = saved.completed_keys.iter().map(|k| k.page).collect();
    let mut records = saved.records_so_far.clone();
    records.sort_by_key(|r| (r.key, r.index));
    assert_eq!(records, expected_records(saved_pages.iter().copied()));

    // Second attempt picks up where the first stopped.
    let config = base_config(PageRange::default()).build().unwrap();
    let client = Arc::new(MockClient::new(9));
    let report = pipeline(config, FakeRenderer::new(12), Arc::clone(&client))
        .run(&paths)
        .await
        .unwrap();

    for page in &saved_pages {
        assert_eq!(client.calls_for(*page), 0, "page {page} was re-dispatched");
    }
    assert_eq!(report.summary.resumed_units, saved_pages.len());
    assert_eq!(report.outcome.records, reference.outcome.records);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_wait_exponentially_then_fail_the_unit() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(PageRange::new(1, 2))
        .max_retries(4)
        .workers(1)
        .build()
        .unwrap();
    let client = Arc::new(
        MockClient::new(0)
            .no_delay()
            .failing(1, vec![CallError::RateLimited { retry_after: None }; 10]),
    );

    let start = tokio::time::Instant::now();
    let report = pipeline(config, FakeRenderer::new(2), Arc::clone(&client))
        .run(&paths_in(dir.path()))
        .await
        .unwrap();
    let waited = start.elapsed();

    // 1 s + 2 s + 4 s between four calls, nothing after the last.
    assert!(waited >= Duration::from_secs(7), "waited {waited:?}");
    assert!(waited < Duration::from_secs(8), "waited {waited:?}");
    assert_eq!(client.calls_for(1), 4);

    assert_eq!(report.summary.failed.len(), 1);
    assert_eq!(report.summary.failed[0].key, UnitKey::page(1));
    assert_eq!(
        report.summary.failed[0].reason,
        FailureReason::RateLimitedExhausted { attempts: 4 }
    );
    // The run carried on past the failed unit.
    assert_eq!(report.outcome.records, expected_records([2]));
}

#[tokio::test(start_paused = true)]
async fn transient_errors_recover_within_budget() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(PageRange::new(1, 3)).build().unwrap();
    let client = Arc::new(MockClient::new(8).failing(
        2,
        vec![
            CallError::ServiceError("503 overloaded".into()),
            CallError::Timeout(Duration::from_secs(60)),
        ],
    ));
    let report = pipeline(config, FakeRenderer::new(3), Arc::clone(&client))
        .run(&paths_in(dir.path()))
        .await
        .unwrap();

    assert!(report.summary.failed.is_empty());
    assert_eq!(client.calls_for(2), 3);
    assert_eq!(report.outcome.records, expected_records(1..=3));
}

#[tokio::test(start_paused = true)]
async fn malformed_response_fails_unit_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(PageRange::new(1, 4)).build().unwrap();
    let client = Arc::new(MockClient::new(6).malformed_on(3));
    let report = pipeline(config, FakeRenderer::new(4), Arc::clone(&client))
        .run(&paths_in(dir.path()))
        .await
        .unwrap();

    assert_eq!(client.calls_for(3), 1);
    assert_eq!(report.summary.failed.len(), 1);
    assert!(matches!(
        report.summary.failed[0].reason,
        FailureReason::Malformed { .. }
    ));
    assert_eq!(report.outcome.records, expected_records([1, 2, 4]));
}

#[tokio::test(start_paused = true)]
async fn render_failure_is_recorded_without_a_call() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(PageRange::new(1, 3)).build().unwrap();
    let client = Arc::new(MockClient::new(1));
    let report = pipeline(config, FakeRenderer::with_broken(3, &[2]), Arc::clone(&client))
        .run(&paths_in(dir.path()))
        .await
        .unwrap();

    assert_eq!(client.total_calls(), 2);
    assert_eq!(report.summary.failed.len(), 1);
    assert_eq!(report.summary.failed[0].reason.label(), "render_failed");
}

#[tokio::test(start_paused = true)]
async fn failed_units_are_retried_only_on_request() {
    let seed_checkpoint = |path: &Path| {
        let mut store = CheckpointStore::open(path, 100).unwrap();
        store.record(UnitResult {
            key: UnitKey::page(1),
            records: expected_records([1]),
            status: lexiscan::UnitStatus::Success,
            attempts: 1,
            duration_ms: 1,
        });
        store.record(UnitResult::failed(
            UnitKey::page(2),
            FailureReason::Malformed {
                detail: "prose".into(),
            },
            1,
            1,
        ));
        store.flush().unwrap();
    };

    // Default: the failure stands.
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    seed_checkpoint(&paths.checkpoint);
    let client = Arc::new(MockClient::new(1));
    let config = base_config(PageRange::new(1, 3)).build().unwrap();
    let report = pipeline(config, FakeRenderer::new(3), Arc::clone(&client))
        .run(&paths)
        .await
        .unwrap();
    assert_eq!(client.calls_for(2), 0);
    assert_eq!(report.summary.failed.len(), 1);
    assert_eq!(report.outcome.records, expected_records([1, 3]));

    // With retry_failed the unit is dispatched again.
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    seed_checkpoint(&paths.checkpoint);
    let client = Arc::new(MockClient::new(1));
    let config = base_config(PageRange::new(1, 3))
        .retry_failed(true)
        .build()
        .unwrap();
    let report = pipeline(config, FakeRenderer::new(3), Arc::clone(&client))
        .run(&paths)
        .await
        .unwrap();
    assert_eq!(client.calls_for(1), 0);
    assert_eq!(client.calls_for(2), 1);
    assert!(report.summary.failed.is_empty());
    assert_eq!(report.outcome.records, expected_records(1..=3));
}

#[tokio::test(start_paused = true)]
async fn completed_run_with_failures_leaves_nothing_to_resume() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    let config = base_config(PageRange::new(1, 3)).build().unwrap();
    let client = Arc::new(MockClient::new(2).malformed_on(2));
    let report = pipeline(config, FakeRenderer::new(3), client)
        .run(&paths)
        .await
        .unwrap();
    assert_eq!(report.summary.failed.len(), 1);
    assert!(!paths.checkpoint.exists());

    // Only a forced re-run gets another go, and it processes the whole range.
    let client = Arc::new(MockClient::new(2));
    let config = base_config(PageRange::new(1, 3))
        .overwrite(true)
        .retry_failed(true)
        .build()
        .unwrap();
    let report = pipeline(config, FakeRenderer::new(3), Arc::clone(&client))
        .run(&paths)
        .await
        .unwrap();
    assert_eq!(client.total_calls(), 3);
    assert_eq!(report.summary.resumed_units, 0);
    assert_eq!(report.outcome.records, expected_records(1..=3));
}

#[tokio::test(start_paused = true)]
async fn fresh_run_discards_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    let mut store = CheckpointStore::open(&paths.checkpoint, 100).unwrap();
    store.record(UnitResult {
        key: UnitKey::page(1),
        records: vec![],
        status: lexiscan::UnitStatus::Success,
        attempts: 1,
        duration_ms: 1,
    });
    store.flush().unwrap();

    let client = Arc::new(MockClient::new(3));
    let config = base_config(PageRange::new(1, 2)).fresh(true).build().unwrap();
    let report = pipeline(config, FakeRenderer::new(2), Arc::clone(&client))
        .run(&paths)
        .await
        .unwrap();

    assert_eq!(client.calls_for(1), 1);
    assert_eq!(report.summary.resumed_units, 0);
    assert_eq!(report.outcome.records, expected_records(1..=2));
}

#[tokio::test(start_paused = true)]
async fn checkpoint_outside_range_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    let mut store = CheckpointStore::open(&paths.checkpoint, 100).unwrap();
    for page in [1, 50] {
        store.record(UnitResult {
            key: UnitKey::page(page),
            records: expected_records([page]),
            status: lexiscan::UnitStatus::Success,
            attempts: 1,
            duration_ms: 1,
        });
    }
    store.flush().unwrap();

    let client = Arc::new(MockClient::new(3));
    let config = base_config(PageRange::new(1, 3)).build().unwrap();
    let report = pipeline(config, FakeRenderer::new(60), Arc::clone(&client))
        .run(&paths)
        .await
        .unwrap();

    assert_eq!(client.calls_for(1), 0);
    assert_eq!(report.summary.resumed_units, 1);
    assert_eq!(report.outcome.records, expected_records(1..=3));
}

#[tokio::test]
async fn existing_output_is_not_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    std::fs::write(&paths.output, "[\"keep me\"]").unwrap();

    let log = Arc::new(StateLog::default());
    let config = base_config(PageRange::default())
        .progress_callback(Arc::clone(&log) as Arc<dyn ExtractionProgressCallback>)
        .build()
        .unwrap();
    let client = Arc::new(MockClient::new(1).no_delay());
    let err = pipeline(config, FakeRenderer::new(3), Arc::clone(&client))
        .run(&paths)
        .await
        .unwrap_err();

    assert!(matches!(err, ExtractError::OutputExists { .. }));
    assert_eq!(client.total_calls(), 0);
    assert_eq!(std::fs::read_to_string(&paths.output).unwrap(), "[\"keep me\"]");
    let last = log.transitions.lock().unwrap().last().copied();
    assert_eq!(last, Some((RunState::Loading, RunState::Failed)));
}

#[tokio::test]
async fn complete_checkpoint_finishes_over_existing_output() {
    // The previous run wrote its output, then stopped before removing the checkpoint.
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    std::fs::write(&paths.output, "[]").unwrap();
    let mut store = CheckpointStore::open(&paths.checkpoint, 100).unwrap();
    for page in 1..=3 {
        store.record(UnitResult {
            key: UnitKey::page(page),
            records: expected_records([page]),
            status: lexiscan::UnitStatus::Success,
            attempts: 1,
            duration_ms: 1,
        });
    }
    store.flush().unwrap();

    let client = Arc::new(MockClient::new(1).no_delay());
    let config = base_config(PageRange::new(1, 3)).build().unwrap();
    let report = pipeline(config, FakeRenderer::new(3), Arc::clone(&client))
        .run(&paths)
        .await
        .unwrap();

    assert_eq!(client.total_calls(), 0);
    assert_eq!(report.summary.resumed_units, 3);
    assert_eq!(read_output(&paths.output), expected_records(1..=3));
    assert!(!paths.checkpoint.exists());
}

#[tokio::test]
async fn partial_checkpoint_does_not_unlock_existing_output() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    std::fs::write(&paths.output, "[\"keep me\"]").unwrap();
    let mut store = CheckpointStore::open(&paths.checkpoint, 100).unwrap();
    store.record(UnitResult {
        key: UnitKey::page(1),
        records: expected_records([1]),
        status: lexiscan::UnitStatus::Success,
        attempts: 1,
        duration_ms: 1,
    });
    store.flush().unwrap();
    let saved = std::fs::read(&paths.checkpoint).unwrap();

    // Neither resuming nor a fresh start may touch the output without --force.
    for fresh in [false, true] {
        let client = Arc::new(MockClient::new(1).no_delay());
        let config = base_config(PageRange::new(1, 3)).fresh(fresh).build().unwrap();
        let err = pipeline(config, FakeRenderer::new(3), Arc::clone(&client))
            .run(&paths)
            .await
            .unwrap_err();

        assert!(matches!(err, ExtractError::OutputExists { .. }), "fresh={fresh}");
        assert_eq!(client.total_calls(), 0);
        assert_eq!(std::fs::read(&paths.checkpoint).unwrap(), saved);
        assert_eq!(std::fs::read_to_string(&paths.output).unwrap(), "[\"keep me\"]");
    }
}

#[tokio::test]
async fn overwrite_replaces_existing_output() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    std::fs::write(&paths.output, "stale").unwrap();

    let config = base_config(PageRange::new(1, 2))
        .overwrite(true)
        .build()
        .unwrap();
    let client = Arc::new(MockClient::new(1).no_delay());
    pipeline(config, FakeRenderer::new(2), client)
        .run(&paths)
        .await
        .unwrap();

    assert_eq!(read_output(&paths.output), expected_records(1..=2));
}

#[tokio::test]
async fn empty_page_range_is_a_setup_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(PageRange::starting_at(20)).build().unwrap();
    let client = Arc::new(MockClient::new(1).no_delay());
    let err = pipeline(config, FakeRenderer::new(5), Arc::clone(&client))
        .run(&paths_in(dir.path()))
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractError::EmptyPageRange { total: 5, .. }));
    assert_eq!(client.total_calls(), 0);
}

// ── Fatal errors ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn rejected_call_fails_the_run_and_keeps_finished_units() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    let log = Arc::new(StateLog::default());
    let config = base_config(PageRange::new(1, 6))
        .workers(1)
        .checkpoint_every(100)
        .progress_callback(Arc::clone(&log) as Arc<dyn ExtractionProgressCallback>)
        .build()
        .unwrap();
    let client = Arc::new(MockClient::new(0).no_delay().failing(
        4,
        vec![CallError::Rejected(
            "Authentication error: invalid x-api-key".into(),
        )],
    ));

    let start = tokio::time::Instant::now();
    let err = pipeline(config, FakeRenderer::new(6), Arc::clone(&client))
        .run(&paths)
        .await
        .unwrap_err();

    match err {
        ExtractError::InferenceRejected { key, .. } => assert_eq!(key, UnitKey::page(4)),
        other => panic!("unexpected error: {other}"),
    }
    // No retries, no backoff, nothing dispatched after the rejection.
    assert_eq!(client.calls_for(4), 1);
    assert_eq!(client.calls_for(5), 0);
    assert_eq!(start.elapsed(), Duration::ZERO);

    let transitions = log.transitions.lock().unwrap().clone();
    let (from, to) = *transitions.last().unwrap();
    assert_eq!(to, RunState::Failed);
    assert!(matches!(from, RunState::Running | RunState::Draining), "from {from}");
    assert!(transitions.iter().all(|(_, to)| *to != RunState::Done));

    // Units finished before the rejection are durable; the rejected one is not recorded.
    assert!(!paths.output.exists());
    let saved = CheckpointStore::load(&paths.checkpoint).unwrap();
    assert_eq!(
        saved.completed_keys,
        BTreeSet::from([UnitKey::page(1), UnitKey::page(2), UnitKey::page(3)])
    );
    assert!(saved.failures.is_empty());

    // With working credentials the next run only does the rest.
    let client = Arc::new(MockClient::new(0).no_delay());
    let config = base_config(PageRange::new(1, 6)).build().unwrap();
    let report = pipeline(config, FakeRenderer::new(6), Arc::clone(&client))
        .run(&paths)
        .await
        .unwrap();
    assert_eq!(client.total_calls(), 3);
    assert_eq!(report.outcome.records, expected_records(1..=6));
}

#[tokio::test(start_paused = true)]
async fn failed_flush_fails_the_run_and_keeps_last_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoint_dir = dir.path().join("progress");
    let paths = paths_in(dir.path()).with_checkpoint(checkpoint_dir.join("entries.progress.json"));
    let moved = dir.path().join("progress-moved");

    let breaker = Arc::new(BrokenCheckpointDir::new(checkpoint_dir, moved.clone()));
    let config = base_config(PageRange::new(1, 6))
        .workers(1)
        .checkpoint_every(2)
        .progress_callback(Arc::clone(&breaker) as Arc<dyn ExtractionProgressCallback>)
        .build()
        .unwrap();
    let client = Arc::new(MockClient::new(0).no_delay());
    let err = pipeline(config, FakeRenderer::new(6), Arc::clone(&client))
        .run(&paths)
        .await
        .unwrap_err();

    assert!(matches!(err, ExtractError::CheckpointWriteFailed { .. }), "got {err}");
    assert!(!paths.output.exists());

    // The first durable checkpoint is byte-for-byte what was flushed.
    let first = breaker.first_flush.lock().unwrap().clone().unwrap();
    let kept = moved.join("entries.progress.json");
    assert_eq!(std::fs::read(&kept).unwrap(), first);
    let saved = CheckpointStore::load(&kept).unwrap();
    assert_eq!(
        saved.completed_keys,
        BTreeSet::from([UnitKey::page(1), UnitKey::page(2)])
    );

    let transitions = breaker.states.transitions.lock().unwrap().clone();
    let (from, to) = *transitions.last().unwrap();
    assert_eq!(to, RunState::Failed);
    assert!(matches!(from, RunState::Running | RunState::Draining), "from {from}");
    assert!(transitions.iter().all(|(_, to)| *to != RunState::Finalizing));
}

// ── Segmentation end to end ──────────────────────────────────────────────────

/// Dictionary text layer spread over two pages.
struct DictionaryText;

#[async_trait]
impl PageRenderer for DictionaryText {
    fn page_count(&self) -> usize {
        2
    }

    async fn render(&self, page: usize) -> Result<Payload, RenderError> {
        let text = match page {
            1 => "ABAQUITI\n\nabaquiti s. abuelo.\n\n23\n\nkené s. design; pattern.\nmore of kené",
            _ => "continued on two.\njoni v. t. ver.",
        };
        Ok(Payload::Text(text.into()))
    }
}

/// Returns the chunk text back as a single record.
struct EchoClient;

#[async_trait]
impl InferenceClient for EchoClient {
    async fn call(&self, payload: &Payload, _instruction: &str) -> Result<String, CallError> {
        let chunk = match payload {
            Payload::Text(t) => t.trim().to_string(),
            Payload::Image { .. } => String::new(),
        };
        Ok(json!([{ "text": chunk }]).to_string())
    }
}

#[tokio::test]
async fn segment_strategy_keys_records_by_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(PageRange::default()).build().unwrap();
    let producer = Arc::new(SegmentProducer::new(
        Arc::new(DictionaryText),
        config.pages,
        "parse".into(),
    ));
    let report = Pipeline::new(config, producer, Arc::new(EchoClient), Arc::new(JsonArrayParser))
        .run(&paths_in(dir.path()))
        .await
        .unwrap();

    let keys: BTreeSet<UnitKey> = report.outcome.records.iter().map(|r| r.key).collect();
    assert_eq!(
        keys,
        BTreeSet::from([UnitKey::chunk(1, 0), UnitKey::chunk(1, 1), UnitKey::chunk(2, 0)])
    );
    let texts: Vec<&str> = report
        .outcome
        .records
        .iter()
        .map(|r| r.value["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts[0], "abaquiti s. abuelo.");
    assert!(texts[1].starts_with("kené s. design; pattern."));
    assert!(texts[1].contains("continued on two."));
    assert_eq!(texts[2], "joni v. t. ver.");
    assert!(texts.iter().all(|t| !t.contains("ABAQUITI") && !t.contains("23")));
}
