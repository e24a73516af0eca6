// ABOUTME: Integration tests verifying modules work together.
// ABOUTME: Drives the full poll → claim → pipeline → release workflow against in-memory collaborators.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fixloop::prelude::*;
use parking_lot::Mutex;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An in-memory issue tracker.
#[derive(Default)]
struct Tracker {
    items: Mutex<HashMap<ItemId, WorkItem>>,
    comments: Mutex<Vec<(ItemId, String)>>,
    published: Mutex<Vec<ChangeRef>>,
}

impl Tracker {
    fn file(&self, number: u64, title: &str) -> ItemId {
        let item = WorkItem::new(ItemId::new("acme/widgets", number), title)
            .body("Steps to reproduce: run it")
            .label("autofix");
        let id = item.id.clone();
        self.items.lock().insert(id.clone(), item);
        id
    }

    fn is_open(&self, id: &ItemId) -> bool {
        self.items.lock().get(id).is_some_and(|i| i.open)
    }

    fn comments_on(&self, id: &ItemId) -> Vec<String> {
        self.comments
            .lock()
            .iter()
            .filter(|(target, _)| target == id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl IssueSource for Tracker {
    async fn list_candidates(&self, filter: &CandidateFilter) -> anyhow::Result<Vec<WorkItem>> {
        let mut found: Vec<WorkItem> = self
            .items
            .lock()
            .values()
            .filter(|item| filter.matches(&item.state()))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn comment(&self, item: &ItemId, text: &str) -> anyhow::Result<()> {
        self.comments.lock().push((item.clone(), text.to_string()));
        Ok(())
    }

    async fn open_change(&self, item: &ItemId, spec: &BranchSpec) -> anyhow::Result<ChangeRef> {
        let mut published = self.published.lock();
        let change = ChangeRef {
            id: published.len() as u64 + 100,
            url: format!("https://tracker.test/{}/pull/{}", spec.branch, item.number),
        };
        published.push(change.clone());
        Ok(change)
    }

    async fn close(&self, item: &ItemId, _reason: &CloseReason) -> anyhow::Result<()> {
        if let Some(found) = self.items.lock().get_mut(item) {
            found.open = false;
        }
        Ok(())
    }

    async fn get_status(&self, item: &ItemId) -> anyhow::Result<ExternalState> {
        self.items
            .lock()
            .get(item)
            .map(WorkItem::state)
            .ok_or_else(|| anyhow::anyhow!("unknown item {}", item))
    }
}

/// A generator that fails a fixed number of times before succeeding.
struct Coder {
    failures_left: AtomicU32,
}

impl Coder {
    fn new(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl CodeGenerator for Coder {
    async fn plan(&self, spec: &IssueSpec, _agent: &AgentHandle) -> anyhow::Result<ChangePlan> {
        Ok(ChangePlan {
            summary: format!("Handle the crash in '{}'", spec.title),
            steps: vec!["guard against empty input".into()],
        })
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        _agent: &AgentHandle,
    ) -> anyhow::Result<GeneratedChanges> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            anyhow::bail!("generation attempt {} failed", request.attempt);
        }
        Ok(GeneratedChanges {
            workspace: PathBuf::from("/work"),
            files_changed: vec![PathBuf::from("src/parse.rs")],
            tests: vec!["parses_empty_input".into()],
        })
    }
}

struct Checks;

#[async_trait]
impl Validator for Checks {
    async fn run_checks(&self, _workspace: &Path) -> anyhow::Result<CheckReport> {
        Ok(CheckReport::passed("12 passed"))
    }
}

#[derive(Default)]
struct Runtime {
    starts: AtomicU32,
}

#[async_trait]
impl AgentRuntime for Runtime {
    async fn start(&self, descriptor: &AgentDescriptor) -> anyhow::Result<String> {
        let n = self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}@{}", descriptor.agent_id, n))
    }

    async fn stop(&self, _instance: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn heartbeat(&self, _instance: &str) -> bool {
        true
    }
}

fn poller(tracker: Arc<Tracker>, coder: Coder, config: Config) -> (Poller, FakeClock) {
    let clock = FakeClock::new();
    let collaborators = Collaborators {
        source: tracker,
        generator: Arc::new(coder),
        validator: Arc::new(Checks),
    };
    let poller = Poller::new(
        config,
        collaborators,
        Arc::new(Runtime::default()),
        Arc::new(clock.clone()),
    )
    .expect("valid configuration");
    (poller, clock)
}

#[tokio::test]
async fn test_items_are_resolved_end_to_end() {
    init_tracing();
    let tracker = Arc::new(Tracker::default());
    let first = tracker.file(1, "Crash on empty input");
    let second = tracker.file(2, "Crash on unicode input");

    let (mut poller, _clock) = poller(tracker.clone(), Coder::new(0), Config::default());

    let finished = Arc::new(Mutex::new(Vec::new()));
    let sink = finished.clone();
    poller
        .hooks()
        .on_run_finished(move |_, item, status, _| sink.lock().push((item.clone(), status)))
        .await;

    let watched = tracker.clone();
    let (a, b) = (first.clone(), second.clone());
    let shutdown = async move {
        while watched.is_open(&a) || watched.is_open(&b) {
            tokio::task::yield_now().await;
        }
    };
    let summaries = poller.run(shutdown).await;

    assert_eq!(summaries.len(), 2);
    assert!(summaries.iter().all(|s| s.status == RunStatus::Completed));
    assert_eq!(tracker.published.lock().len(), 2);
    assert!(!tracker.is_open(&first));
    assert!(!tracker.is_open(&second));

    // Only the acknowledgement was posted on each item.
    assert_eq!(tracker.comments_on(&first).len(), 1);
    assert!(tracker.comments_on(&first)[0].starts_with("Claimed by fixloop"));

    assert_eq!(finished.lock().len(), 2);
    assert!(poller.claims().is_empty());
}

#[tokio::test]
async fn test_generation_failures_fail_the_run_with_one_notification() {
    init_tracing();
    let tracker = Arc::new(Tracker::default());
    let id = tracker.file(5, "Crash on startup");

    let mut config = Config::default();
    config.max_retries = 3;
    let (mut poller, _clock) = poller(tracker.clone(), Coder::new(u32::MAX), config);

    let report = poller.poll_cycle().await;
    assert_eq!(report.claimed, vec![id.clone()]);

    poller.drain().await;
    let summaries = poller.reap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].status, RunStatus::Failed);
    assert_eq!(summaries[0].retry_count(PhaseName::GenerateChanges), 3);

    let comments = tracker.comments_on(&id);
    assert_eq!(comments.len(), 2, "acknowledgement plus one failure notice");
    assert!(comments[1].contains("generate_changes"));
    assert!(tracker.is_open(&id));
    assert!(tracker.published.lock().is_empty());

    // The claim is gone, so the next cycle picks the item up again.
    let report = poller.poll_cycle().await;
    assert_eq!(report.claimed, vec![id]);
    poller.drain().await;
}

#[tokio::test]
async fn test_generation_recovers_within_retry_budget() {
    let tracker = Arc::new(Tracker::default());
    let id = tracker.file(42, "Off by one");
    let (mut poller, _clock) = poller(tracker.clone(), Coder::new(2), Config::default());

    poller.poll_cycle().await;
    poller.drain().await;

    let summary = poller.reap().pop().expect("one run");
    assert_eq!(summary.item_id, id);
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.retry_count(PhaseName::GenerateChanges), 2);
    assert!(summary.change.is_some());
}

#[tokio::test]
async fn test_racing_claims_have_one_winner() {
    let clock = FakeClock::new();
    let claims = Arc::new(ClaimRegistry::new(Arc::new(clock)));
    let item = ItemId::new("acme/widgets", 42);

    let attempts: Vec<_> = ["cycle-a", "cycle-b"]
        .into_iter()
        .map(|holder| {
            let claims = claims.clone();
            let item = item.clone();
            tokio::spawn(async move {
                claims.try_claim(&item, holder, Duration::from_secs(600))
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for attempt in attempts {
        outcomes.push(attempt.await.unwrap());
    }

    assert_eq!(outcomes.iter().filter(|o| o.is_claimed()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, ClaimOutcome::AlreadyClaimed { .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_abandoned_claim_can_be_retaken_after_lease() {
    let clock = FakeClock::new();
    let claims = ClaimRegistry::new(Arc::new(clock.clone()));
    let item = ItemId::new("acme/widgets", 9);
    let lease = Duration::from_secs(600);

    assert!(claims.try_claim(&item, "crashed-poller", lease).is_claimed());

    clock.advance(Duration::from_secs(700));
    assert!(claims.try_claim(&item, "fresh-poller", lease).is_claimed());
    assert_eq!(
        claims.renew(&item, "crashed-poller"),
        RenewOutcome::NotHolder
    );
}

#[tokio::test]
async fn test_comment_ceiling_defers_then_allows() {
    let clock = FakeClock::new();
    let mut table = std::collections::BTreeMap::new();
    table.insert(
        OperationKind::Comment,
        KindLimits::new().window(WindowLimit::rolling(3, Duration::from_secs(60))),
    );
    let limiter = RateLimiter::new(&table, Arc::new(clock.clone()));
    let comment = Operation::new(OperationKind::Comment, "developer");

    for _ in 0..3 {
        assert_eq!(limiter.admit(&comment, false), Admission::Allowed);
    }

    clock.advance(Duration::from_secs(30));
    assert_eq!(
        limiter.admit(&comment, false),
        Admission::Deferred {
            retry_after: Duration::from_secs(30)
        }
    );

    clock.advance(Duration::from_secs(31));
    assert_eq!(limiter.admit(&comment, false), Admission::Allowed);
}
