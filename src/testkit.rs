// ABOUTME: In-memory collaborators and a wired-up engine for unit tests.
// ABOUTME: Mocks record every write so tests can assert on side effects.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::agent::{AgentDescriptor, AgentHandle, AgentRegistry, AgentRuntime};
use crate::clock::FakeClock;
use crate::codegen::{
    ChangePlan, CheckReport, CodeGenerator, GeneratedChanges, GenerationRequest, IssueSpec,
    Validator,
};
use crate::config::Config;
use crate::coordinator::{ClaimRegistry, RateLimiter};
use crate::pipeline::{Collaborators, PipelineOrchestrator};
use crate::source::{
    BranchSpec, CandidateFilter, ChangeRef, CloseReason, ExternalState, IssueSource, ItemId,
    WorkItem,
};

pub fn item(number: u64) -> WorkItem {
    WorkItem::new(ItemId::new("acme/widgets", number), format!("Bug {}", number))
        .body("It crashes")
        .label("autofix")
}

#[derive(Default)]
pub struct MockSource {
    items: Mutex<Vec<WorkItem>>,
    states: Mutex<HashMap<ItemId, ExternalState>>,
    pub comments: Mutex<Vec<(ItemId, String)>>,
    pub changes: Mutex<Vec<(ItemId, BranchSpec)>>,
    pub closed: Mutex<Vec<(ItemId, CloseReason)>>,
    /// Fail this many upcoming `open_change` calls.
    pub fail_open_change: AtomicU32,
    pub fail_listing: AtomicBool,
    next_change: AtomicU64,
}

impl MockSource {
    pub fn add(&self, item: WorkItem) {
        self.states.lock().insert(item.id.clone(), item.state());
        self.items.lock().push(item);
    }

    pub fn set_state(&self, id: &ItemId, state: ExternalState) {
        self.states.lock().insert(id.clone(), state);
    }

    pub fn comments_on(&self, id: &ItemId) -> Vec<String> {
        self.comments
            .lock()
            .iter()
            .filter(|(target, _)| target == id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl IssueSource for MockSource {
    async fn list_candidates(&self, filter: &CandidateFilter) -> anyhow::Result<Vec<WorkItem>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            anyhow::bail!("tracker unavailable");
        }
        let states = self.states.lock();
        let mut found: Vec<WorkItem> = self
            .items
            .lock()
            .iter()
            .filter(|item| states.get(&item.id).is_some_and(|s| filter.matches(s)))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn comment(&self, item: &ItemId, text: &str) -> anyhow::Result<()> {
        self.comments.lock().push((item.clone(), text.to_string()));
        Ok(())
    }

    async fn open_change(&self, item: &ItemId, spec: &BranchSpec) -> anyhow::Result<ChangeRef> {
        let remaining = self.fail_open_change.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_open_change.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("push rejected");
        }
        self.changes.lock().push((item.clone(), spec.clone()));
        let id = self.next_change.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ChangeRef {
            id,
            url: format!("https://tracker.test/changes/{}", id),
        })
    }

    async fn close(&self, item: &ItemId, reason: &CloseReason) -> anyhow::Result<()> {
        self.closed.lock().push((item.clone(), reason.clone()));
        if let Some(state) = self.states.lock().get_mut(item) {
            state.open = false;
        }
        Ok(())
    }

    async fn get_status(&self, item: &ItemId) -> anyhow::Result<ExternalState> {
        self.states
            .lock()
            .get(item)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such item {}", item))
    }
}

#[derive(Default)]
pub struct MockGenerator {
    /// Fail this many upcoming `generate` calls.
    pub fail_generate: AtomicU32,
    pub generate_calls: AtomicU32,
    pub requests: Mutex<Vec<GenerationRequest>>,
    pub agents_seen: Mutex<Vec<AgentHandle>>,
    /// When set, `generate` waits for a permit before returning.
    pub gate: Mutex<Option<Arc<Semaphore>>>,
}

#[async_trait]
impl CodeGenerator for MockGenerator {
    async fn plan(&self, spec: &IssueSpec, agent: &AgentHandle) -> anyhow::Result<ChangePlan> {
        self.agents_seen.lock().push(agent.clone());
        Ok(ChangePlan {
            summary: format!("Fix {}", spec.title),
            steps: vec!["patch".into(), "add test".into()],
        })
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        agent: &AgentHandle,
    ) -> anyhow::Result<GeneratedChanges> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.agents_seen.lock().push(agent.clone());
        self.requests.lock().push(request.clone());

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire().await?.forget();
        }

        let remaining = self.fail_generate.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_generate.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("model overloaded");
        }
        Ok(GeneratedChanges {
            workspace: PathBuf::from(format!("/tmp/work/{}", request.spec.item.number)),
            files_changed: vec![PathBuf::from("src/lib.rs")],
            tests: vec!["test_no_crash".into()],
        })
    }
}

#[derive(Default)]
pub struct MockValidator {
    /// Upcoming results; passes once exhausted.
    pub results: Mutex<VecDeque<bool>>,
    pub runs: AtomicU32,
}

#[async_trait]
impl Validator for MockValidator {
    async fn run_checks(&self, _workspace: &Path) -> anyhow::Result<CheckReport> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match self.results.lock().pop_front() {
            Some(false) => Ok(CheckReport::failed("1 test failed")),
            _ => Ok(CheckReport::passed("all checks passed")),
        }
    }
}

#[derive(Default)]
pub struct MockRuntime {
    pub starts: AtomicU32,
    pub fail_starts: AtomicBool,
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    async fn start(&self, descriptor: &AgentDescriptor) -> anyhow::Result<String> {
        if self.fail_starts.load(Ordering::SeqCst) {
            anyhow::bail!("no capacity");
        }
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{}-{}", descriptor.agent_id, n))
    }

    async fn stop(&self, _instance: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn heartbeat(&self, _instance: &str) -> bool {
        true
    }
}

/// Every engine component wired to in-memory collaborators.
pub struct Harness {
    pub config: Arc<Config>,
    pub clock: FakeClock,
    pub source: Arc<MockSource>,
    pub generator: Arc<MockGenerator>,
    pub validator: Arc<MockValidator>,
    pub runtime: Arc<MockRuntime>,
    pub claims: Arc<ClaimRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub agents: AgentRegistry,
}

impl Harness {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let clock = FakeClock::new();
        let runtime = Arc::new(MockRuntime::default());
        let agents = AgentRegistry::from_config(&config, runtime.clone(), Arc::new(clock.clone()))
            .expect("valid agent config");
        let limiter = RateLimiter::new(&config.rate_limits, Arc::new(clock.clone()))
            .with_max_defer(config.max_defer);

        Self {
            claims: Arc::new(ClaimRegistry::new(Arc::new(clock.clone()))),
            limiter: Arc::new(limiter),
            agents,
            source: Arc::new(MockSource::default()),
            generator: Arc::new(MockGenerator::default()),
            validator: Arc::new(MockValidator::default()),
            runtime,
            config,
            clock,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            source: self.source.clone(),
            generator: self.generator.clone(),
            validator: self.validator.clone(),
        }
    }

    pub fn orchestrator(&self) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            self.config.clone(),
            self.claims.clone(),
            self.limiter.clone(),
            self.agents.clone(),
            self.collaborators(),
            Arc::new(self.clock.clone()),
        )
    }

    /// Claim an item the way the poller does.
    pub fn claim(&self, item: &WorkItem, holder: &str) {
        let outcome = self
            .claims
            .try_claim(&item.id, holder, self.config.lease_duration);
        assert!(outcome.is_claimed(), "claim failed: {:?}", outcome);
    }
}

/// Config without rate limits, so tests see collaborator behaviour only.
pub fn unlimited_config() -> Config {
    Config {
        rate_limits: Default::default(),
        ..Config::default()
    }
}
