// ABOUTME: Per-operation-kind rate limiter gating outbound writes to the issue source.
// ABOUTME: Combines rolling/fixed window ceilings, a cooldown and a duplicate-content guard.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock::Clock;
use crate::config::secs;
use crate::source::ItemId;

/// Floor for the wait between admission attempts in `admit_or_wait`.
const MIN_WAIT: Duration = Duration::from_millis(10);

/// Kinds of outbound write, each with its own limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Posting a comment on an item.
    Comment,
    /// Changing an item's state (closing, relabeling).
    StatusChange,
    /// Opening a change request.
    Publish,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [
        OperationKind::Comment,
        OperationKind::StatusChange,
        OperationKind::Publish,
    ];
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Comment => write!(f, "comment"),
            OperationKind::StatusChange => write!(f, "status_change"),
            OperationKind::Publish => write!(f, "publish"),
        }
    }
}

/// How a window counts operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Sliding: the last `period` before now.
    #[default]
    Rolling,
    /// Aligned periods that reset when they roll over.
    Fixed,
}

/// A ceiling of `limit` operations per `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    pub limit: u32,
    #[serde(with = "secs")]
    pub period: Duration,
    #[serde(default)]
    pub kind: WindowKind,
}

impl WindowLimit {
    pub fn rolling(limit: u32, period: Duration) -> Self {
        Self {
            limit,
            period,
            kind: WindowKind::Rolling,
        }
    }

    pub fn fixed(limit: u32, period: Duration) -> Self {
        Self {
            limit,
            period,
            kind: WindowKind::Fixed,
        }
    }
}

/// All limits applying to one operation kind.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KindLimits {
    /// Every window must have room for an operation to be admitted.
    pub windows: Vec<WindowLimit>,
    /// Minimum gap between consecutive admitted operations.
    #[serde(with = "secs")]
    pub cooldown: Duration,
    /// How long identical content is remembered for the duplicate guard.
    #[serde(with = "secs")]
    pub duplicate_retention: Duration,
}

impl KindLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a window.
    pub fn window(mut self, window: WindowLimit) -> Self {
        self.windows.push(window);
        self
    }

    /// Set the cooldown.
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Set the duplicate-content retention.
    pub fn duplicate_retention(mut self, retention: Duration) -> Self {
        self.duplicate_retention = retention;
        self
    }
}

/// Limits for every operation kind.
pub type RateLimitTable = BTreeMap<OperationKind, KindLimits>;

/// Default limits.
///
/// Cooldowns: comment 15s, status change 30s, publish 30s.
pub fn default_rate_limits() -> RateLimitTable {
    const MINUTE: Duration = Duration::from_secs(60);
    const DAY: Duration = Duration::from_secs(24 * 60 * 60);
    const HOUR: Duration = Duration::from_secs(60 * 60);

    let mut table = RateLimitTable::new();
    table.insert(
        OperationKind::Comment,
        KindLimits::new()
            .window(WindowLimit::rolling(3, MINUTE))
            .window(WindowLimit::rolling(200, DAY))
            .cooldown(Duration::from_secs(15))
            .duplicate_retention(HOUR),
    );
    table.insert(
        OperationKind::StatusChange,
        KindLimits::new()
            .window(WindowLimit::rolling(10, MINUTE))
            .window(WindowLimit::rolling(500, DAY))
            .cooldown(Duration::from_secs(30))
            .duplicate_retention(HOUR),
    );
    table.insert(
        OperationKind::Publish,
        KindLimits::new()
            .window(WindowLimit::rolling(2, MINUTE))
            .window(WindowLimit::rolling(50, DAY))
            .cooldown(Duration::from_secs(30))
            .duplicate_retention(HOUR),
    );
    table
}

/// An outbound write awaiting admission.
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OperationKind,
    /// Who is performing the write (agent or poller id).
    pub actor: String,
    pub target: Option<ItemId>,
    pub payload: Option<String>,
}

impl Operation {
    pub fn new(kind: OperationKind, actor: impl Into<String>) -> Self {
        Self {
            kind,
            actor: actor.into(),
            target: None,
            payload: None,
        }
    }

    /// Set the item this operation writes to.
    pub fn on(mut self, target: &ItemId) -> Self {
        self.target = Some(target.clone());
        self
    }

    /// Set the semantic content of the write.
    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Content digest for the duplicate guard; `None` without a payload.
    fn digest(&self) -> Option<[u8; 32]> {
        let payload = self.payload.as_ref()?;
        let mut hasher = Sha256::new();
        hasher.update(self.kind.to_string().as_bytes());
        hasher.update([0]);
        if let Some(target) = &self.target {
            hasher.update(target.to_string().as_bytes());
        }
        hasher.update([0]);
        hasher.update(payload.as_bytes());
        Some(hasher.finalize().into())
    }
}

/// Why an operation was refused outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Identical content was already written within the retention window.
    Duplicate,
    /// A ceiling is exhausted for longer than callers are allowed to wait.
    CeilingExhausted { retry_after: Duration },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Duplicate => write!(f, "duplicate content"),
            RejectReason::CeilingExhausted { retry_after } => {
                write!(f, "ceiling exhausted for {:?}", retry_after)
            }
        }
    }
}

/// The limiter's decision for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Deferred { retry_after: Duration },
    Rejected { reason: RejectReason },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Observability counters for one operation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateStats {
    pub admitted: u64,
    pub deferred: u64,
    pub rejected: u64,
    pub bypassed: u64,
}

/// Counter state of one window.
struct WindowState {
    limit: WindowLimit,
    /// Admission times inside the window (rolling).
    events: VecDeque<Instant>,
    /// Start of the current period (fixed).
    window_start: Instant,
    /// Admissions in the current period (fixed).
    count: u32,
}

impl WindowState {
    fn new(limit: WindowLimit, now: Instant) -> Self {
        Self {
            limit,
            events: VecDeque::new(),
            window_start: now,
            count: 0,
        }
    }

    /// Start of the fixed period containing `now`.
    fn current_start(&self, now: Instant) -> Instant {
        let period = self.limit.period.as_nanos();
        let elapsed = now.saturating_duration_since(self.window_start).as_nanos();
        if period == 0 || elapsed < period {
            return self.window_start;
        }
        let rolled = (elapsed / period) * period;
        self.window_start + Duration::from_nanos(u64::try_from(rolled).unwrap_or(u64::MAX))
    }

    /// How long until this window has room, without mutating it.
    ///
    /// A zero ceiling never has room and reports `Duration::MAX`.
    fn wait_time(&self, now: Instant) -> Duration {
        let limit = self.limit.limit as usize;
        if limit == 0 {
            return Duration::MAX;
        }
        let period = self.limit.period;
        match self.limit.kind {
            WindowKind::Rolling => {
                let live: Vec<&Instant> = self
                    .events
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) < period)
                    .collect();
                if live.len() < limit {
                    return Duration::ZERO;
                }
                // The oldest event that must age out before there is room.
                let blocking = live[live.len() - limit];
                period.saturating_sub(now.saturating_duration_since(*blocking))
            }
            WindowKind::Fixed => {
                let start = self.current_start(now);
                let count = if start == self.window_start {
                    self.count as usize
                } else {
                    0
                };
                if count < limit {
                    return Duration::ZERO;
                }
                (start + period).saturating_duration_since(now)
            }
        }
    }

    fn record(&mut self, now: Instant) {
        let period = self.limit.period;
        match self.limit.kind {
            WindowKind::Rolling => {
                while let Some(front) = self.events.front() {
                    if now.saturating_duration_since(*front) >= period {
                        self.events.pop_front();
                    } else {
                        break;
                    }
                }
                self.events.push_back(now);
            }
            WindowKind::Fixed => {
                let start = self.current_start(now);
                if start != self.window_start {
                    self.window_start = start;
                    self.count = 0;
                }
                self.count += 1;
            }
        }
    }
}

/// Bucket state for one operation kind.
struct Bucket {
    windows: Vec<WindowState>,
    cooldown: Duration,
    retention: Duration,
    last_operation_at: Option<Instant>,
    cooldown_until: Option<Instant>,
    digests: HashMap<[u8; 32], Instant>,
}

impl Bucket {
    fn new(limits: &KindLimits, now: Instant) -> Self {
        Self {
            windows: limits
                .windows
                .iter()
                .map(|w| WindowState::new(*w, now))
                .collect(),
            cooldown: limits.cooldown,
            retention: limits.duplicate_retention,
            last_operation_at: None,
            cooldown_until: None,
            digests: HashMap::new(),
        }
    }

    fn is_duplicate(&self, now: Instant, digest: Option<&[u8; 32]>) -> bool {
        digest
            .and_then(|d| self.digests.get(d))
            .is_some_and(|at| now.saturating_duration_since(*at) < self.retention)
    }

    /// Time until every window and the cooldown allow another operation.
    fn wait_time(&self, now: Instant) -> Duration {
        let cooldown = self
            .cooldown_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);

        self.windows
            .iter()
            .map(|w| w.wait_time(now))
            .fold(cooldown, Duration::max)
    }

    fn record(&mut self, now: Instant, digest: Option<[u8; 32]>) {
        for window in &mut self.windows {
            window.record(now);
        }
        self.last_operation_at = Some(now);
        self.cooldown_until = Some(now + self.cooldown);

        let retention = self.retention;
        self.digests
            .retain(|_, at| now.saturating_duration_since(*at) < retention);
        if let Some(digest) = digest {
            if !retention.is_zero() {
                self.digests.insert(digest, now);
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    admitted: AtomicU64,
    deferred: AtomicU64,
    rejected: AtomicU64,
    bypassed: AtomicU64,
}

struct KindSlot {
    bucket: Mutex<Bucket>,
    counters: Counters,
}

/// Rate limiter for outbound writes.
///
/// Each operation kind has its own bucket behind its own lock, so decisions
/// for different kinds never contend. Only admitted operations change bucket
/// state; deferred and rejected ones leave it untouched.
pub struct RateLimiter {
    slots: HashMap<OperationKind, KindSlot>,
    clock: Arc<dyn Clock>,
    max_defer: Duration,
}

impl RateLimiter {
    /// Create a limiter from a limits table.
    ///
    /// Kinds absent from the table are admitted unconditionally.
    pub fn new(table: &RateLimitTable, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        let slots = table
            .iter()
            .map(|(kind, limits)| {
                (
                    *kind,
                    KindSlot {
                        bucket: Mutex::new(Bucket::new(limits, now)),
                        counters: Counters::default(),
                    },
                )
            })
            .collect();

        Self {
            slots,
            clock,
            max_defer: Duration::MAX,
        }
    }

    /// Turn deferrals longer than `max_defer` into rejections.
    pub fn with_max_defer(mut self, max_defer: Duration) -> Self {
        self.max_defer = max_defer;
        self
    }

    /// Decide whether an operation may proceed now.
    ///
    /// `bypass` skips every check; it is reserved for the poller's own trusted
    /// writes and is still counted.
    pub fn admit(&self, op: &Operation, bypass: bool) -> Admission {
        let Some(slot) = self.slots.get(&op.kind) else {
            return Admission::Allowed;
        };

        if bypass {
            slot.counters.bypassed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(kind = %op.kind, actor = %op.actor, "rate limit bypassed");
            return Admission::Allowed;
        }

        let now = self.clock.now();
        let digest = op.digest();
        let mut bucket = slot.bucket.lock();

        if bucket.is_duplicate(now, digest.as_ref()) {
            drop(bucket);
            slot.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(kind = %op.kind, actor = %op.actor, "duplicate content rejected");
            return Admission::Rejected {
                reason: RejectReason::Duplicate,
            };
        }

        let wait = bucket.wait_time(now);
        if wait.is_zero() {
            bucket.record(now, digest);
            slot.counters.admitted.fetch_add(1, Ordering::Relaxed);
            return Admission::Allowed;
        }
        drop(bucket);

        if wait > self.max_defer || wait == Duration::MAX {
            slot.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(kind = %op.kind, actor = %op.actor, ?wait, "rate ceiling exhausted");
            return Admission::Rejected {
                reason: RejectReason::CeilingExhausted { retry_after: wait },
            };
        }

        slot.counters.deferred.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(kind = %op.kind, actor = %op.actor, ?wait, "operation deferred");
        Admission::Deferred { retry_after: wait }
    }

    /// Admit an operation, sleeping through deferrals.
    ///
    /// Returns `Allowed` once admitted, the rejection if one occurs, or the
    /// last deferral if `cancel` completes first.
    pub async fn admit_or_wait<F>(&self, op: &Operation, cancel: F) -> Admission
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(cancel);

        loop {
            let decision = self.admit(op, false);
            let Admission::Deferred { retry_after } = decision else {
                return decision;
            };

            tokio::select! {
                biased;
                () = &mut cancel => {
                    return decision;
                }
                () = self.clock.sleep(retry_after.max(MIN_WAIT)) => {}
            }
        }
    }

    /// When an operation of this kind was last admitted.
    pub fn last_operation_at(&self, kind: OperationKind) -> Option<Instant> {
        self.slots
            .get(&kind)
            .and_then(|slot| slot.bucket.lock().last_operation_at)
    }

    /// Counters for one kind.
    pub fn stats(&self, kind: OperationKind) -> RateStats {
        match self.slots.get(&kind) {
            Some(slot) => RateStats {
                admitted: slot.counters.admitted.load(Ordering::Relaxed),
                deferred: slot.counters.deferred.load(Ordering::Relaxed),
                rejected: slot.counters.rejected.load(Ordering::Relaxed),
                bypassed: slot.counters.bypassed.load(Ordering::Relaxed),
            },
            None => RateStats::default(),
        }
    }
}
