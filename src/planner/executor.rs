//! Plan executor.
//!
//! Applies a plan one op at a time, in plan order. Every successful provider
//! call is followed immediately by a state write, so a crash loses at most
//! the op in flight. The first failure stops the run: the failing resource is
//! tainted and everything after it is reported as pending. There is no
//! automatic rollback.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ConfigHasher;
use crate::error::{PlanError, ProviderError, Result, StackwrightError, StateError};
use crate::graph::DependencyGraph;
use crate::model::{CapabilityTable, KindCapabilities, ReplaceStrategy, ResourceId, ResourceRef, ResourceSpec};
use crate::provider::{Provider, ProviderOp, Provisioned, ResourceRequest};
use crate::state::{LockInfo, RecordStatus, StateRecord, StateSnapshot, StateStore};

use super::plan::{ChangeKind, ChangeOp, Plan};

/// Shared flag checked between ops.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    /// Creates an untripped flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. The op in flight still runs to completion.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Tunables for a run.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Per-call timeout for kinds that do not set their own.
    pub call_timeout: Option<Duration>,
    /// Attempts for each state write after a successful provider call.
    pub state_write_attempts: u32,
    /// Delay before the second state write attempt, doubled after each failure.
    pub state_write_backoff: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            call_timeout: Some(Duration::from_secs(300)),
            state_write_attempts: 5,
            state_write_backoff: Duration::from_millis(200),
        }
    }
}

/// Why an op failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The provider call failed.
    Provider(ProviderError),
    /// A reference could not be resolved from state; no provider call was made.
    UnresolvedReference {
        /// The reference token.
        reference: String,
        /// Why resolution failed.
        reason: String,
    },
}

/// The op that stopped a run.
#[derive(Debug, Clone)]
pub struct FailedOp {
    /// The failing op.
    pub op: ChangeOp,
    /// What went wrong.
    pub cause: FailureCause,
}

/// Outcome of applying a plan.
#[derive(Debug, Default)]
pub struct ApplyResult {
    /// Ops applied successfully, in order.
    pub completed: Vec<ChangeOp>,
    /// The op that failed, if any.
    pub failed: Option<FailedOp>,
    /// Ops never attempted.
    pub pending: Vec<ChangeOp>,
    /// Whether the run stopped because of cancellation.
    pub cancelled: bool,
}

/// Serializable view of one op in an apply result.
#[derive(Debug, Clone, Serialize)]
pub struct OpOutcome {
    /// Change kind.
    pub action: ChangeKind,
    /// Resource identity.
    pub identity: String,
}

/// Serializable view of an apply result.
#[derive(Debug, Clone, Serialize)]
pub struct ApplySummary {
    /// Whether every op was applied.
    pub success: bool,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Completed ops.
    pub completed: Vec<OpOutcome>,
    /// Failed op, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<OpOutcome>,
    /// Failure message, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the failure is known to be retryable.
    pub retryable: bool,
    /// Pending ops.
    pub pending: Vec<OpOutcome>,
}

/// Why an op stopped the run.
enum Halt {
    /// The op failed; the run stops with a partial result.
    Failed(FailureCause),
    /// State could not be written; the run aborts.
    Fatal(StackwrightError),
}

impl From<StackwrightError> for Halt {
    fn from(e: StackwrightError) -> Self {
        Self::Fatal(e)
    }
}

type OpResult = std::result::Result<(), Halt>;

/// Executor for plans.
pub struct PlanExecutor<'a, P: Provider, S: StateStore> {
    provider: &'a P,
    store: &'a S,
    capabilities: &'a CapabilityTable,
    options: ExecutorOptions,
    cancellation: CancellationFlag,
    hasher: ConfigHasher,
    lease: Mutex<Option<LockInfo>>,
}

impl<'a, P: Provider, S: StateStore> PlanExecutor<'a, P, S> {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(provider: &'a P, store: &'a S, capabilities: &'a CapabilityTable) -> Self {
        Self {
            provider,
            store,
            capabilities,
            options: ExecutorOptions::default(),
            cancellation: CancellationFlag::new(),
            hasher: ConfigHasher::new(),
            lease: Mutex::new(None),
        }
    }

    /// Sets the state lock this run holds. It is renewed before every op and
    /// every state write, and the run stops if someone else took it over.
    #[must_use]
    pub fn with_lock(self, lock: LockInfo) -> Self {
        Self {
            lease: Mutex::new(Some(lock)),
            ..self
        }
    }

    /// Sets the run tunables.
    #[must_use]
    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the cancellation flag checked between ops.
    #[must_use]
    pub fn with_cancellation(mut self, cancellation: CancellationFlag) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Applies a plan.
    ///
    /// # Errors
    ///
    /// Returns `StalePlan` if state changed since the plan was computed, or a
    /// state error if a record cannot be persisted. Provider failures are not
    /// errors; they are reported in the [`ApplyResult`].
    pub async fn apply(&self, plan: Plan) -> Result<ApplyResult> {
        let mut records = self.store.load().await?;
        let found = self.hasher.hash_state(&records);
        if !ConfigHasher::hashes_match(&plan.state_fingerprint, &found) {
            return Err(PlanError::StalePlan {
                expected: self.hasher.short_hash(&plan.state_fingerprint),
                found: self.hasher.short_hash(&found),
            }
            .into());
        }

        let (ops, graph) = plan.into_parts();
        info!("Applying plan with {} changes", ops.len());

        let mut result = ApplyResult::default();
        let mut remaining = ops.into_iter();

        while let Some(op) = remaining.next() {
            if self.cancellation.is_cancelled() {
                warn!("Apply cancelled, {} changes left pending", remaining.len() + 1);
                result.cancelled = true;
                result.pending.push(op);
                break;
            }

            self.hold_lease().await?;
            info!("Applying {op}");
            match self.apply_op(&op, &graph, &mut records).await {
                Ok(()) => result.completed.push(op),
                Err(Halt::Failed(cause)) => {
                    error!("Failed to {op}: {cause}");
                    result.failed = Some(FailedOp { op, cause });
                    break;
                }
                Err(Halt::Fatal(e)) => return Err(e),
            }
        }
        result.pending.extend(remaining);

        info!(
            "Apply finished: {} completed, {} failed, {} pending",
            result.completed.len(),
            usize::from(result.failed.is_some()),
            result.pending.len()
        );
        Ok(result)
    }

    async fn apply_op(&self, op: &ChangeOp, graph: &DependencyGraph, records: &mut StateSnapshot) -> OpResult {
        let dependencies = |id: &ResourceId| {
            graph
                .get(id)
                .map(|node| node.dependencies.clone())
                .unwrap_or_default()
        };

        match op {
            ChangeOp::Create { spec, previous, .. } => {
                let request = resolve(spec, records)?;
                let revision = previous.as_ref().map_or(0, |p| p.revision);
                match self.create(&request).await {
                    Ok(provisioned) => {
                        let record = active_record(spec, provisioned, revision + 1, dependencies(spec.id()));
                        self.persist(record, records).await?;
                        Ok(())
                    }
                    Err(e) => {
                        let mut record = StateRecord::new(spec.id().clone(), spec.canonical_properties());
                        record.revision = revision;
                        record.dependencies = dependencies(spec.id());
                        self.taint(record, records).await?;
                        Err(Halt::Failed(FailureCause::Provider(e)))
                    }
                }
            }

            ChangeOp::Update { spec, previous, .. } => {
                let request = resolve(spec, records)?;
                let caps = self.capabilities.get(spec.kind());
                let call = {
                    let provider = self.provider;
                    let request = &request;
                    move || provider.update(request, previous)
                };
                match self.invoke(ProviderOp::Update, spec.id(), caps, call).await {
                    Ok(provisioned) => {
                        let mut record =
                            active_record(spec, provisioned, previous.revision + 1, dependencies(spec.id()));
                        record.deposed = current_deposed(records, spec.id());
                        self.persist(record, records).await?;
                        Ok(())
                    }
                    Err(e) => {
                        self.taint(previous.clone(), records).await?;
                        Err(Halt::Failed(FailureCause::Provider(e)))
                    }
                }
            }

            ChangeOp::Replace {
                spec,
                previous,
                strategy,
                ..
            } => {
                let request = resolve(spec, records)?;
                let deps = dependencies(spec.id());
                match strategy {
                    ReplaceStrategy::DeleteBeforeCreate => {
                        self.replace_delete_first(spec, previous, &request, deps, records)
                            .await
                    }
                    ReplaceStrategy::CreateBeforeDestroy => {
                        self.replace_create_first(spec, previous, &request, deps, records)
                            .await
                    }
                }
            }

            ChangeOp::Delete { previous, .. } => {
                if previous.physical_id.is_some() {
                    if let Err(e) = self.delete(previous).await {
                        self.taint(previous.clone(), records).await?;
                        return Err(Halt::Failed(FailureCause::Provider(e)));
                    }
                } else {
                    debug!("{} has no physical id, removing record only", previous.identity);
                }

                let mut gone = previous.clone();
                gone.physical_id = None;
                gone.set_status(RecordStatus::Deleted);
                self.persist(gone, records).await?;
                self.forget(&previous.identity, records).await?;
                Ok(())
            }

            ChangeOp::DeleteDeposed {
                previous,
                physical_id,
                ..
            } => {
                let mut target = previous.clone();
                target.physical_id = Some(physical_id.clone());
                target.deposed.clear();
                self.delete(&target)
                    .await
                    .map_err(|e| Halt::Failed(FailureCause::Provider(e)))?;

                if let Some(mut current) = records.get(&previous.identity).cloned() {
                    current.deposed.retain(|deposed| deposed != physical_id);
                    self.persist(current, records).await?;
                }
                Ok(())
            }
        }
    }

    async fn replace_delete_first(
        &self,
        spec: &ResourceSpec,
        previous: &StateRecord,
        request: &ResourceRequest,
        dependencies: std::collections::BTreeSet<ResourceId>,
        records: &mut StateSnapshot,
    ) -> OpResult {
        if previous.physical_id.is_some() {
            if let Err(e) = self.delete(previous).await {
                self.taint(previous.clone(), records).await?;
                return Err(Halt::Failed(FailureCause::Provider(e)));
            }
        }

        // Between the two calls the old instance is gone and the new one does not exist yet
        let mut gone = previous.clone();
        gone.physical_id = None;
        gone.deposed = current_deposed(records, spec.id());
        gone.set_status(RecordStatus::Deleted);
        self.persist(gone.clone(), records).await?;

        match self.create(request).await {
            Ok(provisioned) => {
                let mut record = active_record(spec, provisioned, previous.revision + 1, dependencies);
                record.deposed = current_deposed(records, spec.id());
                self.persist(record, records).await?;
                Ok(())
            }
            Err(e) => {
                self.taint(gone, records).await?;
                Err(Halt::Failed(FailureCause::Provider(e)))
            }
        }
    }

    async fn replace_create_first(
        &self,
        spec: &ResourceSpec,
        previous: &StateRecord,
        request: &ResourceRequest,
        dependencies: std::collections::BTreeSet<ResourceId>,
        records: &mut StateSnapshot,
    ) -> OpResult {
        let provisioned = match self.create(request).await {
            Ok(provisioned) => provisioned,
            Err(e) => {
                self.taint(previous.clone(), records).await?;
                return Err(Halt::Failed(FailureCause::Provider(e)));
            }
        };

        let mut record = active_record(spec, provisioned, previous.revision + 1, dependencies);
        record.deposed = current_deposed(records, spec.id());
        self.persist(record.clone(), records).await?;

        let Some(old_id) = previous.physical_id.clone() else {
            return Ok(());
        };
        if let Err(e) = self.delete(previous).await {
            warn!(
                "New instance of {} is live but deleting the old instance {old_id} failed: {e}",
                spec.id()
            );
            record.deposed.push(old_id);
            self.persist(record, records).await?;
        }
        Ok(())
    }

    async fn create(&self, request: &ResourceRequest) -> std::result::Result<Provisioned, ProviderError> {
        let caps = self.capabilities.get(request.id.kind());
        let provider = self.provider;
        self.invoke(ProviderOp::Create, &request.id, caps, move || provider.create(request))
            .await
    }

    /// Deletes through the provider; a resource that is already gone counts as deleted.
    async fn delete(&self, record: &StateRecord) -> std::result::Result<(), ProviderError> {
        let caps = self.capabilities.get(record.identity.kind());
        let provider = self.provider;
        match self
            .invoke(ProviderOp::Delete, &record.identity, caps, move || provider.delete(record))
            .await
        {
            Err(ProviderError::NotFound { physical_id }) => {
                debug!("{physical_id} for {} was already gone", record.identity);
                Ok(())
            }
            other => other,
        }
    }

    /// Runs one provider call with the kind's timeout and retry policy.
    async fn invoke<T, F, Fut>(
        &self,
        op: ProviderOp,
        id: &ResourceId,
        caps: &KindCapabilities,
        call: F,
    ) -> std::result::Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let policy = caps.retry_policy();
        let limit = caps.timeout.or(self.options.call_timeout);
        let mut attempt: u32 = 1;

        loop {
            let outcome = match limit {
                Some(limit) => tokio::time::timeout(limit, call())
                    .await
                    .unwrap_or_else(|_| {
                        Err(ProviderError::Timeout {
                            operation: op.to_string(),
                            resource: id.to_string(),
                            timeout_secs: limit.as_secs(),
                        })
                    }),
                None => call().await,
            };

            match outcome {
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    let delay = e.retry_delay_secs().map_or_else(
                        || policy.backoff(attempt),
                        |secs| Duration::from_secs(secs).min(Duration::from_millis(policy.max_backoff_ms)),
                    );
                    warn!(
                        "{op} {id} failed (attempt {attempt}/{}): {e}; retrying in {}ms",
                        policy.max_attempts,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn taint(&self, mut record: StateRecord, records: &mut StateSnapshot) -> Result<()> {
        warn!("Marking {} as tainted", record.identity);
        if records.contains_key(&record.identity) {
            record.deposed = current_deposed(records, &record.identity);
        }
        record.set_status(RecordStatus::Tainted);
        self.persist(record, records).await
    }

    /// Saves a record, retrying with backoff. The in-memory view is only
    /// updated once the write succeeded.
    async fn persist(&self, record: StateRecord, records: &mut StateSnapshot) -> Result<()> {
        self.hold_lease().await?;
        let id = record.identity.clone();
        self.with_write_retry(&id, record.physical_id.as_deref(), || self.store.save(&id, &record))
            .await?;
        records.insert(id, record);
        Ok(())
    }

    /// Removes a record, retrying with backoff.
    async fn forget(&self, id: &ResourceId, records: &mut StateSnapshot) -> Result<()> {
        self.hold_lease().await?;
        self.with_write_retry(id, None, || self.store.delete(id)).await?;
        records.remove(id);
        Ok(())
    }

    /// Renews the state lock, if this run holds one.
    ///
    /// Losing the lock is fatal: another writer owns the state now. Any other
    /// refresh failure keeps the current lease and is only logged.
    async fn hold_lease(&self) -> Result<()> {
        let mut lease = self.lease.lock().await;
        let Some(lock) = lease.clone() else {
            return Ok(());
        };

        match self.store.refresh_lock(&lock).await {
            Ok(renewed) => {
                *lease = Some(renewed);
                Ok(())
            }
            Err(e @ StackwrightError::State(StateError::LockLost { .. })) => {
                error!("{e}; stopping before touching state again");
                Err(e)
            }
            Err(e) => {
                warn!("Failed to renew state lock {}: {e}", lock.lock_id);
                Ok(())
            }
        }
    }

    async fn with_write_retry<F, Fut>(&self, id: &ResourceId, physical_id: Option<&str>, write: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let attempts = self.options.state_write_attempts.max(1);
        let mut delay = self.options.state_write_backoff;

        for attempt in 1..=attempts {
            match write().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!("State write for {id} failed (attempt {attempt}/{attempts}): {e}");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => {
                    error!(
                        "State write for {id} failed after {attempts} attempts; physical resource {} is not recorded",
                        physical_id.unwrap_or("<none>")
                    );
                    return Err(StateError::WriteFailed {
                        id: id.clone(),
                        attempts,
                        message: e.to_string(),
                    }
                    .into());
                }
            }
        }

        Ok(())
    }
}

/// Resolves every reference in a spec against current records.
fn resolve(spec: &ResourceSpec, records: &StateSnapshot) -> std::result::Result<ResourceRequest, Halt> {
    let lookup = |reference: &ResourceRef| -> std::result::Result<serde_json::Value, String> {
        let record = records
            .get(&reference.target)
            .filter(|record| record.status == RecordStatus::Active)
            .ok_or_else(|| format!("{} has no active state record", reference.target))?;
        record
            .attribute(&reference.attribute)
            .ok_or_else(|| format!("{} has no recorded attribute '{}'", reference.target, reference.attribute))
    };

    let mut properties = std::collections::BTreeMap::new();
    for (name, value) in spec.properties() {
        let resolved = value.resolve(&lookup).map_err(|(reference, reason)| {
            let err = PlanError::UnresolvedReference {
                resource: spec.id().clone(),
                reference: reference.token(),
                reason: reason.clone(),
            };
            warn!("{err}");
            Halt::Failed(FailureCause::UnresolvedReference {
                reference: reference.token(),
                reason,
            })
        })?;
        properties.insert(name.clone(), resolved);
    }

    Ok(ResourceRequest {
        id: spec.id().clone(),
        properties,
    })
}

/// Deposed instances recorded for `id` right now. Earlier ops in the same run
/// may have cleaned some up since the plan was computed.
fn current_deposed(records: &StateSnapshot, id: &ResourceId) -> Vec<String> {
    records
        .get(id)
        .map(|record| record.deposed.clone())
        .unwrap_or_default()
}

fn active_record(
    spec: &ResourceSpec,
    provisioned: Provisioned,
    revision: u64,
    dependencies: std::collections::BTreeSet<ResourceId>,
) -> StateRecord {
    let mut record = StateRecord::new(spec.id().clone(), spec.canonical_properties());
    record.physical_id = Some(provisioned.physical_id);
    record.outputs = provisioned.outputs;
    record.revision = revision;
    record.dependencies = dependencies;
    record
}

impl FailureCause {
    /// Returns true if running the op again may succeed without changes.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::UnresolvedReference { .. } => false,
        }
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provider(e) => write!(f, "{e}"),
            Self::UnresolvedReference { reference, reason } => {
                write!(f, "cannot resolve {reference}: {reason}")
            }
        }
    }
}

impl ApplyResult {
    /// Returns true if every op was applied.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_none() && !self.cancelled && self.pending.is_empty()
    }

    /// Serializable summary.
    #[must_use]
    pub fn summary(&self) -> ApplySummary {
        let outcome = |op: &ChangeOp| OpOutcome {
            action: op.kind(),
            identity: op.id().to_string(),
        };

        ApplySummary {
            success: self.is_success(),
            cancelled: self.cancelled,
            completed: self.completed.iter().map(outcome).collect(),
            failed: self.failed.as_ref().map(|f| outcome(&f.op)),
            error: self.failed.as_ref().map(|f| f.cause.to_string()),
            retryable: self.failed.as_ref().is_some_and(|f| f.cause.is_retryable()),
            pending: self.pending.iter().map(outcome).collect(),
        }
    }
}
