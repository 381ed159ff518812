//! Orchestration entry points.
//!
//! The [`Orchestrator`] ties a stack, a provider and a state store together:
//! it builds the dependency graph, diffs it against recorded state and
//! applies plans while holding the state lock.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, ConfigParser, ProviderKind, StackConfig, StateBackend};
use crate::error::{ConfigError, Result};
use crate::graph::{DependencyGraph, GraphBuilder};
use crate::model::{CapabilityTable, SpecSet};
use crate::planner::{ApplyResult, CancellationFlag, DiffEngine, ExecutorOptions, Plan, PlanExecutor};
use crate::provider::{HttpProvider, Provider, SandboxProvider};
use crate::state::{LocalStateStore, S3StateStore, StateSnapshot, StateStore, generate_holder_id};

/// Plans and applies one stack.
pub struct Orchestrator<'a, P: Provider, S: StateStore> {
    specs: SpecSet,
    capabilities: CapabilityTable,
    options: ExecutorOptions,
    provider: &'a P,
    store: &'a S,
    diff_engine: DiffEngine,
    cancellation: CancellationFlag,
    holder: String,
}

impl<'a, P: Provider, S: StateStore> Orchestrator<'a, P, S> {
    /// Creates an orchestrator for an explicit resource set.
    #[must_use]
    pub fn new(specs: SpecSet, capabilities: CapabilityTable, provider: &'a P, store: &'a S) -> Self {
        Self {
            specs,
            capabilities,
            options: ExecutorOptions::default(),
            provider,
            store,
            diff_engine: DiffEngine::new(),
            cancellation: CancellationFlag::new(),
            holder: generate_holder_id(),
        }
    }

    /// Creates an orchestrator from a parsed stack.
    ///
    /// # Errors
    ///
    /// Returns an error if a resource in the stack is malformed.
    pub fn from_config(config: &StackConfig, provider: &'a P, store: &'a S) -> Result<Self> {
        let specs = config.spec_set()?;
        Ok(Self::new(specs, config.capabilities(), provider, store).with_options(config.executor_options()))
    }

    /// Sets the executor tunables.
    #[must_use]
    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the flag checked between ops during apply.
    #[must_use]
    pub fn with_cancellation(mut self, cancellation: CancellationFlag) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Sets the lock holder id recorded while applying.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Desired resources.
    #[must_use]
    pub const fn specs(&self) -> &SpecSet {
        &self.specs
    }

    /// Builds the dependency graph of the desired resources.
    ///
    /// # Errors
    ///
    /// Returns an error on cycles or dangling references.
    pub fn graph(&self) -> Result<DependencyGraph> {
        Ok(GraphBuilder::build(&self.specs)?)
    }

    /// Loads recorded state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state store cannot be read.
    pub async fn state(&self) -> Result<StateSnapshot> {
        self.store.load().await
    }

    /// Computes the plan that converges recorded state to the desired resources.
    ///
    /// # Errors
    ///
    /// Returns planning errors unmodified, or a state error if state cannot be read.
    pub async fn plan(&self) -> Result<Plan> {
        let graph = self.graph()?;
        let prior = self.store.load().await?;
        debug!("Planning {} resources against {} records", graph.len(), prior.len());

        let plan = self.diff_engine.diff(graph, &prior, &self.capabilities);
        info!("Plan {}: {} changes", ConfigHasher::new().short_hash(&plan.graph_fingerprint), plan.len());
        Ok(plan)
    }

    /// Computes the plan that deletes every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        let prior = self.store.load().await?;
        let plan = self
            .diff_engine
            .diff(DependencyGraph::default(), &prior, &self.capabilities);
        info!("Destroy plan: {} changes", plan.len());
        Ok(plan)
    }

    /// Applies a plan under the state lock.
    ///
    /// The lock is released whether or not the apply succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held elsewhere, the plan is stale, or
    /// state cannot be written.
    pub async fn apply(&self, plan: Plan) -> Result<ApplyResult> {
        let lock = self.store.acquire_lock(&self.holder).await?;
        debug!("Acquired state lock {} as {}", lock.lock_id, lock.holder);

        let result = PlanExecutor::new(self.provider, self.store, &self.capabilities)
            .with_options(self.options.clone())
            .with_cancellation(self.cancellation.clone())
            .with_lock(lock.clone())
            .apply(plan)
            .await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }

        result
    }
}

/// Opens the state store configured for a stack.
///
/// Relative local paths are resolved against `base`, the stack file's directory.
///
/// # Errors
///
/// Returns an error if the s3 backend has no bucket.
pub async fn open_state_store(config: &StackConfig, base: &Path) -> Result<Box<dyn StateStore>> {
    match config.state.backend {
        StateBackend::Local => {
            let dir = resolve_path(base, config.local_state_dir());
            debug!("Using local state in {}", dir.display());
            Ok(Box::new(LocalStateStore::with_base_dir(dir)))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| ConfigError::validation("S3 bucket name is required", "state.bucket"))?;
            debug!("Using S3 state in bucket {bucket}");
            Ok(Box::new(
                S3StateStore::new(bucket, config.state.prefix.as_deref(), config.state.region.as_deref()).await,
            ))
        }
    }
}

/// Opens the provider adapter configured for a stack.
///
/// # Errors
///
/// Returns an error if the http adapter has no endpoint or its token
/// variable is unset.
pub fn open_provider(config: &StackConfig, base: &Path) -> Result<Box<dyn Provider>> {
    match config.provider.kind {
        ProviderKind::Sandbox => {
            let inventory = config
                .provider
                .inventory
                .as_ref()
                .map_or_else(|| config.local_state_dir().join("sandbox.json"), PathBuf::from);
            Ok(Box::new(SandboxProvider::with_inventory(resolve_path(base, inventory))))
        }
        ProviderKind::Http => {
            let endpoint = config
                .provider
                .endpoint
                .as_deref()
                .ok_or_else(|| ConfigError::validation("An endpoint is required", "provider.endpoint"))?;
            let token = ConfigParser::provider_token(config)?;
            let provider = match config.provider.timeout_secs {
                Some(secs) => HttpProvider::with_timeout(endpoint, token, secs)?,
                None => HttpProvider::new(endpoint, token)?,
            };
            Ok(Box::new(provider))
        }
    }
}

fn resolve_path(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_relative() { base.join(path) } else { path }
}
