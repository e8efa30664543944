//! Engine: the assignment loops.
//!
//! One `Engine` instance owns everything that carries state across calls:
//! - the agent directory (who is online, how loaded they are)
//! - the assignment executor and its dedup guard
//! - the ledger of past assignments
//! - the published agent snapshot (`watch`) and assignment events (`broadcast`)
//!
//! Two periodic cycles drive it. The agent-stats cycle only refreshes the
//! snapshot. The assignment cycle pulls fresh unassigned records, assigns each
//! to the least-loaded agent and bumps that agent's count in memory so the
//! rest of the batch spreads out. The webhook path goes through
//! [`Engine::assign_single`] with live counts.

pub mod balancer;
pub mod directory;
pub mod error;
pub mod executor;

pub use error::AssignError;

use crate::backends::{Agent, CrmBackend, RecordQuery, WorkRecord};
use crate::crm::GatewayError;
use crate::ledger::Ledger;
use anyhow::Context;
use chrono::{DateTime, Utc};
use directory::AgentDirectory;
use executor::AssignmentExecutor;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;

/// Capacity of the assignment event channel; slow observers lag, never block.
const EVENT_CAPACITY: usize = 256;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Agent-stats refresh period
    pub stats_interval: Duration,
    /// Assignment cycle period
    pub assignment_interval: Duration,
    /// How far back the assignment cycle looks for new records
    pub window: Duration,
    /// Status tag of open, routable records
    pub open_status: String,
    /// Only hand work to agents marked online
    pub require_online: bool,
    /// HTTP listen address
    pub bind: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stats_interval: Duration::from_secs(60),
            assignment_interval: Duration::from_secs(120),
            window: Duration::from_secs(300),
            open_status: "NEW".to_string(),
            require_online: true,
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_config() -> Self {
        let defaults = Self::default();
        let secs = |key: &str, fallback: Duration| {
            Duration::from_secs(crate::config::get_or(key, fallback.as_secs()))
        };
        Self {
            stats_interval: secs("engine.stats_interval_seconds", defaults.stats_interval),
            assignment_interval: secs(
                "engine.assignment_interval_seconds",
                defaults.assignment_interval,
            ),
            window: secs("engine.window_seconds", defaults.window),
            open_status: crate::config::get_or("crm.open_status", defaults.open_status),
            require_online: crate::config::get_or("agents.require_online", defaults.require_online),
            bind: crate::config::get_or("server.bind", defaults.bind),
        }
    }
}

/// Latest published view of agent load.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub refreshed_at: Option<DateTime<Utc>>,
    pub agents: Vec<Agent>,
}

/// Optimistic +1 for an agent that just received a record.
fn bump(agents: &mut [Agent], agent_id: &str) {
    if let Some(count) = agents
        .iter_mut()
        .find(|a| a.id == agent_id)
        .and_then(|a| a.open_work_count.as_mut())
    {
        *count += 1;
    }
}

/// Headline numbers for the dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub active_agents: usize,
    pub assigned_today: u64,
    /// Unassigned records in the window, awaiting the next cycle.
    pub pending: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Assigned,
    Failed { reason: String },
}

/// What happened to one record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentResult {
    pub record_id: String,
    pub record_title: String,
    pub agent_id: String,
    pub agent_name: String,
    pub outcome: Outcome,
    pub at: DateTime<Utc>,
}

impl AssignmentResult {
    fn new(record: &WorkRecord, agent: &Agent, outcome: Outcome) -> Self {
        Self {
            record_id: record.id.clone(),
            record_title: record.title.clone(),
            agent_id: agent.id.clone(),
            agent_name: agent.display_name(),
            outcome,
            at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Assigned
    }
}

/// Tally of one assignment cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub fetched: usize,
    pub assigned: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Engine {
    config: EngineConfig,
    backend: Arc<dyn CrmBackend>,
    directory: AgentDirectory,
    executor: AssignmentExecutor,
    ledger: Arc<Ledger>,
    snapshot: watch::Sender<AgentSnapshot>,
    events: broadcast::Sender<AssignmentResult>,
}

impl Engine {
    pub fn new(config: EngineConfig, backend: Arc<dyn CrmBackend>, ledger: Arc<Ledger>) -> Self {
        let directory =
            AgentDirectory::new(backend.clone(), &config.open_status, config.require_online);
        let executor = AssignmentExecutor::new(backend.clone());
        let (snapshot, _) = watch::channel(AgentSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            backend,
            directory,
            executor,
            ledger,
            snapshot,
            events,
        }
    }

    /// Build an engine from config: CRM backend plus the on-disk ledger.
    pub async fn from_config() -> anyhow::Result<Self> {
        let config = EngineConfig::from_config();
        let backend = crate::backends::from_config()?;
        let ledger_path = crate::ledger::default_path()?;
        let ledger = Ledger::open(&ledger_path)?;
        ledger.migrate().await.context("migrating ledger")?;
        tracing::debug!(path = %ledger_path.display(), "ledger ready");
        Ok(Self::new(config, backend, Arc::new(ledger)))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn executor(&self) -> &AssignmentExecutor {
        &self.executor
    }

    /// Assignment events, successes and failures.
    pub fn subscribe(&self) -> broadcast::Receiver<AssignmentResult> {
        self.events.subscribe()
    }

    #[cfg(test)]
    pub fn watch_agents(&self) -> watch::Receiver<AgentSnapshot> {
        self.snapshot.subscribe()
    }

    /// Current published snapshot.
    pub fn agents(&self) -> AgentSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Agent-stats cycle: reload agents and counts, replace the snapshot.
    pub async fn refresh_agents(&self) -> Result<Vec<Agent>, GatewayError> {
        let agents = self.directory.snapshot().await?;
        tracing::info!(agents = agents.len(), "agent stats refreshed");
        self.snapshot.send_replace(AgentSnapshot {
            refreshed_at: Some(Utc::now()),
            agents: agents.clone(),
        });
        Ok(agents)
    }

    /// Oldest creation time the assignment cycle still picks up.
    fn window_start(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.window)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Unassigned records in the window right now.
    pub async fn pending_count(&self) -> Result<u32, GatewayError> {
        let query = RecordQuery::unassigned_since(&self.config.open_status, self.window_start());
        self.backend.count_work_records(&query).await
    }

    /// Active agents from the published snapshot, today's ledger entries
    /// (local midnight onwards) and the pending count from the CRM.
    pub async fn stats(&self) -> anyhow::Result<DashboardStats> {
        let since = crate::ledger::start_of_local_day(chrono::Local::now());
        let assigned_today = self.ledger.assigned_since(since).await?;
        let pending = self.pending_count().await.context("counting pending records")?;
        Ok(DashboardStats {
            active_agents: self.snapshot.borrow().agents.len(),
            assigned_today,
            pending,
        })
    }

    /// Assignment cycle over records created within the window.
    ///
    /// Per-record problems are tallied in the report; only failing to list
    /// records or agents aborts the cycle.
    pub async fn run_assignment_cycle(&self) -> Result<CycleReport, GatewayError> {
        let query = RecordQuery::unassigned_since(&self.config.open_status, self.window_start());
        let records = self.backend.list_work_records(&query).await?;

        let mut report = CycleReport {
            fetched: records.len(),
            ..CycleReport::default()
        };
        if records.is_empty() {
            tracing::debug!("no unassigned records in window");
            return Ok(report);
        }

        let mut agents = self.refresh_agents().await?;
        for record in &records {
            if !record.is_unassigned() || self.executor.is_assigned(&record.id) {
                report.skipped += 1;
                continue;
            }
            match self.assign_from(&mut agents, record).await {
                Ok(_) => report.assigned += 1,
                Err(AssignError::AlreadyAssigned { .. }) => report.skipped += 1,
                Err(e) if e.is_skip() => {
                    tracing::warn!(record_id = %record.id, reason = %e, "record left unassigned");
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::error!(record_id = %record.id, err = %e, "assignment failed");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            fetched = report.fetched,
            assigned = report.assigned,
            skipped = report.skipped,
            failed = report.failed,
            "assignment cycle complete"
        );
        Ok(report)
    }

    /// Assign one record with freshly counted agents (webhook path).
    pub async fn assign_single(&self, record: &WorkRecord) -> Result<AssignmentResult, AssignError> {
        let agents = self.directory.list_active_agents().await?;
        if agents.is_empty() {
            tracing::warn!(record_id = %record.id, "no agents available");
            return Err(AssignError::NoAgentsAvailable);
        }
        let mut agents = self.directory.with_open_work_counts(agents).await;
        self.assign_from(&mut agents, record).await
    }

    /// Select from `agents`, write the owner, then record and publish.
    async fn assign_from(
        &self,
        agents: &mut [Agent],
        record: &WorkRecord,
    ) -> Result<AssignmentResult, AssignError> {
        if agents.is_empty() {
            return Err(AssignError::NoAgentsAvailable);
        }
        let agent = balancer::select_least_loaded(agents)
            .cloned()
            .ok_or(AssignError::NoSelection)?;

        match self.executor.assign(&record.id, &agent.id).await {
            Ok(()) => {
                bump(agents, &agent.id);
                // Webhook assignments bump the published snapshot too, so the
                // dashboard reflects them before the next stats refresh.
                // Selection never reads the snapshot; the next refresh
                // replaces it wholesale.
                self.snapshot.send_modify(|s| bump(&mut s.agents, &agent.id));

                let result = AssignmentResult::new(record, &agent, Outcome::Assigned);
                if let Err(e) = self.ledger.append(&result).await {
                    tracing::error!(record_id = %record.id, ?e, "ledger append failed");
                }
                let _ = self.events.send(result.clone());
                Ok(result)
            }
            Err(e) => {
                if let AssignError::RemoteFailure { reason, .. } = &e {
                    let failed = AssignmentResult::new(
                        record,
                        &agent,
                        Outcome::Failed {
                            reason: reason.clone(),
                        },
                    );
                    let _ = self.events.send(failed);
                }
                Err(e)
            }
        }
    }
}

/// Start the service: called by `leadroute serve`.
pub async fn serve() -> anyhow::Result<()> {
    tracing::info!("leadroute engine starting");

    let engine = Arc::new(Engine::from_config().await?);
    let config = engine.config().clone();
    tracing::info!(
        backend = engine.backend.name(),
        stats = ?config.stats_interval,
        assignment = ?config.assignment_interval,
        window = ?config.window,
        "engine ready"
    );

    let stats = tokio::spawn(stats_loop(engine.clone()));
    let assignment = tokio::spawn(assignment_loop(engine.clone()));

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(bind = %config.bind, "webhook server listening");

    axum::serve(listener, crate::server::router(engine.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("webhook server failed")?;

    stats.abort();
    assignment.abort();
    tracing::info!(
        assigned = engine.executor().assigned_count(),
        "leadroute engine stopped"
    );
    Ok(())
}

async fn stats_loop(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(engine.config().stats_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        if let Err(e) = engine.refresh_agents().await {
            tracing::error!(err = %e, "agent stats cycle failed");
        }
    }
}

async fn assignment_loop(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(engine.config().assignment_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        match engine.run_assignment_cycle().await {
            Ok(_) => {}
            Err(e) if e.is_rate_limited() => {
                tracing::warn!(err = %e, "assignment cycle rate limited, retrying next tick");
            }
            Err(e) => tracing::error!(err = %e, "assignment cycle failed"),
        }
    }
}

/// Resolves on SIGINT or SIGTERM (launchd/systemd stop services with SIGTERM).
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(?e, "cannot install SIGTERM handler, SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
    }
}
