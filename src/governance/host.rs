//! Engine Host
//!
//! A worker that drains the shared engine action backlog. Hosts coordinate only
//! through the claim compare-and-set; inside one host, execution is bounded by a
//! semaphore of task slots.

use crate::config::EngineConfig;
use crate::error::AppError;
use crate::governance::engine_action::EngineActionService;
use crate::governance::registry::{ExecutionContext, ServiceOutcome, ServiceRegistry};
use crate::governance::types::{CompletionStatus, EngineAction, EngineActionStatus};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Decides whether a REQUESTED action may proceed
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn approve(&self, action: &EngineAction) -> Result<bool, AppError>;
}

/// Approves everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn approve(&self, _action: &EngineAction) -> Result<bool, AppError> {
        Ok(true)
    }
}

/// What one poll did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSummary {
    pub inspected: usize,
    pub approved: usize,
    pub rejected: usize,
    pub waiting: usize,
    pub claimed: usize,
    pub lost_claims: usize,
    /// Completions whose missing successors were created
    pub resolved: usize,
}

pub struct EngineHost {
    engine_guid: String,
    engine_name: String,
    actions: EngineActionService,
    services: Arc<ServiceRegistry>,
    approval: Arc<dyn ApprovalGate>,
    slots: Arc<Semaphore>,
    poll_interval: Duration,
    batch_size: usize,
    tasks: Mutex<JoinSet<()>>,
    running: Arc<Mutex<HashSet<String>>>,
}

impl EngineHost {
    pub fn new(config: &EngineConfig, actions: EngineActionService, services: Arc<ServiceRegistry>) -> Self {
        Self {
            engine_guid: config.engine_guid.clone(),
            engine_name: config.engine_name.clone(),
            actions,
            services,
            approval: Arc::new(AutoApprove),
            slots: Arc::new(Semaphore::new(config.task_slots.max(1))),
            poll_interval: config.poll_interval(),
            batch_size: config.poll_batch_size.max(1),
            tasks: Mutex::new(JoinSet::new()),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_approval_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval = gate;
        self
    }

    pub fn engine_guid(&self) -> &str {
        &self.engine_guid
    }

    /// Poll until shutdown, then wait for running actions to finish
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "⚙️  Engine host '{}' ({}) started with {} task slot(s)",
            self.engine_name,
            self.engine_guid,
            self.slots.available_permits()
        );

        match self.resume_claimed().await {
            Ok(0) => {}
            Ok(n) => info!("Resumed {} engine action(s) claimed before restart", n),
            Err(e) => error!("Failed to rediscover claimed engine actions: {}", e),
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.poll_once().await {
                Ok(summary) if summary.inspected > 0 => debug!("Poll: {:?}", summary),
                Ok(_) => {}
                Err(e) => warn!("Engine host poll failed: {}", e),
            }
            self.reap_finished().await;

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Engine host '{}' shutting down; waiting for running actions", self.engine_name);
        self.wait_for_tasks().await;
        info!("Engine host '{}' stopped", self.engine_name);
    }

    /// Re-queue non-terminal actions this engine already holds
    pub async fn resume_claimed(&self) -> Result<usize, AppError> {
        let claimed = self
            .actions
            .list_claimed_by(&self.engine_name, &self.engine_guid)
            .await?;

        let mut resumed = 0;
        for action in claimed {
            match action.status {
                EngineActionStatus::Activating | EngineActionStatus::InProgress => {
                    let permit = match self.slots.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    self.spawn_execution(action, permit).await;
                    resumed += 1;
                }
                status => debug!(
                    "Claimed engine action {} is {}; the poll loop advances it",
                    action.guid, status
                ),
            }
        }
        Ok(resumed)
    }

    /// Inspect one batch of work: completions of this engine still missing
    /// successors, actions this engine holds that have not started, then the
    /// unclaimed backlog.
    pub async fn poll_once(&self) -> Result<PollSummary, AppError> {
        let mut summary = PollSummary::default();
        let running = self.running.lock().await.clone();

        let unresolved = self
            .actions
            .list_unresolved_by(&self.engine_name, &self.engine_guid)
            .await?;
        for action in unresolved.into_iter().filter(|a| !running.contains(&a.guid)) {
            summary.inspected += 1;
            match self
                .actions
                .resume_resolution(&self.engine_name, &action.guid, &self.engine_guid)
                .await
            {
                Ok(result) => {
                    summary.resolved += 1;
                    info!(
                        "Finished resolution of engine action {} ({} successor(s))",
                        action.guid,
                        result.triggered_engine_action_guids.len()
                    );
                }
                Err(e) => debug!("Could not resolve successors of {}: {}", action.guid, e),
            }
        }

        let mut candidates: Vec<EngineAction> = self
            .actions
            .list_claimed_by(&self.engine_name, &self.engine_guid)
            .await?
            .into_iter()
            .filter(|a| a.status != EngineActionStatus::InProgress && !running.contains(&a.guid))
            .collect();
        candidates.extend(
            self.actions
                .list_claimable(&self.engine_name, self.batch_size)
                .await?,
        );

        for candidate in candidates {
            summary.inspected += 1;
            let guid = candidate.guid.clone();
            if let Err(e) = self.advance(candidate, &mut summary).await {
                // Another host moved it first, or the store hiccuped; retry next poll.
                debug!("Could not advance engine action {}: {}", guid, e);
            }
        }
        Ok(summary)
    }

    /// Move an unstarted action as far as it can go in this poll
    async fn advance(&self, mut action: EngineAction, summary: &mut PollSummary) -> Result<(), AppError> {
        loop {
            match action.status {
                EngineActionStatus::Requested => {
                    if self.approval.approve(&action).await? {
                        action = self.set_status(&action, EngineActionStatus::Approved).await?;
                        summary.approved += 1;
                    } else {
                        self.actions
                            .reject_engine_action(
                                &self.engine_name,
                                &action.guid,
                                &self.engine_guid,
                                Some("Not approved for execution".to_string()),
                            )
                            .await?;
                        summary.rejected += 1;
                        return Ok(());
                    }
                }
                EngineActionStatus::Approved => {
                    let next = if action.is_due(Utc::now()) {
                        EngineActionStatus::Activating
                    } else {
                        summary.waiting += 1;
                        EngineActionStatus::Waiting
                    };
                    action = self.set_status(&action, next).await?;
                }
                EngineActionStatus::Waiting => {
                    if !action.is_due(Utc::now()) {
                        return Ok(());
                    }
                    action = self.set_status(&action, EngineActionStatus::Activating).await?;
                }
                EngineActionStatus::Activating => {
                    let permit = match self.slots.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            debug!("No free task slot for engine action {}", action.guid);
                            return Ok(());
                        }
                    };
                    if self
                        .actions
                        .claim_engine_action(&self.engine_name, &action.guid, &self.engine_guid)
                        .await?
                    {
                        summary.claimed += 1;
                        action.processing_engine_guid = Some(self.engine_guid.clone());
                        self.spawn_execution(action, permit).await;
                    } else {
                        summary.lost_claims += 1;
                    }
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
    }

    async fn set_status(&self, action: &EngineAction, status: EngineActionStatus) -> Result<EngineAction, AppError> {
        self.actions
            .update_engine_action_status(&self.engine_name, &action.guid, &self.engine_guid, status)
            .await
    }

    async fn spawn_execution(&self, action: EngineAction, permit: tokio::sync::OwnedSemaphorePermit) {
        let actions = self.actions.clone();
        let services = self.services.clone();
        let engine_guid = self.engine_guid.clone();
        let user_id = self.engine_name.clone();
        let running = self.running.clone();
        running.lock().await.insert(action.guid.clone());

        self.tasks.lock().await.spawn(async move {
            let guid = action.guid.clone();
            if let Err(e) = execute(actions, services, engine_guid, user_id, action).await {
                error!("Engine action {} could not be completed: {}", guid, e);
            }
            running.lock().await.remove(&guid);
            drop(permit);
        });
    }

    async fn reap_finished(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                error!("Engine action task panicked: {}", e);
            }
        }
    }

    /// Wait until every spawned execution has finished
    pub async fn wait_for_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Engine action task panicked: {}", e);
            }
        }
    }
}

/// Run one claimed action through its governance service and record the result
async fn execute(
    actions: EngineActionService,
    services: Arc<ServiceRegistry>,
    engine_guid: String,
    user_id: String,
    action: EngineAction,
) -> Result<(), AppError> {
    let action = if action.status == EngineActionStatus::Activating {
        actions
            .update_engine_action_status(&user_id, &action.guid, &engine_guid, EngineActionStatus::InProgress)
            .await?
    } else {
        action
    };

    let outcome = match services.get(&action.request_type) {
        None => {
            warn!(
                "No governance service registered for request type '{}'",
                action.request_type
            );
            ServiceOutcome::invalid(format!(
                "No governance service is registered for request type '{}'",
                action.request_type
            ))
        }
        Some(service) => {
            let ctx = ExecutionContext {
                engine_guid: engine_guid.clone(),
                user_id: user_id.clone(),
                engine_action: action.clone(),
            };
            debug!("Running '{}' for engine action {}", action.request_type, action.guid);
            match service.execute(&ctx).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Governance service failed on engine action {}: {}", action.guid, e);
                    ServiceOutcome {
                        status: CompletionStatus::Failed,
                        guards: Default::default(),
                        message: Some(e.to_string()),
                    }
                }
            }
        }
    };

    actions
        .record_completion(
            &user_id,
            &action.guid,
            &engine_guid,
            outcome.status,
            outcome.guards,
            outcome.message,
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatusEncoding;
    use crate::governance::engine_action::EngineActionFilter;
    use crate::governance::factory::{EngineActionFactory, EngineActionRequest, ProcessInitiation};
    use crate::governance::graph::ProcessGraph;
    use crate::governance::guards::GuardResolver;
    use crate::governance::listener::ListenerRegistry;
    use crate::governance::registry::{GovernanceService, NoOpService};
    use crate::governance::types::{
        GovernanceActionProcess, GovernanceActionStep, LinkProperties, ProcessStatus, ENGINE_ACTION_TYPE,
    };
    use crate::store::{InMemoryMetadataStore, MetadataStore, Pagination};
    use pretty_assertions::assert_eq;

    const USER: &str = "steward";

    struct Broken;

    #[async_trait]
    impl GovernanceService for Broken {
        async fn execute(&self, _ctx: &ExecutionContext) -> Result<ServiceOutcome, AppError> {
            Err(AppError::Internal("scanner offline".to_string()))
        }
    }

    struct RejectAll;

    #[async_trait]
    impl ApprovalGate for RejectAll {
        async fn approve(&self, _action: &EngineAction) -> Result<bool, AppError> {
            Ok(false)
        }
    }

    struct Fixture {
        store: Arc<InMemoryMetadataStore>,
        graph: ProcessGraph,
        factory: EngineActionFactory,
        actions: EngineActionService,
        services: Arc<ServiceRegistry>,
    }

    fn fixture() -> Fixture {
        let memory = Arc::new(InMemoryMetadataStore::new());
        let store: Arc<dyn MetadataStore> = memory.clone();
        let listeners = Arc::new(ListenerRegistry::default());
        let graph = ProcessGraph::new(store.clone());
        let factory = EngineActionFactory::new(store.clone(), graph.clone(), listeners.clone(), StatusEncoding::Property);
        let resolver = GuardResolver::new(store.clone(), graph.clone(), factory.clone());
        let actions = EngineActionService::new(store, listeners, resolver, StatusEncoding::Property);
        let services = Arc::new(
            ServiceRegistry::with_builtins()
                .with("scan", Arc::new(NoOpService::new(["scanned"])))
                .with("broken", Arc::new(Broken)),
        );
        Fixture {
            store: memory,
            graph,
            factory,
            actions,
            services,
        }
    }

    fn host(f: &Fixture, engine_guid: &str) -> EngineHost {
        let config = EngineConfig {
            engine_guid: engine_guid.to_string(),
            engine_name: "test-engine".to_string(),
            task_slots: 2,
            ..Default::default()
        };
        EngineHost::new(&config, f.actions.clone(), f.services.clone())
    }

    async fn request(f: &Fixture, request: EngineActionRequest) -> String {
        f.factory.initiate_engine_action(USER, request).await.unwrap()
    }

    /// Two "scan" steps joined by an unconditional link; returns the first action
    async fn two_step_process(f: &Fixture) -> String {
        let step = |name: &str| GovernanceActionStep {
            guid: String::new(),
            qualified_name: name.to_string(),
            display_name: None,
            description: None,
            request_type: "scan".to_string(),
            request_parameters: Default::default(),
            ignore_multiple_triggers: false,
            process_guid: None,
        };
        let process = f
            .graph
            .create_process(
                USER,
                GovernanceActionProcess {
                    guid: String::new(),
                    qualified_name: "nightly-scan".to_string(),
                    display_name: None,
                    description: None,
                    status: ProcessStatus::Draft,
                },
            )
            .await
            .unwrap();
        let first = f.graph.create_step(USER, step("scan-tables")).await.unwrap();
        let second = f.graph.create_step(USER, step("scan-views")).await.unwrap();
        f.graph.set_first_step(USER, &process, &first, None, false).await.unwrap();
        f.graph
            .add_next_step_link(USER, &first, &second, LinkProperties::default())
            .await
            .unwrap();

        f.factory
            .initiate_process(
                USER,
                ProcessInitiation {
                    process_qualified_name: "nightly-scan".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_poll_runs_action_to_completion() {
        let f = fixture();
        let guid = request(&f, EngineActionRequest::new("scan")).await;
        let host = host(&f, "engine-1");

        let summary = host.poll_once().await.unwrap();
        assert_eq!(summary.claimed, 1);
        host.wait_for_tasks().await;

        let action = f.actions.get_engine_action(USER, &guid).await.unwrap();
        assert_eq!(action.status, EngineActionStatus::Actioned);
        assert_eq!(action.processing_engine_guid.as_deref(), Some("engine-1"));
        assert!(action.completion_guards.contains("scanned"));
        assert!(action.activation_time.is_some());
    }

    #[tokio::test]
    async fn test_unknown_request_type_completes_invalid() {
        let f = fixture();
        let guid = request(&f, EngineActionRequest::new("nobody-handles-this")).await;
        let host = host(&f, "engine-1");
        host.poll_once().await.unwrap();
        host.wait_for_tasks().await;

        let action = f.actions.get_engine_action(USER, &guid).await.unwrap();
        assert_eq!(action.status, EngineActionStatus::Invalid);
        assert!(action.completion_message.unwrap().contains("nobody-handles-this"));
    }

    #[tokio::test]
    async fn test_service_error_completes_failed() {
        let f = fixture();
        let guid = request(&f, EngineActionRequest::new("broken")).await;
        let host = host(&f, "engine-1");
        host.poll_once().await.unwrap();
        host.wait_for_tasks().await;

        let action = f.actions.get_engine_action(USER, &guid).await.unwrap();
        assert_eq!(action.status, EngineActionStatus::Failed);
        assert!(action.completion_message.unwrap().contains("scanner offline"));
    }

    #[tokio::test]
    async fn test_future_start_waits_unclaimed() {
        let f = fixture();
        let guid = request(
            &f,
            EngineActionRequest {
                start_time: Some(Utc::now() + chrono::Duration::hours(1)),
                ..EngineActionRequest::new("scan")
            },
        )
        .await;
        let host = host(&f, "engine-1");

        let summary = host.poll_once().await.unwrap();
        assert_eq!(summary.waiting, 1);
        assert_eq!(summary.claimed, 0);

        let action = f.actions.get_engine_action(USER, &guid).await.unwrap();
        assert_eq!(action.status, EngineActionStatus::Waiting);
        assert!(!action.is_claimed());

        // Still not due on the next poll.
        host.poll_once().await.unwrap();
        let action = f.actions.get_engine_action(USER, &guid).await.unwrap();
        assert_eq!(action.status, EngineActionStatus::Waiting);
    }

    #[tokio::test]
    async fn test_rejecting_gate_ignores_action() {
        let f = fixture();
        let guid = request(&f, EngineActionRequest::new("scan")).await;
        let host = host(&f, "engine-1").with_approval_gate(Arc::new(RejectAll));
        let summary = host.poll_once().await.unwrap();
        assert_eq!(summary.rejected, 1);

        let action = f.actions.get_engine_action(USER, &guid).await.unwrap();
        assert_eq!(action.status, EngineActionStatus::Ignored);
    }

    #[tokio::test]
    async fn test_restart_resumes_own_claims_only() {
        let f = fixture();
        let mine = request(&f, EngineActionRequest::new("scan")).await;
        let theirs = request(&f, EngineActionRequest::new("scan")).await;

        // Simulate a crash after claiming: both actions are left ACTIVATING.
        for (guid, engine) in [(&mine, "engine-1"), (&theirs, "engine-2")] {
            for status in [EngineActionStatus::Approved, EngineActionStatus::Activating] {
                f.actions
                    .update_engine_action_status(USER, guid, engine, status)
                    .await
                    .unwrap();
            }
            assert!(f.actions.claim_engine_action(USER, guid, engine).await.unwrap());
        }

        let restarted = host(&f, "engine-1");
        assert_eq!(restarted.resume_claimed().await.unwrap(), 1);
        restarted.wait_for_tasks().await;

        let mine = f.actions.get_engine_action(USER, &mine).await.unwrap();
        assert_eq!(mine.status, EngineActionStatus::Actioned);
        let theirs = f.actions.get_engine_action(USER, &theirs).await.unwrap();
        assert_eq!(theirs.status, EngineActionStatus::Activating);

        // The other engine's claim is not stolen by polling either.
        assert_eq!(restarted.poll_once().await.unwrap().inspected, 0);
    }

    #[tokio::test]
    async fn test_poll_advances_action_claimed_before_approval() {
        let f = fixture();
        let guid = request(&f, EngineActionRequest::new("scan")).await;
        assert!(f.actions.claim_engine_action(USER, &guid, "engine-1").await.unwrap());

        let host = host(&f, "engine-1");
        assert_eq!(host.resume_claimed().await.unwrap(), 0);

        let summary = host.poll_once().await.unwrap();
        assert_eq!(summary.inspected, 1);
        assert_eq!(summary.approved, 1);
        host.wait_for_tasks().await;

        let action = f.actions.get_engine_action(USER, &guid).await.unwrap();
        assert_eq!(action.status, EngineActionStatus::Actioned);
        assert_eq!(action.processing_engine_guid.as_deref(), Some("engine-1"));

        // Another engine never advances it.
        let other = request(&f, EngineActionRequest::new("scan")).await;
        assert!(f.actions.claim_engine_action(USER, &other, "engine-2").await.unwrap());
        host.poll_once().await.unwrap();
        let other = f.actions.get_engine_action(USER, &other).await.unwrap();
        assert_eq!(other.status, EngineActionStatus::Requested);
    }

    #[tokio::test]
    async fn test_poll_finishes_interrupted_resolution() {
        let f = fixture();
        let first = two_step_process(&f).await;
        let host = host(&f, "engine-1");

        f.store.set_accepting_elements(false);
        host.poll_once().await.unwrap();
        host.wait_for_tasks().await;

        let action = f.actions.get_engine_action(USER, &first).await.unwrap();
        assert_eq!(action.status, EngineActionStatus::Actioned);
        assert!(!action.successors_resolved);
        assert_eq!(f.store.count(ENGINE_ACTION_TYPE).await, 1);

        // Still refusing: the completion stays queued for the next poll.
        assert_eq!(host.poll_once().await.unwrap().resolved, 0);

        f.store.set_accepting_elements(true);
        let summary = host.poll_once().await.unwrap();
        assert_eq!(summary.resolved, 1);
        host.wait_for_tasks().await;
        assert_eq!(f.store.count(ENGINE_ACTION_TYPE).await, 2);

        let action = f.actions.get_engine_action(USER, &first).await.unwrap();
        assert!(action.successors_resolved);

        // The successor was picked up by the same poll; nothing resolves twice.
        assert_eq!(host.poll_once().await.unwrap().resolved, 0);
        host.wait_for_tasks().await;
        let filter = EngineActionFilter {
            statuses: vec![EngineActionStatus::Actioned],
            ..Default::default()
        };
        let done = f
            .actions
            .list_engine_actions(USER, &filter, Pagination::all())
            .await
            .unwrap();
        assert_eq!(done.len(), 2);
        assert!(done.iter().all(|a| a.successors_resolved));
        assert_eq!(f.store.count(ENGINE_ACTION_TYPE).await, 2);
    }

    #[tokio::test]
    async fn test_two_hosts_share_backlog_without_double_execution() {
        let f = fixture();
        let mut guids = Vec::new();
        for _ in 0..6 {
            guids.push(request(&f, EngineActionRequest::new("scan")).await);
        }

        let a = Arc::new(host(&f, "engine-a"));
        let b = Arc::new(host(&f, "engine-b"));
        for _ in 0..5 {
            let (ra, rb) = tokio::join!(a.poll_once(), b.poll_once());
            ra.unwrap();
            rb.unwrap();
            a.wait_for_tasks().await;
            b.wait_for_tasks().await;
        }

        for guid in guids {
            let action = f.actions.get_engine_action(USER, &guid).await.unwrap();
            assert_eq!(action.status, EngineActionStatus::Actioned);
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture();
        let guid = request(&f, EngineActionRequest::new("scan")).await;
        let config = EngineConfig {
            engine_guid: "engine-1".to_string(),
            poll_interval_ms: 10,
            ..Default::default()
        };
        let host = Arc::new(EngineHost::new(&config, f.actions.clone(), f.services.clone()));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(host.clone().run(rx));

        let mut done = false;
        for _ in 0..200 {
            let action = f.actions.get_engine_action(USER, &guid).await.unwrap();
            if action.status == EngineActionStatus::Actioned {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(done);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
