//! Governance Action Process Engine
//!
//! Processes are graphs of steps joined by guarded links. Initiating a process
//! creates an engine action for its first step; engine hosts claim and run
//! actions through registered governance services; each completion's output
//! guards decide which successor steps get their own engine actions.
//!
//! ```text
//! initiate ──► EngineAction(REQUESTED) ──► host claims ──► service runs
//!                                                              │
//!          successors ◄── guard resolver ◄── completion + guards
//! ```

pub mod engine_action;
pub mod factory;
pub mod graph;
pub mod guards;
pub mod host;
pub mod listener;
pub mod registry;
pub mod types;

pub use engine_action::{CompletionResult, EngineActionFilter, EngineActionService};
pub use factory::{EngineActionFactory, EngineActionRequest, ProcessInitiation};
pub use graph::{GraphReport, GraphWarning, ProcessGraph, ProcessUpdate, StepUpdate};
pub use guards::GuardResolver;
pub use host::{ApprovalGate, AutoApprove, EngineHost, PollSummary};
pub use listener::{EngineActionEvent, EngineActionEventKind, ListenerRegistry};
pub use registry::{
    ExecutionContext, GovernanceService, GuardEchoService, NoOpService, ServiceOutcome,
    ServiceRegistry,
};
pub use types::*;

use crate::config::StatusEncoding;
use crate::store::MetadataStore;
use std::sync::Arc;

/// The wired-together engine components sharing one store and listener registry
#[derive(Clone)]
pub struct GovernanceEngine {
    pub graph: ProcessGraph,
    pub factory: EngineActionFactory,
    pub actions: EngineActionService,
    pub listeners: Arc<ListenerRegistry>,
}

impl GovernanceEngine {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        listeners: Arc<ListenerRegistry>,
        status_encoding: StatusEncoding,
    ) -> Self {
        let graph = ProcessGraph::new(store.clone());
        let factory = EngineActionFactory::new(
            store.clone(),
            graph.clone(),
            listeners.clone(),
            status_encoding,
        );
        let resolver = GuardResolver::new(store.clone(), graph.clone(), factory.clone());
        let actions = EngineActionService::new(store, listeners.clone(), resolver, status_encoding);

        Self {
            graph,
            factory,
            actions,
            listeners,
        }
    }
}
