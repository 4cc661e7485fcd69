//! Guard Resolver
//!
//! Decides which successor steps fire when an engine action completes, and
//! creates their engine actions.

use crate::error::AppError;
use crate::governance::factory::EngineActionFactory;
use crate::governance::graph::ProcessGraph;
use crate::governance::types::*;
use crate::store::{MetadataStore, Pagination, SearchCriteria};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Links that fire for a set of output guards.
///
/// Returns nothing when any mandatory link's guard was not produced. Otherwise
/// every wildcard link plus every link whose guard was produced fires, in link
/// order.
pub fn select_firing_links<'a>(links: &'a [NextStepLink], output_guards: &BTreeSet<String>) -> Vec<&'a NextStepLink> {
    if let Some(blocking) = links
        .iter()
        .find(|l| l.mandatory_guard && !l.is_satisfied_by(output_guards))
    {
        info!(
            "Mandatory guard {:?} on link {} was not produced; no successors fire",
            blocking.guard, blocking.guid
        );
        return Vec::new();
    }

    links
        .iter()
        .filter(|l| l.is_satisfied_by(output_guards))
        .collect()
}

#[derive(Clone)]
pub struct GuardResolver {
    store: Arc<dyn MetadataStore>,
    graph: ProcessGraph,
    factory: EngineActionFactory,
}

impl GuardResolver {
    pub fn new(store: Arc<dyn MetadataStore>, graph: ProcessGraph, factory: EngineActionFactory) -> Self {
        Self { store, graph, factory }
    }

    /// Create the successor actions of a completed action. Returns their GUIDs.
    pub async fn resolve(&self, user_id: &str, completed: &EngineAction) -> Result<Vec<String>, AppError> {
        self.fire(user_id, completed, HashMap::new()).await
    }

    /// Finish a resolution that was interrupted part way. Successors created by
    /// the earlier attempt count against their firing links and are returned
    /// alongside any created now.
    pub async fn resume(&self, user_id: &str, completed: &EngineAction) -> Result<Vec<String>, AppError> {
        let existing = self.existing_successors(user_id, &completed.guid).await?;
        self.fire(user_id, completed, existing).await
    }

    async fn fire(
        &self,
        user_id: &str,
        completed: &EngineAction,
        mut existing: HashMap<String, Vec<String>>,
    ) -> Result<Vec<String>, AppError> {
        let step_guid = match &completed.step_guid {
            Some(guid) => guid,
            None => return Ok(Vec::new()),
        };

        let links = self.graph.outgoing_links(user_id, step_guid).await?;
        if links.is_empty() {
            debug!("Step {} has no successors; branch ends", step_guid);
            return Ok(Vec::new());
        }

        let guards = &completed.completion_guards;
        for guard in guards {
            if !links.iter().any(|l| l.guard.as_deref() == Some(guard.as_str())) {
                debug!("Guard '{}' from {} matches no link", guard, completed.guid);
            }
        }

        let mut created = Vec::new();
        for link in select_firing_links(&links, guards) {
            if let Some(guid) = existing.get_mut(&link.next_step_guid).and_then(Vec::pop) {
                debug!("Link {} already fired engine action {}", link.guid, guid);
                created.push(guid);
                continue;
            }

            let step = match self.graph.get_step(user_id, &link.next_step_guid).await {
                Ok(step) => step,
                Err(AppError::NotFound(_)) | Err(AppError::InvalidParameter(_)) => {
                    warn!(
                        "Skipping link {}: next step {} no longer exists",
                        link.guid, link.next_step_guid
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            if (link.ignore_multiple_triggers || step.ignore_multiple_triggers)
                && self.already_triggered(user_id, &completed.guid, &step.guid).await?
            {
                debug!(
                    "Step '{}' already triggered by {}; ignoring repeat",
                    step.qualified_name, completed.guid
                );
                continue;
            }

            created.push(self.factory.create_for_step(user_id, &step, completed).await?);
        }

        if !created.is_empty() {
            info!(
                "Engine action {} triggered {} successor(s)",
                completed.guid,
                created.len()
            );
        }
        Ok(created)
    }

    /// Engine actions already created from a predecessor, grouped by step
    async fn existing_successors(
        &self,
        user_id: &str,
        previous_guid: &str,
    ) -> Result<HashMap<String, Vec<String>>, AppError> {
        let elements = self
            .store
            .find_elements(
                user_id,
                ENGINE_ACTION_TYPE,
                &SearchCriteria::new().eq(props::PREVIOUS_ENGINE_ACTION_GUID, previous_guid),
                Pagination::all(),
            )
            .await?;

        let mut by_step: HashMap<String, Vec<String>> = HashMap::new();
        for element in elements {
            if let Some(step_guid) = element.properties.get(props::STEP_GUID).and_then(|v| v.as_str()) {
                by_step
                    .entry(step_guid.to_string())
                    .or_default()
                    .push(element.guid);
            }
        }
        Ok(by_step)
    }

    async fn already_triggered(&self, user_id: &str, previous_guid: &str, step_guid: &str) -> Result<bool, AppError> {
        let existing = self
            .store
            .find_elements(
                user_id,
                ENGINE_ACTION_TYPE,
                &SearchCriteria::new()
                    .eq(props::PREVIOUS_ENGINE_ACTION_GUID, previous_guid)
                    .eq(props::STEP_GUID, step_guid),
                Pagination::page(0, 1),
            )
            .await?;
        Ok(!existing.is_empty())
    }
}
