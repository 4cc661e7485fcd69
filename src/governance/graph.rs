//! Process Graph Model
//!
//! A process is a graph of steps held in the metadata store: steps are elements,
//! next-step links and the process's first-step reference are relationships.
//! Traversal always goes through GUID lookups, so cycles and shared successors
//! need no special representation. Cycles are allowed; `validate_process`
//! reports the ones that could re-trigger without any guard.

use crate::error::{invalid_parameter, require_non_empty, AppError};
use crate::governance::types::*;
use crate::store::{
    Element, MetadataStore, Pagination, Properties, Relationship, RelationshipDirection,
    SearchCriteria, UpdateMode,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Problems found in a process graph. These are reported, never enforced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphWarning {
    #[serde(rename_all = "camelCase")]
    DanglingLink {
        link_guid: String,
        current_step_guid: String,
        next_step_guid: String,
        missing_step_guid: String,
    },
    #[serde(rename_all = "camelCase")]
    DanglingFirstStep {
        process_guid: String,
        link_guid: String,
        missing_step_guid: String,
    },
    #[serde(rename_all = "camelCase")]
    MissingFirstStep { process_guid: String },
    /// Steps that can re-trigger each other through unguarded links only
    #[serde(rename_all = "camelCase")]
    GuardlessCycle { step_guids: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GraphReport {
    pub process_guid: String,
    pub reachable_step_guids: Vec<String>,
    pub warnings: Vec<GraphWarning>,
}

/// Partial update of a process definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessUpdate {
    pub qualified_name: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
}

/// Partial update of a step definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepUpdate {
    pub qualified_name: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub request_type: Option<String>,
    pub request_parameters: Option<BTreeMap<String, String>>,
    pub ignore_multiple_triggers: Option<bool>,
}

#[derive(Clone)]
pub struct ProcessGraph {
    store: Arc<dyn MetadataStore>,
}

impl ProcessGraph {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    // =========================================================================
    // PROCESSES
    // =========================================================================

    pub async fn create_process(
        &self,
        user_id: &str,
        process: GovernanceActionProcess,
    ) -> Result<String, AppError> {
        require_non_empty(&process.qualified_name, "qualifiedName")?;
        self.ensure_unique_name(user_id, PROCESS_TYPE, &process.qualified_name)
            .await?;

        let guid = self
            .store
            .create_element(user_id, PROCESS_TYPE, encode_properties(&process)?)
            .await?;

        info!("Created governance action process '{}' ({})", process.qualified_name, guid);
        Ok(guid)
    }

    pub async fn get_process(
        &self,
        user_id: &str,
        guid: &str,
    ) -> Result<GovernanceActionProcess, AppError> {
        let element = self.typed_element(user_id, guid, PROCESS_TYPE).await?;
        decode_element(&element)
    }

    pub async fn get_process_by_name(
        &self,
        user_id: &str,
        qualified_name: &str,
    ) -> Result<GovernanceActionProcess, AppError> {
        require_non_empty(qualified_name, "processQualifiedName")?;
        let found = self
            .store
            .find_elements(
                user_id,
                PROCESS_TYPE,
                &SearchCriteria::new().eq(props::QUALIFIED_NAME, qualified_name),
                Pagination::page(0, 1),
            )
            .await?;

        match found.first() {
            Some(element) => decode_element(element),
            None => Err(AppError::NotFound(format!(
                "Governance action process '{}' not found",
                qualified_name
            ))),
        }
    }

    pub async fn list_processes(
        &self,
        user_id: &str,
        status: Option<ProcessStatus>,
        pagination: Pagination,
    ) -> Result<Vec<GovernanceActionProcess>, AppError> {
        let mut criteria = SearchCriteria::new();
        if let Some(status) = status {
            criteria = criteria.eq(props::STATUS, serde_json::to_value(status).unwrap_or(Value::Null));
        }

        self.store
            .find_elements(user_id, PROCESS_TYPE, &criteria, pagination)
            .await?
            .iter()
            .map(decode_element)
            .collect()
    }

    pub async fn update_process(
        &self,
        user_id: &str,
        guid: &str,
        update: ProcessUpdate,
        mode: UpdateMode,
    ) -> Result<GovernanceActionProcess, AppError> {
        let mut process = self.get_process(user_id, guid).await?;

        if let Some(name) = update.qualified_name {
            require_non_empty(&name, "qualifiedName")?;
            if name != process.qualified_name {
                self.ensure_unique_name(user_id, PROCESS_TYPE, &name).await?;
            }
            process.qualified_name = name;
        }
        // Replace clears optional fields the caller left out.
        if update.display_name.is_some() || mode == UpdateMode::Replace {
            process.display_name = update.display_name;
        }
        if update.description.is_some() || mode == UpdateMode::Replace {
            process.description = update.description;
        }

        let element = self
            .store
            .update_element_properties(user_id, guid, UpdateMode::Replace, encode_properties(&process)?)
            .await?;
        decode_element(&element)
    }

    /// Make the process available for initiation
    pub async fn publish_process(
        &self,
        user_id: &str,
        guid: &str,
    ) -> Result<GovernanceActionProcess, AppError> {
        let process = self.get_process(user_id, guid).await?;
        if self.first_step_link(user_id, guid).await?.is_none() {
            return Err(invalid_parameter(format!(
                "Process '{}' cannot be published without a first step",
                process.qualified_name
            )));
        }
        self.set_process_status(user_id, guid, ProcessStatus::Active).await
    }

    pub async fn withdraw_process(
        &self,
        user_id: &str,
        guid: &str,
    ) -> Result<GovernanceActionProcess, AppError> {
        self.get_process(user_id, guid).await?;
        self.set_process_status(user_id, guid, ProcessStatus::Deprecated)
            .await
    }

    /// Delete a process that no longer references any step
    pub async fn delete_process(&self, user_id: &str, guid: &str) -> Result<(), AppError> {
        let process = self.get_process(user_id, guid).await?;

        if self.first_step_link(user_id, guid).await?.is_some() {
            return Err(invalid_parameter(format!(
                "Process '{}' still has a first step; remove it before deleting the process",
                process.qualified_name
            )));
        }

        let owned_steps = self
            .store
            .find_elements(
                user_id,
                STEP_TYPE,
                &SearchCriteria::new().eq(props::PROCESS_GUID, guid),
                Pagination::page(0, 1),
            )
            .await?;
        if !owned_steps.is_empty() {
            return Err(invalid_parameter(format!(
                "Process '{}' still owns steps",
                process.qualified_name
            )));
        }

        self.store.delete_element(user_id, guid).await?;
        info!("Deleted governance action process '{}' ({})", process.qualified_name, guid);
        Ok(())
    }

    async fn set_process_status(
        &self,
        user_id: &str,
        guid: &str,
        status: ProcessStatus,
    ) -> Result<GovernanceActionProcess, AppError> {
        let mut update = Properties::new();
        update.insert(
            props::STATUS.to_string(),
            serde_json::to_value(status).unwrap_or(Value::Null),
        );
        let element = self
            .store
            .update_element_properties(user_id, guid, UpdateMode::Merge, update)
            .await?;
        debug!("Process {} is now {:?}", guid, status);
        decode_element(&element)
    }

    // =========================================================================
    // STEPS
    // =========================================================================

    pub async fn create_step(
        &self,
        user_id: &str,
        step: GovernanceActionStep,
    ) -> Result<String, AppError> {
        require_non_empty(&step.qualified_name, "qualifiedName")?;
        require_non_empty(&step.request_type, "requestType")?;
        if let Some(process_guid) = &step.process_guid {
            self.typed_element(user_id, process_guid, PROCESS_TYPE)
                .await
                .map_err(not_found_as_invalid)?;
        }
        self.ensure_unique_name(user_id, STEP_TYPE, &step.qualified_name)
            .await?;

        let guid = self
            .store
            .create_element(user_id, STEP_TYPE, encode_properties(&step)?)
            .await?;

        info!("Created governance action step '{}' ({})", step.qualified_name, guid);
        Ok(guid)
    }

    pub async fn get_step(&self, user_id: &str, guid: &str) -> Result<GovernanceActionStep, AppError> {
        let element = self.step_element(user_id, guid).await?;
        decode_element(&element)
    }

    pub async fn get_step_by_name(
        &self,
        user_id: &str,
        qualified_name: &str,
    ) -> Result<GovernanceActionStep, AppError> {
        require_non_empty(qualified_name, "stepQualifiedName")?;
        let found = self
            .store
            .find_elements(
                user_id,
                STEP_TYPE,
                &SearchCriteria::new().eq(props::QUALIFIED_NAME, qualified_name),
                Pagination::page(0, 1),
            )
            .await?;

        match found.first() {
            Some(element) => decode_element(element),
            None => Err(AppError::NotFound(format!(
                "Governance action step '{}' not found",
                qualified_name
            ))),
        }
    }

    pub async fn update_step(
        &self,
        user_id: &str,
        guid: &str,
        update: StepUpdate,
    ) -> Result<GovernanceActionStep, AppError> {
        let mut step = self.get_step(user_id, guid).await?;

        if let Some(name) = update.qualified_name {
            require_non_empty(&name, "qualifiedName")?;
            if name != step.qualified_name {
                self.ensure_unique_name(user_id, STEP_TYPE, &name).await?;
            }
            step.qualified_name = name;
        }
        if let Some(request_type) = update.request_type {
            require_non_empty(&request_type, "requestType")?;
            step.request_type = request_type;
        }
        if update.display_name.is_some() {
            step.display_name = update.display_name;
        }
        if update.description.is_some() {
            step.description = update.description;
        }
        if let Some(parameters) = update.request_parameters {
            step.request_parameters = parameters;
        }
        if let Some(ignore) = update.ignore_multiple_triggers {
            step.ignore_multiple_triggers = ignore;
        }

        let element = self
            .store
            .update_element_properties(user_id, guid, UpdateMode::Replace, encode_properties(&step)?)
            .await?;
        decode_element(&element)
    }

    /// Delete a step. Links touching it are kept and returned as warnings.
    pub async fn delete_step(&self, user_id: &str, guid: &str) -> Result<Vec<GraphWarning>, AppError> {
        let step = self.get_step(user_id, guid).await?;

        let links = self
            .store
            .get_relationships(user_id, guid, NEXT_STEP_TYPE, RelationshipDirection::Either)
            .await?;
        let first_step_refs = self
            .store
            .get_relationships(user_id, guid, FIRST_STEP_TYPE, RelationshipDirection::Incoming)
            .await?;

        self.store.delete_element(user_id, guid).await?;

        let mut warnings = Vec::new();
        for link in &links {
            warnings.push(GraphWarning::DanglingLink {
                link_guid: link.guid.clone(),
                current_step_guid: link.end1_guid.clone(),
                next_step_guid: link.end2_guid.clone(),
                missing_step_guid: guid.to_string(),
            });
        }
        for first in &first_step_refs {
            warnings.push(GraphWarning::DanglingFirstStep {
                process_guid: first.end1_guid.clone(),
                link_guid: first.guid.clone(),
                missing_step_guid: guid.to_string(),
            });
        }

        if !warnings.is_empty() {
            warn!(
                "Deleted step '{}' ({}) leaves {} dangling reference(s)",
                step.qualified_name,
                guid,
                warnings.len()
            );
        }
        Ok(warnings)
    }

    // =========================================================================
    // FIRST STEP
    // =========================================================================

    pub async fn get_first_step(&self, user_id: &str, process_guid: &str) -> Result<FirstStep, AppError> {
        let process = self.get_process(user_id, process_guid).await?;
        let link = self
            .first_step_link(user_id, process_guid)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Process '{}' has no first step",
                    process.qualified_name
                ))
            })?;

        let step = self.get_step(user_id, &link.end2_guid).await.map_err(|e| match e {
            AppError::NotFound(_) => AppError::NotFound(format!(
                "First step {} of process '{}' no longer exists",
                link.end2_guid, process.qualified_name
            )),
            other => other,
        })?;

        let link_props = link_properties(&link)?;
        Ok(FirstStep {
            link_guid: link.guid,
            process_guid: process_guid.to_string(),
            step,
            guard: link_props.guard,
            mandatory_guard: link_props.mandatory_guard,
        })
    }

    /// Set (or replace) the first step of a process
    pub async fn set_first_step(
        &self,
        user_id: &str,
        process_guid: &str,
        step_guid: &str,
        guard: Option<String>,
        mandatory_guard: bool,
    ) -> Result<String, AppError> {
        require_non_empty(process_guid, "processGuid")?;
        require_non_empty(step_guid, "stepGuid")?;
        self.typed_element(user_id, process_guid, PROCESS_TYPE)
            .await
            .map_err(not_found_as_invalid)?;
        self.step_element(user_id, step_guid)
            .await
            .map_err(not_found_as_invalid)?;

        let existing = self.first_step_link(user_id, process_guid).await?;

        let link_props = LinkProperties {
            guard,
            mandatory_guard,
            ignore_multiple_triggers: false,
        }
        .normalized();
        let link_guid = self
            .store
            .create_relationship(
                user_id,
                FIRST_STEP_TYPE,
                process_guid,
                step_guid,
                encode_properties(&link_props)?,
            )
            .await?;

        if let Some(old) = existing {
            self.store.delete_relationship(user_id, &old.guid).await?;
        }

        info!("Process {} now starts at step {}", process_guid, step_guid);
        Ok(link_guid)
    }

    pub async fn remove_first_step(&self, user_id: &str, process_guid: &str) -> Result<(), AppError> {
        self.get_process(user_id, process_guid).await?;
        let link = self
            .first_step_link(user_id, process_guid)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Process {} has no first step", process_guid)))?;
        self.store.delete_relationship(user_id, &link.guid).await
    }

    async fn first_step_link(
        &self,
        user_id: &str,
        process_guid: &str,
    ) -> Result<Option<Relationship>, AppError> {
        let mut links = self
            .store
            .get_relationships(user_id, process_guid, FIRST_STEP_TYPE, RelationshipDirection::Outgoing)
            .await?;
        // The newest link wins if a replace was interrupted.
        Ok(links.pop())
    }

    // =========================================================================
    // NEXT STEP LINKS
    // =========================================================================

    /// Outgoing links of an existing step
    pub async fn get_next_steps(&self, user_id: &str, step_guid: &str) -> Result<Vec<NextStepLink>, AppError> {
        self.step_element(user_id, step_guid).await?;
        self.outgoing_links(user_id, step_guid).await
    }

    /// Outgoing links of a step, whether or not the step itself still exists
    pub(crate) async fn outgoing_links(
        &self,
        user_id: &str,
        step_guid: &str,
    ) -> Result<Vec<NextStepLink>, AppError> {
        self.store
            .get_relationships(user_id, step_guid, NEXT_STEP_TYPE, RelationshipDirection::Outgoing)
            .await?
            .iter()
            .map(NextStepLink::from_relationship)
            .collect()
    }

    pub async fn add_next_step_link(
        &self,
        user_id: &str,
        current_step_guid: &str,
        next_step_guid: &str,
        properties: LinkProperties,
    ) -> Result<String, AppError> {
        require_non_empty(current_step_guid, "currentStepGuid")?;
        require_non_empty(next_step_guid, "nextStepGuid")?;
        self.step_element(user_id, current_step_guid)
            .await
            .map_err(not_found_as_invalid)?;
        self.step_element(user_id, next_step_guid)
            .await
            .map_err(not_found_as_invalid)?;

        let properties = properties.normalized();
        let existing = self.outgoing_links(user_id, current_step_guid).await?;
        if existing
            .iter()
            .any(|l| l.next_step_guid == next_step_guid && l.guard == properties.guard)
        {
            return Err(invalid_parameter(format!(
                "Step {} already links to {} with guard {:?}",
                current_step_guid, next_step_guid, properties.guard
            )));
        }

        let guid = self
            .store
            .create_relationship(
                user_id,
                NEXT_STEP_TYPE,
                current_step_guid,
                next_step_guid,
                encode_properties(&properties)?,
            )
            .await?;

        debug!(
            "Linked step {} -> {} (guard: {:?}, mandatory: {})",
            current_step_guid, next_step_guid, properties.guard, properties.mandatory_guard
        );
        Ok(guid)
    }

    pub async fn update_next_step_link(
        &self,
        user_id: &str,
        link_guid: &str,
        properties: LinkProperties,
    ) -> Result<NextStepLink, AppError> {
        let existing = self.next_step_relationship(user_id, link_guid).await?;
        for end in [&existing.end1_guid, &existing.end2_guid] {
            self.step_element(user_id, end)
                .await
                .map_err(not_found_as_invalid)?;
        }

        let relationship = self
            .store
            .update_relationship_properties(
                user_id,
                link_guid,
                UpdateMode::Replace,
                encode_properties(&properties.normalized())?,
            )
            .await?;
        NextStepLink::from_relationship(&relationship)
    }

    pub async fn remove_next_step_link(&self, user_id: &str, link_guid: &str) -> Result<(), AppError> {
        self.next_step_relationship(user_id, link_guid).await?;
        self.store.delete_relationship(user_id, link_guid).await
    }

    async fn next_step_relationship(&self, user_id: &str, link_guid: &str) -> Result<Relationship, AppError> {
        require_non_empty(link_guid, "linkGuid")?;
        let relationship = self.store.get_relationship(user_id, link_guid).await?;
        if relationship.type_name != NEXT_STEP_TYPE {
            return Err(invalid_parameter(format!(
                "Relationship {} is a {}, not a {}",
                link_guid, relationship.type_name, NEXT_STEP_TYPE
            )));
        }
        Ok(relationship)
    }

    // =========================================================================
    // VALIDATION
    // =========================================================================

    /// Walk the process from its first step and report configuration problems
    pub async fn validate_process(&self, user_id: &str, process_guid: &str) -> Result<GraphReport, AppError> {
        self.get_process(user_id, process_guid).await?;

        let mut report = GraphReport {
            process_guid: process_guid.to_string(),
            reachable_step_guids: Vec::new(),
            warnings: Vec::new(),
        };

        let first = match self.first_step_link(user_id, process_guid).await? {
            Some(link) => link,
            None => {
                report.warnings.push(GraphWarning::MissingFirstStep {
                    process_guid: process_guid.to_string(),
                });
                return Ok(report);
            }
        };

        if !self.store.element_exists(user_id, &first.end2_guid).await? {
            report.warnings.push(GraphWarning::DanglingFirstStep {
                process_guid: process_guid.to_string(),
                link_guid: first.guid.clone(),
                missing_step_guid: first.end2_guid.clone(),
            });
            return Ok(report);
        }

        // Breadth-first walk over existing steps; adjacency keeps wildcard edges
        // for cycle detection.
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue = VecDeque::from([first.end2_guid.clone()]);
        let mut wildcard_edges: HashMap<String, Vec<String>> = HashMap::new();

        while let Some(step_guid) = queue.pop_front() {
            if !visited.insert(step_guid.clone()) {
                continue;
            }
            report.reachable_step_guids.push(step_guid.clone());

            for link in self.outgoing_links(user_id, &step_guid).await? {
                if !self.store.element_exists(user_id, &link.next_step_guid).await? {
                    report.warnings.push(GraphWarning::DanglingLink {
                        link_guid: link.guid.clone(),
                        current_step_guid: link.current_step_guid.clone(),
                        next_step_guid: link.next_step_guid.clone(),
                        missing_step_guid: link.next_step_guid.clone(),
                    });
                    continue;
                }
                if link.is_wildcard() {
                    wildcard_edges
                        .entry(step_guid.clone())
                        .or_default()
                        .push(link.next_step_guid.clone());
                }
                if !visited.contains(&link.next_step_guid) {
                    queue.push_back(link.next_step_guid.clone());
                }
            }
        }

        for cycle in find_cycles(&report.reachable_step_guids, &wildcard_edges) {
            report.warnings.push(GraphWarning::GuardlessCycle { step_guids: cycle });
        }

        if !report.warnings.is_empty() {
            warn!(
                "Process {} has {} configuration warning(s)",
                process_guid,
                report.warnings.len()
            );
        }
        Ok(report)
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    async fn typed_element(&self, user_id: &str, guid: &str, type_name: &str) -> Result<Element, AppError> {
        require_non_empty(guid, "guid")?;
        let element = self.store.get_element(user_id, guid).await?;
        if element.type_name != type_name {
            return Err(invalid_parameter(format!(
                "Element {} is a {}, not a {}",
                guid, element.type_name, type_name
            )));
        }
        Ok(element)
    }

    async fn step_element(&self, user_id: &str, guid: &str) -> Result<Element, AppError> {
        require_non_empty(guid, "stepGuid")?;
        let element = self.store.get_element(user_id, guid).await?;
        if !is_step_type(&element.type_name) {
            return Err(invalid_parameter(format!(
                "Element {} is a {}, not a governance action step",
                guid, element.type_name
            )));
        }
        Ok(element)
    }

    async fn ensure_unique_name(&self, user_id: &str, type_name: &str, qualified_name: &str) -> Result<(), AppError> {
        let existing = self
            .store
            .find_elements(
                user_id,
                type_name,
                &SearchCriteria::new().eq(props::QUALIFIED_NAME, qualified_name),
                Pagination::page(0, 1),
            )
            .await?;
        if !existing.is_empty() {
            return Err(invalid_parameter(format!(
                "A {} named '{}' already exists",
                type_name, qualified_name
            )));
        }
        Ok(())
    }
}

fn link_properties(relationship: &Relationship) -> Result<LinkProperties, AppError> {
    serde_json::from_value::<LinkProperties>(Value::Object(relationship.properties.clone()))
        .map(LinkProperties::normalized)
        .map_err(|e| AppError::PropertyServerFailure(format!("Malformed link {}: {}", relationship.guid, e)))
}

/// A reference that cannot be resolved during configuration is a bad parameter
fn not_found_as_invalid(e: AppError) -> AppError {
    match e {
        AppError::NotFound(msg) => AppError::InvalidParameter(msg),
        other => other,
    }
}

/// Depth-first search for cycles in the given adjacency, each reported once
fn find_cycles(nodes: &[String], edges: &HashMap<String, Vec<String>>) -> Vec<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    fn visit(
        node: &str,
        edges: &HashMap<String, Vec<String>>,
        marks: &mut HashMap<String, Mark>,
        stack: &mut Vec<String>,
        seen: &mut HashSet<Vec<String>>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        marks.insert(node.to_string(), Mark::OnStack);
        stack.push(node.to_string());

        for next in edges.get(node).map(Vec::as_slice).unwrap_or(&[]) {
            match marks.get(next).copied().unwrap_or(Mark::Unvisited) {
                Mark::Unvisited => visit(next, edges, marks, stack, seen, cycles),
                Mark::OnStack => {
                    if let Some(pos) = stack.iter().position(|s| s == next) {
                        let cycle = stack[pos..].to_vec();
                        let mut key = cycle.clone();
                        key.sort();
                        if seen.insert(key) {
                            cycles.push(cycle);
                        }
                    }
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks.insert(node.to_string(), Mark::Done);
    }

    let mut marks: HashMap<String, Mark> = HashMap::new();
    let mut stack = Vec::new();
    let mut seen = HashSet::new();
    let mut cycles = Vec::new();

    for node in nodes {
        if marks.get(node).copied().unwrap_or(Mark::Unvisited) == Mark::Unvisited {
            visit(node, edges, &mut marks, &mut stack, &mut seen, &mut cycles);
        }
    }
    cycles
}
