//! Engine Action State Machine
//!
//! Every status write is a compare-and-set on the stored status, so a terminal
//! state can never be overwritten even when two writers race. Ownership is the
//! processing engine GUID, set once by `claim` and checked on every later write.

use crate::config::StatusEncoding;
use crate::error::{require_non_empty, AppError};
use crate::governance::guards::GuardResolver;
use crate::governance::listener::{EngineActionEvent, EngineActionEventKind, ListenerRegistry};
use crate::governance::types::*;
use crate::store::{MetadataStore, Pagination, Properties, SearchCriteria};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Statuses an engine host picks up from the shared backlog
pub const CLAIMABLE_STATUSES: [EngineActionStatus; 4] = [
    EngineActionStatus::Requested,
    EngineActionStatus::Approved,
    EngineActionStatus::Waiting,
    EngineActionStatus::Activating,
];

/// Terminal statuses reached through a recorded completion
pub const COMPLETED_STATUSES: [EngineActionStatus; 4] = [
    EngineActionStatus::Actioned,
    EngineActionStatus::Invalid,
    EngineActionStatus::Ignored,
    EngineActionStatus::Failed,
];

/// Search filter for engine actions; every populated field must match
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineActionFilter {
    #[serde(default)]
    pub statuses: Vec<EngineActionStatus>,
    pub process_guid: Option<String>,
    pub step_guid: Option<String>,
    pub request_type: Option<String>,
    pub processing_engine_guid: Option<String>,
    pub previous_engine_action_guid: Option<String>,
    pub action_target_guid: Option<String>,
    /// Only actions no engine has claimed
    #[serde(default)]
    pub unclaimed: bool,
}

impl EngineActionFilter {
    pub fn criteria(&self) -> SearchCriteria {
        let mut criteria = SearchCriteria::new();
        if !self.statuses.is_empty() {
            criteria = criteria.one_of(
                props::STATUS,
                self.statuses.iter().map(|s| json!(s.as_str())).collect(),
            );
        }
        if let Some(guid) = &self.process_guid {
            criteria = criteria.eq(props::PROCESS_GUID, guid.as_str());
        }
        if let Some(guid) = &self.step_guid {
            criteria = criteria.eq(props::STEP_GUID, guid.as_str());
        }
        if let Some(request_type) = &self.request_type {
            criteria = criteria.eq(props::REQUEST_TYPE, request_type.as_str());
        }
        if let Some(guid) = &self.previous_engine_action_guid {
            criteria = criteria.eq(props::PREVIOUS_ENGINE_ACTION_GUID, guid.as_str());
        }
        if let Some(guid) = &self.action_target_guid {
            criteria = criteria.contains(props::ACTION_TARGET_GUIDS, guid.as_str());
        }
        if self.unclaimed {
            criteria = criteria.is_null(props::PROCESSING_ENGINE_GUID);
        } else if let Some(guid) = &self.processing_engine_guid {
            criteria = criteria.eq(props::PROCESSING_ENGINE_GUID, guid.as_str());
        }
        criteria
    }
}

/// A recorded completion and the successor actions it triggered
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResult {
    pub engine_action: EngineAction,
    pub triggered_engine_action_guids: Vec<String>,
}

#[derive(Clone)]
pub struct EngineActionService {
    store: Arc<dyn MetadataStore>,
    listeners: Arc<ListenerRegistry>,
    resolver: GuardResolver,
    status_encoding: StatusEncoding,
}

impl EngineActionService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        listeners: Arc<ListenerRegistry>,
        resolver: GuardResolver,
        status_encoding: StatusEncoding,
    ) -> Self {
        Self {
            store,
            listeners,
            resolver,
            status_encoding,
        }
    }

    // =========================================================================
    // READS
    // =========================================================================

    pub async fn get_engine_action(&self, user_id: &str, guid: &str) -> Result<EngineAction, AppError> {
        require_non_empty(guid, "engineActionGuid")?;
        let element = self.store.get_element(user_id, guid).await?;
        if element.type_name != ENGINE_ACTION_TYPE {
            return Err(AppError::InvalidParameter(format!(
                "Element {} is a {}, not an engine action",
                guid, element.type_name
            )));
        }
        decode_engine_action(&element)
    }

    pub async fn list_engine_actions(
        &self,
        user_id: &str,
        filter: &EngineActionFilter,
        pagination: Pagination,
    ) -> Result<Vec<EngineAction>, AppError> {
        self.store
            .find_elements(user_id, ENGINE_ACTION_TYPE, &filter.criteria(), pagination)
            .await?
            .iter()
            .map(decode_engine_action)
            .collect()
    }

    /// Non-terminal actions held by an engine, used to resume after a restart
    pub async fn list_claimed_by(&self, user_id: &str, engine_guid: &str) -> Result<Vec<EngineAction>, AppError> {
        require_non_empty(engine_guid, "engineGuid")?;
        let filter = EngineActionFilter {
            statuses: EngineActionStatus::ALL
                .iter()
                .copied()
                .filter(|s| !s.is_terminal())
                .collect(),
            processing_engine_guid: Some(engine_guid.to_string()),
            ..Default::default()
        };
        self.list_engine_actions(user_id, &filter, Pagination::all())
            .await
    }

    /// Unclaimed actions waiting for an engine, oldest first
    pub async fn list_claimable(&self, user_id: &str, limit: usize) -> Result<Vec<EngineAction>, AppError> {
        let filter = EngineActionFilter {
            statuses: CLAIMABLE_STATUSES.to_vec(),
            unclaimed: true,
            ..Default::default()
        };
        self.list_engine_actions(user_id, &filter, Pagination::page(0, limit))
            .await
    }

    // =========================================================================
    // CLAIM
    // =========================================================================

    /// Try to take ownership of an action. Exactly one concurrent caller wins;
    /// the others get `false`.
    pub async fn claim_engine_action(&self, user_id: &str, guid: &str, engine_guid: &str) -> Result<bool, AppError> {
        require_non_empty(engine_guid, "engineGuid")?;
        let action = self.get_engine_action(user_id, guid).await?;

        if action.status.is_terminal() {
            return Err(AppError::InvalidTransition(format!(
                "Engine action {} is already {} and cannot be claimed",
                guid, action.status
            )));
        }
        if let Some(holder) = &action.processing_engine_guid {
            if holder == engine_guid {
                return Ok(true);
            }
            debug!("Engine action {} already claimed by {}", guid, holder);
            return Ok(false);
        }

        let won = self
            .store
            .compare_and_set_property(
                user_id,
                guid,
                props::PROCESSING_ENGINE_GUID,
                None,
                Value::String(engine_guid.to_string()),
                Properties::new(),
            )
            .await?;

        if won {
            info!("🔒 Engine {} claimed engine action {}", engine_guid, guid);
            let mut claimed = action;
            claimed.processing_engine_guid = Some(engine_guid.to_string());
            self.listeners
                .publish(EngineActionEvent::new(EngineActionEventKind::Claimed, &claimed))
                .await;
        } else {
            debug!("Engine {} lost the claim race for {}", engine_guid, guid);
        }
        Ok(won)
    }

    // =========================================================================
    // STATUS
    // =========================================================================

    /// Move an action along the non-terminal part of the state machine on
    /// behalf of an engine. Outcomes go through `record_completion` and forced
    /// termination through `cancel_engine_action`.
    pub async fn update_engine_action_status(
        &self,
        user_id: &str,
        guid: &str,
        engine_guid: &str,
        new_status: EngineActionStatus,
    ) -> Result<EngineAction, AppError> {
        require_non_empty(engine_guid, "engineGuid")?;
        if new_status.is_terminal() {
            return Err(AppError::InvalidTransition(format!(
                "Engine action {} cannot be set to {} directly; record a completion or cancel it",
                guid, new_status
            )));
        }
        let action = self.get_engine_action(user_id, guid).await?;
        self.check_holder(&action, engine_guid, new_status)?;

        let mut extra = Properties::new();
        if new_status == EngineActionStatus::InProgress {
            extra.insert(props::ACTIVATION_TIME.to_string(), json!(Utc::now()));
        }
        self.transition(user_id, action, new_status, extra).await
    }

    /// Turn down a REQUESTED action before it runs. Nothing fires from it.
    pub async fn reject_engine_action(
        &self,
        user_id: &str,
        guid: &str,
        engine_guid: &str,
        message: Option<String>,
    ) -> Result<EngineAction, AppError> {
        require_non_empty(engine_guid, "engineGuid")?;
        let action = self.get_engine_action(user_id, guid).await?;
        if action.status != EngineActionStatus::Requested {
            return Err(invalid_transition(guid, action.status, EngineActionStatus::Ignored));
        }
        self.check_holder(&action, engine_guid, EngineActionStatus::Ignored)?;

        let mut extra = closing_properties(message);
        extra.insert(props::SUCCESSORS_RESOLVED.to_string(), json!(true));
        self.transition(user_id, action, EngineActionStatus::Ignored, extra)
            .await
    }

    /// Record the outcome of an in-progress action and fire its successors.
    ///
    /// Status, guards and message are written together. When the holder calls
    /// again for an action that completed but whose successors were not all
    /// created, the stored outcome is kept and only the missing successors are
    /// created.
    pub async fn record_completion(
        &self,
        user_id: &str,
        guid: &str,
        engine_guid: &str,
        completion: CompletionStatus,
        output_guards: impl IntoIterator<Item = String>,
        message: Option<String>,
    ) -> Result<CompletionResult, AppError> {
        require_non_empty(engine_guid, "engineGuid")?;
        let action = self.get_engine_action(user_id, guid).await?;

        if action.processing_engine_guid.as_deref() != Some(engine_guid) {
            return Err(AppError::ConflictOnClaim(format!(
                "Engine {} does not hold engine action {}",
                engine_guid, guid
            )));
        }
        if awaits_resolution(&action) {
            warn!(
                "Engine action {} is already {}; finishing its successor resolution",
                guid, action.status
            );
            return self.finish_resolution(user_id, action, true).await;
        }

        let guards: BTreeSet<String> = output_guards
            .into_iter()
            .filter_map(|g| normalize_guard(Some(g)))
            .collect();

        let mut extra = closing_properties(message);
        extra.insert(props::COMPLETION_GUARDS.to_string(), json!(guards));
        extra.insert(props::SUCCESSORS_RESOLVED.to_string(), json!(false));

        let completed = self
            .transition(user_id, action, completion.into(), extra)
            .await?;
        info!(
            "✅ Engine action {} completed as {} with guards {:?}",
            guid, completed.status, completed.completion_guards
        );

        self.finish_resolution(user_id, completed, false).await
    }

    /// Completed actions held by an engine whose successors are not all created
    pub async fn list_unresolved_by(&self, user_id: &str, engine_guid: &str) -> Result<Vec<EngineAction>, AppError> {
        require_non_empty(engine_guid, "engineGuid")?;
        let filter = EngineActionFilter {
            statuses: COMPLETED_STATUSES.to_vec(),
            processing_engine_guid: Some(engine_guid.to_string()),
            ..Default::default()
        };
        let criteria = filter.criteria().eq(props::SUCCESSORS_RESOLVED, false);
        self.store
            .find_elements(user_id, ENGINE_ACTION_TYPE, &criteria, Pagination::all())
            .await?
            .iter()
            .map(decode_engine_action)
            .collect()
    }

    /// Create the successors still missing for a completed action
    pub async fn resume_resolution(
        &self,
        user_id: &str,
        guid: &str,
        engine_guid: &str,
    ) -> Result<CompletionResult, AppError> {
        require_non_empty(engine_guid, "engineGuid")?;
        let action = self.get_engine_action(user_id, guid).await?;
        if action.processing_engine_guid.as_deref() != Some(engine_guid) {
            return Err(AppError::ConflictOnClaim(format!(
                "Engine {} does not hold engine action {}",
                engine_guid, guid
            )));
        }
        if !awaits_resolution(&action) {
            return Err(AppError::InvalidTransition(format!(
                "Engine action {} is {} with nothing left to resolve",
                guid, action.status
            )));
        }
        self.finish_resolution(user_id, action, true).await
    }

    async fn finish_resolution(
        &self,
        user_id: &str,
        mut completed: EngineAction,
        retry: bool,
    ) -> Result<CompletionResult, AppError> {
        let triggered = if retry {
            self.resolver.resume(user_id, &completed).await?
        } else {
            self.resolver.resolve(user_id, &completed).await?
        };

        self.store
            .compare_and_set_property(
                user_id,
                &completed.guid,
                props::SUCCESSORS_RESOLVED,
                Some(json!(false)),
                json!(true),
                Properties::new(),
            )
            .await?;
        completed.successors_resolved = true;

        Ok(CompletionResult {
            engine_action: completed,
            triggered_engine_action_guids: triggered,
        })
    }

    /// Administrative termination; any non-terminal action moves to OTHER
    pub async fn cancel_engine_action(
        &self,
        user_id: &str,
        guid: &str,
        message: Option<String>,
    ) -> Result<EngineAction, AppError> {
        let action = self.get_engine_action(user_id, guid).await?;

        let mut extra = closing_properties(message);
        extra.insert(props::SUCCESSORS_RESOLVED.to_string(), json!(true));

        let cancelled = self
            .transition(user_id, action, EngineActionStatus::Other, extra)
            .await?;
        warn!("Engine action {} cancelled by {}", guid, user_id);
        Ok(cancelled)
    }

    fn check_holder(
        &self,
        action: &EngineAction,
        engine_guid: &str,
        new_status: EngineActionStatus,
    ) -> Result<(), AppError> {
        match &action.processing_engine_guid {
            Some(holder) if holder != engine_guid => Err(AppError::ConflictOnClaim(format!(
                "Engine action {} is held by engine {}",
                action.guid, holder
            ))),
            None if new_status == EngineActionStatus::InProgress => Err(AppError::ConflictOnClaim(format!(
                "Engine action {} must be claimed before it can start",
                action.guid
            ))),
            _ => Ok(()),
        }
    }

    /// Compare-and-set the status together with the accompanying fields
    async fn transition(
        &self,
        user_id: &str,
        action: EngineAction,
        new_status: EngineActionStatus,
        extra: Properties,
    ) -> Result<EngineAction, AppError> {
        let current = action.status;
        if !current.can_transition_to(new_status) {
            return Err(invalid_transition(&action.guid, current, new_status));
        }

        let swapped = self
            .store
            .compare_and_set_property(
                user_id,
                &action.guid,
                props::STATUS,
                Some(json!(current.as_str())),
                json!(new_status.as_str()),
                extra,
            )
            .await?;
        if !swapped {
            let latest = self.get_engine_action(user_id, &action.guid).await?;
            return Err(invalid_transition(&action.guid, latest.status, new_status));
        }

        write_status_classification(
            self.store.as_ref(),
            self.status_encoding,
            user_id,
            &action.guid,
            new_status,
        )
        .await?;

        let element = self.store.get_element(user_id, &action.guid).await?;
        let updated = decode_engine_action(&element)?;
        debug!("Engine action {}: {} -> {}", action.guid, current, new_status);

        let kind = if new_status.is_terminal() {
            EngineActionEventKind::Completed
        } else {
            EngineActionEventKind::StatusChanged
        };
        self.listeners
            .publish(EngineActionEvent::new(kind, &updated))
            .await;
        Ok(updated)
    }
}

/// Completion message and time written with every terminal status
fn closing_properties(message: Option<String>) -> Properties {
    let mut extra = Properties::new();
    extra.insert(props::COMPLETION_MESSAGE.to_string(), json!(message));
    extra.insert(props::COMPLETION_TIME.to_string(), json!(Utc::now()));
    extra
}

fn awaits_resolution(action: &EngineAction) -> bool {
    COMPLETED_STATUSES.contains(&action.status) && !action.successors_resolved
}

fn invalid_transition(guid: &str, from: EngineActionStatus, to: EngineActionStatus) -> AppError {
    if from.is_terminal() {
        AppError::InvalidTransition(format!(
            "Engine action {} is {} and can no longer change status",
            guid, from
        ))
    } else {
        AppError::InvalidTransition(format!(
            "Engine action {} cannot move from {} to {}",
            guid, from, to
        ))
    }
}

/// Mirror the status into the status classification when configured to
pub(crate) async fn write_status_classification(
    store: &dyn MetadataStore,
    encoding: StatusEncoding,
    user_id: &str,
    guid: &str,
    status: EngineActionStatus,
) -> Result<(), AppError> {
    if encoding != StatusEncoding::Classification {
        return Ok(());
    }
    let mut properties = Properties::new();
    properties.insert(props::STATUS.to_string(), json!(status.as_str()));
    store
        .classify_element(user_id, guid, STATUS_CLASSIFICATION, properties)
        .await
}
