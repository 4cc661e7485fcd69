//! Governance action types
//!
//! Processes, steps, next-step links and engine actions, plus the codec between
//! these typed views and the generic elements held by the metadata store.

use crate::error::AppError;
use crate::store::{Element, Properties, Relationship};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

pub const PROCESS_TYPE: &str = "GovernanceActionProcess";
pub const STEP_TYPE: &str = "GovernanceActionProcessStep";
/// Older name for a step definition, still accepted as a link endpoint
pub const STEP_TYPE_ALIAS: &str = "GovernanceActionType";
pub const NEXT_STEP_TYPE: &str = "NextGovernanceActionProcessStep";
pub const FIRST_STEP_TYPE: &str = "GovernanceActionProcessFlow";
pub const ENGINE_ACTION_TYPE: &str = "EngineAction";

/// Classification used when engine action status is classification-encoded
pub const STATUS_CLASSIFICATION: &str = "GovernanceActionStatus";

pub fn is_step_type(type_name: &str) -> bool {
    type_name == STEP_TYPE || type_name == STEP_TYPE_ALIAS
}

// =============================================================================
// PROCESS
// =============================================================================

/// Lifecycle of a process definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Draft,
    Active,
    Deprecated,
    Other,
}

impl Default for ProcessStatus {
    fn default() -> Self {
        ProcessStatus::Draft
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceActionProcess {
    #[serde(default)]
    pub guid: String,
    pub qualified_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: ProcessStatus,
}

/// The first-step reference of a process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FirstStep {
    pub link_guid: String,
    pub process_guid: String,
    pub step: GovernanceActionStep,
    pub guard: Option<String>,
    pub mandatory_guard: bool,
}

// =============================================================================
// STEP
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GovernanceActionStep {
    #[serde(default)]
    pub guid: String,
    pub qualified_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub request_type: String,
    #[serde(default)]
    pub request_parameters: BTreeMap<String, String>,
    /// Suppress a second trigger of this step from the same predecessor action
    #[serde(default)]
    pub ignore_multiple_triggers: bool,
    #[serde(default)]
    pub process_guid: Option<String>,
}

// =============================================================================
// NEXT STEP LINK
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NextStepLink {
    pub guid: String,
    pub current_step_guid: String,
    pub next_step_guid: String,
    pub guard: Option<String>,
    pub mandatory_guard: bool,
    pub ignore_multiple_triggers: bool,
}

/// Properties persisted on a next-step relationship
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LinkProperties {
    #[serde(default)]
    pub guard: Option<String>,
    #[serde(default)]
    pub mandatory_guard: bool,
    #[serde(default)]
    pub ignore_multiple_triggers: bool,
}

impl LinkProperties {
    /// Empty guards are stored as absent
    pub fn normalized(mut self) -> Self {
        self.guard = normalize_guard(self.guard);
        self
    }
}

pub fn normalize_guard(guard: Option<String>) -> Option<String> {
    guard
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty())
}

impl NextStepLink {
    pub fn from_relationship(relationship: &Relationship) -> Result<Self, AppError> {
        let props: LinkProperties = serde_json::from_value(Value::Object(relationship.properties.clone()))
            .map_err(|e| {
                AppError::PropertyServerFailure(format!(
                    "Malformed next-step link {}: {}",
                    relationship.guid, e
                ))
            })?;
        let props = props.normalized();

        Ok(Self {
            guid: relationship.guid.clone(),
            current_step_guid: relationship.end1_guid.clone(),
            next_step_guid: relationship.end2_guid.clone(),
            guard: props.guard,
            mandatory_guard: props.mandatory_guard,
            ignore_multiple_triggers: props.ignore_multiple_triggers,
        })
    }

    /// A link without a guard fires on every completion
    pub fn is_wildcard(&self) -> bool {
        self.guard.is_none()
    }

    pub fn is_satisfied_by(&self, output_guards: &BTreeSet<String>) -> bool {
        match &self.guard {
            None => true,
            Some(guard) => output_guards.contains(guard),
        }
    }
}

// =============================================================================
// ENGINE ACTION
// =============================================================================

/// Lifecycle of an engine action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineActionStatus {
    Requested,
    Approved,
    Waiting,
    Activating,
    InProgress,
    Actioned,
    Invalid,
    Ignored,
    Failed,
    Other,
}

impl EngineActionStatus {
    pub const ALL: [EngineActionStatus; 10] = [
        EngineActionStatus::Requested,
        EngineActionStatus::Approved,
        EngineActionStatus::Waiting,
        EngineActionStatus::Activating,
        EngineActionStatus::InProgress,
        EngineActionStatus::Actioned,
        EngineActionStatus::Invalid,
        EngineActionStatus::Ignored,
        EngineActionStatus::Failed,
        EngineActionStatus::Other,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineActionStatus::Actioned
                | EngineActionStatus::Invalid
                | EngineActionStatus::Ignored
                | EngineActionStatus::Failed
                | EngineActionStatus::Other
        )
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: EngineActionStatus) -> bool {
        use EngineActionStatus::*;

        if self.is_terminal() {
            return false;
        }
        if next == Other {
            return true;
        }
        matches!(
            (self, next),
            (Requested, Approved)
                | (Requested, Ignored)
                | (Approved, Waiting)
                | (Approved, Activating)
                | (Waiting, Activating)
                | (Activating, InProgress)
                | (InProgress, Actioned)
                | (InProgress, Invalid)
                | (InProgress, Ignored)
                | (InProgress, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineActionStatus::Requested => "requested",
            EngineActionStatus::Approved => "approved",
            EngineActionStatus::Waiting => "waiting",
            EngineActionStatus::Activating => "activating",
            EngineActionStatus::InProgress => "in_progress",
            EngineActionStatus::Actioned => "actioned",
            EngineActionStatus::Invalid => "invalid",
            EngineActionStatus::Ignored => "ignored",
            EngineActionStatus::Failed => "failed",
            EngineActionStatus::Other => "other",
        }
    }
}

impl std::fmt::Display for EngineActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EngineActionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        EngineActionStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| AppError::InvalidParameter(format!("Unknown engine action status '{}'", s)))
    }
}

/// Outcome reported by a governance service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// Succeeded
    Actioned,
    /// Preconditions not met
    Invalid,
    /// Deliberately skipped
    Ignored,
    /// Execution error
    Failed,
}

impl From<CompletionStatus> for EngineActionStatus {
    fn from(status: CompletionStatus) -> Self {
        match status {
            CompletionStatus::Actioned => EngineActionStatus::Actioned,
            CompletionStatus::Invalid => EngineActionStatus::Invalid,
            CompletionStatus::Ignored => EngineActionStatus::Ignored,
            CompletionStatus::Failed => EngineActionStatus::Failed,
        }
    }
}

/// The runtime instance of one step execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineAction {
    #[serde(default)]
    pub guid: String,
    pub qualified_name: String,
    #[serde(default)]
    pub process_guid: Option<String>,
    #[serde(default)]
    pub step_guid: Option<String>,
    pub request_type: String,
    #[serde(default)]
    pub request_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub request_source_guids: Vec<String>,
    #[serde(default)]
    pub action_target_guids: Vec<String>,
    #[serde(default)]
    pub received_guards: BTreeSet<String>,
    /// The completed action whose guards triggered this one
    #[serde(default)]
    pub previous_engine_action_guid: Option<String>,
    pub status: EngineActionStatus,
    #[serde(default)]
    pub processing_engine_guid: Option<String>,
    /// Absent means eligible immediately
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub activation_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_guards: BTreeSet<String>,
    #[serde(default)]
    pub completion_message: Option<String>,
    /// Set once every successor of a completion exists
    #[serde(default)]
    pub successors_resolved: bool,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl EngineAction {
    pub fn is_claimed(&self) -> bool {
        self.processing_engine_guid.is_some()
    }

    /// Whether the requested start time has been reached
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.start_time.map(|t| t <= now).unwrap_or(true)
    }
}

// =============================================================================
// PROPERTY NAMES
// =============================================================================

pub mod props {
    pub const QUALIFIED_NAME: &str = "qualifiedName";
    pub const STATUS: &str = "status";
    pub const PROCESS_GUID: &str = "processGuid";
    pub const STEP_GUID: &str = "stepGuid";
    pub const REQUEST_TYPE: &str = "requestType";
    pub const PROCESSING_ENGINE_GUID: &str = "processingEngineGuid";
    pub const PREVIOUS_ENGINE_ACTION_GUID: &str = "previousEngineActionGuid";
    pub const ACTION_TARGET_GUIDS: &str = "actionTargetGuids";
    pub const REQUEST_SOURCE_GUIDS: &str = "requestSourceGuids";
    pub const COMPLETION_GUARDS: &str = "completionGuards";
    pub const COMPLETION_MESSAGE: &str = "completionMessage";
    pub const COMPLETION_TIME: &str = "completionTime";
    pub const ACTIVATION_TIME: &str = "activationTime";
    pub const SUCCESSORS_RESOLVED: &str = "successorsResolved";
}

// =============================================================================
// ELEMENT CODEC
// =============================================================================

/// Fields owned by the store rather than the element's properties
const STORE_FIELDS: [&str; 3] = ["guid", "createdAt", "updatedAt"];

/// Decode an element's properties into a typed view
pub fn decode_element<T: DeserializeOwned>(element: &Element) -> Result<T, AppError> {
    let mut properties = element.properties.clone();
    properties.insert("guid".to_string(), Value::String(element.guid.clone()));
    properties.insert(
        "createdAt".to_string(),
        serde_json::to_value(element.created_at).unwrap_or(Value::Null),
    );
    properties.insert(
        "updatedAt".to_string(),
        serde_json::to_value(element.updated_at).unwrap_or(Value::Null),
    );

    serde_json::from_value(Value::Object(properties)).map_err(|e| {
        AppError::PropertyServerFailure(format!(
            "Element {} of type {} has unexpected properties: {}",
            element.guid, element.type_name, e
        ))
    })
}

/// Encode a typed view into element properties
pub fn encode_properties<T: Serialize>(value: &T) -> Result<Properties, AppError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(mut map)) => {
            for field in STORE_FIELDS {
                map.remove(field);
            }
            Ok(map)
        }
        Ok(other) => Err(AppError::Internal(format!(
            "Expected an object when encoding properties, found {}",
            other
        ))),
        Err(e) => Err(AppError::Internal(format!("Failed to encode properties: {}", e))),
    }
}

/// Decode an engine action, falling back to classification-carried status
pub fn decode_engine_action(element: &Element) -> Result<EngineAction, AppError> {
    if element.properties.get(props::STATUS).is_some() {
        return decode_element(element);
    }

    let mut element = element.clone();
    if let Some(status) = element
        .classifications
        .get(STATUS_CLASSIFICATION)
        .and_then(|c| c.get(props::STATUS))
        .cloned()
    {
        element.properties.insert(props::STATUS.to_string(), status);
    }
    decode_element(&element)
}
