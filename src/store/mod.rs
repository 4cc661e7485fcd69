//! Metadata Store
//!
//! The persistence boundary of the engine. Processes, steps, links and engine
//! actions are all stored as generic elements and relationships keyed by GUID and
//! type name. Two implementations are provided: an in-memory store used by tests
//! and single-host deployments, and a PostgreSQL store shared by many hosts.

mod memory;
mod postgres;

pub use memory::InMemoryMetadataStore;
pub use postgres::PostgresMetadataStore;

use crate::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// JSON object holding an element's or relationship's properties
pub type Properties = Map<String, Value>;

/// A stored element
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub guid: String,
    pub type_name: String,
    pub properties: Properties,
    #[serde(default)]
    pub classifications: HashMap<String, Properties>,
    pub version: u64,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored relationship between two elements
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub guid: String,
    pub type_name: String,
    pub end1_guid: String,
    pub end2_guid: String,
    pub properties: Properties,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Whether an update merges into or replaces the existing properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    Merge,
    Replace,
}

/// Which end of a relationship the anchor element sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipDirection {
    /// Anchor is end1
    Outgoing,
    /// Anchor is end2
    Incoming,
    Either,
}

/// A single property condition within a search
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyCondition {
    Equals(Value),
    /// Property absent or JSON null
    IsNull,
    OneOf(Vec<Value>),
    /// Array property contains the value
    Contains(Value),
}

impl PropertyCondition {
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let value = value.filter(|v| !v.is_null());
        match self {
            PropertyCondition::Equals(expected) => value == Some(expected),
            PropertyCondition::IsNull => value.is_none(),
            PropertyCondition::OneOf(options) => value.map(|v| options.contains(v)).unwrap_or(false),
            PropertyCondition::Contains(item) => value
                .and_then(Value::as_array)
                .map(|items| items.contains(item))
                .unwrap_or(false),
        }
    }
}

/// Conjunction of property conditions used by `find_elements`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchCriteria {
    pub conditions: Vec<(String, PropertyCondition)>,
}

impl SearchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, property: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push((property.to_string(), PropertyCondition::Equals(value.into())));
        self
    }

    pub fn is_null(mut self, property: &str) -> Self {
        self.conditions
            .push((property.to_string(), PropertyCondition::IsNull));
        self
    }

    pub fn one_of(mut self, property: &str, values: Vec<Value>) -> Self {
        self.conditions
            .push((property.to_string(), PropertyCondition::OneOf(values)));
        self
    }

    pub fn contains(mut self, property: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push((property.to_string(), PropertyCondition::Contains(value.into())));
        self
    }

    pub fn matches(&self, properties: &Properties) -> bool {
        self.conditions
            .iter()
            .all(|(name, condition)| condition.matches(properties.get(name)))
    }
}

/// Paging window; a page size of zero returns every remaining result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(default)]
    pub start_from: usize,
    #[serde(default)]
    pub page_size: usize,
}

impl Pagination {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn page(start_from: usize, page_size: usize) -> Self {
        Self {
            start_from,
            page_size,
        }
    }

    pub(crate) fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.start_from);
        if self.page_size == 0 {
            iter.collect()
        } else {
            iter.take(self.page_size).collect()
        }
    }
}

/// Abstract metadata store consumed by the engine.
///
/// Every call carries the caller identity; implementations decide whether the
/// caller may perform it and answer `NotAuthorized` otherwise.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_element(
        &self,
        user_id: &str,
        type_name: &str,
        properties: Properties,
    ) -> Result<String, AppError>;

    async fn get_element(&self, user_id: &str, guid: &str) -> Result<Element, AppError>;

    async fn update_element_properties(
        &self,
        user_id: &str,
        guid: &str,
        mode: UpdateMode,
        properties: Properties,
    ) -> Result<Element, AppError>;

    async fn delete_element(&self, user_id: &str, guid: &str) -> Result<(), AppError>;

    async fn classify_element(
        &self,
        user_id: &str,
        guid: &str,
        classification: &str,
        properties: Properties,
    ) -> Result<(), AppError>;

    async fn find_elements(
        &self,
        user_id: &str,
        type_name: &str,
        criteria: &SearchCriteria,
        pagination: Pagination,
    ) -> Result<Vec<Element>, AppError>;

    /// Atomically set `property` to `new_value`, merging `also` in the same write,
    /// only when its current value equals `expected` (`None` meaning absent or
    /// null). Returns whether the write happened.
    async fn compare_and_set_property(
        &self,
        user_id: &str,
        guid: &str,
        property: &str,
        expected: Option<Value>,
        new_value: Value,
        also: Properties,
    ) -> Result<bool, AppError>;

    async fn create_relationship(
        &self,
        user_id: &str,
        type_name: &str,
        end1_guid: &str,
        end2_guid: &str,
        properties: Properties,
    ) -> Result<String, AppError>;

    async fn get_relationship(&self, user_id: &str, guid: &str) -> Result<Relationship, AppError>;

    async fn update_relationship_properties(
        &self,
        user_id: &str,
        guid: &str,
        mode: UpdateMode,
        properties: Properties,
    ) -> Result<Relationship, AppError>;

    async fn delete_relationship(&self, user_id: &str, guid: &str) -> Result<(), AppError>;

    /// Relationships of `type_name` attached to `guid`, ordered by creation
    async fn get_relationships(
        &self,
        user_id: &str,
        guid: &str,
        type_name: &str,
        direction: RelationshipDirection,
    ) -> Result<Vec<Relationship>, AppError>;

    /// Whether an element with this GUID exists
    async fn element_exists(&self, user_id: &str, guid: &str) -> Result<bool, AppError> {
        match self.get_element(user_id, guid).await {
            Ok(_) => Ok(true),
            Err(AppError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Merge `update` into `target` according to `mode`
pub(crate) fn apply_update(target: &mut Properties, mode: UpdateMode, update: Properties) {
    match mode {
        UpdateMode::Replace => *target = update,
        UpdateMode::Merge => {
            for (k, v) in update {
                target.insert(k, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_criteria_null_matches_absent_and_null() {
        let criteria = SearchCriteria::new().is_null("processingEngineGuid");
        assert!(criteria.matches(&props(json!({}))));
        assert!(criteria.matches(&props(json!({"processingEngineGuid": null}))));
        assert!(!criteria.matches(&props(json!({"processingEngineGuid": "e-1"}))));
    }

    #[test]
    fn test_criteria_conjunction() {
        let criteria = SearchCriteria::new()
            .eq("stepGuid", "s-1")
            .one_of("status", vec![json!("requested"), json!("approved")])
            .contains("actionTargetGuids", "asset-1");
        assert!(criteria.matches(&props(json!({
            "stepGuid": "s-1",
            "status": "approved",
            "actionTargetGuids": ["asset-1", "asset-2"]
        }))));
        assert!(!criteria.matches(&props(json!({
            "stepGuid": "s-1",
            "status": "actioned",
            "actionTargetGuids": ["asset-1"]
        }))));
    }

    #[test]
    fn test_pagination_window() {
        let items: Vec<u32> = (0..10).collect();
        assert_eq!(Pagination::page(2, 3).apply(items.clone()), vec![2, 3, 4]);
        assert_eq!(Pagination::all().apply(items.clone()).len(), 10);
        assert!(Pagination::page(20, 5).apply(items).is_empty());
    }

    #[test]
    fn test_merge_and_replace() {
        let mut target = props(json!({"a": 1, "b": 2}));
        apply_update(&mut target, UpdateMode::Merge, props(json!({"b": 3, "c": 4})));
        assert_eq!(Value::Object(target.clone()), json!({"a": 1, "b": 3, "c": 4}));
        apply_update(&mut target, UpdateMode::Replace, props(json!({"z": 0})));
        assert_eq!(Value::Object(target), json!({"z": 0}));
    }
}
