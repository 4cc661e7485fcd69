//! In-memory metadata store
//!
//! Thread-safe maps behind tokio `RwLock`s. The claim compare-and-set runs under
//! the element map's write lock, so it is atomic across every task sharing the
//! store.

use super::{
    apply_update, Element, MetadataStore, Pagination, Properties, Relationship,
    RelationshipDirection, SearchCriteria, UpdateMode,
};
use crate::error::AppError;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Entry plus its creation sequence, used for stable ordering
#[derive(Debug, Clone)]
struct Stored<T> {
    seq: u64,
    item: T,
}

pub struct InMemoryMetadataStore {
    elements: RwLock<HashMap<String, Stored<Element>>>,
    relationships: RwLock<HashMap<String, Stored<Relationship>>>,
    sequence: AtomicU64,
    /// When set, only these callers may use the store
    authorized_users: Option<HashSet<String>>,
    available: AtomicBool,
    accepting_elements: AtomicBool,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            elements: RwLock::new(HashMap::new()),
            relationships: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            authorized_users: None,
            available: AtomicBool::new(true),
            accepting_elements: AtomicBool::new(true),
        }
    }

    /// Restrict the store to a fixed set of callers
    pub fn with_authorized_users<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            authorized_users: Some(users.into_iter().map(Into::into).collect()),
            ..Self::new()
        }
    }

    /// Simulate the store becoming unreachable (or reachable again)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Simulate a store that keeps serving reads and updates but fails to
    /// create elements
    pub fn set_accepting_elements(&self, accepting: bool) {
        self.accepting_elements.store(accepting, Ordering::SeqCst);
    }

    /// Number of stored elements of a type
    pub async fn count(&self, type_name: &str) -> usize {
        let elements = self.elements.read().await;
        elements
            .values()
            .filter(|s| s.item.type_name == type_name)
            .count()
    }

    fn check(&self, user_id: &str) -> Result<(), AppError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(AppError::PropertyServerFailure(
                "Metadata store is unreachable".to_string(),
            ));
        }
        if let Some(users) = &self.authorized_users {
            if !users.contains(user_id) {
                return Err(AppError::NotAuthorized(format!(
                    "User '{}' is not permitted to access the metadata store",
                    user_id
                )));
            }
        }
        Ok(())
    }

    fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_unset(value: Option<&Value>) -> bool {
    value.map(Value::is_null).unwrap_or(true)
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn create_element(
        &self,
        user_id: &str,
        type_name: &str,
        properties: Properties,
    ) -> Result<String, AppError> {
        self.check(user_id)?;
        if !self.accepting_elements.load(Ordering::SeqCst) {
            return Err(AppError::PropertyServerFailure(format!(
                "Metadata store refused to create a {}",
                type_name
            )));
        }
        let guid = Uuid::new_v4().to_string();
        let now = Utc::now();
        let element = Element {
            guid: guid.clone(),
            type_name: type_name.to_string(),
            properties,
            classifications: HashMap::new(),
            version: 1,
            created_by: Some(user_id.to_string()),
            updated_by: None,
            created_at: now,
            updated_at: now,
        };

        let mut elements = self.elements.write().await;
        elements.insert(
            guid.clone(),
            Stored {
                seq: self.next_seq(),
                item: element,
            },
        );

        debug!("Created {} element {}", type_name, guid);
        Ok(guid)
    }

    async fn get_element(&self, user_id: &str, guid: &str) -> Result<Element, AppError> {
        self.check(user_id)?;
        let elements = self.elements.read().await;
        elements
            .get(guid)
            .map(|s| s.item.clone())
            .ok_or_else(|| AppError::NotFound(format!("Element {} not found", guid)))
    }

    async fn update_element_properties(
        &self,
        user_id: &str,
        guid: &str,
        mode: UpdateMode,
        properties: Properties,
    ) -> Result<Element, AppError> {
        self.check(user_id)?;
        let mut elements = self.elements.write().await;
        let stored = elements
            .get_mut(guid)
            .ok_or_else(|| AppError::NotFound(format!("Element {} not found", guid)))?;

        let element = &mut stored.item;
        apply_update(&mut element.properties, mode, properties);
        element.version += 1;
        element.updated_by = Some(user_id.to_string());
        element.updated_at = Utc::now();
        Ok(element.clone())
    }

    async fn delete_element(&self, user_id: &str, guid: &str) -> Result<(), AppError> {
        self.check(user_id)?;
        let mut elements = self.elements.write().await;
        if elements.remove(guid).is_none() {
            return Err(AppError::NotFound(format!("Element {} not found", guid)));
        }
        // Relationships are left in place; callers report dangling ends.
        Ok(())
    }

    async fn classify_element(
        &self,
        user_id: &str,
        guid: &str,
        classification: &str,
        properties: Properties,
    ) -> Result<(), AppError> {
        self.check(user_id)?;
        let mut elements = self.elements.write().await;
        let stored = elements
            .get_mut(guid)
            .ok_or_else(|| AppError::NotFound(format!("Element {} not found", guid)))?;

        let element = &mut stored.item;
        element
            .classifications
            .insert(classification.to_string(), properties);
        element.version += 1;
        element.updated_by = Some(user_id.to_string());
        element.updated_at = Utc::now();
        Ok(())
    }

    async fn find_elements(
        &self,
        user_id: &str,
        type_name: &str,
        criteria: &SearchCriteria,
        pagination: Pagination,
    ) -> Result<Vec<Element>, AppError> {
        self.check(user_id)?;
        let elements = self.elements.read().await;
        let mut matches: Vec<&Stored<Element>> = elements
            .values()
            .filter(|s| s.item.type_name == type_name && criteria.matches(&s.item.properties))
            .collect();
        matches.sort_by_key(|s| s.seq);

        Ok(pagination.apply(matches.into_iter().map(|s| s.item.clone()).collect()))
    }

    async fn compare_and_set_property(
        &self,
        user_id: &str,
        guid: &str,
        property: &str,
        expected: Option<Value>,
        new_value: Value,
        also: Properties,
    ) -> Result<bool, AppError> {
        self.check(user_id)?;
        let mut elements = self.elements.write().await;
        let stored = elements
            .get_mut(guid)
            .ok_or_else(|| AppError::NotFound(format!("Element {} not found", guid)))?;

        let element = &mut stored.item;
        let current = element.properties.get(property);
        let matches = match &expected {
            None => is_unset(current),
            Some(expected) => current == Some(expected),
        };
        if !matches {
            return Ok(false);
        }

        element.properties.extend(also);
        element.properties.insert(property.to_string(), new_value);
        element.version += 1;
        element.updated_by = Some(user_id.to_string());
        element.updated_at = Utc::now();
        Ok(true)
    }

    async fn create_relationship(
        &self,
        user_id: &str,
        type_name: &str,
        end1_guid: &str,
        end2_guid: &str,
        properties: Properties,
    ) -> Result<String, AppError> {
        self.check(user_id)?;
        {
            let elements = self.elements.read().await;
            for end in [end1_guid, end2_guid] {
                if !elements.contains_key(end) {
                    return Err(AppError::InvalidParameter(format!(
                        "Relationship end {} does not exist",
                        end
                    )));
                }
            }
        }

        let guid = Uuid::new_v4().to_string();
        let now = Utc::now();
        let relationship = Relationship {
            guid: guid.clone(),
            type_name: type_name.to_string(),
            end1_guid: end1_guid.to_string(),
            end2_guid: end2_guid.to_string(),
            properties,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        let mut relationships = self.relationships.write().await;
        relationships.insert(
            guid.clone(),
            Stored {
                seq: self.next_seq(),
                item: relationship,
            },
        );

        debug!("Created {} relationship {} ({} -> {})", type_name, guid, end1_guid, end2_guid);
        Ok(guid)
    }

    async fn get_relationship(&self, user_id: &str, guid: &str) -> Result<Relationship, AppError> {
        self.check(user_id)?;
        let relationships = self.relationships.read().await;
        relationships
            .get(guid)
            .map(|s| s.item.clone())
            .ok_or_else(|| AppError::NotFound(format!("Relationship {} not found", guid)))
    }

    async fn update_relationship_properties(
        &self,
        user_id: &str,
        guid: &str,
        mode: UpdateMode,
        properties: Properties,
    ) -> Result<Relationship, AppError> {
        self.check(user_id)?;
        let mut relationships = self.relationships.write().await;
        let stored = relationships
            .get_mut(guid)
            .ok_or_else(|| AppError::NotFound(format!("Relationship {} not found", guid)))?;

        let relationship = &mut stored.item;
        apply_update(&mut relationship.properties, mode, properties);
        relationship.version += 1;
        relationship.updated_at = Utc::now();
        Ok(relationship.clone())
    }

    async fn delete_relationship(&self, user_id: &str, guid: &str) -> Result<(), AppError> {
        self.check(user_id)?;
        let mut relationships = self.relationships.write().await;
        if relationships.remove(guid).is_none() {
            return Err(AppError::NotFound(format!("Relationship {} not found", guid)));
        }
        Ok(())
    }

    async fn get_relationships(
        &self,
        user_id: &str,
        guid: &str,
        type_name: &str,
        direction: RelationshipDirection,
    ) -> Result<Vec<Relationship>, AppError> {
        self.check(user_id)?;
        let relationships = self.relationships.read().await;
        let mut matches: Vec<&Stored<Relationship>> = relationships
            .values()
            .filter(|s| s.item.type_name == type_name)
            .filter(|s| match direction {
                RelationshipDirection::Outgoing => s.item.end1_guid == guid,
                RelationshipDirection::Incoming => s.item.end2_guid == guid,
                RelationshipDirection::Either => {
                    s.item.end1_guid == guid || s.item.end2_guid == guid
                }
            })
            .collect();
        matches.sort_by_key(|s| s.seq);

        Ok(matches.into_iter().map(|s| s.item.clone()).collect())
    }
}
