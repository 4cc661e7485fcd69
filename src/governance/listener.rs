//! Watchdog listener registry
//!
//! Listeners receive an event whenever an engine action is created or changes
//! status. The broadcast channel behind the registry is created on the first
//! registration and dropped by `shutdown`; registering again recreates it.

use crate::governance::types::{EngineAction, EngineActionStatus};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

const DEFAULT_CAPACITY: usize = 256;

static GLOBAL: Lazy<Arc<ListenerRegistry>> =
    Lazy::new(|| Arc::new(ListenerRegistry::new(DEFAULT_CAPACITY)));

/// The registry shared by everything in this process
pub fn global() -> Arc<ListenerRegistry> {
    GLOBAL.clone()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineActionEventKind {
    Created,
    Claimed,
    StatusChanged,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineActionEvent {
    pub kind: EngineActionEventKind,
    pub engine_action_guid: String,
    pub status: EngineActionStatus,
    pub request_type: String,
    pub process_guid: Option<String>,
    pub step_guid: Option<String>,
    pub processing_engine_guid: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl EngineActionEvent {
    pub fn new(kind: EngineActionEventKind, action: &EngineAction) -> Self {
        Self {
            kind,
            engine_action_guid: action.guid.clone(),
            status: action.status,
            request_type: action.request_type.clone(),
            process_guid: action.process_guid.clone(),
            step_guid: action.step_guid.clone(),
            processing_engine_guid: action.processing_engine_guid.clone(),
            timestamp: Utc::now(),
        }
    }
}

pub struct ListenerRegistry {
    capacity: usize,
    sender: Mutex<Option<broadcast::Sender<EngineActionEvent>>>,
}

impl ListenerRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sender: Mutex::new(None),
        }
    }

    /// Subscribe to engine action events, creating the channel if needed.
    ///
    /// Concurrent first registrations serialize on the mutex, so exactly one
    /// channel is created and every caller subscribes to it.
    pub async fn register_listener(&self) -> broadcast::Receiver<EngineActionEvent> {
        let mut sender = self.sender.lock().await;
        match sender.as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(self.capacity);
                *sender = Some(tx);
                info!("👂 Engine action listener channel started");
                rx
            }
        }
    }

    /// Send an event to current listeners; a no-op when nobody has registered
    pub async fn publish(&self, event: EngineActionEvent) {
        let sender = self.sender.lock().await;
        if let Some(tx) = sender.as_ref() {
            // An error only means every receiver has gone away.
            if tx.send(event).is_err() {
                debug!("No listeners for engine action event");
            }
        }
    }

    pub async fn is_active(&self) -> bool {
        self.sender.lock().await.is_some()
    }

    pub async fn listener_count(&self) -> usize {
        self.sender
            .lock()
            .await
            .as_ref()
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Drop the channel; receivers observe `RecvError::Closed`
    pub async fn shutdown(&self) {
        if self.sender.lock().await.take().is_some() {
            info!("Engine action listener channel stopped");
        }
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use tokio::sync::broadcast::error::RecvError;

    fn action() -> EngineAction {
        EngineAction {
            guid: "ea-1".to_string(),
            qualified_name: "scan::ea-1".to_string(),
            process_guid: None,
            step_guid: None,
            request_type: "scan".to_string(),
            request_parameters: BTreeMap::new(),
            request_source_guids: vec![],
            action_target_guids: vec![],
            received_guards: BTreeSet::new(),
            previous_engine_action_guid: None,
            status: EngineActionStatus::Requested,
            processing_engine_guid: None,
            start_time: None,
            activation_time: None,
            completion_time: None,
            completion_guards: BTreeSet::new(),
            completion_message: None,
            successors_resolved: false,
            requested_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_concurrent_registration_shares_one_channel() {
        let registry = Arc::new(ListenerRegistry::new(16));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.register_listener().await }));
        }
        let mut receivers = Vec::new();
        for handle in handles {
            receivers.push(handle.await.unwrap());
        }
        assert_eq!(registry.listener_count().await, 8);

        registry
            .publish(EngineActionEvent::new(EngineActionEventKind::Created, &action()))
            .await;
        for rx in receivers.iter_mut() {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.engine_action_guid, "ea-1");
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_and_reregistration_recreates() {
        let registry = ListenerRegistry::new(4);
        let mut rx = registry.register_listener().await;
        registry.shutdown().await;
        assert!(!registry.is_active().await);
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));

        let mut rx = registry.register_listener().await;
        assert!(registry.is_active().await);
        registry
            .publish(EngineActionEvent::new(EngineActionEventKind::StatusChanged, &action()))
            .await;
        assert_eq!(rx.recv().await.unwrap().kind, EngineActionEventKind::StatusChanged);
    }

    #[tokio::test]
    async fn test_publish_without_listeners_is_noop() {
        let registry = ListenerRegistry::default();
        registry
            .publish(EngineActionEvent::new(EngineActionEventKind::Created, &action()))
            .await;
        assert!(!registry.is_active().await);
    }
}
