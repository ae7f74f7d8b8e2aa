//! Application-level events.
//!
//! Unlike document change events, these carry user interactions (a button
//! click, a selection gesture) that are forwarded to the server as `EVENT`
//! messages and dispatched locally to subscribed models.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::model::{ModelId, ModelRef};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEvent {
    pub event_name: String,
    /// Target model. Events without one go to every subscriber.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<ModelId>,
    #[serde(default)]
    pub event_values: Json,
}

impl ModelEvent {
    pub fn new(event_name: impl Into<String>, event_values: Json) -> Self {
        Self {
            event_name: event_name.into(),
            model_id: None,
            event_values,
        }
    }

    pub fn for_model(mut self, model_id: ModelId) -> Self {
        self.model_id = Some(model_id);
        self
    }
}

pub type EventSender = Arc<dyn Fn(&ModelEvent) + Send + Sync>;

/// Per-document event routing.
///
/// Outgoing events go through the sender installed by the client session;
/// incoming ones are delivered to the models that subscribed.
#[derive(Default)]
pub struct EventManager {
    sender: Mutex<Option<EventSender>>,
    subscribed: Mutex<HashSet<ModelId>>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sender(&self, sender: Option<EventSender>) {
        *self.sender.lock() = sender;
    }

    pub fn has_sender(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Forward an event to the session. Returns `false` when no session is
    /// attached.
    pub fn send_event(&self, event: &ModelEvent) -> bool {
        let sender = self.sender.lock().clone();
        match sender {
            Some(send) => {
                send(event);
                true
            }
            None => {
                log::debug!("No session attached, dropping event {}", event.event_name);
                false
            }
        }
    }

    pub fn subscribe(&self, model_id: ModelId) {
        self.subscribed.lock().insert(model_id);
    }

    pub fn unsubscribe(&self, model_id: &ModelId) {
        self.subscribed.lock().remove(model_id);
    }

    pub fn is_subscribed(&self, model_id: &ModelId) -> bool {
        self.subscribed.lock().contains(model_id)
    }

    /// Deliver `event` to subscribed models that `lookup` can find,
    /// restricted to the event's target when it names one.
    pub fn trigger<F>(&self, event: &ModelEvent, lookup: F)
    where
        F: Fn(&ModelId) -> Option<ModelRef>,
    {
        let targets: Vec<ModelId> = self
            .subscribed
            .lock()
            .iter()
            .filter(|id| event.model_id.as_ref().is_none_or(|target| target == *id))
            .cloned()
            .collect();
        for id in targets {
            if let Some(model) = lookup(&id) {
                model.process_event(event);
            }
        }
    }
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("has_sender", &self.has_sender())
            .field("subscribed", &self.subscribed.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelRegistry;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_send_without_session() {
        let manager = EventManager::new();
        assert!(!manager.send_event(&ModelEvent::new("tap", json!({}))));
    }

    #[test]
    fn test_send_through_sender() {
        let manager = EventManager::new();
        let sent = Arc::new(AtomicUsize::new(0));
        let s = sent.clone();
        manager.set_sender(Some(Arc::new(move |event: &ModelEvent| {
            assert_eq!(event.event_name, "tap");
            s.fetch_add(1, Ordering::SeqCst);
        })));
        assert!(manager.send_event(&ModelEvent::new("tap", json!({"x": 1}))));
        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trigger_respects_target() {
        let registry = ModelRegistry::with_builtins();
        let a = registry.create("Model").unwrap();
        let b = registry.create("Model").unwrap();
        let models: HashMap<ModelId, ModelRef> = [a.clone(), b.clone()]
            .into_iter()
            .map(|m| (m.id().clone(), m))
            .collect();

        let hits_a = Arc::new(AtomicUsize::new(0));
        let hits_b = Arc::new(AtomicUsize::new(0));
        let (ha, hb) = (hits_a.clone(), hits_b.clone());
        let _sa = a.on_event(move |_| {
            ha.fetch_add(1, Ordering::SeqCst);
        });
        let _sb = b.on_event(move |_| {
            hb.fetch_add(1, Ordering::SeqCst);
        });

        let manager = EventManager::new();
        manager.subscribe(a.id().clone());
        manager.subscribe(b.id().clone());

        manager.trigger(&ModelEvent::new("reset", json!(null)), |id| models.get(id).cloned());
        manager.trigger(
            &ModelEvent::new("tap", json!(null)).for_model(a.id().clone()),
            |id| models.get(id).cloned(),
        );

        assert_eq!(hits_a.load(Ordering::SeqCst), 2);
        assert_eq!(hits_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_json_shape() {
        let event = ModelEvent::new("tap", json!({"sx": 3})).for_model(ModelId::from("m1"));
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event_name": "tap", "model_id": "m1", "event_values": {"sx": 3}})
        );
    }
}
