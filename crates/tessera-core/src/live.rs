//! In-memory live queries: mutation results are matched against each
//! subscription's selector and pushed to its channel.

use crate::query::Selector;
use crate::schema::RPERM_FIELD;
use crate::validator::Auth;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveEvent {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveMessage {
    pub subscription: u64,
    pub event: LiveEvent,
    pub class_name: String,
    pub object: Value,
}

struct Subscription {
    class_name: String,
    filter: Selector,
    auth: Auth,
    sender: mpsc::Sender<LiveMessage>,
}

impl Subscription {
    fn wants(&self, class_name: &str, object: &Value) -> bool {
        self.class_name == class_name && readable(&self.auth, object) && self.filter.eval(object)
    }
}

/// `_rperm` of the object intersects the caller's tokens.
fn readable(auth: &Auth, object: &Value) -> bool {
    if auth.master {
        return true;
    }
    match object.get(RPERM_FIELD) {
        Some(Value::Array(acl)) => {
            let tokens = auth.tokens();
            acl.iter()
                .filter_map(Value::as_str)
                .any(|entry| tokens.iter().any(|t| t == entry))
        }
        // not projected: the mutation already passed the ACL filter
        None => true,
        Some(_) => false,
    }
}

pub struct LiveHub {
    next_id: AtomicU64,
    buffer: usize,
    subscriptions: RwLock<HashMap<u64, Subscription>>,
}

impl Default for LiveHub {
    fn default() -> Self {
        LiveHub::new(64)
    }
}

impl LiveHub {
    /// `buffer` bounds the undelivered messages per subscription.
    pub fn new(buffer: usize) -> Self {
        LiveHub {
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(
        &self,
        class_name: impl Into<String>,
        filter: Selector,
        auth: Auth,
    ) -> (u64, mpsc::Receiver<LiveMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.buffer);
        self.subscriptions.write().insert(
            id,
            Subscription {
                class_name: class_name.into(),
                filter: filter.simplify(),
                auth,
                sender,
            },
        );
        (id, receiver)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.subscriptions.write().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }

    /// Delivers `objects` to every matching subscription without waiting.
    /// Returns the number of messages queued.
    pub fn publish(&self, event: LiveEvent, class_name: &str, objects: &[Value]) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let subscriptions = self.subscriptions.read();
            for (id, sub) in subscriptions.iter() {
                for object in objects.iter().filter(|o| sub.wants(class_name, o)) {
                    let message = LiveMessage {
                        subscription: *id,
                        event,
                        class_name: class_name.to_string(),
                        object: object.clone(),
                    };
                    match sub.sender.try_send(message) {
                        Ok(()) => delivered += 1,
                        Err(TrySendError::Full(_)) => {
                            tracing::warn!("live subscription {id} is lagging, dropped a {event:?} event");
                        }
                        Err(TrySendError::Closed(_)) => {
                            closed.push(*id);
                            break;
                        }
                    }
                }
            }
        }
        if !closed.is_empty() {
            let mut subscriptions = self.subscriptions.write();
            for id in closed {
                subscriptions.remove(&id);
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn selector(raw: Value) -> Selector {
        Selector::decode(&raw, false).unwrap()
    }

    #[tokio::test]
    async fn matching_objects_are_delivered() {
        let hub = LiveHub::new(8);
        let (id, mut rx) = hub.subscribe("Note", selector(json!({"pinned": true})), Auth::anonymous());
        let sent = hub.publish(
            LiveEvent::Create,
            "Note",
            &[
                json!({"_id": "a", "pinned": true, "_rperm": ["*"]}),
                json!({"_id": "b", "pinned": false, "_rperm": ["*"]}),
            ],
        );
        assert_eq!(sent, 1);
        let message = rx.recv().await.unwrap();
        assert_eq!(message.subscription, id);
        assert_eq!(message.event, LiveEvent::Create);
        assert_eq!(message.object["_id"], json!("a"));
        assert_eq!(hub.publish(LiveEvent::Create, "Tag", &[json!({"pinned": true})]), 0);
    }

    #[test]
    fn read_acl_is_enforced() {
        let hub = LiveHub::new(8);
        let (_, _anon) = hub.subscribe("Note", Selector::truth(), Auth::anonymous());
        let (_, _owner) = hub.subscribe("Note", Selector::truth(), Auth::user("u1", vec![]));
        let sent = hub.publish(LiveEvent::Update, "Note", &[json!({"_id": "a", "_rperm": ["u1"]})]);
        assert_eq!(sent, 1);
    }

    #[test]
    fn closed_and_removed_subscriptions_are_dropped() {
        let hub = LiveHub::new(1);
        let (id, rx) = hub.subscribe("Note", Selector::truth(), Auth::master());
        let (kept, _rx) = hub.subscribe("Note", Selector::truth(), Auth::master());
        drop(rx);
        hub.publish(LiveEvent::Delete, "Note", &[json!({"_id": "a"})]);
        assert_eq!(hub.len(), 1);
        assert!(!hub.unsubscribe(id));
        assert!(hub.unsubscribe(kept));
        assert!(hub.is_empty());
    }
}
