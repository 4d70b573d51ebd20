//! Event dispatcher
//!
//! Publish/subscribe registry with one-shot and recurring subscriptions
//! plus a wait-for-event primitive.
//!
//! Callbacks run as independent tasks, never sequentially awaited, so a
//! slow subscriber cannot delay delivery to the others. One-shot
//! subscriptions leave the registry before their callback is invoked,
//! which makes duplicate delivery impossible even when a callback
//! re-enters `emit`.

use super::parser::resolve_alias;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

/// Boxed async event callback.
pub type EventCallback = Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Handle identifying one subscription, for targeted removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Dispatch errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// `wait_for` elapsed without the event firing; distinct from an
    /// event that fired with an empty payload
    #[error("Timed out waiting for event `{0}`")]
    Timeout(String),

    /// The pending subscription was removed before the event fired
    #[error("Subscription for `{0}` was dropped before the event fired")]
    SubscriptionDropped(String),
}

struct Subscription {
    id: u64,
    callback: EventCallback,
    recurring: bool,
}

/// Publish/subscribe registry for gateway events.
///
/// Event names are canonicalized through the alias table on every
/// registration and lookup, so `"message"` and `"message_create"`
/// address the same subscription list.
#[derive(Default)]
pub struct EventDispatcher {
    subscriptions: Mutex<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a recurring callback for an event.
    pub fn on<F, Fut>(&self, event: &str, callback: F) -> SubscriptionId
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(event, Arc::new(move |value| Box::pin(callback(value))), true)
    }

    /// Register a callback that fires at most once.
    pub fn once<F, Fut>(&self, event: &str, callback: F) -> SubscriptionId
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(event, Arc::new(move |value| Box::pin(callback(value))), false)
    }

    /// Register a pre-boxed callback.
    ///
    /// Callback invocability is enforced by the signature, so a bad
    /// registration fails at compile time rather than at dispatch time.
    pub fn subscribe(&self, event: &str, callback: EventCallback, recurring: bool) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = resolve_alias(event).to_string();

        self.subscriptions.lock().entry(key).or_default().push(Subscription {
            id,
            callback,
            recurring,
        });

        SubscriptionId(id)
    }

    /// Remove one subscription by handle. Returns whether it was present.
    pub fn unsubscribe(&self, event: &str, id: SubscriptionId) -> bool {
        let key = resolve_alias(event);
        let mut subscriptions = self.subscriptions.lock();

        let Some(list) = subscriptions.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|sub| sub.id != id.0);
        let removed = list.len() != before;
        if list.is_empty() {
            subscriptions.remove(key);
        }
        removed
    }

    /// Remove every subscription, or only those for one event.
    pub fn unsubscribe_all(&self, event: Option<&str>) {
        let mut subscriptions = self.subscriptions.lock();
        match event {
            Some(event) => {
                subscriptions.remove(resolve_alias(event));
            }
            None => subscriptions.clear(),
        }
    }

    /// Number of live subscriptions for an event.
    #[must_use]
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscriptions
            .lock()
            .get(resolve_alias(event))
            .map_or(0, Vec::len)
    }

    /// Emit an event, spawning each callback into the supplied scope.
    ///
    /// The scope owner decides the callbacks' lifetime: dropping or
    /// shutting down the scope cancels any still-running callbacks.
    pub fn emit_in(&self, scope: &mut JoinSet<()>, event: &str, payload: &Value) {
        for callback in self.take_callbacks(event) {
            let payload = payload.clone();
            scope.spawn(callback(payload));
        }
    }

    /// Emit an event, spawning each callback as a detached task.
    pub fn emit(&self, event: &str, payload: &Value) {
        for callback in self.take_callbacks(event) {
            let payload = payload.clone();
            tokio::spawn(callback(payload));
        }
    }

    /// Collect callbacks to run, removing one-shot entries from the
    /// registry before any of them is invoked.
    fn take_callbacks(&self, event: &str) -> Vec<EventCallback> {
        let key = resolve_alias(event);
        let mut subscriptions = self.subscriptions.lock();

        let Some(list) = subscriptions.get_mut(key) else {
            return Vec::new();
        };

        let mut callbacks = Vec::with_capacity(list.len());
        let mut index = 0;
        while index < list.len() {
            if list[index].recurring {
                callbacks.push(Arc::clone(&list[index].callback));
                index += 1;
            } else {
                callbacks.push(list.remove(index).callback);
            }
        }
        if list.is_empty() {
            subscriptions.remove(key);
        }
        callbacks
    }

    /// Suspend until `event` fires, returning its payload.
    ///
    /// A timeout is reported as [`DispatchError::Timeout`], never as an
    /// absent value.
    pub async fn wait_for(&self, event: &str, timeout: Duration) -> Result<Value, DispatchError> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));

        let id = self.subscribe(
            event,
            Arc::new(move |value| {
                let tx = tx.lock().take();
                Box::pin(async move {
                    if let Some(tx) = tx {
                        let _ = tx.send(value);
                    }
                })
            }),
            false,
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(DispatchError::SubscriptionDropped(event.to_string())),
            Err(_) => {
                self.unsubscribe(event, id);
                Err(DispatchError::Timeout(event.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> impl Fn(Value) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static {
        let counter = Arc::clone(counter);
        move |_| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    async fn settle() {
        // Let spawned callbacks run
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_recurring_subscription_fires_every_emit() {
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.on("message_create", {
            let counter = Arc::clone(&counter);
            move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        dispatcher.emit("message_create", &Value::Null);
        dispatcher.emit("message_create", &Value::Null);
        settle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_one_shot_fires_exactly_once() {
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.subscribe("ready", Arc::new(counting_callback(&counter)), false);

        dispatcher.emit("ready", &Value::Null);
        dispatcher.emit("ready", &Value::Null);
        settle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_one_shot_removed_before_callback_runs() {
        // The registry entry must be gone by the time the callback is
        // scheduled; a second emit issued immediately finds nothing
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.subscribe("ready", Arc::new(counting_callback(&counter)), false);

        dispatcher.emit("ready", &Value::Null);
        assert_eq!(dispatcher.subscriber_count("ready"), 0);
    }

    #[tokio::test]
    async fn test_alias_subscribe_and_emit_meet() {
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        // Subscribe with the friendly name, emit with the canonical one
        dispatcher.subscribe("message", Arc::new(counting_callback(&counter)), true);
        dispatcher.emit("message_create", &Value::Null);

        // And the other way around
        dispatcher.emit("message", &Value::Null);
        settle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_by_handle() {
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let id = dispatcher.subscribe("typing_start", Arc::new(counting_callback(&counter)), true);

        assert!(dispatcher.unsubscribe("typing", id));
        assert!(!dispatcher.unsubscribe("typing_start", id));

        dispatcher.emit("typing_start", &Value::Null);
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_all_scoped_and_global() {
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.subscribe("guild_create", Arc::new(counting_callback(&counter)), true);
        dispatcher.subscribe("guild_delete", Arc::new(counting_callback(&counter)), true);

        dispatcher.unsubscribe_all(Some("guild_create"));
        assert_eq!(dispatcher.subscriber_count("guild_create"), 0);
        assert_eq!(dispatcher.subscriber_count("guild_delete"), 1);

        dispatcher.unsubscribe_all(None);
        assert_eq!(dispatcher.subscriber_count("guild_delete"), 0);
    }

    #[tokio::test]
    async fn test_emit_in_scope_owns_callbacks() {
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));
        dispatcher.subscribe("message_create", Arc::new(counting_callback(&counter)), true);

        let mut scope = JoinSet::new();
        dispatcher.emit_in(&mut scope, "message_create", &serde_json::json!({"id": "1"}));
        while scope.join_next().await.is_some() {}

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_for_receives_payload() {
        let dispatcher = Arc::new(EventDispatcher::new());

        let waiter = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .wait_for("ready", Duration::from_secs(1))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.emit("ready", &serde_json::json!({"session_id": "abc"}));

        let value = waiter.await.unwrap().unwrap();
        assert_eq!(value["session_id"], "abc");
        // The transient subscription is gone
        assert_eq!(dispatcher.subscriber_count("ready"), 0);
    }

    #[tokio::test]
    async fn test_wait_for_timeout_is_distinct_error() {
        let dispatcher = EventDispatcher::new();
        let err = dispatcher
            .wait_for("never_fires", Duration::from_millis(30))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Timeout(_)));
        // The timed-out transient subscription must not leak
        assert_eq!(dispatcher.subscriber_count("never_fires"), 0);
    }

    #[tokio::test]
    async fn test_slow_callback_does_not_delay_others() {
        let dispatcher = EventDispatcher::new();
        let counter = Arc::new(AtomicUsize::new(0));

        dispatcher.on("message_create", |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        dispatcher.subscribe("message_create", Arc::new(counting_callback(&counter)), true);

        dispatcher.emit("message_create", &Value::Null);
        settle().await;

        // The fast callback completed while the slow one is still parked
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
