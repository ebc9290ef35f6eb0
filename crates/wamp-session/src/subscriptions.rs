//! Topic subscriptions and event fan-out.
//!
//! One [`Subscription`] per topic holds the listeners currently interested in
//! it. The registry only tracks state; the session decides which wire
//! messages follow from a change (SUBSCRIBE when a topic is created,
//! UNSUBSCRIBE when it is removed).

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Weak;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::prefix::PrefixTable;
use crate::session::SessionInner;

/// Identifies one listener across all topics.
pub type ListenerId = u64;

/// One topic's live interest.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    listeners: HashMap<ListenerId, mpsc::UnboundedSender<Value>>,
}

impl Subscription {
    fn new(topic: String) -> Self {
        Self {
            topic,
            listeners: HashMap::new(),
        }
    }

    /// Topic URI (full form).
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Deliver `event` to every listener, returning how many accepted it.
    fn deliver(&self, event: &Value) -> usize {
        self.listeners
            .values()
            .filter(|tx| tx.send(event.clone()).is_ok())
            .count()
    }
}

/// Result of adding a listener.
#[derive(Debug)]
pub struct Registration {
    /// ID of the new listener.
    pub listener: ListenerId,
    /// Events routed to the new listener.
    pub events: mpsc::UnboundedReceiver<Value>,
    /// Whether the topic had no live subscription before.
    pub created: bool,
}

/// Result of removing a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerRemoval {
    /// The topic or listener was not registered.
    NotFound,
    /// The listener was removed; others remain.
    Removed,
    /// The last listener was removed and the topic with it.
    TopicEmptied,
}

/// Live subscriptions keyed by full topic URI.
///
/// Callers expand `prefix:suffix` references before registering.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    topics: HashMap<String, Subscription>,
    next_listener: ListenerId,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener for `topic`, creating the subscription if needed.
    pub fn add_listener(&mut self, topic: &str) -> Registration {
        let created = !self.topics.contains_key(topic);
        let subscription = self
            .topics
            .entry(topic.to_owned())
            .or_insert_with(|| Subscription::new(topic.to_owned()));

        self.next_listener += 1;
        let listener = self.next_listener;
        let (tx, events) = mpsc::unbounded_channel();
        let _ = subscription.listeners.insert(listener, tx);

        trace!(topic, listener, created, "listener added");
        Registration {
            listener,
            events,
            created,
        }
    }

    /// Remove one listener. Removing the last listener removes the topic.
    pub fn remove_listener(&mut self, topic: &str, listener: ListenerId) -> ListenerRemoval {
        let Some(subscription) = self.topics.get_mut(topic) else {
            return ListenerRemoval::NotFound;
        };
        if subscription.listeners.remove(&listener).is_none() {
            return ListenerRemoval::NotFound;
        }
        if subscription.listeners.is_empty() {
            let _ = self.topics.remove(topic);
            ListenerRemoval::TopicEmptied
        } else {
            ListenerRemoval::Removed
        }
    }

    /// Remove the whole subscription for `topic`, closing every listener.
    ///
    /// Returns `false` if there was no live subscription.
    pub fn unsubscribe(&mut self, topic: &str) -> bool {
        self.topics.remove(topic).is_some()
    }

    /// Route an inbound event.
    ///
    /// `raw_topic` is expanded through `prefixes` before lookup. Events for
    /// topics nobody subscribed to are dropped. Returns the number of
    /// listeners reached.
    pub fn dispatch_event(&self, raw_topic: &str, event: &Value, prefixes: &PrefixTable) -> usize {
        let topic = prefixes.expand(raw_topic);
        self.topics
            .get(&topic)
            .map_or(0, |subscription| subscription.deliver(event))
    }

    /// Whether `topic` has a live subscription.
    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Subscription for `topic`, if live.
    pub fn get(&self, topic: &str) -> Option<&Subscription> {
        self.topics.get(topic)
    }

    /// Live topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    /// Whether there are no live subscriptions.
    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Drop every subscription, closing all listeners.
    pub fn clear(&mut self) {
        self.topics.clear();
    }
}

/// A caller's handle on a topic, decoding events to `T`.
///
/// Dropping the handle removes its listener; dropping the last handle for a
/// topic unsubscribes the topic.
pub struct Subscriber<T> {
    topic: String,
    listener: ListenerId,
    events: mpsc::UnboundedReceiver<Value>,
    session: Weak<SessionInner>,
    _event: PhantomData<fn() -> T>,
}

impl<T> Subscriber<T> {
    pub(crate) fn new(
        topic: String,
        registration: Registration,
        session: Weak<SessionInner>,
    ) -> Self {
        Self {
            topic,
            listener: registration.listener,
            events: registration.events,
            session,
            _event: PhantomData,
        }
    }

    /// Full topic URI this handle listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl<T: DeserializeOwned> Subscriber<T> {
    /// Wait for the next event.
    ///
    /// Returns `None` once the topic has been unsubscribed or the session is
    /// gone.
    pub async fn recv(&mut self) -> Option<Result<T, serde_json::Error>> {
        self.events.recv().await.map(serde_json::from_value)
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Result<T, serde_json::Error>> {
        self.events.try_recv().ok().map(serde_json::from_value)
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.topic)
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.release_listener(&self.topic, self.listener);
        }
    }
}
