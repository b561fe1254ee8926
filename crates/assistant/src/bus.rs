use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::frame::WireMessage;

/// Names under which application events are published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Connected,
    Disconnected,
    Reconnecting,
    MessagesObtained,
    MessageUpdated,
    MessageCompleted,
    InProgress,
    Error,
    MessageAdd,
}

impl EventName {
    pub const ALL: [EventName; 9] = [
        Self::Connected,
        Self::Disconnected,
        Self::Reconnecting,
        Self::MessagesObtained,
        Self::MessageUpdated,
        Self::MessageCompleted,
        Self::InProgress,
        Self::Error,
        Self::MessageAdd,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::MessagesObtained => "messagesObtained",
            Self::MessageUpdated => "messageUpdated",
            Self::MessageCompleted => "messageCompleted",
            Self::InProgress => "inProgress",
            Self::Error => "error",
            Self::MessageAdd => "messageAdd",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Why the connection ended for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The caller asked to disconnect.
    ClientRequested,
    /// Every automatic reconnection attempt failed.
    RetriesExhausted { attempts: u32 },
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientRequested => formatter.write_str("Disconnected by client"),
            Self::RetriesExhausted { .. } => formatter.write_str("Max reconnect attempts reached"),
        }
    }
}

/// Application event with its detail payload.
#[derive(Debug, Clone, PartialEq)]
pub enum AssistantEvent {
    Connected,
    Disconnected { reason: DisconnectReason },
    Reconnecting { attempt: u32, delay: Duration },
    MessagesObtained { message: Option<WireMessage> },
    MessageUpdated { text: String },
    MessageCompleted,
    InProgress,
    Error { error: String },
    /// Published locally once a user message was handed to the transport.
    MessageAdd { text: String },
}

impl AssistantEvent {
    pub fn name(&self) -> EventName {
        match self {
            Self::Connected => EventName::Connected,
            Self::Disconnected { .. } => EventName::Disconnected,
            Self::Reconnecting { .. } => EventName::Reconnecting,
            Self::MessagesObtained { .. } => EventName::MessagesObtained,
            Self::MessageUpdated { .. } => EventName::MessageUpdated,
            Self::MessageCompleted => EventName::MessageCompleted,
            Self::InProgress => EventName::InProgress,
            Self::Error { .. } => EventName::Error,
            Self::MessageAdd { .. } => EventName::MessageAdd,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

pub type EventHandler = Arc<dyn Fn(&AssistantEvent) + Send + Sync>;

#[derive(Clone, Default)]
struct Registry {
    handlers: HashMap<EventName, Vec<(SubscriptionId, EventHandler)>>,
}

struct BusInner {
    registry: ArcSwap<Registry>,
    next_id: AtomicU64,
}

/// Publish/subscribe registry keyed by [`EventName`].
///
/// Publishing works on a snapshot of the registry, so handlers may subscribe,
/// unsubscribe or publish from inside a callback. Handlers for one name run
/// synchronously in registration order. Handlers must not panic; the bus does not
/// isolate one handler's failure from the rest.
///
/// Publishes are not serialized across callers. [`AssistantService`] publishes
/// connection and frame events from its driver task, but send failures and
/// `messageAdd` from the thread that called `send_*`, so one handler may run on two
/// threads at once. Handlers guard shared state themselves, for example with a
/// `Mutex` as the conversation store does.
///
/// [`AssistantService`]: crate::service::AssistantService
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.registry.load();
        let counts = EventName::ALL
            .iter()
            .filter_map(|name| {
                let count = registry.handlers.get(name).map_or(0, Vec::len);
                (count > 0).then_some((name.as_str(), count))
            })
            .collect::<Vec<_>>();
        formatter
            .debug_struct("EventBus")
            .field("handlers", &counts)
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: ArcSwap::from_pointee(Registry::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe<F>(&self, name: EventName, handler: F) -> SubscriptionId
    where
        F: Fn(&AssistantEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: EventHandler = Arc::new(handler);
        self.inner.registry.rcu(|current| {
            let mut next = Registry::clone(current);
            next.handlers
                .entry(name)
                .or_default()
                .push((id, Arc::clone(&handler)));
            next
        });
        id
    }

    /// Like [`EventBus::subscribe`], but the handler is removed when the guard drops.
    pub fn subscribe_scoped<F>(&self, name: EventName, handler: F) -> Subscription
    where
        F: Fn(&AssistantEvent) + Send + Sync + 'static,
    {
        let id = self.subscribe(name, handler);
        Subscription {
            bus: Arc::downgrade(&self.inner),
            name,
            id,
        }
    }

    /// Removes exactly one handler. Returns false when it was not registered.
    pub fn unsubscribe(&self, name: EventName, id: SubscriptionId) -> bool {
        Self::remove(&self.inner, name, id)
    }

    pub fn publish(&self, event: &AssistantEvent) {
        let registry = self.inner.registry.load_full();
        let Some(handlers) = registry.handlers.get(&event.name()) else {
            return;
        };

        for (_, handler) in handlers {
            handler(event);
        }
    }

    pub fn handler_count(&self, name: EventName) -> usize {
        self.inner
            .registry
            .load()
            .handlers
            .get(&name)
            .map_or(0, Vec::len)
    }

    fn remove(inner: &BusInner, name: EventName, id: SubscriptionId) -> bool {
        let mut removed = false;
        inner.registry.rcu(|current| {
            let mut next = Registry::clone(current);
            removed = false;
            if let Some(handlers) = next.handlers.get_mut(&name) {
                let before = handlers.len();
                handlers.retain(|(registered, _)| *registered != id);
                removed = handlers.len() != before;
                if handlers.is_empty() {
                    next.handlers.remove(&name);
                }
            }
            next
        });
        removed
    }
}

/// Scoped registration; unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    bus: Weak<BusInner>,
    name: EventName,
    id: SubscriptionId,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn name(&self) -> EventName {
        self.name
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Subscription")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            EventBus::remove(&inner, self.name, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> EventHandler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |label: &'static str| -> EventHandler {
                let log = Arc::clone(&log);
                Arc::new(move |event: &AssistantEvent| {
                    log.lock()
                        .unwrap()
                        .push(format!("{label}:{}", event.name()));
                })
            }
        };
        (log, make)
    }

    #[test]
    fn handlers_run_once_each_in_registration_order() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let first = make("first");
        let second = make("second");
        bus.subscribe(EventName::Connected, move |event| first(event));
        bus.subscribe(EventName::Connected, move |event| second(event));

        bus.publish(&AssistantEvent::Connected);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:connected".to_string(), "second:connected".to_string()]
        );
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(&AssistantEvent::MessageCompleted);
        assert_eq!(bus.handler_count(EventName::MessageCompleted), 0);
    }

    #[test]
    fn handlers_only_see_their_own_name() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let handler = make("error");
        bus.subscribe(EventName::Error, move |event| handler(event));

        bus.publish(&AssistantEvent::InProgress);
        bus.publish(&AssistantEvent::error("boom"));

        assert_eq!(*log.lock().unwrap(), vec!["error:error".to_string()]);
    }

    #[test]
    fn unsubscribe_removes_exactly_that_handler() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let keep = make("keep");
        let drop_me = make("drop");
        bus.subscribe(EventName::InProgress, move |event| keep(event));
        let removed = bus.subscribe(EventName::InProgress, move |event| drop_me(event));

        assert!(bus.unsubscribe(EventName::InProgress, removed));
        assert!(!bus.unsubscribe(EventName::InProgress, removed));
        assert!(!bus.unsubscribe(EventName::Connected, SubscriptionId(999)));

        bus.publish(&AssistantEvent::InProgress);
        assert_eq!(*log.lock().unwrap(), vec!["keep:inProgress".to_string()]);
    }

    #[test]
    fn late_subscriber_misses_earlier_publication() {
        let bus = EventBus::new();
        bus.publish(&AssistantEvent::Connected);

        let (log, make) = recorder();
        let handler = make("late");
        bus.subscribe(EventName::Connected, move |event| handler(event));

        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn scoped_subscription_releases_on_drop() {
        let bus = EventBus::new();
        let guard = bus.subscribe_scoped(EventName::MessageUpdated, |_| {});
        assert_eq!(bus.handler_count(EventName::MessageUpdated), 1);

        drop(guard);
        assert_eq!(bus.handler_count(EventName::MessageUpdated), 0);
    }

    #[test]
    fn handler_may_subscribe_while_publishing() {
        let bus = EventBus::new();
        let inner_bus = bus.clone();
        bus.subscribe(EventName::Connected, move |_| {
            inner_bus.subscribe(EventName::Connected, |_| {});
        });

        bus.publish(&AssistantEvent::Connected);
        assert_eq!(bus.handler_count(EventName::Connected), 2);
    }

    #[test]
    fn publishes_from_several_threads_reach_every_handler() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let handler = make("error");
        bus.subscribe(EventName::Error, move |event| handler(event));

        let publishers = (0..4)
            .map(|_| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        bus.publish(&AssistantEvent::error("Not connected to server"));
                    }
                })
            })
            .collect::<Vec<_>>();
        for publisher in publishers {
            publisher.join().unwrap();
        }

        assert_eq!(log.lock().unwrap().len(), 100);
    }
}
