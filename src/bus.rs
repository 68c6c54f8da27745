//! A small topic → handlers event bus used internally to fan out config
//! reload events (`config::diff::ConfigEvent`) to the handlers in
//! `daemon`. Dispatch is synchronous and runs in the caller's task — a
//! reload blocks on every handler in turn — matching `MailLaser`'s own
//! callback-style webhook dispatch rather than reaching for a channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::config::diff::ConfigEvent;

pub type HandlerId = u64;

type Handler = Box<dyn Fn(&ConfigEvent) + Send + Sync>;

struct Subscriber {
    id: HandlerId,
    handler: Handler,
}

/// Topic → subscriber list dispatcher. Unknown topics are simply ignored —
/// there is no registration step for a topic, only for handlers.
pub struct EventBus {
    subscribers: Mutex<HashMap<&'static str, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus::default()
    }

    /// Registers `handler` for `topic`, returning an id `unsubscribe` can
    /// use to remove it later.
    pub fn subscribe(
        &self,
        topic: &'static str,
        handler: impl Fn(&ConfigEvent) + Send + Sync + 'static,
    ) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap()
            .entry(topic)
            .or_default()
            .push(Subscriber {
                id,
                handler: Box::new(handler),
            });
        id
    }

    pub fn unsubscribe(&self, topic: &'static str, id: HandlerId) {
        if let Some(handlers) = self.subscribers.lock().unwrap().get_mut(topic) {
            handlers.retain(|s| s.id != id);
        }
    }

    /// Synchronously runs every handler subscribed to `event.topic()`, in
    /// subscription order.
    pub fn publish(&self, event: &ConfigEvent) {
        let topic = event.topic();
        let guard = self.subscribers.lock().unwrap();
        if let Some(handlers) = guard.get(topic) {
            for sub in handlers {
                (sub.handler)(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, LogLevel};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn app_config() -> AppConfig {
        AppConfig {
            pid_file: "/var/run/maild.pid".into(),
            log_file: "stderr".into(),
            log_level: LogLevel::Info,
            allowed_hosts: HashSet::new(),
            backend_config: Default::default(),
            servers: vec![],
        }
    }

    #[test]
    fn dispatches_to_matching_topic_only() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        bus.subscribe("config.pid_file", move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&ConfigEvent::LogFile(app_config()));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        bus.publish(&ConfigEvent::PidFile(app_config()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_future_dispatch() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let id = bus.subscribe("config.pid_file", move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&ConfigEvent::PidFile(app_config()));
        bus.unsubscribe("config.pid_file", id);
        bus.publish(&ConfigEvent::PidFile(app_config()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_on_unknown_topic_is_a_no_op() {
        let bus = EventBus::new();
        bus.publish(&ConfigEvent::PidFile(app_config()));
    }
}
