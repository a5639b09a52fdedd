//! Progress notification channel.
//!
//! Publishing is fire-and-forget: every subscriber runs on its own thread fed
//! by an unbounded channel, so a slow or panicking subscriber never blocks or
//! takes down the lifecycle worker.

use crate::LifecycleError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Trace,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub severity: Severity,
    pub context: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl Event {
    pub fn new(severity: Severity, context: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            context: context.to_owned(),
            message: message.into(),
            detail: None,
            at: Utc::now(),
        }
    }
}

pub trait Notify: Send + 'static {
    fn notify(&mut self, event: &Event);
}

impl<F> Notify for F
where
    F: FnMut(&Event) + Send + 'static,
{
    fn notify(&mut self, event: &Event) {
        self(event);
    }
}

enum Message {
    Event(Arc<Event>),
    Flush(Sender<()>),
}

struct Subscriber {
    tx: Sender<Message>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that mirrors every event into `tracing`.
    pub fn with_tracing() -> Self {
        let bus = Self::new();
        bus.subscribe(TracingNotifier);
        bus
    }

    pub fn subscribe(&self, mut notifier: impl Notify) {
        let (tx, rx) = mpsc::channel::<Message>();
        let handle = thread::spawn(move || {
            let mut poisoned = false;
            for message in rx {
                match message {
                    Message::Event(event) if !poisoned => {
                        let delivered =
                            catch_unwind(AssertUnwindSafe(|| notifier.notify(&event)));
                        if delivered.is_err() {
                            warn!("notification subscriber panicked; dropping its events");
                            poisoned = true;
                        }
                    }
                    Message::Event(_) => {}
                    Message::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
        self.lock().push(Subscriber { tx, handle });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, event: Event) {
        let event = Arc::new(event);
        for sub in self.lock().iter() {
            let _ = sub.tx.send(Message::Event(Arc::clone(&event)));
        }
    }

    pub fn trace(&self, context: &str, message: impl Into<String>) {
        self.publish(Event::new(Severity::Trace, context, message));
    }

    pub fn warning(&self, context: &str, message: impl Into<String>) {
        self.publish(Event::new(Severity::Warning, context, message));
    }

    pub fn error(&self, err: &LifecycleError) {
        let mut event = Event::new(Severity::Error, &err.context, &err.message);
        event.detail.clone_from(&err.output);
        self.publish(event);
    }

    /// Block until every subscriber has handled everything published so far.
    pub fn flush(&self) {
        let acks: Vec<_> = self
            .lock()
            .iter()
            .filter_map(|sub| {
                let (tx, rx) = mpsc::channel();
                sub.tx.send(Message::Flush(tx)).ok().map(|()| rx)
            })
            .collect();
        for ack in acks {
            let _ = ack.recv();
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        let subscribers = std::mem::take(&mut *self.lock());
        for Subscriber { tx, handle } in subscribers {
            drop(tx);
            let _ = handle.join();
        }
    }
}

/// Mirrors events into `tracing` at the matching level.
pub struct TracingNotifier;

impl Notify for TracingNotifier {
    fn notify(&mut self, event: &Event) {
        let detail = event.detail.as_deref().unwrap_or_default();
        match event.severity {
            Severity::Trace => info!("[{}] {}", event.context, event.message),
            Severity::Warning => warn!("[{}] {}", event.context, event.message),
            Severity::Error => error!("[{}] {} {detail}", event.context, event.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn every_subscriber_sees_every_event_in_order() {
        let bus = EventBus::new();
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&seen_a);
        let b = Arc::clone(&seen_b);
        bus.subscribe(move |e: &Event| a.lock().unwrap().push(e.message.clone()));
        bus.subscribe(move |e: &Event| b.lock().unwrap().push(e.message.clone()));

        bus.trace("attach", "one");
        bus.warning("attach", "two");
        bus.flush();

        assert_eq!(*seen_a.lock().unwrap(), vec!["one", "two"]);
        assert_eq!(*seen_b.lock().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn slow_subscriber_does_not_block_publisher() {
        let bus = EventBus::new();
        bus.subscribe(|_: &Event| thread::sleep(Duration::from_millis(200)));

        let started = std::time::Instant::now();
        for i in 0..5 {
            bus.trace("test", format!("event {i}"));
        }
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.subscribe(|_: &Event| panic!("renderer crashed"));
        bus.subscribe(move |_: &Event| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.trace("test", "a");
        bus.trace("test", "b");
        bus.flush();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn error_event_carries_tool_output() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        bus.subscribe(move |e: &Event| *s.lock().unwrap() = Some(e.clone()));

        bus.error(&LifecycleError::tool_failure("create", "diskpart failed", "raw text"));
        bus.flush();

        let event = seen.lock().unwrap().clone().unwrap();
        assert_eq!(event.severity, Severity::Error);
        assert_eq!(event.context, "create");
        assert_eq!(event.detail.as_deref(), Some("raw text"));
    }

    #[test]
    fn drop_delivers_pending_events() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let bus = EventBus::new();
            let c = Arc::clone(&count);
            bus.subscribe(move |_: &Event| {
                thread::sleep(Duration::from_millis(10));
                c.fetch_add(1, Ordering::SeqCst);
            });
            for _ in 0..3 {
                bus.trace("test", "x");
            }
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn event_serializes_without_empty_detail() {
        let json = serde_json::to_value(Event::new(Severity::Warning, "detach", "slow")).unwrap();
        assert_eq!(json["severity"], "warning");
        assert_eq!(json["context"], "detach");
        assert!(json.get("detail").is_none());
        assert!(json["at"].is_string());
    }
}
