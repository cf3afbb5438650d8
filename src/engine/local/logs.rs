//! Log fan-out from `tracing` to host subscribers

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use smol::channel::{Receiver, Sender, TrySendError};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::engine::{LogEvent, LogLevel};

/// Events buffered per subscriber before new ones are dropped
const SUBSCRIBER_CAPACITY: usize = 256;

struct Inner {
    level: AtomicU8,
    subscribers: Mutex<Vec<Sender<LogEvent>>>,
}

/// A `tracing` layer that forwards events to log subscribers
///
/// Install it next to the usual fmt layer; every event at or above the
/// configured level is delivered to each live subscriber. Subscribers whose
/// receiver was dropped are pruned on the next event.
#[derive(Clone)]
pub struct LogBroadcast {
    inner: Arc<Inner>,
}

impl LogBroadcast {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                level: AtomicU8::new(level_to_u8(LogLevel::default())),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Minimum level forwarded to subscribers
    pub fn level(&self) -> LogLevel {
        level_from_u8(self.inner.level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, level: LogLevel) {
        self.inner.level.store(level_to_u8(level), Ordering::Relaxed);
    }

    pub fn subscribe(&self) -> Receiver<LogEvent> {
        let (tx, rx) = smol::channel::bounded(SUBSCRIBER_CAPACITY);
        self.subscribers().push(tx);
        rx
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    /// Deliver one event to every live subscriber
    pub fn publish(&self, event: LogEvent) {
        if event.level < self.level() {
            return;
        }
        self.subscribers().retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        });
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Sender<LogEvent>>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LogBroadcast {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Subscriber> Layer<S> for LogBroadcast {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = LogLevel::from(event.metadata().level());
        if level < self.level() || self.subscribers().is_empty() {
            return;
        }

        let mut visitor = PayloadVisitor::default();
        event.record(&mut visitor);
        self.publish(LogEvent {
            level,
            payload: visitor.finish(),
        });
    }
}

fn level_to_u8(level: LogLevel) -> u8 {
    level as u8
}

fn level_from_u8(value: u8) -> LogLevel {
    match value {
        0 => LogLevel::Debug,
        1 => LogLevel::Info,
        2 => LogLevel::Warning,
        3 => LogLevel::Error,
        _ => LogLevel::Silent,
    }
}

/// Renders the message followed by `key=value` pairs
#[derive(Default)]
struct PayloadVisitor {
    message: String,
    fields: String,
}

impl PayloadVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }

    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl Visit for PayloadVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.push_field(field.name(), format_args!("{value}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }
}
