//! Unsolicited push streams to the event listener
//!
//! Three independent producers feed the listener: the engine log feed and two
//! periodic snapshot emitters (memory, connections). Each runs as its own
//! detached task and stops cooperatively: dropping its stop sender wakes the
//! task right away if it is waiting, otherwise it exits before the next tick.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_io::Timer;
use futures_lite::{StreamExt, future};
use serde_json::json;
use smol::channel::{Receiver, Sender};

use crate::action::{Message, MessageType};
use crate::engine::{Engine, LogEvent};
use crate::spawn::Spawner;

/// Destination of push messages
pub trait Emitter: Send + Sync + 'static {
    /// Deliver one message; silently dropped when nobody listens
    fn emit(&self, message: Message);
}

#[derive(Default)]
struct Running {
    memory: Option<Sender<()>>,
    connections: Option<Sender<()>>,
    logs: Option<Receiver<LogEvent>>,
}

pub struct PushStreams<E: Engine> {
    engine: Arc<E>,
    emitter: Arc<dyn Emitter>,
    spawner: Spawner,
    memory_interval: Duration,
    connections_interval: Duration,
    running: Mutex<Running>,
}

impl<E: Engine> PushStreams<E> {
    pub fn new(
        engine: Arc<E>,
        emitter: Arc<dyn Emitter>,
        spawner: Spawner,
        memory_interval: Duration,
        connections_interval: Duration,
    ) -> Self {
        Self {
            engine,
            emitter,
            spawner,
            memory_interval,
            connections_interval,
            running: Mutex::new(Running::default()),
        }
    }

    fn running(&self) -> MutexGuard<'_, Running> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start forwarding engine logs, replacing any previous subscription
    pub fn start_log(&self) {
        let feed = self.engine.subscribe_logs();
        if let Some(previous) = self.running().logs.replace(feed.clone()) {
            previous.close();
        }

        let emitter = Arc::clone(&self.emitter);
        self.spawner.spawn(async move {
            while let Ok(event) = feed.recv().await {
                emitter.emit(Message::new(MessageType::Log, event));
            }
        });
    }

    pub fn stop_log(&self) {
        if let Some(feed) = self.running().logs.take() {
            feed.close();
        }
    }

    /// Start the periodic memory snapshot; no-op if already running
    pub fn start_memory(&self) {
        let mut running = self.running();
        if running.memory.is_some() {
            return;
        }
        let engine = Arc::clone(&self.engine);
        let emitter = Arc::clone(&self.emitter);
        running.memory = Some(self.every(self.memory_interval, move || {
            emitter.emit(Message::new(
                MessageType::Memory,
                json!({"inuse": engine.memory()}),
            ));
        }));
    }

    pub fn stop_memory(&self) {
        self.running().memory = None;
    }

    /// Start the periodic connections snapshot; no-op if already running
    pub fn start_connections(&self) {
        let mut running = self.running();
        if running.connections.is_some() {
            return;
        }
        let engine = Arc::clone(&self.engine);
        let emitter = Arc::clone(&self.emitter);
        running.connections = Some(self.every(self.connections_interval, move || {
            emitter.emit(Message::new(MessageType::Connections, engine.connections()));
        }));
    }

    pub fn stop_connections(&self) {
        self.running().connections = None;
    }

    pub fn stop_all(&self) {
        let stopped = std::mem::take(&mut *self.running());
        if let Some(feed) = stopped.logs {
            feed.close();
        }
    }

    /// Run `tick` now and then every `period` until the returned sender drops
    fn every(&self, period: Duration, tick: impl Fn() + Send + 'static) -> Sender<()> {
        let (stop_tx, stop_rx) = smol::channel::bounded::<()>(1);
        self.spawner.spawn(async move {
            let mut timer = Timer::interval(period);
            loop {
                if stop_rx.is_closed() {
                    break;
                }
                tick();
                let next = future::or(async { timer.next().await.is_some() }, async {
                    let _ = stop_rx.recv().await;
                    false
                })
                .await;
                if !next {
                    break;
                }
            }
        });
        stop_tx
    }
}

impl<E: Engine> Drop for PushStreams<E> {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEngine, RecordingEmitter};
    use executor_core::tokio::TokioGlobal;

    fn streams(engine: Arc<FakeEngine>, emitter: Arc<RecordingEmitter>) -> PushStreams<FakeEngine> {
        PushStreams::new(
            engine,
            emitter,
            Spawner::new(TokioGlobal),
            Duration::from_millis(20),
            Duration::from_millis(10),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_memory_stream_starts_and_stops() {
        let engine = Arc::new(FakeEngine::default());
        let emitter = Arc::new(RecordingEmitter::default());
        let push = streams(engine, Arc::clone(&emitter));

        push.start_memory();
        push.start_memory();
        Timer::after(Duration::from_millis(70)).await;
        push.stop_memory();
        Timer::after(Duration::from_millis(30)).await;

        let emitted = emitter.of_type(MessageType::Memory);
        assert!(emitted.len() >= 2, "expected several ticks, got {}", emitted.len());
        // a duplicate start must not double the rate
        assert!(emitted.len() <= 5);
        assert_eq!(emitted[0].data, json!({"inuse": FakeEngine::MEMORY}));

        let settled = emitter.of_type(MessageType::Memory).len();
        Timer::after(Duration::from_millis(50)).await;
        assert_eq!(emitter.of_type(MessageType::Memory).len(), settled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connections_stream_emits_immediately() {
        let engine = Arc::new(FakeEngine::default());
        let emitter = Arc::new(RecordingEmitter::default());
        let push = streams(engine, Arc::clone(&emitter));

        push.start_connections();
        Timer::after(Duration::from_millis(5)).await;
        assert!(!emitter.of_type(MessageType::Connections).is_empty());
        push.stop_all();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_log_feed_forwards_until_stopped() {
        let engine = Arc::new(FakeEngine::default());
        let emitter = Arc::new(RecordingEmitter::default());
        let push = streams(Arc::clone(&engine), Arc::clone(&emitter));

        push.start_log();
        engine.log(crate::engine::LogLevel::Warning, "first");
        Timer::after(Duration::from_millis(20)).await;
        push.stop_log();
        engine.log(crate::engine::LogLevel::Warning, "second");
        Timer::after(Duration::from_millis(20)).await;

        let logs = emitter.of_type(MessageType::Log);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].data, json!({"level": "warning", "payload": "first"}));
    }
}
