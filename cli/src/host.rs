//! In-process stand-in for the host app

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use smol::channel::{Receiver, Sender};

use conduit::{Action, ActionResult, Bridge, Callback, HostHandle, LocalEngine};

use crate::config::MergedConfig;
use crate::error::{CliResult, ensure_success};

pub type HostBridge = Bridge<LocalEngine, ChannelHandle>;

/// An envelope the bridge delivered to the host
#[derive(Debug)]
pub enum Envelope {
    Reply(String),
    Push(String),
}

/// Host handle that forwards every delivery into a channel
pub struct ChannelHandle {
    tx: Sender<Envelope>,
    push: bool,
}

impl ChannelHandle {
    /// Handle for the response to one command
    pub fn reply(tx: Sender<Envelope>) -> Self {
        Self { tx, push: false }
    }

    /// Handle for the event listener
    pub fn listener(tx: Sender<Envelope>) -> Self {
        Self { tx, push: true }
    }
}

impl HostHandle for ChannelHandle {
    fn release(&self) {
        tracing::trace!(push = self.push, "host handle released");
    }
}

impl Callback for ChannelHandle {
    fn invoke(&self, payload: &str) {
        let envelope = if self.push {
            Envelope::Push(payload.to_string())
        } else {
            Envelope::Reply(payload.to_string())
        };
        // unbounded, so this only fails once the receiver is gone
        let _ = self.tx.try_send(envelope);
    }
}

pub fn create_bridge(config: &MergedConfig, logs: conduit::LogBroadcast) -> Arc<HostBridge> {
    let engine = Arc::new(LocalEngine::new(logs));
    Arc::new(Bridge::builder(engine).config(config.bridge.clone()).build())
}

/// Send one command and wait for its response
pub async fn call(bridge: &HostBridge, action: &Action) -> CliResult<ActionResult> {
    let (tx, rx) = smol::channel::unbounded();
    let bytes = serde_json::to_vec(action)?;
    bridge.invoke_action(ChannelHandle::reply(tx), &bytes);
    next_reply(&rx).await
}

async fn next_reply(rx: &Receiver<Envelope>) -> CliResult<ActionResult> {
    loop {
        match rx.recv().await.context("bridge dropped the response")? {
            Envelope::Reply(payload) => {
                return serde_json::from_str(&payload).context("malformed response envelope");
            }
            Envelope::Push(_) => continue,
        }
    }
}

/// Initialize the engine and apply the profile in its home directory
pub async fn prepare(bridge: &HostBridge, config: &MergedConfig) -> CliResult<()> {
    let Some(home_dir) = &config.home_dir else {
        return Ok(());
    };

    let init = call(
        bridge,
        &Action::new("init", "init", json!({"home-dir": home_dir, "version": 0})),
    )
    .await?;
    ensure_success(&init)?;
    anyhow::ensure!(
        init.data == json!(true),
        "failed to initialize engine in {}",
        home_dir.display()
    );

    let setup = call(bridge, &Action::new("setup", "setup-config", json!({}))).await?;
    ensure_success(&setup)?;
    match setup.data.as_str() {
        Some("") | None => Ok(()),
        Some(error) => anyhow::bail!("failed to apply profile: {error}"),
    }
}
