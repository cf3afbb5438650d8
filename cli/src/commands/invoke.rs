use std::time::Duration;

use anyhow::Context;
use smol::{Timer, future};

use conduit::{Action, LogBroadcast};

use crate::cli::InvokeArgs;
use crate::config::MergedConfig;
use crate::error::{CliResult, ensure_success};
use crate::host::{self, ChannelHandle, Envelope};

pub async fn execute(args: InvokeArgs, config: MergedConfig, logs: LogBroadcast) -> CliResult<()> {
    let action: Action =
        serde_json::from_str(&args.action).context("command is not a valid envelope")?;

    let bridge = host::create_bridge(&config, logs);
    host::prepare(&bridge, &config).await?;

    let (push_tx, push_rx) = smol::channel::unbounded();
    bridge.set_event_listener(Some(ChannelHandle::listener(push_tx)));

    let result = host::call(&bridge, &action).await?;
    println!("{}", result.encode());

    if args.linger_ms > 0 {
        let linger = async {
            Timer::after(Duration::from_millis(args.linger_ms)).await;
        };
        let print_pushes = async {
            while let Ok(Envelope::Push(payload) | Envelope::Reply(payload)) = push_rx.recv().await
            {
                println!("{payload}");
            }
        };
        future::or(linger, print_pushes).await;
    }

    bridge.shutdown();
    ensure_success(&result)
}
