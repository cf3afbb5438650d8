use smol::io::{AsyncBufReadExt, BufReader};
use smol::stream::StreamExt;

use conduit::LogBroadcast;

use crate::cli::ServeArgs;
use crate::config::MergedConfig;
use crate::error::CliResult;
use crate::host::{self, ChannelHandle, Envelope};

enum Event {
    Delivered(Envelope),
    /// stdin closed after this many commands
    Closed(usize),
}

pub async fn execute(_args: ServeArgs, config: MergedConfig, logs: LogBroadcast) -> CliResult<()> {
    let bridge = host::create_bridge(&config, logs);
    host::prepare(&bridge, &config).await?;

    let (envelope_tx, envelope_rx) = smol::channel::unbounded();
    bridge.set_event_listener(Some(ChannelHandle::listener(envelope_tx.clone())));

    let (event_tx, event_rx) = smol::channel::unbounded();
    let reader = {
        let bridge = bridge.clone();
        let event_tx = event_tx.clone();
        smol::spawn(async move {
            let mut lines = BufReader::new(smol::Unblock::new(std::io::stdin())).lines();
            let mut sent = 0;
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to read stdin");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                bridge.invoke_action(ChannelHandle::reply(envelope_tx.clone()), line.as_bytes());
                sent += 1;
            }
            let _ = event_tx.send(Event::Closed(sent)).await;
        })
    };
    let forward = smol::spawn(async move {
        while let Ok(envelope) = envelope_rx.recv().await {
            if event_tx.send(Event::Delivered(envelope)).await.is_err() {
                break;
            }
        }
    });

    let mut replies = 0;
    let mut expected = None;
    while expected != Some(replies) {
        let Ok(event) = event_rx.recv().await else {
            break;
        };
        match event {
            Event::Delivered(Envelope::Reply(payload)) => {
                replies += 1;
                println!("{payload}");
            }
            Event::Delivered(Envelope::Push(payload)) => println!("{payload}"),
            Event::Closed(sent) => expected = Some(sent),
        }
    }

    tracing::debug!(replies, "stdin closed, shutting down");
    reader.await;
    bridge.set_event_listener(None);
    bridge.shutdown();
    drop(forward);
    Ok(())
}
