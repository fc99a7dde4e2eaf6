//! stagecall - terminal front-end for staged voice conversations
//!
//! Logs in with the configured profile and drives the conversation from
//! single-letter commands on stdin.

#![forbid(unsafe_code)]

use stagecall::config::AppConfig;
use stagecall::Snapshot;
use tokio::sync::watch;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stagecall=info")),
        )
        .init();

    let config = AppConfig::from_env()?;
    run(config).await
}

#[cfg(feature = "pulse")]
async fn run(config: AppConfig) -> anyhow::Result<()> {
    use std::sync::Arc;
    use stagecall::audio::{PulseMicrophone, PulsePlayback};
    use stagecall::connectivity::spawn_probe;
    use stagecall::gemini_client::{GeminiConfig, GeminiTransport};
    use stagecall::playback::TimelineSink;
    use stagecall::{Command, Conversation, ConversationParts};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::sync::mpsc;
    use tracing::info;

    const APP_NAME: &str = "stagecall";
    const HELP: &str = "Commands: t = toggle talk, n = next stage, r = reset, s = status, q = quit";

    let plan = config.stage_plan()?;
    info!("Loaded {} stages", plan.len());

    let transport = GeminiTransport::from_api_key(
        &config.api_key,
        Some(GeminiConfig {
            model: config.model.clone(),
            ..Default::default()
        }),
    );
    let online = spawn_probe(config.probe.clone()).await;

    let (sink, ended) = TimelineSink::new();
    let _playback = PulsePlayback::start(APP_NAME, sink.clone())?;

    let (conversation, snapshots) = Conversation::new(ConversationParts {
        plan,
        transport: Arc::new(transport),
        microphone: Box::new(PulseMicrophone::new(APP_NAME, config.input_device.clone())),
        playback: Box::new(sink),
        ended,
        online,
        voice: config.voice.clone(),
    });

    let (commands, commands_rx) = mpsc::channel(16);
    let conversation = tokio::spawn(conversation.run(commands_rx));
    tokio::spawn(print_snapshots(snapshots.clone()));

    commands.send(Command::Login(config.profile.clone())).await?;
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match line.trim() {
            "t" => Command::ToggleTalk,
            "n" => Command::NextStage,
            "r" => Command::Reset,
            "s" => {
                print_snapshot(&snapshots.borrow());
                continue;
            }
            "q" => break,
            "" => continue,
            other => {
                println!("Unknown command {:?}. {}", other, HELP);
                continue;
            }
        };
        if commands.send(command).await.is_err() {
            break;
        }
    }

    let _ = commands.send(Command::Shutdown).await;
    conversation.await?;
    info!("stagecall stopped");
    Ok(())
}

#[cfg(not(feature = "pulse"))]
async fn run(_config: AppConfig) -> anyhow::Result<()> {
    anyhow::bail!("stagecall was built without an audio backend; rebuild with --features pulse")
}

#[cfg_attr(not(feature = "pulse"), allow(dead_code))]
async fn print_snapshots(mut snapshots: watch::Receiver<Snapshot>) {
    print_snapshot(&snapshots.borrow_and_update());
    while snapshots.changed().await.is_ok() {
        print_snapshot(&snapshots.borrow_and_update());
    }
    debug!("Snapshot channel closed");
}

#[cfg_attr(not(feature = "pulse"), allow(dead_code))]
fn print_snapshot(snapshot: &Snapshot) {
    let line = match snapshot.error() {
        Some(error) => format!("! {}", error),
        None => snapshot.status().unwrap_or_default().to_string(),
    };
    println!(
        "[{}/{} {}] [{:?}{}] [{}] {}",
        snapshot.stage_index + 1,
        snapshot.stage_count,
        snapshot.stage_name,
        snapshot.activity,
        if snapshot.capturing { ", mic on" } else { "" },
        snapshot.session.label(),
        line
    );
}
