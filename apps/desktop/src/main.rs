use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use client_core::{
    DispatchOutcome, SessionCommand, SessionCoordinator, SessionEvent, SocketIoConnector,
};
use engine_integration::{EngineFactory, LoopbackEngineFactory};
use shared::domain::{ControlState, MeetingId, SessionIdentity};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod config;

#[derive(Parser, Debug)]
#[command(name = "meet", about = "Join a meeting with live captions")]
struct Args {
    /// Room to join; a fresh one is generated when omitted.
    #[arg(long)]
    meeting_id: Option<String>,
    #[arg(long)]
    participant_id: Option<String>,
    #[arg(long, default_value = "")]
    display_name: String,
    #[arg(long)]
    email: Option<String>,
    /// Show captions from the start.
    #[arg(long)]
    captions: bool,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Command(SessionCommand),
    ToggleCaptions,
    Quit,
    Blank,
    Unknown(String),
}

fn parse_input(line: &str) -> Input {
    match line.trim().to_ascii_lowercase().as_str() {
        "" => Input::Blank,
        "mute" | "audio" => Input::Command(SessionCommand::ToggleAudio),
        "video" | "camera" => Input::Command(SessionCommand::ToggleVideo),
        "share" | "screen" => Input::Command(SessionCommand::ToggleScreenShare),
        "leave" | "hangup" => Input::Command(SessionCommand::Leave),
        "captions" | "cc" => Input::ToggleCaptions,
        "quit" | "exit" => Input::Quit,
        other => Input::Unknown(other.to_string()),
    }
}

fn describe(control: &ControlState) -> String {
    let on_off = |on: bool| if on { "on" } else { "off" };
    let mut line = format!(
        "mic {} | camera {} | sharing {} | captions {}",
        if control.audio_muted { "muted" } else { "live" },
        on_off(control.video_enabled),
        on_off(control.screen_sharing),
        on_off(control.captions_enabled),
    );
    if let Some(text) = control.caption_text() {
        line.push_str(&format!("\n  > {text}"));
    }
    line
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    let settings = config::load_settings(args.config.as_deref())?;

    let engine_factory: Arc<dyn EngineFactory> = if settings.verify_engine_script {
        Arc::new(LoopbackEngineFactory::verifying_script(
            settings.engine_script(),
        ))
    } else {
        Arc::new(LoopbackEngineFactory::new())
    };
    let connector = Arc::new(SocketIoConnector::new(settings.caption_backend_url.clone()));
    let session = SessionCoordinator::new(settings.session_config(), engine_factory, connector);

    let identity = SessionIdentity::new(
        args.meeting_id.map(MeetingId::from),
        args.participant_id
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        args.display_name,
        args.email,
    );
    println!(
        "Joining meeting {} as {}",
        identity.meeting_id, identity.display_name
    );

    let mut events = session.subscribe_events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::LifecycleChanged(state)) => println!("[session] {state}"),
                Ok(SessionEvent::ControlStateChanged(control)) => println!("{}", describe(&control)),
                Ok(SessionEvent::CaptionsUnavailable(err)) => {
                    println!("[captions] unavailable: {err}")
                }
                Ok(SessionEvent::ConferenceLeft) => println!("[session] conference ended"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut ended = session.subscribe_events();
    if let Err(err) = session.start(identity).await {
        session.stop().await;
        printer.abort();
        return Err(err.into());
    }
    if args.captions {
        session.set_captions_enabled(true).await;
    }
    println!("Commands: mute, video, share, captions, leave, quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = ended.recv() => match event {
                Ok(SessionEvent::ConferenceLeft) | Err(RecvError::Closed) => break,
                _ => {}
            },
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match parse_input(&line) {
                    Input::Command(command) => match session.dispatch(command).await {
                        DispatchOutcome::Dropped => {
                            println!("Not in an active conference yet; '{}' ignored", line.trim());
                        }
                        DispatchOutcome::Forwarded if command == SessionCommand::Leave => break,
                        DispatchOutcome::Forwarded => {}
                    },
                    Input::ToggleCaptions => {
                        let enabled = session.toggle_captions().await;
                        println!("Captions {}", if enabled { "on" } else { "off" });
                    }
                    Input::Quit => break,
                    Input::Blank => {}
                    Input::Unknown(other) => println!("Unknown command '{other}'"),
                }
            }
        }
    }

    session.stop().await;
    printer.abort();
    Ok(())
}
