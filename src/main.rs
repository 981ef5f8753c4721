use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;

use hearing_relay::audio::{AudioSystem, BackendKind, CaptureSource, RelayEvent, StartOutcome};
use hearing_relay::config::RelayConfig;

/// Volume change for `+` / `-`
const VOLUME_STEP: f32 = 0.25;

/// Command-line arguments for hearing_relay
#[derive(Parser, Debug)]
#[command(name = "hearing_relay")]
#[command(about = "Relay the microphone to headphones in real time with adjustable gain")]
#[command(version)]
struct Args {
    /// Engine to use: native (ALSA), fallback (cpal) or auto
    #[arg(short, long, env = "HEARING_RELAY_BACKEND")]
    backend: Option<String>,

    /// Preferred input device (ALSA PCM name or description)
    #[arg(short, long, env = "HEARING_RELAY_DEVICE")]
    device: Option<String>,

    /// Initial volume (1.0 = unity gain)
    #[arg(short, long)]
    volume: Option<f32>,

    /// Capture source: unprocessed, voice_recognition or voice_performance
    #[arg(long, env = "HEARING_RELAY_CAPTURE_SOURCE")]
    capture_source: Option<CaptureSource>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum EngineChoice {
    Auto,
    Only(BackendKind),
}

impl EngineChoice {
    fn parse(name: &str) -> Result<Self> {
        if name.trim().eq_ignore_ascii_case("auto") {
            return Ok(EngineChoice::Auto);
        }
        Ok(EngineChoice::Only(name.parse()?))
    }
}

/// One line typed on stdin.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Command {
    SetVolume(f32),
    Step(f32),
    Status,
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    match line.trim() {
        "" => None,
        "+" => Some(Command::Step(VOLUME_STEP)),
        "-" => Some(Command::Step(-VOLUME_STEP)),
        "status" | "s" => Some(Command::Status),
        "quit" | "q" | "exit" => Some(Command::Quit),
        other => other.parse().ok().map(Command::SetVolume),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    env_logger::init();

    let args = Args::parse();
    log::info!("{} {} starting", env!("APP_NAME"), env!("APP_VERSION"));

    // 加载编译时配置，命令行参数优先
    let mut config = RelayConfig::default();
    if let Some(source) = args.capture_source {
        config.capture_source = source;
    }
    let choice = match &args.backend {
        Some(name) => EngineChoice::parse(name)?,
        None => EngineChoice::Only(config.backend),
    };

    let (tx_event, mut rx_event) = mpsc::unbounded_channel::<RelayEvent>();
    let system = Arc::new(AudioSystem::new(config).with_events(tx_event));
    if let Some(volume) = args.volume {
        system.set_volume(volume);
    }

    // 打开设备会阻塞，放到阻塞线程池里
    let outcome = {
        let system = system.clone();
        let hint = args.device.clone();
        tokio::task::spawn_blocking(move || match choice {
            EngineChoice::Auto => system.start_with_fallback(hint.as_deref()),
            EngineChoice::Only(kind) => system.start(kind, hint.as_deref()),
        })
        .await?
        .context("Failed to start the relay")?
    };
    if let StartOutcome::Started { session } = outcome {
        log::info!("Relay started, session {}", session);
    }
    println!("Relay running. Type a volume (e.g. 1.5), '+', '-', 'status' or 'quit'.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut failure: Option<String> = None;

    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }

            Some(event) = rx_event.recv() => {
                println!("{}", serde_json::to_string(&event)?);
                if let RelayEvent::StoppedUnexpectedly { reason, .. } = event {
                    failure = Some(reason);
                    break;
                }
            }

            line = lines.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    // stdin 关闭后继续运行，直到 Ctrl+C
                    stdin_open = false;
                    continue;
                };
                match parse_command(&line) {
                    Some(Command::SetVolume(v)) => {
                        println!("volume {:.2}", system.set_volume(v));
                    }
                    Some(Command::Step(delta)) => {
                        println!("volume {:.2}", system.set_volume(system.volume() + delta));
                    }
                    Some(Command::Status) => {
                        println!("{}", serde_json::to_string_pretty(&system.status())?);
                    }
                    Some(Command::Quit) => break,
                    None if line.trim().is_empty() => {}
                    None => println!("unknown command: {}", line.trim()),
                }
            }
        }
    }

    {
        let system = system.clone();
        tokio::task::spawn_blocking(move || system.stop())
            .await?
            .context("Failed to stop the relay")?;
    }

    match failure {
        Some(reason) => anyhow::bail!("Relay stopped unexpectedly: {}", reason),
        None => Ok(()),
    }
}
