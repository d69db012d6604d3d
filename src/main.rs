use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use stagelink::audio::list_input_devices;
use stagelink::config::{ClientConfig, DEFAULT_SIGNALING_PATH};
use stagelink::{Platform, Role, SessionHandle};

/// Join a live stage as audience, actor or director.
#[derive(Debug, Parser)]
#[command(name = "stagelink", version, about)]
struct Args {
    /// Stage server address, e.g. http://10.0.0.5:8080
    #[arg(long, env = "STAGELINK_SERVER", required_unless_present = "list_devices")]
    server: Option<String>,

    #[arg(long, env = "STAGELINK_ROLE", default_value = "audience")]
    role: Role,

    /// Join with the microphone muted
    #[arg(long, env = "STAGELINK_MUTED")]
    muted: bool,

    /// Receive-only, no audio devices
    #[arg(long, env = "STAGELINK_HEADLESS")]
    headless: bool,

    #[arg(long, env = "STAGELINK_INPUT_DEVICE")]
    input_device: Option<String>,

    #[arg(long, env = "STAGELINK_NOISE_SUPPRESSION")]
    noise_suppression: bool,

    /// STUN server URL; repeat or comma-separate for several
    #[arg(long = "stun", env = "STAGELINK_STUN", value_delimiter = ',')]
    stun: Vec<String>,

    #[arg(long, env = "STAGELINK_SIGNALING_PATH", default_value = DEFAULT_SIGNALING_PATH)]
    signaling_path: String,

    /// Print input devices and exit
    #[arg(long)]
    list_devices: bool,
}

impl Args {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig {
            signaling_path: self.signaling_path.clone(),
            input_device: self.input_device.clone(),
            noise_suppression: self.noise_suppression,
            ..ClientConfig::default()
        };
        if !self.stun.is_empty() {
            config.ice_servers = self.stun.clone();
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .parse_lossy(
                    std::env::var("RUST_LOG").unwrap_or_else(|_| "info,webrtc::mux=error".into()),
                ),
        )
        .init();

    let args = Args::parse();

    if args.list_devices {
        for device in list_input_devices() {
            let marker = if device.is_default { " (default)" } else { "" };
            println!("{}{marker}", device.name);
        }
        return Ok(());
    }

    let server = args.server.clone().context("--server is required")?;
    let config = args.client_config();
    let platform = if args.headless {
        Platform::headless(&config)
    } else {
        Platform::native(&config)
    };

    let session = SessionHandle::spawn(server, config, platform);
    session.connect(args.muted, args.role);

    let mut status = session.subscribe();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let s = status.borrow_and_update().clone();
            info!(
                state = %s.state,
                connected = s.is_connected,
                muted = s.muted,
                ice = ?s.connection_state,
                "Session status"
            );
        }
    });

    info!("Commands: m = toggle mic, c = reconnect, q = quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match line.trim() {
                    "m" => session.toggle_mic(),
                    "c" => {
                        let muted = session.muted();
                        session.close();
                        session.connect(muted, args.role);
                    }
                    "q" => break,
                    "" => {}
                    other => warn!("Unknown command '{other}'"),
                },
                Ok(None) => {
                    debug!("stdin closed, Ctrl-C to quit");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {e}");
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing session");
                break;
            }
        }
    }

    session.shutdown().await;
    Ok(())
}
