//! Live camera viewer: subscribe to a camera's topic and keep the most recent
//! snapshot on disk.
//!
//! ```sh
//! cargo run -p phoenix-subscriber --example camera_snapshots -- <CAMERA_ID> \
//!     [--endpoint ws://localhost:4000/ws] [--output live.jpg]
//! ```
//!
//! Every `snapshot-taken` push carries a base64 JPEG in `payload.image`; it is
//! decoded and written over `--output`. Press Ctrl-C to leave and disconnect.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::Parser;
use phoenix_subscriber::{BoxError, HandlerResult, Message, Socket, SocketConfig, protocol};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

const SNAPSHOT_EVENT: &str = "snapshot-taken";

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "camera_snapshots")]
struct Args {
    /// Camera whose snapshots to follow (topic `cameras:<id>`)
    #[arg(env = "CAMERA_ID")]
    camera_id: String,

    /// Phoenix socket endpoint
    #[arg(long, env = "PHOENIX_ENDPOINT", default_value = "ws://localhost:4000/ws")]
    endpoint: String,

    /// File overwritten with each decoded snapshot
    #[arg(long, short, default_value = "live.jpg")]
    output: PathBuf,

    /// Optional `token` connect parameter
    #[arg(long, env = "PHOENIX_TOKEN")]
    token: Option<String>,

    /// Seconds between heartbeats
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,
}

fn save_snapshot(output: &Path, msg: &Message) -> HandlerResult {
    let image = msg
        .payload
        .get("image")
        .and_then(|v| v.as_str())
        .ok_or_else(|| BoxError::from("snapshot payload has no image"))?;
    let bytes = BASE64.decode(image)?;
    std::fs::write(output, &bytes)?;
    tracing::info!(bytes = bytes.len(), path = %output.display(), "Snapshot saved");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = SocketConfig::new(args.endpoint);
    if let Some(token) = args.token {
        config.params.insert("token".into(), token);
    }
    config.timing.heartbeat_interval = Duration::from_secs(args.heartbeat_secs.max(1));

    let socket = Socket::new(config)?;
    tracing::info!(url = %socket.endpoint_url(), "Starting");
    socket.connect()?;

    let channel = socket.channel(
        protocol::topic("cameras", &args.camera_id),
        serde_json::json!({}),
    );
    let output = Arc::new(args.output);
    channel.on(SNAPSHOT_EVENT, move |msg| save_snapshot(&output, msg));

    tokio::select! {
        joined = channel.join().wait() => match joined {
            Ok(_) => tracing::info!(topic = channel.topic(), "Watching camera"),
            Err(e) => {
                tracing::error!("{e}");
                socket.close().await;
                return Err(e.into());
            }
        },
        _ = tokio::signal::ctrl_c() => {
            socket.close().await;
            return Ok(());
        }
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Leaving");
    channel.leave().await?;
    socket.close().await;
    Ok(())
}
