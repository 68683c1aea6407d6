//! `taskboard-watch`: follow a board's live event stream.
//!
//! Subscribes to one board and prints every event as a JSON line on stdout,
//! keeping a local cache in step with the stream and reloading it whenever
//! the stream skips ahead.
//!
//! ```bash
//! taskboard-watch --token secret 0192b3c4-...
//!
//! TASKBOARD_URL=ws://board.example:9100/ws TASKBOARD_TOKEN=secret \
//!     taskboard-watch 0192b3c4-...
//! ```

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use taskboard::{Applied, BoardCache, BoardClient, ClientError};
use taskboard_proto::event::BoardEvent;
use taskboard_proto::ids::BoardId;

#[derive(clap::Parser, Debug)]
#[command(version, about = "Follow a Taskboard board's live events")]
struct WatchArgs {
    /// Board to follow.
    board_id: BoardId,

    /// WebSocket URL of the board server.
    #[arg(long, env = "TASKBOARD_URL", default_value = "ws://127.0.0.1:9100/ws")]
    url: url::Url,

    /// Bearer token.
    #[arg(long, env = "TASKBOARD_TOKEN")]
    token: String,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TASKBOARD_LOG")]
    log_level: String,

    /// Path to log file (default: `$TMPDIR/taskboard-watch.log`).
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = WatchArgs::parse();

    // Logs go to a file; stdout carries the event stream.
    let _log_guard = init_logging(&args.log_level, args.log_file.as_deref());

    if let Err(e) = watch(&args).await {
        tracing::error!(error = %e, "watch failed");
        eprintln!("taskboard-watch: {e}");
        std::process::exit(1);
    }
}

async fn watch(args: &WatchArgs) -> Result<(), ClientError> {
    let client = BoardClient::connect(args.url.as_str(), &args.token).await?;
    let snapshot = client.subscribe(args.board_id).await?;
    tracing::info!(
        board_id = %args.board_id,
        revision = snapshot.revision,
        "subscribed"
    );
    let mut cache = BoardCache::from_snapshot(snapshot);

    while let Some(envelope) = client.next_event().await {
        match serde_json::to_string(&envelope) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(err = %e, "could not encode event"),
        }

        if cache.apply_event(&envelope) == Applied::RefetchRequired {
            tracing::info!(
                known = cache.revision(),
                got = envelope.revision,
                "cache out of step, reloading"
            );
            cache = BoardCache::from_snapshot(client.get_board(args.board_id).await?);
        }

        if matches!(envelope.event, BoardEvent::BoardDeleted { .. }) {
            tracing::info!(board_id = %args.board_id, "board deleted");
            break;
        }
    }

    client.close().await;
    Ok(())
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown so buffered
/// entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("taskboard-watch.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}
