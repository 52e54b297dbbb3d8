// simulator: synthetic reflector telemetry publisher for development and
// demos. Listens for dashboard subscribers and fans generated events out to
// every connected one, one JSON document per line.

mod traffic;

use clap::Parser;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(
    name = "simulator",
    version,
    about = "Synthetic URF reflector telemetry publisher"
)]
struct Args {
    /// Listen address for dashboard subscribers.
    #[arg(long, default_value = "127.0.0.1:5555")]
    bind: String,
    /// How long to run, in seconds.
    #[arg(long, default_value_t = 3600)]
    duration_secs: u64,
    /// Fraction of closing events to drop, exercising the consumer's
    /// state-derived and safety-net closure paths.
    #[arg(long, default_value_t = 0.15)]
    drop_rate: f32,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let listener = match TcpListener::bind(&args.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FATAL: failed to bind {}: {e}", args.bind);
            std::process::exit(1);
        }
    };
    info!(addr = %args.bind, duration_secs = args.duration_secs, "simulator listening");

    // Subscribers that fall behind just miss events; the generator never
    // waits for them.
    let (tx, _) = broadcast::channel::<String>(256);
    tokio::spawn(accept_loop(listener, tx.clone()));

    let mut reflector = traffic::Reflector::new(args.drop_rate, chrono::Utc::now());
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.duration_secs);
    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => break,
            _ = ticker.tick() => {
                for doc in reflector.tick(chrono::Utc::now()) {
                    let _ = tx.send(doc.to_string());
                }
            }
        }
    }
    info!("simulation finished");
}

async fn accept_loop(listener: TcpListener, tx: broadcast::Sender<String>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(?peer, "dashboard connected");
                tokio::spawn(serve_consumer(stream, tx.subscribe()));
            }
            Err(e) => warn!(error = %e, "accept error"),
        }
    }
}

/// Forward every published document to one consumer until it disconnects.
async fn serve_consumer(mut stream: TcpStream, mut rx: broadcast::Receiver<String>) {
    loop {
        match rx.recv().await {
            Ok(doc) => {
                let mut line = doc.into_bytes();
                line.push(b'\n');
                if stream.write_all(&line).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(n, "consumer lagged, events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
