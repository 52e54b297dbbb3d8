//! Upstream telemetry subscriber.
//!
//! The publisher is a reliable ordered byte-message source emitting one JSON
//! document per line over TCP. The initial connect is fatal when it fails
//! (handled by the caller); once running, disconnects retry with capped
//! exponential backoff, and bad documents are logged and skipped so the
//! ingestion loop never stalls.

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{info, warn};

use crate::engine::Engine;

/// Upper bound on a single upstream document.
const MAX_LINE_BYTES: usize = 1 << 20;

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// First connection to the publisher; the caller treats failure as fatal.
pub async fn connect(addr: &str) -> std::io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

/// Read documents until shutdown, reconnecting as needed.
pub async fn run_ingest(
    addr: String,
    initial: TcpStream,
    engine: Arc<Engine>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut socket = Some(initial);
    let mut backoff = RECONNECT_MIN;
    loop {
        let stream = match socket.take() {
            Some(s) => s,
            None => {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                        continue;
                    }
                    () = tokio::time::sleep(backoff) => {}
                }
                match connect(&addr).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, %addr, "upstream reconnect failed");
                        backoff = (backoff * 2).min(RECONNECT_MAX);
                        continue;
                    }
                }
            }
        };
        info!(%addr, "subscribed to upstream telemetry");
        backoff = RECONNECT_MIN;

        let mut frames = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                frame = frames.next() => match frame {
                    Some(Ok(line)) => dispatch(&line, &engine).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "upstream read error");
                        break;
                    }
                    None => {
                        warn!("upstream closed the connection");
                        break;
                    }
                }
            }
        }
    }
}

async fn dispatch(line: &str, engine: &Engine) {
    match rd_protocol::decode(line) {
        Ok(event) => engine.handle_event(event).await,
        Err(e) => warn!(error = %e, "dropping undecodable document"),
    }
}
