//! ConnectionManager — lifecycle of the two push streams.
//!
//! One supervisor task per stream.  Each connection attempt gets a fresh
//! handle and a fresh generation number; when the socket drops, the
//! supervisor publishes `Closed`, sleeps the configured fixed delay, and
//! tries again — indefinitely, with no backoff growth and no retry cap,
//! until `stop` shuts the stream down for good.
//!
//! Inbound messages are tagged with the generation that read them.  The
//! consumer checks the tag against the stream's current generation before
//! applying anything, so a superseded handle's messages can never mutate
//! current state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use gridmix_proto::protocol::VolumeCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Thread,
    Volume,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Thread => "thread",
            StreamKind::Volume => "volume",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStatus {
    #[default]
    Connecting,
    Open,
    Closed,
}

/// A push message as read off the wire, tagged with the generation of the
/// connection that produced it.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub kind: StreamKind,
    pub generation: u64,
    pub payload: String,
}

#[derive(Debug, Clone)]
pub struct ConnOptions {
    pub thread_url: String,
    pub volume_url: String,
    pub reconnect_delay: Duration,
}

impl ConnOptions {
    pub fn from_config(config: &gridmix_proto::config::Config) -> Self {
        Self {
            thread_url: config.backend.thread_ws_url.clone(),
            volume_url: config.backend.volume_ws_url.clone(),
            reconnect_delay: Duration::from_millis(config.client.reconnect_delay_ms),
        }
    }
}

/// Clonable handle for pushing volume commands out over the volume stream.
/// Fire-and-forget: when the link is down the send fails and the caller
/// logs and moves on (the REST path still carries the change).
#[derive(Clone)]
pub struct VolumePush {
    status_rx: watch::Receiver<LinkStatus>,
    out_tx: mpsc::Sender<String>,
}

impl VolumePush {
    pub fn send(&self, cmd: &VolumeCommand) -> anyhow::Result<()> {
        if *self.status_rx.borrow() != LinkStatus::Open {
            anyhow::bail!("volume stream is not connected");
        }
        let text = serde_json::to_string(cmd)?;
        self.out_tx
            .try_send(text)
            .map_err(|e| anyhow::anyhow!("volume stream send queue unavailable: {e}"))
    }
}

pub struct ConnectionManager {
    thread_status_rx: watch::Receiver<LinkStatus>,
    volume_status_rx: watch::Receiver<LinkStatus>,
    thread_gen: Arc<AtomicU64>,
    volume_gen: Arc<AtomicU64>,
    thread_shutdown: watch::Sender<bool>,
    volume_shutdown: watch::Sender<bool>,
    volume_push: VolumePush,
}

impl ConnectionManager {
    /// Spawn both stream supervisors.  Messages from either stream arrive
    /// on `inbound_tx`.
    pub fn start(options: ConnOptions, inbound_tx: mpsc::Sender<Inbound>) -> Self {
        let (thread_status_tx, thread_status_rx) = watch::channel(LinkStatus::Connecting);
        let (volume_status_tx, volume_status_rx) = watch::channel(LinkStatus::Connecting);
        let (thread_shutdown, thread_shutdown_rx) = watch::channel(false);
        let (volume_shutdown, volume_shutdown_rx) = watch::channel(false);
        let (out_tx, out_rx) = mpsc::channel::<String>(64);

        let thread_gen = Arc::new(AtomicU64::new(0));
        let volume_gen = Arc::new(AtomicU64::new(0));

        tokio::spawn(run_stream(
            StreamKind::Thread,
            options.thread_url.clone(),
            options.reconnect_delay,
            Arc::clone(&thread_gen),
            thread_status_tx,
            inbound_tx.clone(),
            None,
            thread_shutdown_rx,
        ));
        tokio::spawn(run_stream(
            StreamKind::Volume,
            options.volume_url.clone(),
            options.reconnect_delay,
            Arc::clone(&volume_gen),
            volume_status_tx,
            inbound_tx,
            Some(out_rx),
            volume_shutdown_rx,
        ));

        let volume_push = VolumePush {
            status_rx: volume_status_rx.clone(),
            out_tx,
        };

        Self {
            thread_status_rx,
            volume_status_rx,
            thread_gen,
            volume_gen,
            thread_shutdown,
            volume_shutdown,
            volume_push,
        }
    }

    /// Permanently shut down one stream's supervisor: the live connection
    /// is dropped and no further reconnects are attempted.  The generation
    /// bump makes any still-queued messages from that stream stale.
    pub fn stop(&self, kind: StreamKind) {
        info!("{} stream: stopping", kind.as_str());
        match kind {
            StreamKind::Thread => {
                self.thread_gen.fetch_add(1, Ordering::SeqCst);
                let _ = self.thread_shutdown.send(true);
            }
            StreamKind::Volume => {
                self.volume_gen.fetch_add(1, Ordering::SeqCst);
                let _ = self.volume_shutdown.send(true);
            }
        }
    }

    pub fn status(&self, kind: StreamKind) -> LinkStatus {
        match kind {
            StreamKind::Thread => *self.thread_status_rx.borrow(),
            StreamKind::Volume => *self.volume_status_rx.borrow(),
        }
    }

    pub fn subscribe_status(&self, kind: StreamKind) -> watch::Receiver<LinkStatus> {
        match kind {
            StreamKind::Thread => self.thread_status_rx.clone(),
            StreamKind::Volume => self.volume_status_rx.clone(),
        }
    }

    pub fn generation(&self, kind: StreamKind) -> u64 {
        match kind {
            StreamKind::Thread => self.thread_gen.load(Ordering::SeqCst),
            StreamKind::Volume => self.volume_gen.load(Ordering::SeqCst),
        }
    }

    /// Stale-handle guard: true only while the message's connection is
    /// still the live one for its stream.
    pub fn is_current(&self, msg: &Inbound) -> bool {
        self.generation(msg.kind) == msg.generation
    }

    pub fn volume_push(&self) -> VolumePush {
        self.volume_push.clone()
    }
}

async fn run_stream(
    kind: StreamKind,
    url: String,
    reconnect_delay: Duration,
    generation: Arc<AtomicU64>,
    status_tx: watch::Sender<LinkStatus>,
    inbound_tx: mpsc::Sender<Inbound>,
    mut outbound_rx: Option<mpsc::Receiver<String>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let my_gen = generation.fetch_add(1, Ordering::SeqCst) + 1;
        status_tx.send_replace(LinkStatus::Connecting);
        debug!("{} stream: connecting to {} (gen {})", kind.as_str(), url, my_gen);

        // A `changed` result on the shutdown watch means either an explicit
        // stop or the manager itself being dropped; both end the supervisor.
        let connected = tokio::select! {
            conn = tokio_tungstenite::connect_async(&url) => conn,
            _ = shutdown_rx.changed() => break,
        };

        match connected {
            Ok((ws, _)) => {
                info!("{} stream: connected (gen {})", kind.as_str(), my_gen);
                status_tx.send_replace(LinkStatus::Open);

                let (mut sink, mut stream) = ws.split();
                loop {
                    let outbound = async {
                        match outbound_rx.as_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    };
                    tokio::select! {
                        msg = stream.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                let inbound = Inbound {
                                    kind,
                                    generation: my_gen,
                                    payload: text.to_string(),
                                };
                                if inbound_tx.send(inbound).await.is_err() {
                                    // Consumer is gone; nothing left to do.
                                    return;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("{} stream: read error: {}", kind.as_str(), e);
                                break;
                            }
                        },
                        out = outbound => {
                            let Some(text) = out else { return };
                            if let Err(e) = sink.send(Message::Text(text.into())).await {
                                warn!("{} stream: send error: {}", kind.as_str(), e);
                                break;
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            status_tx.send_replace(LinkStatus::Closed);
                            info!("{} stream: stopped", kind.as_str());
                            return;
                        }
                    }
                }
                info!("{} stream: disconnected", kind.as_str());
            }
            Err(e) => {
                warn!("{} stream: connect failed: {}", kind.as_str(), e);
            }
        }

        status_tx.send_replace(LinkStatus::Closed);
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }
    status_tx.send_replace(LinkStatus::Closed);
    info!("{} stream: stopped", kind.as_str());
}
