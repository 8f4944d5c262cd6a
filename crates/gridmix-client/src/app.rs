//! App — composition root and single event loop.
//!
//! Owns the store, the connection manager, and the gateway (all injected
//! into the components that need them; no module-level mutable state).
//! Everything that mutates the store funnels through this loop or through
//! the gateway's command protocol.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use gridmix_proto::config::Config;
use gridmix_proto::protocol::ServerStatus;
use gridmix_proto::state::{ChannelStore, CHANNEL_SLOTS, MAX_VOLUME};

use crate::conn::{ConnOptions, ConnectionManager, Inbound, StreamKind};
use crate::gateway::CommandGateway;
use crate::render::{draw, Frame};
use crate::router::{EventRouter, RouterAction};

/// User intents read from the control surface (here: stdin lines).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    TogglePower(u8),
    Activate(u8),
    Deactivate(u8),
    SetVolume(u8, u8),
    Solo(u8),
    Unsolo,
    Refresh,
    /// Re-query the backend's view of the downstream device.
    Status,
    Quit,
}

impl Intent {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or("");
        let intent = match verb {
            "power" | "p" => Self::TogglePower(parse_channel(parts.next())?),
            "on" => Self::Activate(parse_channel(parts.next())?),
            "off" => Self::Deactivate(parse_channel(parts.next())?),
            "vol" | "v" => {
                let id = parse_channel(parts.next())?;
                let level: u8 = parts
                    .next()
                    .ok_or("falta el nivel de volumen")?
                    .parse()
                    .map_err(|_| "nivel de volumen inválido".to_string())?;
                if level > MAX_VOLUME {
                    return Err(format!("el volumen debe estar entre 0 y {MAX_VOLUME}"));
                }
                Self::SetVolume(id, level)
            }
            "solo" | "s" => Self::Solo(parse_channel(parts.next())?),
            "unsolo" | "u" => Self::Unsolo,
            "refresh" | "r" => Self::Refresh,
            "status" => Self::Status,
            "quit" | "q" => Self::Quit,
            "" => return Err(String::new()),
            other => return Err(format!("comando desconocido: {other}")),
        };
        if parts.next().is_some() {
            return Err("demasiados argumentos".to_string());
        }
        Ok(intent)
    }
}

fn parse_channel(arg: Option<&str>) -> Result<u8, String> {
    let id: u8 = arg
        .ok_or("falta el número de canal")?
        .parse()
        .map_err(|_| "número de canal inválido".to_string())?;
    if !(1..=CHANNEL_SLOTS).contains(&id) {
        return Err(format!("el canal debe estar entre 1 y {CHANNEL_SLOTS}"));
    }
    Ok(id)
}

pub struct App {
    store: Arc<ChannelStore>,
    manager: ConnectionManager,
    gateway: Arc<CommandGateway>,
    router: EventRouter,
    inbound_rx: mpsc::Receiver<Inbound>,
    actions_rx: mpsc::Receiver<RouterAction>,
    refresh_interval: Duration,
}

impl App {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let store = Arc::new(ChannelStore::new());

        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(256);
        let manager = ConnectionManager::start(ConnOptions::from_config(config), inbound_tx);

        let gateway = Arc::new(CommandGateway::new(
            config,
            Arc::clone(&store),
            Some(manager.volume_push()),
        )?);

        let (actions_tx, actions_rx) = mpsc::channel::<RouterAction>(16);
        let router = EventRouter::new(
            Arc::clone(&store),
            actions_tx,
            Duration::from_millis(config.client.error_display_ms),
        );

        Ok(Self {
            store,
            manager,
            gateway,
            router,
            inbound_rx,
            actions_rx,
            refresh_interval: Duration::from_secs(config.client.refresh_interval_secs),
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            store,
            manager,
            gateway,
            router,
            mut inbound_rx,
            mut actions_rx,
            refresh_interval,
        } = self;

        info!("gridmix: starting");

        // Initial population: names first, then the authoritative state.
        gateway.fetch_config().await;
        gateway.refresh_status().await;
        gateway.refresh_volumes().await;
        let mut server: Option<ServerStatus> = gateway.server_status().await;

        let (intent_tx, mut intent_rx) = mpsc::channel::<Intent>(16);
        tokio::spawn(read_intents(intent_tx));

        let mut render_rx = store.subscribe();
        let mut thread_status_rx = manager.subscribe_status(StreamKind::Thread);
        let mut volume_status_rx = manager.subscribe_status(StreamKind::Volume);
        let mut notice_rx = gateway.subscribe_notices();

        let mut refresh_tick = tokio::time::interval(refresh_interval);
        refresh_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        refresh_tick.tick().await; // first tick fires immediately; already refreshed

        render(&store, &manager, &server, &notice_rx).await;

        loop {
            tokio::select! {
                Some(msg) = inbound_rx.recv() => consume_inbound(&manager, &router, msg).await,
                Some(action) = actions_rx.recv() => match action {
                    RouterAction::RefreshVolumes => gateway.refresh_volumes().await,
                },
                // Fallback reconciliation when push delivery is stale.
                _ = refresh_tick.tick() => {
                    gateway.refresh_status().await;
                    server = gateway.server_status().await;
                    render(&store, &manager, &server, &notice_rx).await;
                }
                _ = render_rx.changed() => render(&store, &manager, &server, &notice_rx).await,
                _ = thread_status_rx.changed() => render(&store, &manager, &server, &notice_rx).await,
                _ = volume_status_rx.changed() => render(&store, &manager, &server, &notice_rx).await,
                _ = notice_rx.changed() => render(&store, &manager, &server, &notice_rx).await,
                intent = intent_rx.recv() => {
                    let Some(intent) = intent else { break };
                    if intent == Intent::Quit {
                        break;
                    }
                    // Status owns the `server` slot, so it is handled here.
                    if intent == Intent::Status {
                        server = gateway.server_status().await;
                        render(&store, &manager, &server, &notice_rx).await;
                        continue;
                    }
                    dispatch(&gateway, intent).await;
                }
            }
        }

        info!("gridmix: exiting");
        Ok(())
    }
}

/// Route one inbound push message, unless its connection has been
/// superseded — messages from a replaced handle must never reach the
/// store.
pub async fn consume_inbound(manager: &ConnectionManager, router: &EventRouter, msg: Inbound) {
    if manager.is_current(&msg) {
        router.route(msg.kind, &msg.payload).await;
    } else {
        debug!(
            "{} stream: dropping message from superseded connection (gen {})",
            msg.kind.as_str(),
            msg.generation
        );
    }
}

async fn dispatch(gateway: &CommandGateway, intent: Intent) {
    match intent {
        Intent::TogglePower(id) => gateway.toggle_power(id).await,
        Intent::Activate(id) => gateway.activate(id).await,
        Intent::Deactivate(id) => gateway.deactivate(id).await,
        Intent::SetVolume(id, level) => gateway.set_volume(id, level).await,
        Intent::Solo(id) => gateway.solo(id).await,
        Intent::Unsolo => gateway.unsolo().await,
        Intent::Refresh => {
            gateway.refresh_status().await;
            gateway.refresh_volumes().await;
        }
        Intent::Status | Intent::Quit => {}
    }
}

async fn render(
    store: &ChannelStore,
    manager: &ConnectionManager,
    server: &Option<ServerStatus>,
    notice_rx: &tokio::sync::watch::Receiver<Option<String>>,
) {
    let channels = store.snapshot().await;
    let notice = notice_rx.borrow().clone();
    let frame = Frame {
        channels: &channels,
        thread_link: manager.status(StreamKind::Thread),
        volume_link: manager.status(StreamKind::Volume),
        server: server.as_ref(),
        notice: notice.as_deref(),
    };
    println!("{}", draw(&frame));
}

/// Read user intents from stdin, one command per line.
async fn read_intents(intent_tx: mpsc::Sender<Intent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match Intent::parse(&line) {
                Ok(intent) => {
                    if intent_tx.send(intent).await.is_err() {
                        return;
                    }
                }
                Err(msg) if msg.is_empty() => {}
                Err(msg) => println!("{msg} (comandos: on/off/power N, vol N L, solo N, unsolo, refresh, status, quit)"),
            },
            Ok(None) => {
                // stdin closed; keep the app alive as a passive monitor.
                std::future::pending::<()>().await;
            }
            Err(e) => {
                warn!("stdin read error: {}", e);
                return;
            }
        }
    }
}
