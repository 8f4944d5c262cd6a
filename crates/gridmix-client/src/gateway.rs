//! CommandGateway — user-initiated commands over REST, reconciled against
//! the ChannelStore.
//!
//! Every command follows the same protocol: read the pre-command state,
//! apply the optimistic patch (remembering its rev token), issue the REST
//! call, then either commit + full-status refresh on success, or roll the
//! optimistic change back and surface a non-blocking notice on failure.
//! Rollbacks go through `revert_if_unchanged`, so a push event that landed
//! in between wins over the stale rollback.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use gridmix_proto::config::Config;
use gridmix_proto::protocol::{
    ChannelStatus, CommandResponse, ConfigResponse, ServerStatus, StatusResponse, VolumeCommand,
    VolumesResponse,
};
use gridmix_proto::state::{Channel, ChannelPatch, ChannelStore, MAX_VOLUME};

use crate::conn::VolumePush;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend rejected the command: {0}")]
    Rejected(String),
}

pub struct CommandGateway {
    http: reqwest::Client,
    base_url: String,
    store: Arc<ChannelStore>,
    /// Low-latency path for volume changes; `None` when running without
    /// push connections (tests).
    volume_push: Option<VolumePush>,
    notice_tx: watch::Sender<Option<String>>,
}

impl CommandGateway {
    pub fn new(
        config: &Config,
        store: Arc<ChannelStore>,
        volume_push: Option<VolumePush>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.client.request_timeout_ms))
            .build()?;
        let (notice_tx, _) = watch::channel(None);
        Ok(Self {
            http,
            base_url: config.backend.base_url.trim_end_matches('/').to_string(),
            store,
            volume_push,
            notice_tx,
        })
    }

    /// Last user-visible failure notice (non-blocking; render shows it).
    pub fn subscribe_notices(&self) -> watch::Receiver<Option<String>> {
        self.notice_tx.subscribe()
    }

    // ── commands ──────────────────────────────────────────────────────────────

    /// Power toggle: activate vs deactivate is chosen from the
    /// *pre-command* local state, matching the control surface's buttons.
    pub async fn toggle_power(&self, id: u8) {
        let running = self
            .store
            .get(id)
            .await
            .map(|ch| ch.is_running)
            .unwrap_or(false);
        if running {
            self.deactivate(id).await;
        } else {
            self.activate(id).await;
        }
    }

    pub async fn activate(&self, id: u8) {
        self.power(id, true).await;
    }

    pub async fn deactivate(&self, id: u8) {
        self.power(id, false).await;
    }

    async fn power(&self, id: u8, on: bool) {
        let previous = self.store.get(id).await;
        let target = if on {
            ChannelStatus::Running
        } else {
            ChannelStatus::Stopped
        };
        let Some(token) = self.store.apply(ChannelPatch::new(id).status(target)).await else {
            return;
        };

        let url = format!("{}/api/threads/channel/{}", self.base_url, id);
        let request = if on {
            self.http.post(&url)
        } else {
            self.http.delete(&url)
        };

        match command_response(request.send().await).await {
            Ok(response) => {
                info!(
                    "channel {}: {} confirmed ({})",
                    id,
                    if on { "activate" } else { "deactivate" },
                    response.message.as_deref().unwrap_or("ok")
                );
                if let Some(name) = response.channel_name {
                    let mut patch = ChannelPatch::new(id);
                    patch.name = Some(name);
                    self.store.apply(patch).await;
                }
                // Reconcile fields the command response does not carry.
                self.refresh_status().await;
            }
            Err(e) => {
                let rollback = ChannelPatch::new(id).status(
                    previous
                        .map(|ch| ch.status)
                        .unwrap_or(ChannelStatus::Stopped),
                );
                let reverted = self.store.revert_if_unchanged(id, token, rollback).await;
                if !reverted {
                    // A push event confirmed a newer state in the meantime;
                    // it wins over the stale rollback.
                    info!("channel {}: rollback skipped, state already superseded", id);
                }
                self.fail(format!(
                    "No se pudo {} el canal {}: {}",
                    if on { "activar" } else { "desactivar" },
                    id,
                    e
                ));
            }
        }
    }

    pub async fn set_volume(&self, id: u8, level: u8) {
        let level = level.min(MAX_VOLUME);
        let previous = self.store.get(id).await;
        let Some(token) = self.store.apply(ChannelPatch::new(id).volume(level)).await else {
            return;
        };

        // Unbuffered low-latency path, in addition to REST — not instead.
        if let Some(push) = &self.volume_push {
            if let Err(e) = push.send(&VolumeCommand {
                channel_id: id,
                volume: level,
            }) {
                warn!("volume push for channel {} skipped: {}", id, e);
            }
        }

        let url = format!("{}/api/volume/channel/{}", self.base_url, id);
        let request = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "volumeLevel": level }));

        match command_response(request.send().await).await {
            Ok(_) => {
                self.refresh_status().await;
            }
            Err(e) => {
                let rollback =
                    ChannelPatch::new(id).volume(previous.map(|ch| ch.volume).unwrap_or(0));
                self.store.revert_if_unchanged(id, token, rollback).await;
                self.fail(format!("No se pudo ajustar el volumen del canal {id}: {e}"));
            }
        }
    }

    /// Solo: mute every other channel.  The optimistic part is only the
    /// solo marker — the mass zeroing arrives via the push broadcast (or
    /// the follow-up refresh), which is the authoritative sweep.
    pub async fn solo(&self, id: u8) {
        let Some(token) = self.store.apply(ChannelPatch::new(id).soloed(true)).await else {
            return;
        };

        let url = format!("{}/api/volume/mute-all-except/{}", self.base_url, id);
        match command_response(self.http.put(&url).send().await).await {
            Ok(response) => {
                info!(
                    "solo on channel {} confirmed ({})",
                    id,
                    response.action_performed.as_deref().unwrap_or("ok")
                );
                self.refresh_status().await;
            }
            Err(e) => {
                self.store
                    .revert_if_unchanged(id, token, ChannelPatch::new(id).soloed(false))
                    .await;
                self.fail(format!("No se pudo aplicar solo al canal {id}: {e}"));
            }
        }
    }

    /// Unsolo: restore all muted volumes.  Rollback of the optimistic
    /// marker sweep is a refresh — the pre-solo volumes only exist on the
    /// backend.
    pub async fn unsolo(&self) {
        self.store.clear_solo().await;

        let url = format!("{}/api/volume/unmute-channels", self.base_url);
        match command_response(self.http.put(&url).send().await).await {
            Ok(_) => {
                self.refresh_status().await;
                self.refresh_volumes().await;
            }
            Err(e) => {
                self.refresh_status().await;
                self.fail(format!("No se pudo quitar el solo: {e}"));
            }
        }
    }

    // ── refresh paths ─────────────────────────────────────────────────────────

    /// Initial listing: seeds names for configured channels.
    pub async fn fetch_config(&self) {
        let url = format!("{}/api/config", self.base_url);
        let body: Result<ConfigResponse, _> = get_json(&self.http, &url).await;
        match body {
            Ok(config) => {
                for channel in config.channels {
                    let mut patch = ChannelPatch::new(channel.id);
                    patch.name = Some(channel.name);
                    self.store.apply(patch).await;
                }
            }
            Err(e) => error!("config fetch failed: {}", e),
        }
    }

    /// Authoritative full refresh.  A malformed body leaves the existing
    /// store untouched — it must never clear the grid.
    pub async fn refresh_status(&self) {
        let url = format!("{}/api/config/channels/status", self.base_url);
        let body: Result<StatusResponse, _> = get_json(&self.http, &url).await;
        match body {
            Ok(status) => {
                let channels: Vec<Channel> = status
                    .channels
                    .iter()
                    .map(Channel::from_status)
                    .collect();
                self.store.replace_all(channels).await;
            }
            Err(e) => error!("status refresh failed, keeping current state: {}", e),
        }
    }

    pub async fn refresh_volumes(&self) {
        let url = format!("{}/api/volume/channels", self.base_url);
        let body: Result<VolumesResponse, _> = get_json(&self.http, &url).await;
        match body {
            Ok(volumes) => {
                for (key, entry) in volumes.volumes {
                    match key.parse::<u8>() {
                        Ok(id) => {
                            self.store
                                .apply(ChannelPatch::new(id).volume(entry.volume_level))
                                .await;
                        }
                        Err(_) => warn!("volume refresh: skipping non-numeric key {:?}", key),
                    }
                }
            }
            Err(e) => error!("volume refresh failed: {}", e),
        }
    }

    /// Backend's view of the downstream device, for the status line.
    pub async fn server_status(&self) -> Option<ServerStatus> {
        let url = format!("{}/api/server/status", self.base_url);
        match get_json::<ServerStatus>(&self.http, &url).await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("server status fetch failed: {}", e);
                None
            }
        }
    }

    fn fail(&self, message: String) {
        warn!("{}", message);
        self.notice_tx.send_replace(Some(message));
    }
}

async fn get_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
) -> Result<T, GatewayError> {
    let response = http.get(url).send().await?.error_for_status()?;
    Ok(response.json::<T>().await?)
}

/// Fold transport failures, non-2xx, malformed bodies, and `success:false`
/// into one error path.
async fn command_response(
    result: Result<reqwest::Response, reqwest::Error>,
) -> Result<CommandResponse, GatewayError> {
    let response = result?.error_for_status()?;
    let body: CommandResponse = response.json().await?;
    if body.success {
        Ok(body)
    } else {
        Err(GatewayError::Rejected(
            body.message.unwrap_or_else(|| "sin detalle".to_string()),
        ))
    }
}
