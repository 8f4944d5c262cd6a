//! EventRouter — decodes inbound push messages and applies them to the
//! ChannelStore.  Pure dispatch: one bad message is logged and skipped,
//! unknown discriminants are ignored, nothing here ever panics on input.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use gridmix_proto::protocol::{ChannelStatus, MassVolumeAction, ThreadEvent, VolumeEvent};
use gridmix_proto::state::{ChannelPatch, ChannelStore};

use crate::conn::StreamKind;

/// Side effects the router cannot perform itself (they need REST access);
/// the app loop picks them up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterAction {
    RefreshVolumes,
}

pub struct EventRouter {
    store: Arc<ChannelStore>,
    actions_tx: mpsc::Sender<RouterAction>,
    /// How long an ERROR marker stays visible before being cleared.
    error_display: Duration,
}

impl EventRouter {
    pub fn new(
        store: Arc<ChannelStore>,
        actions_tx: mpsc::Sender<RouterAction>,
        error_display: Duration,
    ) -> Self {
        Self {
            store,
            actions_tx,
            error_display,
        }
    }

    pub async fn route(&self, kind: StreamKind, payload: &str) {
        match kind {
            StreamKind::Thread => self.route_thread(payload).await,
            StreamKind::Volume => self.route_volume(payload).await,
        }
    }

    async fn route_thread(&self, payload: &str) {
        let event: ThreadEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("thread stream: skipping malformed message: {}", e);
                return;
            }
        };

        match event {
            ThreadEvent::Connection { active_threads } => {
                // Welcome snapshot — cheap reconciliation on every (re)connect.
                for thread in active_threads {
                    let mut patch = ChannelPatch::new(thread.channel_id)
                        .status(thread.status.unwrap_or(ChannelStatus::Running));
                    patch.name = thread.channel_name;
                    patch.volume = thread.volume;
                    self.store.apply(patch).await;
                }
            }
            ThreadEvent::ThreadStarted {
                channel_id,
                channel_name,
            } => {
                let mut patch = ChannelPatch::new(channel_id).status(ChannelStatus::Running);
                patch.name = channel_name;
                self.store.apply(patch).await;
            }
            ThreadEvent::ThreadFinished { channel_id, reason } => {
                debug!(
                    "thread stream: channel {} finished ({})",
                    channel_id,
                    reason.as_deref().unwrap_or("no reason")
                );
                self.store
                    .apply(ChannelPatch::new(channel_id).status(ChannelStatus::Stopped))
                    .await;
            }
            ThreadEvent::ThreadException {
                channel_id,
                exception_type,
                error_message,
            } => {
                let message = error_message
                    .or(exception_type)
                    .unwrap_or_else(|| "unknown error".to_string());
                let token = self
                    .store
                    .apply(
                        ChannelPatch::new(channel_id)
                            .status(ChannelStatus::Error)
                            .error(Some(message)),
                    )
                    .await;
                // Clear the marker after the display window, unless some
                // newer write already replaced it (rev guard).
                if let Some(token) = token {
                    let store = Arc::clone(&self.store);
                    let window = self.error_display;
                    tokio::spawn(async move {
                        tokio::time::sleep(window).await;
                        store
                            .revert_if_unchanged(
                                channel_id,
                                token,
                                ChannelPatch::new(channel_id)
                                    .status(ChannelStatus::Stopped)
                                    .error(None),
                            )
                            .await;
                    });
                }
            }
            ThreadEvent::ThreadStatusChange {
                channel_id,
                new_status,
                ..
            } => match new_status.as_deref().and_then(ChannelStatus::parse) {
                Some(status) => {
                    self.store
                        .apply(ChannelPatch::new(channel_id).status(status))
                        .await;
                }
                None => debug!(
                    "thread stream: ignoring status change for channel {} with status {:?}",
                    channel_id, new_status
                ),
            },
            ThreadEvent::MassVolumeUpdate {
                action: MassVolumeAction::MuteAllExcept,
                excepted_channel_id,
            } => match excepted_channel_id {
                Some(excepted) => self.store.mute_all_except(excepted).await,
                None => warn!("thread stream: muteAllExcept without exceptedChannelId"),
            },
            ThreadEvent::MassVolumeUpdate {
                action: MassVolumeAction::UnmuteChannels,
                ..
            } => {
                self.store.clear_solo().await;
                // Restored volumes live on the backend; ask for them.
                let _ = self.actions_tx.send(RouterAction::RefreshVolumes).await;
            }
            ThreadEvent::Unknown => {
                debug!("thread stream: ignoring unknown message type");
            }
        }
    }

    async fn route_volume(&self, payload: &str) {
        let event: VolumeEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("volume stream: skipping malformed message: {}", e);
                return;
            }
        };

        match event {
            VolumeEvent::Volume {
                channel_id,
                volume_level,
            } => {
                self.store
                    .apply(ChannelPatch::new(channel_id).volume(volume_level))
                    .await;
            }
            VolumeEvent::Unknown => {
                debug!("volume stream: ignoring unknown message type");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(store: &Arc<ChannelStore>) -> (EventRouter, mpsc::Receiver<RouterAction>) {
        let (tx, rx) = mpsc::channel(8);
        (
            EventRouter::new(Arc::clone(store), tx, Duration::from_millis(5000)),
            rx,
        )
    }

    #[tokio::test]
    async fn test_malformed_payload_is_skipped() {
        let store = Arc::new(ChannelStore::new());
        let (router, _rx) = router(&store);
        router.route(StreamKind::Thread, "not json at all {").await;
        router.route(StreamKind::Volume, "\"just a string\"").await;
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_discriminant_is_ignored() {
        let store = Arc::new(ChannelStore::new());
        let (router, _rx) = router(&store);
        router
            .route(
                StreamKind::Thread,
                r#"{"type":"connection_stats","activeConnections":2}"#,
            )
            .await;
        assert!(store.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_thread_lifecycle_events() {
        let store = Arc::new(ChannelStore::new());
        let (router, _rx) = router(&store);

        router
            .route(
                StreamKind::Thread,
                r#"{"type":"thread_started","channelId":4,"channelName":"Escenario"}"#,
            )
            .await;
        let ch = store.get(4).await.unwrap();
        assert_eq!(ch.status, ChannelStatus::Running);
        assert!(ch.is_running);
        assert_eq!(ch.name, "Escenario");

        router
            .route(
                StreamKind::Thread,
                r#"{"type":"threadFinished","channelId":4}"#,
            )
            .await;
        let ch = store.get(4).await.unwrap();
        assert_eq!(ch.status, ChannelStatus::Stopped);
        assert!(!ch.is_running);
    }

    #[tokio::test]
    async fn test_status_change_applied_verbatim_or_ignored() {
        let store = Arc::new(ChannelStore::new());
        let (router, _rx) = router(&store);

        router
            .route(
                StreamKind::Thread,
                r#"{"type":"thread_status_change","channelId":2,"oldStatus":"STOPPED","newStatus":"RUNNING"}"#,
            )
            .await;
        assert_eq!(store.get(2).await.unwrap().status, ChannelStatus::Running);

        // Unmodelled status: logged and dropped, channel untouched
        router
            .route(
                StreamKind::Thread,
                r#"{"type":"thread_status_change","channelId":2,"newStatus":"WAITING"}"#,
            )
            .await;
        assert_eq!(store.get(2).await.unwrap().status, ChannelStatus::Running);

        // Missing newStatus entirely
        router
            .route(
                StreamKind::Thread,
                r#"{"type":"thread_status_change","channelId":2}"#,
            )
            .await;
        assert_eq!(store.get(2).await.unwrap().status, ChannelStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exception_clears_after_display_window() {
        let store = Arc::new(ChannelStore::new());
        let (router, _rx) = router(&store);

        router
            .route(
                StreamKind::Thread,
                r#"{"type":"thread_exception","channelId":9,"exceptionType":"IOError","errorMessage":"device lost"}"#,
            )
            .await;
        let ch = store.get(9).await.unwrap();
        assert_eq!(ch.status, ChannelStatus::Error);
        assert_eq!(ch.last_error.as_deref(), Some("device lost"));

        // Concurrent event for a *different* channel must not disturb the window
        router
            .route(
                StreamKind::Thread,
                r#"{"type":"thread_started","channelId":10}"#,
            )
            .await;

        tokio::time::sleep(Duration::from_millis(4999)).await;
        assert_eq!(store.get(9).await.unwrap().status, ChannelStatus::Error);

        tokio::time::sleep(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        let ch = store.get(9).await.unwrap();
        assert_eq!(ch.status, ChannelStatus::Stopped);
        assert!(ch.last_error.is_none());
        assert_eq!(store.get(10).await.unwrap().status, ChannelStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exception_clear_yields_to_newer_write() {
        let store = Arc::new(ChannelStore::new());
        let (router, _rx) = router(&store);

        router
            .route(
                StreamKind::Thread,
                r#"{"type":"thread_exception","channelId":9,"errorMessage":"boom"}"#,
            )
            .await;
        // The channel restarts before the window elapses
        router
            .route(
                StreamKind::Thread,
                r#"{"type":"thread_started","channelId":9}"#,
            )
            .await;

        tokio::time::sleep(Duration::from_millis(5001)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.get(9).await.unwrap().status, ChannelStatus::Running);
    }

    #[tokio::test]
    async fn test_mute_all_except_and_unmute() {
        let store = Arc::new(ChannelStore::new());
        let (router, mut rx) = router(&store);
        for id in [3u8, 7, 12] {
            store
                .apply(ChannelPatch::new(id).volume(60).status(ChannelStatus::Running))
                .await
                .unwrap();
        }

        router
            .route(
                StreamKind::Thread,
                r#"{"type":"massVolumeUpdate","action":"muteAllExcept","exceptedChannelId":7}"#,
            )
            .await;
        assert_eq!(store.get(7).await.unwrap().volume, 60);
        assert!(store.get(7).await.unwrap().is_soloed);
        assert_eq!(store.get(3).await.unwrap().volume, 0);
        assert_eq!(store.get(12).await.unwrap().volume, 0);

        router
            .route(
                StreamKind::Thread,
                r#"{"type":"massVolumeUpdate","action":"unmuteChannels"}"#,
            )
            .await;
        assert!(!store.get(7).await.unwrap().is_soloed);
        // Restored volumes come from REST: the router asks for a refresh
        assert_eq!(rx.recv().await, Some(RouterAction::RefreshVolumes));
    }

    #[tokio::test]
    async fn test_volume_event_touches_named_channel_only() {
        let store = Arc::new(ChannelStore::new());
        let (router, _rx) = router(&store);
        store.apply(ChannelPatch::new(1).volume(10)).await.unwrap();

        router
            .route(
                StreamKind::Volume,
                r#"{"type":"volume","channelId":2,"volumeLevel":77}"#,
            )
            .await;
        assert_eq!(store.get(2).await.unwrap().volume, 77);
        assert_eq!(store.get(1).await.unwrap().volume, 10);
    }

    #[tokio::test]
    async fn test_connection_welcome_seeds_running_state() {
        let store = Arc::new(ChannelStore::new());
        let (router, _rx) = router(&store);

        router
            .route(
                StreamKind::Thread,
                r#"{"type":"connection","status":"connected","activeThreads":[
                    {"channelId":1,"channelName":"Sala","status":"RUNNING","volume":40},
                    {"channelId":8,"volume":15}
                ]}"#,
            )
            .await;
        let ch = store.get(1).await.unwrap();
        assert!(ch.is_running);
        assert_eq!(ch.volume, 40);
        assert_eq!(ch.name, "Sala");
        // Entries without an explicit status default to running
        assert!(store.get(8).await.unwrap().is_running);
    }
}
