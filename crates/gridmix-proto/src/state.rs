use std::collections::BTreeMap;

use tokio::sync::{watch, RwLock};
use tracing::warn;

use crate::protocol::{ChannelStatus, StatusChannel};

/// The grid renders exactly this many slots; ids outside 1..=CHANNEL_SLOTS
/// are rejected at the store boundary.
pub const CHANNEL_SLOTS: u8 = 32;

pub const MAX_VOLUME: u8 = 100;

/// One audio channel as known to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: u8,
    pub name: String,
    pub is_running: bool,
    pub volume: u8,
    pub is_soloed: bool,
    pub status: ChannelStatus,
    pub last_error: Option<String>,
    /// Monotonic per-channel write counter.  Every applied mutation bumps
    /// it; rollbacks of optimistic updates are valid only while it is
    /// unchanged (last-write-wins).
    pub rev: u64,
}

impl Channel {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            name: String::new(),
            is_running: false,
            volume: 0,
            is_soloed: false,
            status: ChannelStatus::Stopped,
            last_error: None,
            rev: 0,
        }
    }

    /// Display label; unnamed channels fall back to "Canal {id}".
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("Canal {}", self.id)
        } else {
            self.name.clone()
        }
    }

    pub fn from_status(dto: &StatusChannel) -> Self {
        let mut ch = Self::new(dto.id);
        ch.name = dto.name.clone();
        // `status` supersedes `isRunning` when the backend sends both.
        match dto.status {
            Some(status) => {
                ch.status = status;
                ch.is_running = status.is_running();
            }
            None => {
                ch.is_running = dto.is_running;
                ch.status = if dto.is_running {
                    ChannelStatus::Running
                } else {
                    ChannelStatus::Stopped
                };
            }
        }
        ch.volume = dto.volume.min(MAX_VOLUME);
        ch.is_soloed = dto.solo_muted_thread.unwrap_or(false);
        ch
    }
}

/// Partial update merged into a channel slot.  Unset fields are left alone.
/// `last_error` is doubly optional so a patch can explicitly clear it.
#[derive(Debug, Clone, Default)]
pub struct ChannelPatch {
    pub id: u8,
    pub name: Option<String>,
    pub is_running: Option<bool>,
    pub volume: Option<u8>,
    pub is_soloed: Option<bool>,
    pub status: Option<ChannelStatus>,
    pub last_error: Option<Option<String>>,
}

impl ChannelPatch {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn status(mut self, status: ChannelStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn volume(mut self, volume: u8) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn soloed(mut self, soloed: bool) -> Self {
        self.is_soloed = Some(soloed);
        self
    }

    pub fn error(mut self, message: Option<String>) -> Self {
        self.last_error = Some(message);
        self
    }
}

/// Authoritative channel-id → state table.  Single source of truth for
/// rendering; mutated from REST responses, push events, and optimistic
/// command handlers, all of which go through the same merge path.
///
/// Every mutation emits exactly one render notification (a bump of the
/// store generation on a watch channel), after the full merge is applied.
pub struct ChannelStore {
    channels: RwLock<BTreeMap<u8, Channel>>,
    notify_tx: watch::Sender<u64>,
}

impl Default for ChannelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelStore {
    pub fn new() -> Self {
        let (notify_tx, _) = watch::channel(0);
        Self {
            channels: RwLock::new(BTreeMap::new()),
            notify_tx,
        }
    }

    /// Render trigger: receives the store generation after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify_tx.subscribe()
    }

    pub async fn get(&self, id: u8) -> Option<Channel> {
        self.channels.read().await.get(&id).cloned()
    }

    /// All known channels, ordered by id.  Absent ids are simply absent —
    /// the render layer fills placeholders, never the store.
    pub async fn snapshot(&self) -> Vec<Channel> {
        self.channels.read().await.values().cloned().collect()
    }

    /// Merge a partial update into its channel slot, creating the slot on
    /// first sight.  Returns the channel's new rev, or `None` when the
    /// patch is rejected (id out of range) — the store is left unchanged
    /// and the rejection logged, never raised.
    pub async fn apply(&self, patch: ChannelPatch) -> Option<u64> {
        if !valid_id(patch.id) {
            warn!("ChannelStore: rejecting patch with invalid id {}", patch.id);
            return None;
        }
        let rev = {
            let mut channels = self.channels.write().await;
            let channel = channels
                .entry(patch.id)
                .or_insert_with(|| Channel::new(patch.id));
            merge(channel, &patch);
            channel.rev += 1;
            channel.rev
        };
        self.bump();
        Some(rev)
    }

    /// Rollback path for optimistic updates: apply `patch` only while the
    /// channel's rev still equals `token`.  A push event or REST refresh
    /// landing in between bumps the rev and wins; the stale rollback is
    /// then discarded.  Returns whether the patch was applied.
    pub async fn revert_if_unchanged(&self, id: u8, token: u64, patch: ChannelPatch) -> bool {
        if !valid_id(id) {
            return false;
        }
        let applied = {
            let mut channels = self.channels.write().await;
            match channels.get_mut(&id) {
                Some(channel) if channel.rev == token => {
                    merge(channel, &patch);
                    channel.rev += 1;
                    true
                }
                _ => false,
            }
        };
        if applied {
            self.bump();
        }
        applied
    }

    /// Full replacement from an authoritative REST refresh.  Channels
    /// absent from the fetch are dropped; surviving channels keep their
    /// rev counter monotonic so in-flight rollback tokens stay stale.
    pub async fn replace_all(&self, incoming: Vec<Channel>) {
        {
            let mut channels = self.channels.write().await;
            let old = std::mem::take(&mut *channels);
            for mut ch in incoming {
                if !valid_id(ch.id) {
                    warn!("ChannelStore: dropping refreshed channel with invalid id {}", ch.id);
                    continue;
                }
                ch.rev = old.get(&ch.id).map(|prev| prev.rev).unwrap_or(0) + 1;
                ch.volume = ch.volume.min(MAX_VOLUME);
                channels.insert(ch.id, ch);
            }
        }
        self.bump();
    }

    /// Zero every channel's volume except `excepted`, marking the excepted
    /// channel soloed.  One notification for the whole sweep.
    pub async fn mute_all_except(&self, excepted: u8) {
        {
            let mut channels = self.channels.write().await;
            for channel in channels.values_mut() {
                if channel.id == excepted {
                    channel.is_soloed = true;
                } else {
                    channel.volume = 0;
                    channel.is_soloed = false;
                }
                channel.rev += 1;
            }
        }
        self.bump();
    }

    /// Drop the solo marker everywhere (volumes come back via refresh).
    pub async fn clear_solo(&self) {
        {
            let mut channels = self.channels.write().await;
            for channel in channels.values_mut() {
                if channel.is_soloed {
                    channel.is_soloed = false;
                    channel.rev += 1;
                }
            }
        }
        self.bump();
    }

    fn bump(&self) {
        self.notify_tx.send_modify(|g| *g += 1);
    }
}

fn valid_id(id: u8) -> bool {
    (1..=CHANNEL_SLOTS).contains(&id)
}

fn merge(channel: &mut Channel, patch: &ChannelPatch) {
    if let Some(ref name) = patch.name {
        channel.name = name.clone();
    }
    if let Some(volume) = patch.volume {
        channel.volume = volume.min(MAX_VOLUME);
    }
    if let Some(soloed) = patch.is_soloed {
        channel.is_soloed = soloed;
    }
    // `status` is authoritative: whenever a patch carries one, is_running
    // is derived from it so the two can never disagree in a snapshot.
    match (patch.status, patch.is_running) {
        (Some(status), _) => {
            channel.status = status;
            channel.is_running = status.is_running();
        }
        (None, Some(running)) => {
            channel.is_running = running;
            channel.status = if running {
                ChannelStatus::Running
            } else {
                ChannelStatus::Stopped
            };
        }
        (None, None) => {}
    }
    if let Some(ref last_error) = patch.last_error {
        channel.last_error = last_error.clone();
    }
}
