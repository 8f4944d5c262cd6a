//! Render projection — draws the channel grid and status line from store
//! snapshots.  Pure: reads state in, emits text out, mutates nothing.

use gridmix_proto::protocol::{ChannelStatus, ServerStatus};
use gridmix_proto::state::{Channel, CHANNEL_SLOTS};

use crate::conn::LinkStatus;

pub const GRID_ROWS: u8 = 4;
pub const GRID_COLS: u8 = 8;

const CELL_WIDTH: usize = 14;

/// Everything the projection needs for one frame.
pub struct Frame<'a> {
    pub channels: &'a [Channel],
    pub thread_link: LinkStatus,
    pub volume_link: LinkStatus,
    pub server: Option<&'a ServerStatus>,
    pub notice: Option<&'a str>,
}

pub fn draw(frame: &Frame<'_>) -> String {
    let mut out = String::new();

    for row in 0..GRID_ROWS {
        let mut top = String::new();
        let mut bottom = String::new();
        for col in 0..GRID_COLS {
            let id = row * GRID_COLS + col + 1;
            let channel = frame.channels.iter().find(|ch| ch.id == id);
            let (t, b) = cell(id, channel);
            top.push_str(&t);
            bottom.push_str(&b);
        }
        out.push_str(top.trim_end());
        out.push('\n');
        out.push_str(bottom.trim_end());
        out.push('\n');
    }

    out.push_str(&status_line(frame));
    out.push('\n');
    if let Some(notice) = frame.notice {
        out.push_str("! ");
        out.push_str(notice);
        out.push('\n');
    }
    out
}

/// One grid slot, two lines.  Absent ids render as empty placeholders.
fn cell(id: u8, channel: Option<&Channel>) -> (String, String) {
    debug_assert!(id >= 1 && id <= CHANNEL_SLOTS);
    match channel {
        None => (
            format!("{:<width$}", format!("[{id:>2} --    ]"), width = CELL_WIDTH),
            format!("{:<width$}", "", width = CELL_WIDTH),
        ),
        Some(ch) => {
            let marker = match ch.status {
                ChannelStatus::Running => '*',
                ChannelStatus::Stopped => '.',
                ChannelStatus::Error => '!',
            };
            let solo = if ch.is_soloed { "S" } else { " " };
            let name: String = ch.display_name().chars().take(CELL_WIDTH - 2).collect();
            (
                format!(
                    "{:<width$}",
                    format!("[{:>2} {marker}{solo} {:>3}]", ch.id, ch.volume),
                    width = CELL_WIDTH
                ),
                format!("{:<width$}", name, width = CELL_WIDTH),
            )
        }
    }
}

fn status_line(frame: &Frame<'_>) -> String {
    let server = match frame.server {
        Some(s) if s.is_reachable => format!("servidor {}", s.status),
        Some(s) => format!(
            "servidor {} ({})",
            s.status,
            s.error_message.as_deref().unwrap_or("sin detalle")
        ),
        None => "servidor ?".to_string(),
    };
    format!(
        "hilos: {} | volumen: {} | {}",
        link_label(frame.thread_link),
        link_label(frame.volume_link),
        server
    )
}

fn link_label(status: LinkStatus) -> &'static str {
    match status {
        LinkStatus::Connecting => "conectando",
        LinkStatus::Open => "conectado",
        LinkStatus::Closed => "desconectado",
    }
}
