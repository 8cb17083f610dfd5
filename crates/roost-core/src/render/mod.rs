//! Pure status renderer: `StatusSnapshot` in, ANSI bytes out.
//!
//! [`render`] never touches the terminal or any process state; the
//! display loop decides when to write its output.

pub mod style;
pub mod text;

use chrono::Duration;

use crate::snapshot::{McpServerStatus, StatusSnapshot, Tone};
use crate::terminal::layout::{STATUS_BAR_ROWS, SidebarGeometry, Viewport};

use style::RowBuilder;
use text::capped_list;

/// Product label at the left of the bar.
pub const LABEL: &str = "roost";
/// How many names each sidebar list shows before `+N more`.
pub const LIST_CAP: usize = 4;
/// Errors older than this are no longer shown.
pub const ERROR_VISIBLE_SECS: i64 = 30;

const SAVE_CURSOR: &str = "\x1b7";
const RESTORE_CURSOR: &str = "\x1b8";

const BAR_BG: u8 = 236;
const BAR_FG: u8 = 252;
const PANEL_BG: u8 = 234;
const PANEL_FG: u8 = 250;
const DIM: u8 = 244;

fn tone_color(tone: Tone) -> u8 {
    match tone {
        Tone::Neutral => 250,
        Tone::Good => 114,
        Tone::Busy => 75,
        Tone::Warn => 214,
        Tone::Bad => 203,
    }
}

/// Draw the status bar and, when it fits, the sidebar panel.
///
/// Returns an empty buffer when the layout is passthrough.
pub fn render(snap: &StatusSnapshot) -> Vec<u8> {
    let Some(viewport) = snap.layout.viewport() else {
        return Vec::new();
    };
    if snap.layout.is_passthrough() {
        return Vec::new();
    }

    let mut out = String::from(SAVE_CURSOR);
    out.push_str(&status_bar(snap, viewport));
    if let Some(geometry) = snap.layout.sidebar() {
        for row in sidebar(snap, geometry) {
            out.push_str(&row);
        }
    }
    out.push_str(RESTORE_CURSOR);
    out.into_bytes()
}

fn status_bar(snap: &StatusSnapshot, viewport: Viewport) -> String {
    let mut row = RowBuilder::new(STATUS_BAR_ROWS, viewport.cols, BAR_BG, BAR_FG);
    row.bold(&format!(" {LABEL} "));

    let session = &snap.session;
    if !session.habitat_id.is_empty() || !session.queue_id.is_empty() {
        row.text(&format!("{}/{} ", session.habitat_id, session.queue_id));
    }

    row.colored(&format!("● {} ", snap.status.label()), tone_color(snap.status.tone()));

    if let Some(job) = &snap.active_job {
        row.text(&format!("job {} ({}) ", job.id, job.backend_type));
    }

    let c = &snap.counters;
    row.text(&format!("done {} ", c.jobs_completed));
    if c.jobs_failed > 0 {
        row.colored(&format!("failed {} ", c.jobs_failed), tone_color(Tone::Bad));
    } else {
        row.text("failed 0 ");
    }
    let beat_tone = if c.heartbeats_failed > 0 {
        Tone::Warn
    } else {
        Tone::Neutral
    };
    row.colored(&format!("hb {} ", c.heartbeats_sent), tone_color(beat_tone));

    if snap.copy_mode {
        row.colored("COPY ", tone_color(Tone::Warn));
    } else {
        row.colored("LIVE ", tone_color(Tone::Good));
    }

    row.right(&format!("{} UTC ", snap.now.format("%H:%M:%S")));
    row.finish()
}

fn sidebar(snap: &StatusSnapshot, geometry: SidebarGeometry) -> Vec<String> {
    let rows: [fn(&StatusSnapshot, &mut RowBuilder); 7] = [
        bundle_line,
        |s, r| list_line(r, "agents", &s.bundle.agents),
        |s, r| list_line(r, "skills", &s.bundle.skills),
        |s, r| list_line(r, "tools", &s.bundle.tools),
        mcp_line,
        session_line,
        error_line,
    ];

    rows.iter()
        .take(usize::from(geometry.height))
        .enumerate()
        .map(|(i, draw)| {
            // `take` bounds i by the geometry height, which is a u16.
            let offset = u16::try_from(i).unwrap_or(u16::MAX);
            let mut row = RowBuilder::new(geometry.top + offset, geometry.width, PANEL_BG, PANEL_FG);
            draw(snap, &mut row);
            row.finish()
        })
        .collect()
}

fn key(row: &mut RowBuilder, name: &str) {
    row.colored(&format!(" {name:<8}"), DIM);
}

fn bundle_line(snap: &StatusSnapshot, row: &mut RowBuilder) {
    let b = &snap.bundle;
    key(row, "bundle");
    if b.name.is_empty() {
        row.text("none");
        return;
    }
    row.bold(&b.name);
    row.text(&format!(
        " v{}  {} layers · {} agents · {} skills · {} tools",
        b.version,
        b.layers.len(),
        b.agents.len(),
        b.skills.len(),
        b.tools.len()
    ));
}

fn list_line(row: &mut RowBuilder, name: &str, items: &[String]) {
    key(row, name);
    row.text(&capped_list(items, LIST_CAP));
}

fn mcp_flag(server: &McpServerStatus) -> (&'static str, Tone) {
    if !server.loaded {
        ("unloaded", Tone::Neutral)
    } else if server.expired {
        ("expired", Tone::Bad)
    } else if !server.authenticated {
        ("no auth", Tone::Warn)
    } else {
        ("ok", Tone::Good)
    }
}

fn mcp_line(snap: &StatusSnapshot, row: &mut RowBuilder) {
    key(row, "mcp");
    if snap.mcp.is_empty() {
        row.text("none");
        return;
    }
    for (i, server) in snap.mcp.iter().enumerate() {
        if i > 0 {
            row.text("  ");
        }
        let (flag, tone) = mcp_flag(server);
        row.text(&format!("{} ", server.name));
        row.colored(flag, tone_color(tone));
    }
}

fn session_line(snap: &StatusSnapshot, row: &mut RowBuilder) {
    let s = &snap.session;
    key(row, "session");
    row.text(&format!(
        "worker {} · backends {}",
        if s.worker_id.is_empty() { "-" } else { s.worker_id.as_str() },
        if snap.backends.is_empty() {
            "none".to_string()
        } else {
            snap.backends.join(", ")
        }
    ));
}

fn error_line(snap: &StatusSnapshot, row: &mut RowBuilder) {
    let Some(err) = &snap.last_error else {
        return;
    };
    if snap.now - err.at > Duration::seconds(ERROR_VISIBLE_SECS) {
        return;
    }
    key(row, "error");
    row.colored(&err.message, tone_color(Tone::Bad));
}
