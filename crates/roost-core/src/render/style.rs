//! Row builder that keeps SGR state flat.
//!
//! A row sets its base colours once, switches foreground with explicit
//! `38;5;N` codes, turns bold off with `22`, and ends with exactly one
//! full reset. Nothing in the middle of a row emits `ESC[0m`.

use std::fmt::Write as _;

use super::text::{clip, display_width};

pub const RESET: &str = "\x1b[0m";

/// One styled screen row of fixed width.
pub struct RowBuilder {
    buf: String,
    width: usize,
    used: usize,
    base_fg: u8,
}

impl RowBuilder {
    /// Start a row at 1-based `row`, clearing it first.
    pub fn new(row: u16, width: u16, bg: u8, fg: u8) -> Self {
        let mut buf = String::new();
        let _ = write!(buf, "\x1b[{row};1H\x1b[2K\x1b[48;5;{bg}m\x1b[38;5;{fg}m");
        Self {
            buf,
            width: usize::from(width),
            used: 0,
            base_fg: fg,
        }
    }

    fn remaining(&self) -> usize {
        self.width.saturating_sub(self.used)
    }

    /// Append plain text in the base colour.
    pub fn text(&mut self, s: &str) -> &mut Self {
        let clipped = clip(s, self.remaining());
        self.used += display_width(&clipped);
        self.buf.push_str(&clipped);
        self
    }

    /// Append text in 8-bit colour `fg`, then return to the base colour.
    pub fn colored(&mut self, s: &str, fg: u8) -> &mut Self {
        if self.remaining() == 0 {
            return self;
        }
        let _ = write!(self.buf, "\x1b[38;5;{fg}m");
        self.text(s);
        let _ = write!(self.buf, "\x1b[38;5;{}m", self.base_fg);
        self
    }

    pub fn bold(&mut self, s: &str) -> &mut Self {
        if self.remaining() == 0 {
            return self;
        }
        self.buf.push_str("\x1b[1m");
        self.text(s);
        self.buf.push_str("\x1b[22m");
        self
    }

    /// Right-align `s` against the row's end if it fits after a gap.
    pub fn right(&mut self, s: &str) -> &mut Self {
        let w = display_width(s);
        if self.remaining() > w {
            let pad = self.remaining() - w;
            self.buf.push_str(&" ".repeat(pad));
            self.used += pad;
            self.text(s);
        }
        self
    }

    /// Pad to the full width and close with the single trailing reset.
    pub fn finish(mut self) -> String {
        let pad = self.remaining();
        self.buf.push_str(&" ".repeat(pad));
        self.buf.push_str(RESET);
        self.buf
    }
}
