//! Byte-level classification of raw terminal input.
//!
//! Escape sequences are kept whole so an arrow key or mouse report never
//! gets split around a chord. Bracketed paste is forwarded verbatim with
//! chord recognition off. Sequences cut off at a chunk boundary carry
//! over to the next chunk, except a lone trailing ESC, which is the Esc
//! key itself.

const ESC: u8 = 0x1b;
const CTRL_C: u8 = 0x03;
const CTRL_BACKSLASH: u8 = 0x1c;
const CTRL_BRACKET: u8 = 0x1d;
const CTRL_CARET: u8 = 0x1e;

const PASTE_START: &[u8] = b"\x1b[200~";
const PASTE_END: &[u8] = b"\x1b[201~";
/// Longest escape sequence buffered before it is given up on and
/// flushed as plain bytes.
const MAX_SEQUENCE: usize = 64;

/// Harness-level key chords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chord {
    /// Ctrl-C.
    Interrupt,
    /// Ctrl-\.
    Quit,
    /// Ctrl-^: re-read the terminal size and redo the layout.
    Reprobe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Chord(Chord),
    /// Bytes for the foreground backend.
    Forward(Vec<u8>),
    /// Copy mode was entered (`true`) or left.
    CopyMode(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ground,
    Esc,
    Csi,
    Ss3,
    /// X10 mouse report: `ESC [ M` plus this many raw bytes.
    Mouse(u8),
    Paste,
}

#[derive(Debug)]
pub struct InputDecoder {
    state: State,
    seq: Vec<u8>,
    copy_mode: bool,
    /// How much of [`PASTE_END`] the paste tail has matched so far.
    paste_matched: usize,
}

/// Event list under construction; adjacent forwards are merged.
#[derive(Default)]
struct Events {
    events: Vec<InputEvent>,
    forward: Vec<u8>,
}

impl Events {
    fn forward(&mut self, bytes: &[u8]) {
        self.forward.extend_from_slice(bytes);
    }

    fn push(&mut self, event: InputEvent) {
        self.flush();
        self.events.push(event);
    }

    fn flush(&mut self) {
        if !self.forward.is_empty() {
            let bytes = std::mem::take(&mut self.forward);
            self.events.push(InputEvent::Forward(bytes));
        }
    }

    fn finish(mut self) -> Vec<InputEvent> {
        self.flush();
        self.events
    }
}

impl Default for InputDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl InputDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Ground,
            seq: Vec::with_capacity(16),
            copy_mode: false,
            paste_matched: 0,
        }
    }

    pub fn copy_mode(&self) -> bool {
        self.copy_mode
    }

    /// Classify one chunk read from the terminal.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<InputEvent> {
        let mut events = Events::default();
        for &b in chunk {
            self.step(b, &mut events);
        }
        if self.state == State::Esc {
            self.seq.clear();
            self.state = State::Ground;
            self.escape_key(&mut events);
        }
        events.finish()
    }

    fn step(&mut self, b: u8, events: &mut Events) {
        match self.state {
            State::Ground => self.ground(b, events),
            State::Esc => match b {
                b'[' => {
                    self.seq.push(b);
                    self.state = State::Csi;
                }
                b'O' => {
                    self.seq.push(b);
                    self.state = State::Ss3;
                }
                ESC => {
                    // ESC ESC: the first one was a key press on its own.
                    self.escape_key(events);
                    self.seq.clear();
                    self.seq.push(ESC);
                }
                _ if self.copy_mode => {
                    // Alt-modified key, or Esc typed just before a key.
                    // Either way the Esc leaves copy mode and the key is
                    // swallowed, unless it is the quit chord.
                    self.seq.clear();
                    self.state = State::Ground;
                    self.set_copy_mode(false, events);
                    if b == CTRL_BACKSLASH {
                        events.push(InputEvent::Chord(Chord::Quit));
                    }
                }
                _ => {
                    // Alt-modified key.
                    self.seq.push(b);
                    self.finish_sequence(events);
                }
            },
            State::Csi => {
                self.seq.push(b);
                if self.seq == b"\x1b[M" {
                    self.state = State::Mouse(3);
                } else if (0x40..=0x7e).contains(&b) {
                    if self.seq == PASTE_START {
                        self.paste_matched = 0;
                        self.finish_sequence(events);
                        self.state = State::Paste;
                    } else {
                        self.finish_sequence(events);
                    }
                } else if self.seq.len() >= MAX_SEQUENCE {
                    self.finish_sequence(events);
                }
            }
            State::Ss3 => {
                self.seq.push(b);
                self.finish_sequence(events);
            }
            State::Mouse(remaining) => {
                self.seq.push(b);
                if remaining <= 1 {
                    self.finish_sequence(events);
                } else {
                    self.state = State::Mouse(remaining - 1);
                }
            }
            State::Paste => {
                if !self.copy_mode {
                    events.forward(&[b]);
                }
                if b == PASTE_END[self.paste_matched] {
                    self.paste_matched += 1;
                    if self.paste_matched == PASTE_END.len() {
                        self.paste_matched = 0;
                        self.state = State::Ground;
                    }
                } else {
                    self.paste_matched = usize::from(b == PASTE_END[0]);
                }
            }
        }
    }

    fn ground(&mut self, b: u8, events: &mut Events) {
        if b == ESC {
            self.seq.clear();
            self.seq.push(b);
            self.state = State::Esc;
            return;
        }
        if self.copy_mode {
            match b {
                CTRL_BACKSLASH => events.push(InputEvent::Chord(Chord::Quit)),
                CTRL_BRACKET | b'q' => self.set_copy_mode(false, events),
                _ => {}
            }
            return;
        }
        match b {
            CTRL_C => events.push(InputEvent::Chord(Chord::Interrupt)),
            CTRL_BACKSLASH => events.push(InputEvent::Chord(Chord::Quit)),
            CTRL_BRACKET => self.set_copy_mode(true, events),
            CTRL_CARET => events.push(InputEvent::Chord(Chord::Reprobe)),
            _ => events.forward(&[b]),
        }
    }

    /// A complete (or abandoned) escape sequence: forwarded whole, or
    /// swallowed in copy mode.
    fn finish_sequence(&mut self, events: &mut Events) {
        if !self.copy_mode {
            events.forward(&self.seq);
        }
        self.seq.clear();
        self.state = State::Ground;
    }

    fn escape_key(&mut self, events: &mut Events) {
        if self.copy_mode {
            self.set_copy_mode(false, events);
        } else {
            events.forward(&[ESC]);
        }
    }

    fn set_copy_mode(&mut self, on: bool, events: &mut Events) {
        self.copy_mode = on;
        events.push(InputEvent::CopyMode(on));
    }
}
