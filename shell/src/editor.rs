//! ANSI/CSI-aware line editor.
//!
//! Reads byte-at-a-time from stdin in cooked mode. Recognizes Ctrl-A
//! (home), Ctrl-E (end), Ctrl-K (kill-to-end), Ctrl-U (kill-to-start),
//! Ctrl-W (kill previous word), backspace/DEL, and CSI up/down (history
//! walk, preserving the pre-walk input) / left/right (cursor move).
//! Redraws by emitting `\r`, the prompt, the buffer, `CSI K`, then
//! `CSI <n> C`.
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::history::History;

/// What happened as a result of feeding one byte to the editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// The buffer changed; redraw with [`LineEditor::render`].
    Redraw,
    /// Enter was pressed; the line is complete.
    Submit(String),
    /// Nothing observable happened (e.g. an incomplete escape sequence).
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EscapeState {
    Idle,
    SawEsc,
    SawCsi,
}

/// Editable line state plus an in-progress history walk.
pub struct LineEditor {
    buf: Vec<char>,
    cursor: usize,
    escape: EscapeState,
    history_offset: usize,
    preserved: Option<String>,
}

impl Default for LineEditor {
    fn default() -> Self {
        Self::new()
    }
}

impl LineEditor {
    /// A fresh, empty line.
    #[must_use]
    pub fn new() -> Self {
        LineEditor {
            buf: Vec::new(),
            cursor: 0,
            escape: EscapeState::Idle,
            history_offset: 0,
            preserved: None,
        }
    }

    /// The buffer's current text.
    #[must_use]
    pub fn text(&self) -> String {
        self.buf.iter().collect()
    }

    /// Redraws the line: `\r`, `prompt`, the buffer, clear-to-end-of-line,
    /// then reposition the cursor.
    #[must_use]
    pub fn render(&self, prompt: &str) -> String {
        let text = self.text();
        let tail = self.buf.len() - self.cursor;
        let mut out = String::from("\r");
        out.push_str(prompt);
        out.push_str(&text);
        out.push_str("\x1b[K");
        if tail > 0 {
            out.push_str("\x1b[");
            out.push_str(&tail.to_string());
            out.push('C');
        }
        out
    }

    fn reset_after_submit(&mut self) {
        self.buf.clear();
        self.cursor = 0;
        self.history_offset = 0;
        self.preserved = None;
    }

    fn kill_previous_word(&mut self) {
        let mut i = self.cursor;
        while i > 0 && self.buf[i - 1] == ' ' {
            i -= 1;
        }
        while i > 0 && self.buf[i - 1] != ' ' {
            i -= 1;
        }
        self.buf.drain(i..self.cursor);
        self.cursor = i;
    }

    fn walk_history(&mut self, history: &History, forward: bool) {
        if forward {
            if self.history_offset > 0 {
                self.history_offset -= 1;
            }
        } else if self.history_offset < usize::MAX {
            let next = self.history_offset + 1;
            if history.back(next).is_some() {
                self.history_offset = next;
            } else {
                return;
            }
        }
        if self.preserved.is_none() {
            self.preserved = Some(self.text());
        }
        let replacement = if self.history_offset == 0 {
            self.preserved.clone().unwrap_or_default()
        } else {
            history.back(self.history_offset).unwrap_or("").to_string()
        };
        self.buf = replacement.chars().collect();
        self.cursor = self.buf.len();
        if self.history_offset == 0 {
            self.preserved = None;
        }
    }

    /// Feeds one input byte. `history` backs the up/down walk.
    pub fn feed(&mut self, byte: u8, history: &History) -> Action {
        match self.escape {
            EscapeState::Idle => {}
            EscapeState::SawEsc => {
                self.escape = if byte == b'[' {
                    EscapeState::SawCsi
                } else {
                    EscapeState::Idle
                };
                return Action::None;
            }
            EscapeState::SawCsi => {
                self.escape = EscapeState::Idle;
                match byte {
                    b'A' => self.walk_history(history, false),
                    b'B' => self.walk_history(history, true),
                    b'C' => {
                        if self.cursor < self.buf.len() {
                            self.cursor += 1;
                        }
                    }
                    b'D' => {
                        if self.cursor > 0 {
                            self.cursor -= 1;
                        }
                    }
                    _ => return Action::None,
                }
                return Action::Redraw;
            }
        }

        match byte {
            b'\r' | b'\n' => {
                let line = self.text();
                self.reset_after_submit();
                Action::Submit(line)
            }
            0x01 => {
                self.cursor = 0;
                Action::Redraw
            }
            0x05 => {
                self.cursor = self.buf.len();
                Action::Redraw
            }
            0x0B => {
                self.buf.truncate(self.cursor);
                Action::Redraw
            }
            0x15 => {
                self.buf.drain(0..self.cursor);
                self.cursor = 0;
                Action::Redraw
            }
            0x17 => {
                self.kill_previous_word();
                Action::Redraw
            }
            0x08 | 0x7F => {
                if self.cursor > 0 {
                    self.buf.remove(self.cursor - 1);
                    self.cursor -= 1;
                }
                Action::Redraw
            }
            0x1B => {
                self.escape = EscapeState::SawEsc;
                Action::None
            }
            b if b >= 0x20 => {
                self.buf.insert(self.cursor, b as char);
                self.cursor += 1;
                Action::Redraw
            }
            _ => Action::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_str(ed: &mut LineEditor, s: &str, h: &History) {
        for b in s.bytes() {
            ed.feed(b, h);
        }
    }

    #[test]
    fn typing_then_enter_submits_the_line() {
        let h = History::new();
        let mut ed = LineEditor::new();
        feed_str(&mut ed, "echo hi", &h);
        assert_eq!(ed.feed(b'\r', &h), Action::Submit("echo hi".into()));
        assert_eq!(ed.text(), "");
    }

    #[test]
    fn ctrl_a_then_ctrl_k_clears_to_end() {
        let h = History::new();
        let mut ed = LineEditor::new();
        feed_str(&mut ed, "hello", &h);
        ed.feed(0x01, &h);
        ed.feed(0x0B, &h);
        assert_eq!(ed.text(), "");
    }

    #[test]
    fn ctrl_w_kills_previous_word() {
        let h = History::new();
        let mut ed = LineEditor::new();
        feed_str(&mut ed, "echo hello world", &h);
        ed.feed(0x17, &h);
        assert_eq!(ed.text(), "echo hello ");
    }

    #[test]
    fn up_arrow_recalls_history_and_down_restores_pre_walk_input() {
        let mut h = History::new();
        h.record("first");
        h.record("second");
        let mut ed = LineEditor::new();
        feed_str(&mut ed, "typing", &h);
        ed.feed(0x1B, &h);
        ed.feed(b'[', &h);
        ed.feed(b'A', &h);
        assert_eq!(ed.text(), "second");
        ed.feed(0x1B, &h);
        ed.feed(b'[', &h);
        ed.feed(b'B', &h);
        assert_eq!(ed.text(), "typing");
    }

    #[test]
    fn backspace_removes_the_preceding_character() {
        let h = History::new();
        let mut ed = LineEditor::new();
        feed_str(&mut ed, "abc", &h);
        ed.feed(0x7F, &h);
        assert_eq!(ed.text(), "ab");
    }
}
