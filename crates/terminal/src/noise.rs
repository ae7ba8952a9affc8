//! Recognizing shell noise in PTY output.
//!
//! A shell echoes what it is sent, redraws prompts and toggles terminal modes.
//! None of that is command output. [`NoiseFilter`] classifies whole lines;
//! [`InteractiveFilter`] applies the light-weight version of the same rules to
//! output that arrives while no exec request is running.

use crate::protocol::{BEGIN_PREFIX, DONE_PREFIX, DONE_PRINTF};
use crate::shell::ShellDialect;
use regex::bytes::Regex;
use settings::NoiseProfile;
use std::sync::Arc;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

enum Escape {
    Complete(usize),
    Partial,
    Absent,
}

/// Length of the escape sequence at the front of `bytes`, if any.
fn leading_escape(bytes: &[u8]) -> Escape {
    match bytes {
        [ESC] => Escape::Partial,
        [ESC, b'[', rest @ ..] => {
            for (i, &b) in rest.iter().enumerate() {
                match b {
                    0x40..=0x7e => return Escape::Complete(i + 3),
                    0x20..=0x3f => continue,
                    // malformed; drop the introducer and parameters only
                    _ => return Escape::Complete(i + 2),
                }
            }
            Escape::Partial
        }
        [ESC, b']', rest @ ..] => {
            for (i, &b) in rest.iter().enumerate() {
                if b == BEL {
                    return Escape::Complete(i + 3);
                }
                if b == ESC && rest.get(i + 1) == Some(&b'\\') {
                    return Escape::Complete(i + 4);
                }
            }
            Escape::Partial
        }
        [ESC, _, ..] => Escape::Complete(2),
        _ => Escape::Absent,
    }
}

/// Strip escape sequences from the front of `bytes`.
///
/// The flag is set when an unfinished sequence is left at the front.
pub(crate) fn strip_escapes(mut bytes: &[u8]) -> (&[u8], bool) {
    loop {
        match leading_escape(bytes) {
            Escape::Complete(n) => bytes = &bytes[n..],
            Escape::Partial => return (bytes, true),
            Escape::Absent => return (bytes, false),
        }
    }
}

/// The part of a line that stays on screen: whatever follows the last
/// carriage return, ignoring the line ending itself.
pub(crate) fn last_segment(line: &[u8]) -> &[u8] {
    let line = trim_line_end(line);
    match line.iter().rposition(|&b| b == b'\r') {
        Some(i) => &line[i + 1..],
        None => line,
    }
}

pub(crate) fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Visible text of a line: the last segment with leading escapes removed.
pub fn visible_text(line: &[u8]) -> &[u8] {
    strip_escapes(last_segment(line)).0
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

/// Whether `bytes` ends with a proper, non-empty prefix of `token`.
fn ends_with_prefix_of(bytes: &[u8], token: &[u8]) -> bool {
    (1..token.len()).any(|k| bytes.ends_with(&token[..k]))
}

/// Line classifier for one shell.
#[derive(Debug)]
pub struct NoiseFilter {
    tokens: Vec<Vec<u8>>,
    patterns: Vec<Regex>,
    prompt_chars: Vec<char>,
}

impl NoiseFilter {
    /// Build a filter from the shell's dialect and its noise table.
    ///
    /// Invalid patterns are logged and skipped.
    pub fn new(dialect: ShellDialect, profile: &NoiseProfile) -> Self {
        let tokens = [
            BEGIN_PREFIX,
            DONE_PREFIX,
            dialect.capture_statement(),
            DONE_PRINTF,
        ]
        .iter()
        .map(|token| token.as_bytes().to_vec())
        .collect();

        let patterns = profile
            .patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    tracing::warn!("Ignoring invalid noise pattern {:?}: {}", pattern, e);
                    None
                }
            })
            .collect();

        Self {
            tokens,
            patterns,
            prompt_chars: profile.prompt_chars().chars().collect(),
        }
    }

    /// Whether a complete line is noise and must not reach captured output.
    pub fn is_noise(&self, line: &[u8]) -> bool {
        self.is_protocol_line(line) || self.is_bare_prompt(line) || self.matches_pattern(line)
    }

    /// Line carries wrapper text: a marker, the exit-code capture or the done `printf`.
    pub fn is_protocol_line(&self, line: &[u8]) -> bool {
        self.tokens.iter().any(|token| contains(line, token))
    }

    /// Line shows nothing but prompt characters and whitespace.
    pub fn is_bare_prompt(&self, line: &[u8]) -> bool {
        let (text, unfinished) = strip_escapes(last_segment(line));
        if unfinished {
            return false;
        }
        let text = String::from_utf8_lossy(text);
        let text = text.trim();
        !text.is_empty() && self.is_prompt_filler(text)
    }

    fn matches_pattern(&self, line: &[u8]) -> bool {
        let line = trim_line_end(line);
        self.patterns.iter().any(|pattern| pattern.is_match(line))
    }

    fn is_prompt_filler(&self, text: &str) -> bool {
        text.chars()
            .all(|c| c.is_whitespace() || self.prompt_chars.contains(&c))
    }

    /// Whether an unterminated line could still turn out to be noise once
    /// the rest of it arrives.
    ///
    /// Configured patterns are only applied to complete lines.
    pub fn may_become_noise(&self, partial: &[u8]) -> bool {
        let (text, unfinished) = strip_escapes(last_segment(partial));
        if unfinished {
            return true;
        }
        if self.is_prompt_filler(&String::from_utf8_lossy(text)) {
            return true;
        }
        self.tokens
            .iter()
            .any(|token| contains(partial, token) || ends_with_prefix_of(partial, token))
    }
}

/// Filter for output that arrives while no exec request is in flight.
///
/// Drops complete lines that carry wrapper text (echoes of a request that
/// already timed out, for example) and, once after each exec or at session
/// start, a bare prompt line. Partial lines always pass so that a live prompt
/// shows immediately.
#[derive(Debug)]
pub struct InteractiveFilter {
    noise: Arc<NoiseFilter>,
    suppress_prompt: bool,
    at_line_start: bool,
}

impl InteractiveFilter {
    pub fn new(noise: Arc<NoiseFilter>) -> Self {
        Self {
            noise,
            suppress_prompt: false,
            at_line_start: true,
        }
    }

    /// Drop the next line if it is bare prompt filler.
    pub fn suppress_next_prompt(&mut self) {
        self.suppress_prompt = true;
        self.at_line_start = true;
    }

    pub fn filter(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(chunk.len());
        for piece in chunk.split_inclusive(|&b| b == b'\n') {
            let complete = piece.ends_with(b"\n");
            let whole_line = complete && self.at_line_start;
            self.at_line_start = complete;

            if std::mem::take(&mut self.suppress_prompt)
                && whole_line
                && self.noise.is_bare_prompt(piece)
            {
                continue;
            }
            if whole_line && self.noise.is_protocol_line(piece) {
                continue;
            }
            out.extend_from_slice(piece);
        }
        out
    }
}
