//! Marker framing for exec requests.
//!
//! A request is sent to the shell wrapped so that its output is bracketed by
//! a begin marker line and a done marker line carrying the exit status:
//!
//! ```text
//! printf '\n%s\n' '__PKGTERM_BEGIN_<id>__'; <command>
//! __pkgterm_ec=$?; printf '\n%s%s%s\n' '__PKGTERM_DONE_<id>__' "$__pkgterm_ec" ':END'
//! ```
//!
//! [`ExecDecoder`] recovers the command's output and exit code from the PTY
//! byte stream. Its result does not depend on how the stream is chunked.

use crate::noise::{last_segment, strip_escapes, trim_line_end, visible_text, NoiseFilter};
use crate::shell::ShellDialect;
use crate::types::RequestId;
use std::sync::Arc;

pub const BEGIN_PREFIX: &str = "__PKGTERM_BEGIN_";
pub const DONE_PREFIX: &str = "__PKGTERM_DONE_";
pub const MARKER_SUFFIX: &str = "__";
/// Follows the exit code on the done line.
pub const DONE_TERMINATOR: &str = ":END";
/// The `printf` that emits the begin line. The leading line break moves the
/// marker off a prompt the shell may draw before running the command.
pub const BEGIN_PRINTF: &str = r"printf '\n%s\n'";
/// The `printf` that emits the done line, as the shell echoes it.
pub const DONE_PRINTF: &str = r"printf '\n%s%s%s\n'";

/// Leading escape bytes tolerated in front of a begin marker.
const MAX_ESCAPE_SLACK: usize = 256;

/// The two marker strings for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Markers {
    pub begin: String,
    pub done: String,
}

impl Markers {
    pub fn for_request(id: &RequestId) -> Self {
        Self {
            begin: format!("{BEGIN_PREFIX}{id}{MARKER_SUFFIX}"),
            done: format!("{DONE_PREFIX}{id}{MARKER_SUFFIX}"),
        }
    }
}

/// Wrap `command` for the shell.
///
/// Trailing line breaks on `command` are normalized to exactly one so the
/// exit-code capture lands on its own input line.
pub fn encode(command: &str, markers: &Markers, dialect: ShellDialect) -> String {
    let command = command.trim_end_matches(['\r', '\n']);
    format!(
        "{BEGIN_PRINTF} '{begin}'; {command}\n{capture}; {DONE_PRINTF} '{done}' \"$__pkgterm_ec\" '{DONE_TERMINATOR}'\n",
        begin = markers.begin,
        done = markers.done,
        capture = dialect.capture_statement(),
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeState {
    /// Discarding the shell's echo until the begin marker line.
    AwaitingBegin,
    /// Collecting output until the done marker line.
    Capturing,
    /// Done marker seen; everything further belongs to the shell again.
    Finished,
}

/// A finished request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub exit_code: i32,
    pub stdout: String,
}

/// What one call to [`ExecDecoder::feed`] produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Feed {
    /// Bytes for the display sink.
    pub display: Vec<u8>,
    /// Set once, on the call that consumed the done marker.
    pub completion: Option<Completion>,
    /// Bytes after the done line; the caller treats them as interactive output.
    pub remainder: Vec<u8>,
}

/// Line ending still owed after a done marker matched without one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PendingEnd {
    None,
    CrLf,
    Lf,
}

/// Blank or prompt line kept back until we know whether the done marker
/// follows it.
#[derive(Debug)]
struct HeldLine {
    line: Vec<u8>,
    blank: bool,
    /// Already sent to the display ahead of a partial line.
    shown: bool,
}

/// Incremental decoder for one exec request.
#[derive(Debug)]
pub struct ExecDecoder {
    markers: Markers,
    noise: Arc<NoiseFilter>,
    state: DecodeState,
    /// Current unterminated line (or, before the begin marker, segment).
    line: Vec<u8>,
    /// Before the begin marker: the current segment cannot become the marker.
    skipping: bool,
    /// Bytes of `line` already sent to the display.
    displayed: usize,
    held: Option<HeldLine>,
    captured: Vec<u8>,
    pending_end: PendingEnd,
}

impl ExecDecoder {
    pub fn new(markers: Markers, noise: Arc<NoiseFilter>) -> Self {
        Self {
            markers,
            noise,
            state: DecodeState::AwaitingBegin,
            line: Vec::new(),
            skipping: false,
            displayed: 0,
            held: None,
            captured: Vec::new(),
            pending_end: PendingEnd::None,
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn markers(&self) -> &Markers {
        &self.markers
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Feed {
        let mut feed = Feed::default();
        let mut rest = chunk;
        while !rest.is_empty() {
            rest = match self.state {
                DecodeState::AwaitingBegin => self.scan_begin(rest),
                DecodeState::Capturing => self.scan_done(rest, &mut feed),
                DecodeState::Finished => {
                    let rest = self.consume_pending_end(rest);
                    feed.remainder.extend_from_slice(rest);
                    break;
                }
            };
        }
        if self.state == DecodeState::Capturing {
            self.flush_partial(&mut feed);
        }
        feed
    }

    /// Look for the begin marker as the visible content of a whole line.
    fn scan_begin<'a>(&mut self, data: &'a [u8]) -> &'a [u8] {
        let marker = self.markers.begin.as_bytes();
        for (i, &byte) in data.iter().enumerate() {
            match byte {
                b'\n' => {
                    let matched = !self.skipping && visible_text(&self.line) == marker;
                    self.line.clear();
                    self.skipping = false;
                    if matched {
                        self.state = DecodeState::Capturing;
                        return &data[i + 1..];
                    }
                }
                b'\r' if self.skipping => {
                    // a new segment starts; it may still hold the marker
                    self.skipping = false;
                    self.line.clear();
                }
                _ if self.skipping => {}
                b'\r' => {
                    if visible_text(&self.line) != marker {
                        self.line.clear();
                    }
                    self.line.push(byte);
                }
                _ => {
                    self.line.push(byte);
                    if !self.segment_viable() {
                        self.skipping = true;
                        self.line.clear();
                    }
                }
            }
        }
        &[]
    }

    /// Whether the current segment can still grow into the begin marker.
    fn segment_viable(&self) -> bool {
        let marker = self.markers.begin.as_bytes();
        let (text, unfinished) = strip_escapes(last_segment(&self.line));
        if unfinished {
            return self.line.len() <= marker.len() + MAX_ESCAPE_SLACK;
        }
        marker.starts_with(text)
    }

    fn scan_done<'a>(&mut self, data: &'a [u8], feed: &mut Feed) -> &'a [u8] {
        for (i, &byte) in data.iter().enumerate() {
            self.line.push(byte);
            if byte != b'\n' {
                continue;
            }
            let line = std::mem::take(&mut self.line);
            let displayed = std::mem::replace(&mut self.displayed, 0);
            if let Some(code) = self.match_done(&line) {
                self.finish(code, feed);
                return &data[i + 1..];
            }
            self.accept_line(line, displayed, feed);
        }

        // The done line may be complete before its line ending arrives.
        if let Some(code) = self.match_done(&self.line) {
            self.pending_end = if self.line.ends_with(b"\r") {
                PendingEnd::Lf
            } else {
                PendingEnd::CrLf
            };
            self.line.clear();
            self.displayed = 0;
            self.finish(code, feed);
        }
        &[]
    }

    fn match_done(&self, line: &[u8]) -> Option<i32> {
        let code = visible_text(line)
            .strip_prefix(self.markers.done.as_bytes())?
            .strip_suffix(DONE_TERMINATOR.as_bytes())?;
        let digits = code.strip_prefix(b"-").unwrap_or(code);
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return None;
        }
        std::str::from_utf8(code).ok()?.parse().ok()
    }

    fn accept_line(&mut self, line: Vec<u8>, displayed: usize, feed: &mut Feed) {
        if !self.noise.is_protocol_line(&line) {
            let blank = visible_text(&line).is_empty();
            if blank || self.noise.is_bare_prompt(&line) {
                // The done printf starts with a line break of its own, so the
                // last such line before the marker is not output.
                if let Some(previous) = self.held.replace(HeldLine {
                    line,
                    blank,
                    shown: false,
                }) {
                    self.release(previous, feed);
                }
                return;
            }
        }
        if self.noise.is_noise(&line) {
            return;
        }
        if let Some(held) = self.held.take() {
            self.release(held, feed);
        }
        feed.display.extend_from_slice(&line[displayed.min(line.len())..]);
        self.captured.extend_from_slice(trim_line_end(&line));
        self.captured.push(b'\n');
    }

    /// A held line turned out not to precede the done marker.
    fn release(&mut self, held: HeldLine, feed: &mut Feed) {
        if held.blank {
            if !held.shown {
                feed.display.extend_from_slice(&held.line);
            }
            self.captured.push(b'\n');
        }
    }

    /// Show the unterminated line early unless it may still be noise.
    fn flush_partial(&mut self, feed: &mut Feed) {
        if self.line.len() <= self.displayed || self.noise.may_become_noise(&self.line) {
            return;
        }
        // a held blank line belongs above the partial on screen; whether it
        // is output is still settled by the next whole line
        if let Some(held) = self.held.as_mut().filter(|held| held.blank && !held.shown) {
            feed.display.extend_from_slice(&held.line);
            held.shown = true;
        }
        feed.display.extend_from_slice(&self.line[self.displayed..]);
        self.displayed = self.line.len();
    }

    fn finish(&mut self, exit_code: i32, feed: &mut Feed) {
        self.state = DecodeState::Finished;
        self.held = None;
        let stdout = String::from_utf8_lossy(&std::mem::take(&mut self.captured)).into_owned();
        feed.completion = Some(Completion { exit_code, stdout });
    }

    fn consume_pending_end<'a>(&mut self, mut data: &'a [u8]) -> &'a [u8] {
        if self.pending_end == PendingEnd::CrLf {
            match data.first() {
                Some(b'\r') => {
                    data = &data[1..];
                    self.pending_end = PendingEnd::Lf;
                }
                Some(_) => self.pending_end = PendingEnd::Lf,
                None => return data,
            }
        }
        if self.pending_end == PendingEnd::Lf {
            match data.first() {
                Some(b'\n') => {
                    data = &data[1..];
                    self.pending_end = PendingEnd::None;
                }
                Some(_) => self.pending_end = PendingEnd::None,
                None => {}
            }
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use settings::NoiseProfile;
    use test_case::test_case;

    fn markers() -> Markers {
        Markers {
            begin: "__PKGTERM_BEGIN_t-1__".to_string(),
            done: "__PKGTERM_DONE_t-1__".to_string(),
        }
    }

    fn decoder() -> ExecDecoder {
        let noise = NoiseFilter::new(
            ShellDialect::Posix,
            &NoiseProfile {
                patterns: vec![r"^(\x1b\[\?2004[hl])+\r?$".to_string()],
                prompt_chars: Some("$#%>".to_string()),
            },
        );
        ExecDecoder::new(markers(), Arc::new(noise))
    }

    /// What bash with readline sends back for `echo hello`.
    fn readline_transcript(output: &str, code: i32) -> Vec<u8> {
        let m = markers();
        format!(
            "\x1b[?2004h$ printf '\\n%s\\n' '{b}'; echo hello\r\n\x1b[?2004l\r\r\n{b}\r\n{output}\
             \x1b[?2004h$ __pkgterm_ec=$?; printf '\\n%s%s%s\\n' '{d}' \"$__pkgterm_ec\" ':END'\r\n\
             \x1b[?2004l\r\r\n{d}{code}:END\r\n\x1b[?2004h$ ",
            b = m.begin,
            d = m.done,
        )
        .into_bytes()
    }

    /// What dash sends back: the tty echoes both input lines up front and a
    /// prompt lands before each marker.
    fn canonical_transcript(output: &str, code: i32) -> Vec<u8> {
        let m = markers();
        format!(
            "printf '\\n%s\\n' '{b}'; echo hello\r\n__pkgterm_ec=$?; printf '\\n%s%s%s\\n' '{d}' \"$__pkgterm_ec\" ':END'\r\n\
             $ \r\n{b}\r\n{output}$ \r\n{d}{code}:END\r\n$ ",
            b = m.begin,
            d = m.done,
        )
        .into_bytes()
    }

    fn decode_all(chunks: &[&[u8]]) -> (Feed, Vec<u8>) {
        let mut decoder = decoder();
        let mut display = Vec::new();
        let mut completion = None;
        let mut remainder = Vec::new();
        for chunk in chunks {
            let feed = decoder.feed(chunk);
            display.extend(feed.display);
            if feed.completion.is_some() {
                completion = feed.completion;
            }
            remainder.extend(feed.remainder);
        }
        (
            Feed {
                display: Vec::new(),
                completion,
                remainder,
            },
            display,
        )
    }

    #[test]
    fn encode_wraps_command() {
        let wrapped = encode("brew list", &markers(), ShellDialect::Posix);
        assert_eq!(
            wrapped,
            "printf '\\n%s\\n' '__PKGTERM_BEGIN_t-1__'; brew list\n\
             __pkgterm_ec=$?; printf '\\n%s%s%s\\n' '__PKGTERM_DONE_t-1__' \"$__pkgterm_ec\" ':END'\n"
        );
    }

    #[test_case("ls" ; "no newline")]
    #[test_case("ls\n" ; "one newline")]
    #[test_case("ls\n\n\r\n" ; "several newlines")]
    fn encode_normalizes_trailing_newlines(command: &str) {
        let wrapped = encode(command, &markers(), ShellDialect::Posix);
        assert!(wrapped.contains("; ls\n__pkgterm_ec=$?;"), "{wrapped}");
        assert_eq!(wrapped.matches('\n').count(), 2);
    }

    #[test]
    fn encode_fish_dialect() {
        let wrapped = encode("brew doctor", &markers(), ShellDialect::Fish);
        assert!(wrapped.contains("\nset __pkgterm_ec $status; printf"));
    }

    #[test]
    fn markers_embed_request_id() {
        let id = RequestId::next();
        let m = Markers::for_request(&id);
        assert_eq!(m.begin, format!("__PKGTERM_BEGIN_{id}__"));
        assert_eq!(m.done, format!("__PKGTERM_DONE_{id}__"));
        assert_ne!(Markers::for_request(&RequestId::next()), m);
    }

    #[test]
    fn decodes_readline_shell() {
        let mut decoder = decoder();
        let feed = decoder.feed(&readline_transcript("hello\r\n", 0));
        assert_eq!(
            feed.completion,
            Some(Completion {
                exit_code: 0,
                stdout: "hello\n".to_string()
            })
        );
        assert_eq!(feed.display, b"hello\r\n".to_vec());
        assert_eq!(feed.remainder, b"\x1b[?2004h$ ".to_vec());
        assert_eq!(decoder.state(), DecodeState::Finished);
    }

    #[test]
    fn decodes_canonical_echo_shell() {
        let mut decoder = decoder();
        let feed = decoder.feed(&canonical_transcript("hello\r\n", 0));
        assert_eq!(
            feed.completion,
            Some(Completion {
                exit_code: 0,
                stdout: "hello\n".to_string()
            })
        );
        assert_eq!(feed.remainder, b"$ ".to_vec());
    }

    #[test]
    fn begin_marker_after_prompt_matches() {
        let m = markers();
        // dash draws its prompt before running the command; the begin printf's
        // leading line break keeps the marker off the prompt's line
        let transcript = format!(
            "printf '\\n%s\\n' '{b}'; brew list\r\n# \r\n{b}\r\nwget\r\n# \r\n{d}0:END\r\n# ",
            b = m.begin,
            d = m.done
        );
        let mut decoder = decoder();
        let feed = decoder.feed(transcript.as_bytes());
        assert_eq!(
            feed.completion,
            Some(Completion {
                exit_code: 0,
                stdout: "wget\n".to_string()
            })
        );
        assert_eq!(feed.display, b"wget\r\n".to_vec());
        assert_eq!(feed.remainder, b"# ".to_vec());
    }

    #[test]
    fn begin_marker_sharing_a_prompt_line_is_not_seen() {
        let m = markers();
        let transcript = format!("# {b}\r\nwget\r\n", b = m.begin);
        let mut decoder = decoder();
        decoder.feed(transcript.as_bytes());
        assert_eq!(decoder.state(), DecodeState::AwaitingBegin);
        assert!(encode("ls", &m, ShellDialect::Posix).starts_with(r"printf '\n%s\n'"));
    }

    #[test_case(0 ; "success")]
    #[test_case(7 ; "failure")]
    #[test_case(-1 ; "negative")]
    #[test_case(255 ; "max status")]
    fn exit_code_is_reported(code: i32) {
        let feed = decoder().feed(&readline_transcript("", code));
        assert_eq!(feed.completion.map(|c| c.exit_code), Some(code));
    }

    #[test]
    fn empty_output_is_empty_stdout() {
        let feed = decoder().feed(&canonical_transcript("", 0));
        assert_eq!(feed.completion.map(|c| c.stdout), Some(String::new()));
    }

    #[test]
    fn blank_lines_inside_output_survive() {
        let feed = decoder().feed(&readline_transcript("a\r\n\r\n\r\nb\r\n\r\n", 0));
        assert_eq!(
            feed.completion.map(|c| c.stdout),
            Some("a\n\n\nb\n\n".to_string())
        );
    }

    #[test]
    fn output_without_trailing_newline_is_terminated() {
        // dash: "foo" is followed by the prompt and the done printf's line break
        let m = markers();
        let transcript = format!("{b}\r\nfoo$ \r\n{d}0:END\r\n", b = m.begin, d = m.done);
        let feed = decoder().feed(transcript.as_bytes());
        assert_eq!(feed.completion.map(|c| c.stdout), Some("foo$ \n".to_string()));
    }

    #[test]
    fn echoed_marker_text_is_not_a_marker() {
        let m = markers();
        // the quoted marker inside the echo must not start capture
        let transcript = format!(
            "$ printf '\\n%s\\n' '{b}'; x\r\nnot output\r\n\r\n{b}\r\nreal\r\n\r\n{d}0:END\r\n",
            b = m.begin,
            d = m.done
        );
        let feed = decoder().feed(transcript.as_bytes());
        assert_eq!(feed.completion.map(|c| c.stdout), Some("real\n".to_string()));
    }

    #[test]
    fn marker_prefix_mid_line_is_not_a_marker() {
        let m = markers();
        let transcript = format!(
            "xx{b}\r\n{b}\r\nout\r\n\r\n{d}0:END\r\n",
            b = m.begin,
            d = m.done
        );
        let (feed, _) = decode_all(&[&transcript.as_bytes()[..3], &transcript.as_bytes()[3..]]);
        assert_eq!(feed.completion.map(|c| c.stdout), Some("out\n".to_string()));
    }

    #[test]
    fn other_request_markers_are_noise() {
        let m = markers();
        let transcript = format!(
            "{b}\r\n__PKGTERM_DONE_old-9__0:END\r\nkept\r\n\r\n{d}3:END\r\n",
            b = m.begin,
            d = m.done
        );
        let feed = decoder().feed(transcript.as_bytes());
        assert_eq!(
            feed.completion,
            Some(Completion {
                exit_code: 3,
                stdout: "kept\n".to_string()
            })
        );
    }

    #[test]
    fn partial_line_reaches_display_before_newline() {
        let m = markers();
        let mut decoder = decoder();
        let feed = decoder.feed(format!("{}\r\nPassword:", m.begin).as_bytes());
        assert_eq!(feed.display, b"Password:".to_vec());
        assert!(feed.completion.is_none());

        let feed = decoder.feed(b" \r\n");
        assert_eq!(feed.display, b" \r\n".to_vec());

        let feed = decoder.feed(format!("\r\n{}0:END\r\n", m.done).as_bytes());
        assert_eq!(
            feed.completion.map(|c| c.stdout),
            Some("Password: \n".to_string())
        );
    }

    #[test]
    fn partial_line_after_blank_line_is_shown() {
        let m = markers();
        let mut decoder = decoder();
        let feed = decoder.feed(
            format!("{}\r\n==> Upgrading 3 packages\r\n\r\nContinue? [y/N] ", m.begin).as_bytes(),
        );
        assert_eq!(
            String::from_utf8_lossy(&feed.display),
            "==> Upgrading 3 packages\r\n\r\nContinue? [y/N] "
        );

        let feed = decoder.feed(format!("y\r\n\r\n{}0:END\r\n", m.done).as_bytes());
        assert_eq!(feed.display, b"y\r\n".to_vec());
        assert_eq!(
            feed.completion.map(|c| c.stdout),
            Some("==> Upgrading 3 packages\n\nContinue? [y/N] y\n".to_string())
        );
    }

    #[test]
    fn done_marker_without_line_ending_completes() {
        let m = markers();
        let mut decoder = decoder();
        decoder.feed(format!("{}\r\nok\r\n\r\n", m.begin).as_bytes());
        let feed = decoder.feed(format!("{}0:END", m.done).as_bytes());
        assert_eq!(feed.completion.map(|c| c.stdout), Some("ok\n".to_string()));

        // the owed line ending is swallowed
        let feed = decoder.feed(b"\r");
        assert!(feed.remainder.is_empty());
        let feed = decoder.feed(b"\n$ ");
        assert_eq!(feed.remainder, b"$ ".to_vec());
    }

    #[test]
    fn incomplete_exit_code_waits_for_terminator() {
        let m = markers();
        let mut decoder = decoder();
        decoder.feed(format!("{}\r\n\r\n", m.begin).as_bytes());
        assert!(decoder.feed(format!("{}1", m.done).as_bytes()).completion.is_none());
        let feed = decoder.feed(b"27:END\r\n");
        assert_eq!(feed.completion.map(|c| c.exit_code), Some(127));
    }

    #[test]
    fn unrelated_output_before_begin_is_dropped() {
        let m = markers();
        let transcript = format!(
            "{}garbage without newline\rstill garbage\n{}\r\n\r\n{}0:END\n",
            "x".repeat(10_000),
            m.begin,
            m.done
        );
        let mut decoder = decoder();
        let feed = decoder.feed(transcript.as_bytes());
        assert_eq!(feed.completion.map(|c| c.stdout), Some(String::new()));
        assert!(feed.display.is_empty());
    }

    #[test]
    fn begin_marker_after_carriage_return_matches() {
        let m = markers();
        let transcript = format!(
            "junk junk junk\r\x1b[K{}\r\nline\r\n\r\n{}0:END\r\n",
            m.begin, m.done
        );
        let (feed, _) = decode_all(&[transcript.as_bytes()]);
        assert_eq!(feed.completion.map(|c| c.stdout), Some("line\n".to_string()));
    }

    #[test]
    fn every_two_way_split_gives_same_result() {
        let transcript = readline_transcript("line one\r\n\r\nline two\r\n", 4);
        let (whole, _) = decode_all(&[&transcript]);
        for split in 0..=transcript.len() {
            let (parts, _) = decode_all(&[&transcript[..split], &transcript[split..]]);
            assert_eq!(parts.completion, whole.completion, "split at {split}");
            assert_eq!(parts.remainder, whole.remainder, "split at {split}");
        }
    }

    #[test]
    fn byte_at_a_time_matches_whole() {
        let transcript = canonical_transcript("α β γ\r\nδ\r\n", 0);
        let (whole, _) = decode_all(&[&transcript]);
        let singles: Vec<&[u8]> = transcript.chunks(1).collect();
        let (bytes, _) = decode_all(&singles);
        assert_eq!(bytes.completion, whole.completion);
        assert_eq!(
            whole.completion.map(|c| c.stdout),
            Some("α β γ\nδ\n".to_string())
        );
    }

    proptest! {
        #[test]
        fn chunking_never_changes_result(
            lines in proptest::collection::vec("[a-z0-9 %$#_]{0,20}", 0..8),
            code in 0i32..256,
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..6),
        ) {
            let output: String = lines.iter().map(|l| format!("{l}\r\n")).collect();
            let transcript = readline_transcript(&output, code);

            let mut points: Vec<usize> = cuts
                .iter()
                .map(|c| c.index(transcript.len() + 1))
                .collect();
            points.sort_unstable();
            let mut chunks: Vec<&[u8]> = Vec::new();
            let mut start = 0;
            for point in points {
                chunks.push(&transcript[start..point]);
                start = point;
            }
            chunks.push(&transcript[start..]);

            let (whole, _) = decode_all(&[&transcript]);
            let (parts, _) = decode_all(&chunks);
            prop_assert_eq!(parts.completion.clone(), whole.completion.clone());
            prop_assert_eq!(parts.remainder, whole.remainder);
            prop_assert_eq!(whole.completion.map(|c| c.exit_code), Some(code));
        }

        #[test]
        fn clean_output_round_trips(
            lines in proptest::collection::vec("[A-Za-z0-9][A-Za-z0-9 ./:=-]{0,30}", 1..10),
        ) {
            let output: String = lines.iter().map(|l| format!("{l}\r\n")).collect();
            let expected: String = lines.iter().map(|l| format!("{l}\n")).collect();
            let feed = decoder().feed(&canonical_transcript(&output, 0));
            prop_assert_eq!(feed.completion.map(|c| c.stdout), Some(expected));
        }

        #[test]
        fn only_noise_lines_are_removed(
            lines in proptest::collection::vec(
                prop_oneof![
                    "[a-z][a-z0-9 ]{0,15}".prop_map(|l| (l, true)),
                    Just(("__pkgterm_ec=$?".to_string(), false)),
                    Just(("__PKGTERM_BEGIN_t-1__".to_string(), false)),
                    Just(("__PKGTERM_DONE_zz-2__0:END".to_string(), false)),
                ],
                1..12,
            )
        ) {
            let output: String = lines.iter().map(|(l, _)| format!("{l}\r\n")).collect();
            let expected: String = lines
                .iter()
                .filter(|(_, keep)| *keep)
                .map(|(l, _)| format!("{l}\n"))
                .collect();
            let feed = decoder().feed(&readline_transcript(&output, 0));
            prop_assert_eq!(feed.completion.map(|c| c.stdout), Some(expected));
        }
    }
}
