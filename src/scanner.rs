//! Streaming command scanner.
//!
//! A byte-level state machine that extracts tagged commands of the form
//! `<open PATH>`, `<write PATH>BODY</write>`, `<exec CMD>` and
//! `<search QUERY>` from an unbounded, untrusted text stream. The scanner
//! consumes one byte at a time, uses no regular expressions and holds at
//! most one in-progress command in memory. Malformed tags fall back to
//! scanning without emitting anything.

use getset::{CopyGetters, Getters};
use strum::{AsRefStr, Display, EnumString};

/// Accumulator ceiling for tag and argument states.
const MAX_ARG_LEN: usize = 64 * 1024;
/// Accumulator ceiling for write bodies.
const MAX_BODY_LEN: usize = 10 * 1024 * 1024;

const CLOSE_WRITE: &[u8] = b"</write>";

#[derive(AsRefStr, Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Verb {
    Open,
    Write,
    Exec,
    Search,
}

/// Byte offsets of a command within the originating stream, start inclusive,
/// end exclusive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Span {
    pub start: u64,
    pub end: u64,
}

/// A parsed request. Created by the scanner, consumed once by the executor,
/// never mutated.
#[derive(Clone, CopyGetters, Debug, Getters)]
pub struct Command {
    #[get_copy = "pub"]
    verb: Verb,

    #[get = "pub"]
    /// Path for `open`/`write`, shell command for `exec`, query for `search`.
    argument: String,

    #[get = "pub"]
    /// Body content, only populated for `write`.
    content: Option<String>,

    #[get_copy = "pub"]
    span: Span,
}

impl Command {
    #[cfg(test)]
    pub fn synthetic(verb: Verb, argument: &str, content: Option<&str>) -> Self {
        Self {
            verb,
            argument: argument.into(),
            content: content.map(Into::into),
            span: Span { start: 0, end: 0 },
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Scanning,
    TagOpen,
    Open,
    Write,
    WriteBody,
    Exec,
    Search,
    /// Entered on accumulator overflow; discards input until the next
    /// top-level `<`.
    Recover,
}

/// The streaming scanner. Feed bytes with [`Scanner::feed`] (or one at a
/// time with [`Scanner::push`]); completed commands are returned as they
/// terminate. Unterminated input at end of stream emits nothing.
#[derive(Debug)]
pub struct Scanner {
    state: State,
    acc: Vec<u8>,
    write_argument: String,
    offset: u64,
    command_start: u64,
    max_arg: usize,
    max_body: usize,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    pub fn new() -> Self {
        Self::with_limits(MAX_ARG_LEN, MAX_BODY_LEN)
    }

    /// Construct with explicit accumulator ceilings.
    pub fn with_limits(max_arg: usize, max_body: usize) -> Self {
        Self {
            state: State::Scanning,
            acc: Vec::new(),
            write_argument: String::new(),
            offset: 0,
            command_start: 0,
            max_arg,
            max_body,
        }
    }

    /// Feed a chunk, appending completed commands to `out`.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Command>) {
        for &byte in chunk {
            if let Some(command) = self.push(byte) {
                out.push(command);
            }
        }
    }

    /// Advance the state machine by one byte.
    pub fn push(&mut self, byte: u8) -> Option<Command> {
        let emitted = self.step(byte);
        self.offset += 1;
        emitted
    }

    fn step(&mut self, byte: u8) -> Option<Command> {
        match self.state {
            State::Scanning | State::Recover => {
                if byte == b'<' {
                    self.command_start = self.offset;
                    self.acc.clear();
                    self.acc.push(byte);
                    self.state = State::TagOpen;
                }
                None
            }

            State::TagOpen => {
                self.acc.push(byte);
                if byte == b' ' || byte == b'>' {
                    self.state = match () {
                        _ if self.acc.starts_with(b"<open") => State::Open,
                        _ if self.acc.starts_with(b"<write") => State::Write,
                        _ if self.acc.starts_with(b"<exec") => State::Exec,
                        _ if self.acc.starts_with(b"<search") => State::Search,
                        _ => State::Scanning,
                    };
                    self.acc.clear();
                } else if self.acc.len() > self.max_arg {
                    self.recover();
                }
                None
            }

            State::Open | State::Exec | State::Search => {
                if byte == b'>' {
                    let verb = match self.state {
                        State::Open => Verb::Open,
                        State::Exec => Verb::Exec,
                        _ => Verb::Search,
                    };
                    let argument = self.take_accumulator();
                    self.state = State::Scanning;
                    Some(self.emit(verb, argument, None))
                } else {
                    self.accumulate(byte, self.max_arg);
                    None
                }
            }

            State::Write => {
                if byte == b'>' {
                    self.write_argument = self.take_accumulator();
                    self.state = State::WriteBody;
                } else {
                    self.accumulate(byte, self.max_arg);
                }
                None
            }

            State::WriteBody => {
                self.acc.push(byte);
                if self.acc.ends_with(CLOSE_WRITE) {
                    let body_len = self.acc.len() - CLOSE_WRITE.len();
                    let content = String::from_utf8_lossy(&self.acc[..body_len])
                        .trim()
                        .to_string();
                    self.acc.clear();
                    let argument = std::mem::take(&mut self.write_argument);
                    self.state = State::Scanning;
                    Some(self.emit(Verb::Write, argument, Some(content)))
                } else {
                    if self.acc.len() > self.max_body {
                        self.recover();
                    }
                    None
                }
            }
        }
    }

    fn accumulate(&mut self, byte: u8, ceiling: usize) {
        self.acc.push(byte);
        if self.acc.len() > ceiling {
            self.recover();
        }
    }

    fn recover(&mut self) {
        self.acc.clear();
        self.write_argument.clear();
        self.state = State::Recover;
    }

    fn take_accumulator(&mut self) -> String {
        let argument = String::from_utf8_lossy(&self.acc).trim().to_string();
        self.acc.clear();
        argument
    }

    fn emit(&self, verb: Verb, argument: String, content: Option<String>) -> Command {
        Command {
            verb,
            argument,
            content,
            span: Span {
                start: self.command_start,
                end: self.offset + 1,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(input: &str) -> Vec<Command> {
        let mut scanner = Scanner::new();
        let mut out = Vec::new();
        scanner.feed(input.as_bytes(), &mut out);
        out
    }

    #[test]
    fn open_command() {
        let commands = scan("<open README.md>\n");
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].verb(), Verb::Open);
        assert_eq!(commands[0].argument(), "README.md");
        assert!(commands[0].content().is_none());
    }

    #[test]
    fn write_command_with_body() {
        let commands = scan("<write greeting.txt>hello</write>\n");
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].verb(), Verb::Write);
        assert_eq!(commands[0].argument(), "greeting.txt");
        assert_eq!(commands[0].content().as_deref(), Some("hello"));
    }

    #[test]
    fn write_body_preserves_inner_markup() {
        let commands = scan("<write a.html><b>bold</b>\n<i>x</i></write>");
        assert_eq!(
            commands[0].content().as_deref(),
            Some("<b>bold</b>\n<i>x</i>")
        );
    }

    #[test]
    fn write_body_is_trimmed_as_a_whole() {
        let commands = scan("<write a.txt>\n  line one\n  line two\n</write>");
        assert_eq!(
            commands[0].content().as_deref(),
            Some("line one\n  line two")
        );
    }

    #[test]
    fn exec_argument_keeps_inner_whitespace() {
        let commands = scan("<exec ls -la /workspace>");
        assert_eq!(commands[0].verb(), Verb::Exec);
        assert_eq!(commands[0].argument(), "ls -la /workspace");
    }

    #[test]
    fn multiple_commands_on_one_line() {
        let commands = scan("<open a.txt><exec ls><search error handling>\n");
        let verbs: Vec<Verb> = commands.iter().map(|c| c.verb()).collect();
        assert_eq!(verbs, vec![Verb::Open, Verb::Exec, Verb::Search]);
    }

    #[test]
    fn surrounding_prose_is_ignored() {
        let commands = scan("I will read the file now: <open src/main.rs> done.");
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].argument(), "src/main.rs");
    }

    #[test]
    fn unknown_tag_is_dropped() {
        assert!(scan("<delete everything>").is_empty());
        assert!(scan("<op foo>").is_empty());
    }

    #[test]
    fn unterminated_command_emits_nothing() {
        assert!(scan("<open README.md").is_empty());
        assert!(scan("<write a.txt>half a body").is_empty());
    }

    #[test]
    fn malformed_then_valid() {
        let commands = scan("<<open x> <open real.txt>");
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].argument(), "real.txt");
    }

    #[test]
    fn spans_slice_the_original_stream() {
        let input = "ab<exec ls -la>cd<open f.txt>";
        let commands = scan(input);
        for command in &commands {
            let span = command.span();
            let slice = &input[span.start as usize..span.end as usize];
            assert!(slice.starts_with('<') && slice.ends_with('>'));
            assert!(slice.contains(command.argument().as_str()));
        }
    }

    #[test]
    fn restartable_and_deterministic() {
        let input = "x<open a><write b>c</write><exec ls>y";
        let first = scan(input);
        let second = scan(input);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.verb(), b.verb());
            assert_eq!(a.argument(), b.argument());
            assert_eq!(a.content(), b.content());
            assert_eq!(a.span(), b.span());
        }
    }

    #[test]
    fn chunk_boundaries_do_not_matter() {
        let input = "<write greeting.txt>hello world</write><open a>";
        let whole = scan(input);

        let mut scanner = Scanner::new();
        let mut split = Vec::new();
        for chunk in input.as_bytes().chunks(3) {
            scanner.feed(chunk, &mut split);
        }

        assert_eq!(whole.len(), split.len());
        for (a, b) in whole.iter().zip(split.iter()) {
            assert_eq!(a.argument(), b.argument());
            assert_eq!(a.content(), b.content());
        }
    }

    #[test]
    fn oversized_body_enters_recovery_and_resyncs() {
        let mut scanner = Scanner::with_limits(64, 16);
        let mut out = Vec::new();
        scanner.feed(b"<write big.txt>", &mut out);
        scanner.feed(&[b'x'; 64], &mut out);
        assert!(out.is_empty());

        // The closing tag of the abandoned body is skipped; a fresh command
        // parses normally afterwards.
        scanner.feed(b"</write><open ok.txt>", &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].argument(), "ok.txt");
    }

    #[test]
    fn arbitrary_bytes_do_not_panic() {
        let mut scanner = Scanner::with_limits(32, 64);
        let mut out = Vec::new();
        let mut seed = 0x2545f491u32;
        for _ in 0..200_000 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            scanner.push((seed >> 16) as u8);
        }
        // Terminate whatever partial tag the noise left behind, then resync.
        scanner.feed(b">", &mut out);
        scanner.feed(b"<open after-noise>", &mut out);
        let last = out.last().expect("scanner must resync after noise");
        assert_eq!(last.argument(), "after-noise");
    }
}
