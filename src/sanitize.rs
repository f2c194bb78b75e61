//! Output sanitizer for PTY bytes.
//!
//! Converts raw terminal output into text that is safe to ship over a
//! line-oriented message transport:
//!
//! - decodes UTF-8 incrementally, holding back a multi-byte character that
//!   is split across reads and dropping bytes that can never decode
//! - holds back an escape sequence that is cut off at the end of a read, so
//!   the rule table always sees complete sequences
//! - strips sequences that are disruptive outside a real terminal (titles,
//!   OSC markers, bracketed paste toggles, screen clears) while keeping SGR
//!   color and style sequences
//! - collapses runs of blank lines
//!
//! The removals are an ordered rule table applied in a single pass.

use regex::Regex;
use std::sync::OnceLock;
use tracing::error;

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

/// Longest incomplete escape sequence held back between reads. Anything
/// longer is treated as garbage and passed to the rule table as-is.
pub const MAX_ESCAPE_HOLDBACK: usize = 1024;

/// One `(pattern, replacement)` rewrite.
pub struct Rule {
    pub name: &'static str,
    pattern: Regex,
    replacement: &'static str,
}

impl Rule {
    fn new(name: &'static str, pattern: &str, replacement: &'static str) -> Option<Self> {
        match Regex::new(pattern) {
            Ok(pattern) => Some(Self {
                name,
                pattern,
                replacement,
            }),
            Err(e) => {
                error!("Skipping sanitizer rule {}: {}", name, e);
                None
            }
        }
    }

    pub fn apply(&self, text: &str) -> String {
        self.pattern.replace_all(text, self.replacement).into_owned()
    }
}

/// The ordered rule table. Specific OSC rules come before the generic one
/// so each rule can be tested on its own.
pub fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            Rule::new("osc-title", r"\x1b\][012];[^\x07\x1b]*(?:\x07|\x1b\\)", ""),
            Rule::new(
                "osc-shell-integration",
                r"\x1b\](?:133|633|1337);[^\x07\x1b]*(?:\x07|\x1b\\)",
                "",
            ),
            Rule::new("osc-cwd-url", r"\x1b\]7;[^\x07\x1b]*(?:\x07|\x1b\\)", ""),
            Rule::new(
                "osc-hyperlink",
                r"\x1b\]8;[^;\x07\x1b]*;[^\x07\x1b]*(?:\x07|\x1b\\)",
                "",
            ),
            Rule::new("osc-generic", r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)", ""),
            Rule::new("bracketed-paste", r"\x1b\[\?2004[hl]", ""),
            Rule::new("clear-screen", r"\x1b\[[0-3]?J|\x1bc", ""),
            Rule::new("cursor-home", r"\x1b\[(?:1;1)?[Hf]", ""),
            Rule::new("crlf", r"\r+\n", "\n"),
            Rule::new("blank-runs", r"\n(?:[ \t]*\n){3,}", "\n\n"),
        ]
        .into_iter()
        .flatten()
        .collect()
    })
}

/// Result of sanitizing a read buffer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Sanitized {
    /// Transport-safe text; empty when nothing worth sending remains
    pub text: String,
    /// Bytes of the input accounted for. The rest must be kept and
    /// prepended to the next read.
    pub consumed: usize,
}

/// Sanitize `buffer`, leaving an incomplete trailing character or escape
/// sequence unconsumed.
pub fn sanitize(buffer: &[u8]) -> Sanitized {
    // ESC is ASCII and never part of a multi-byte character, so the scan
    // works on raw bytes.
    let end = incomplete_escape_start(buffer)
        .filter(|start| buffer.len() - start <= MAX_ESCAPE_HOLDBACK)
        .unwrap_or(buffer.len());
    let (decoded, consumed) = decode_prefix(&buffer[..end]);

    Sanitized {
        text: finish(clean_text(&decoded)),
        consumed,
    }
}

/// Sanitize everything that is left when the stream ends. Undecodable and
/// incomplete bytes are replaced rather than held back.
pub fn sanitize_final(buffer: &[u8]) -> String {
    finish(clean_text(&String::from_utf8_lossy(buffer)))
}

/// Apply the rule table to already-decoded text.
pub fn clean_text(text: &str) -> String {
    let mut cleaned = text.to_string();
    for rule in rules() {
        if rule.pattern.is_match(&cleaned) {
            cleaned = rule.apply(&cleaned);
        }
    }
    cleaned
}

fn finish(text: String) -> String {
    if text.trim().is_empty() {
        String::new()
    } else {
        text
    }
}

/// Decode the longest valid UTF-8 prefix, skipping invalid sequences.
///
/// Returns the text and the number of input bytes it accounts for. Only an
/// incomplete character at the very end is left unconsumed.
fn decode_prefix(buffer: &[u8]) -> (String, usize) {
    let mut text = String::with_capacity(buffer.len());
    let mut pos = 0;

    while pos < buffer.len() {
        match std::str::from_utf8(&buffer[pos..]) {
            Ok(valid) => {
                text.push_str(valid);
                pos = buffer.len();
            }
            Err(e) => {
                let valid_up_to = pos + e.valid_up_to();
                if let Ok(valid) = std::str::from_utf8(&buffer[pos..valid_up_to]) {
                    text.push_str(valid);
                }
                match e.error_len() {
                    // Truncated character at the end; wait for more bytes.
                    None => return (text, valid_up_to),
                    Some(bad) => pos = valid_up_to + bad,
                }
            }
        }
    }

    (text, pos)
}

/// Find the start of an escape sequence that is cut off at the end of
/// `bytes`.
fn incomplete_escape_start(bytes: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != ESC {
            i += 1;
            continue;
        }
        match escape_len(&bytes[i..]) {
            Some(len) => i += len,
            None => return Some(i),
        }
    }
    None
}

/// Length of the escape sequence at the start of `seq`, or `None` if it is
/// not terminated yet.
fn escape_len(seq: &[u8]) -> Option<usize> {
    debug_assert_eq!(seq.first(), Some(&ESC));
    match seq.get(1)? {
        // CSI: parameters and intermediates, then one final byte.
        b'[' => {
            let mut j = 2;
            loop {
                match seq.get(j)? {
                    0x20..=0x3f => j += 1,
                    0x40..=0x7e => return Some(j + 1),
                    // Malformed; let the rule table see it verbatim.
                    _ => return Some(j),
                }
            }
        }
        // OSC, DCS, APC, PM: string terminated by BEL or ST.
        b']' | b'P' | b'_' | b'^' => {
            let mut j = 2;
            loop {
                match seq.get(j)? {
                    &BEL => return Some(j + 1),
                    &ESC => {
                        return match seq.get(j + 1)? {
                            b'\\' => Some(j + 2),
                            _ => Some(j),
                        };
                    }
                    _ => j += 1,
                }
            }
        }
        _ => Some(2),
    }
}
