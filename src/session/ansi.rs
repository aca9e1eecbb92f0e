//! Terminal escape stripping
//!
//! Remote tools paint progress bars and colours; matching runs on plain
//! text. The stripper keeps parser state between chunks so a sequence split
//! across two reads is still removed. Without stripping, [`Utf8Decoder`]
//! does the same for multi-byte characters.

use vte::{Parser, Perform};

#[derive(Default)]
struct PlainText {
    out: String,
}

impl Perform for PlainText {
    fn print(&mut self, c: char) {
        self.out.push(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            b'\n' | b'\r' | b'\t' => self.out.push(byte as char),
            _ => {}
        }
    }
}

/// Incremental escape-sequence remover
pub struct AnsiStripper {
    parser: Parser,
    sink: PlainText,
}

impl Default for AnsiStripper {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AnsiStripper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnsiStripper").finish_non_exhaustive()
    }
}

impl AnsiStripper {
    pub fn new() -> Self {
        Self {
            parser: Parser::new(),
            sink: PlainText::default(),
        }
    }

    /// Feed one chunk and return the printable text it completed
    pub fn feed(&mut self, bytes: &[u8]) -> String {
        self.parser.advance(&mut self.sink, bytes);
        std::mem::take(&mut self.sink.out)
    }
}

/// Strip escape sequences from a complete string
pub fn strip_ansi(text: &str) -> String {
    AnsiStripper::new().feed(text.as_bytes())
}

/// Bytes to text, holding back an incomplete trailing UTF-8 sequence until
/// the next chunk completes it
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    tail: Vec<u8>,
}

impl Utf8Decoder {
    pub fn feed(&mut self, bytes: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.tail);
        buf.extend_from_slice(bytes);

        let mut out = String::with_capacity(buf.len());
        let mut rest = buf.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        // Truncated, not invalid
                        None => {
                            self.tail = after.to_vec();
                            break;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                    }
                }
            }
        }
        out
    }
}
