//! Prefixer (§4.7): prepends a per-service line prefix to child output.
//!
//! The escape character immediately marks a line as "started" so that
//! escape-code-framed status lines pass through without prefix pollution;
//! a newline resets the tracking flag for the next line.

const ESCAPE: u8 = 0x1B;
const NEWLINE: u8 = b'\n';

/// Stateful line-prefixing byte filter. One instance per Script Runner
/// invocation; fed one chunk of child output at a time.
pub struct Prefixer {
    prefix: String,
    line_started: bool,
}

impl Prefixer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            line_started: false,
        }
    }

    /// Transforms `chunk` into prefixed output bytes.
    pub fn apply(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(chunk.len() + self.prefix.len());
        for &byte in chunk {
            if !self.line_started {
                out.extend_from_slice(self.prefix.as_bytes());
                self.line_started = true;
            }
            out.push(byte);
            if byte == ESCAPE {
                // Escape-framed status lines are passed through untouched;
                // treat the line as already started so no prefix is added
                // inside the escape sequence.
                self.line_started = true;
            } else if byte == NEWLINE {
                self.line_started = false;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_each_line() {
        let mut p = Prefixer::new("web| ");
        let out = p.apply(b"hello\nworld\n");
        assert_eq!(out, b"web| hello\nweb| world\n".to_vec());
    }

    #[test]
    fn escape_suppresses_prefix_injection() {
        let mut p = Prefixer::new("web| ");
        // the line starts fresh, so the escape byte itself still gets a
        // prefix, but nothing is injected between it and the rest of the
        // escape-framed status line.
        let mut out = p.apply(&[ESCAPE]);
        out.extend(p.apply(b"status\n"));
        assert_eq!(out, [b"web| ".as_slice(), &[ESCAPE], b"status\n"].concat());
    }

    #[test]
    fn partial_chunks_carry_state_across_calls() {
        let mut p = Prefixer::new(">> ");
        let mut out = p.apply(b"foo");
        out.extend(p.apply(b"bar\n"));
        assert_eq!(out, b">> foobar\n".to_vec());
    }
}
