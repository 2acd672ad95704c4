use encoding_rs::CoderResult;
use encoding_rs::Decoder;
use encoding_rs::Encoding;
use encoding_rs::UTF_8;

/// Default encoding for child output streams, resolved once at the call site.
pub fn default_output_encoding() -> &'static Encoding {
    UTF_8
}

/// Incremental, encoding-aware line splitter.
///
/// The break contract is bit-exact: `\n` is a break, `\r` is a break, `\r\n`
/// is a single break, every extra consecutive break yields one empty line,
/// and a trailing partial line without a terminator is emitted by `finish`.
/// Multi-byte sequences split across read chunks decode correctly because the
/// underlying decoder keeps its state between `feed` calls.
pub struct LineDecoder {
    decoder: Decoder,
    line: String,
    last_was_cr: bool,
}

impl LineDecoder {
    pub fn new(encoding: &'static Encoding) -> Self {
        Self {
            decoder: encoding.new_decoder(),
            line: String::new(),
            last_was_cr: false,
        }
    }

    /// Decode a chunk and return the complete lines it finished.
    pub fn feed(&mut self, input: &[u8]) -> Vec<String> {
        let text = self.decode(input, false);
        self.split(&text)
    }

    /// Flush the decoder and return any remaining lines, including a trailing
    /// partial line that was never terminated.
    pub fn finish(mut self) -> Vec<String> {
        let text = self.decode(&[], true);
        let mut lines = self.split(&text);
        if !self.line.is_empty() {
            lines.push(std::mem::take(&mut self.line));
        }
        lines
    }

    fn decode(&mut self, input: &[u8], last: bool) -> String {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(input.len())
            .unwrap_or(input.len().saturating_mul(3) + 16);
        let mut text = String::with_capacity(capacity);
        let mut offset = 0;
        loop {
            let (result, read, _) = self.decoder.decode_to_string(&input[offset..], &mut text, last);
            offset += read;
            match result {
                CoderResult::InputEmpty => break,
                CoderResult::OutputFull => {
                    let remaining = self
                        .decoder
                        .max_utf8_buffer_length(input.len() - offset)
                        .unwrap_or(8_192);
                    text.reserve(remaining.max(4));
                }
            }
        }
        text
    }

    fn split(&mut self, text: &str) -> Vec<String> {
        let mut lines = Vec::new();
        for ch in text.chars() {
            match ch {
                '\n' => {
                    if self.last_was_cr {
                        // Second half of \r\n; the line was already emitted.
                        self.last_was_cr = false;
                    } else {
                        lines.push(std::mem::take(&mut self.line));
                    }
                }
                '\r' => {
                    lines.push(std::mem::take(&mut self.line));
                    self.last_was_cr = true;
                }
                _ => {
                    self.line.push(ch);
                    self.last_was_cr = false;
                }
            }
        }
        lines
    }
}
