//! Incremental UTF-8 decoding across arbitrary chunk boundaries.

/// A stateful UTF-8 decoder.
///
/// Network chunks may end in the middle of a multi-byte character. The decoder returns every
/// complete character it has seen and carries the incomplete tail (at most three bytes) into
/// the next call. Bytes that can never form a valid character are replaced with U+FFFD.
#[derive(Debug, Default, Clone)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Creates a decoder with no carried state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `chunk`, prefixed by any bytes carried from the previous call.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    if let Ok(text) = std::str::from_utf8(valid) {
                        out.push_str(text);
                    }
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[len..];
                        }
                        None => {
                            self.pending = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flushes the decoder at end of input.
    ///
    /// An incomplete trailing sequence can no longer be completed and decodes as U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}
