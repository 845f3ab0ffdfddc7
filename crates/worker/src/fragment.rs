//! UTF-8 safe accumulation of engine output
//!
//! Engines emit byte pieces that can split a multi-byte character. The
//! buffer only releases text that ends on a character boundary.

/// Accumulates engine pieces into whole-character fragments
#[derive(Debug, Default)]
pub struct FragmentBuffer {
    pending: Vec<u8>,
}

impl FragmentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a piece and take out every complete character buffered so far.
    ///
    /// Bytes that can never become valid are replaced with U+FFFD so they do
    /// not block the stream. An incomplete sequence at the end stays buffered
    /// for the next piece.
    pub fn push(&mut self, piece: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(piece);

        let mut text = String::new();
        let mut consumed = 0;
        while consumed < self.pending.len() {
            let rest = &self.pending[consumed..];
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    consumed = self.pending.len();
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    text.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        Some(invalid) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            consumed += valid + invalid;
                        }
                        None => {
                            consumed += valid;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..consumed);
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Release whatever is left once the engine is done
    pub fn finish(&mut self) -> Option<String> {
        self.take_lossy()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn take_lossy(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let bytes = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passes_through() {
        let mut buffer = FragmentBuffer::new();
        assert_eq!(buffer.push(b"He").as_deref(), Some("He"));
        assert_eq!(buffer.push(b"llo").as_deref(), Some("llo"));
        assert!(buffer.is_empty());
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_split_multibyte_is_held_back() {
        let mut buffer = FragmentBuffer::new();
        let bytes = "你".as_bytes();

        assert_eq!(buffer.push(&bytes[..1]), None);
        assert_eq!(buffer.push(&bytes[1..2]), None);
        assert_eq!(buffer.push(&bytes[2..]).as_deref(), Some("你"));
    }

    #[test]
    fn test_valid_prefix_released() {
        let mut buffer = FragmentBuffer::new();
        let mut piece = b"ab".to_vec();
        piece.extend_from_slice(&"é".as_bytes()[..1]);

        assert_eq!(buffer.push(&piece).as_deref(), Some("ab"));
        assert!(!buffer.is_empty());
        assert_eq!(buffer.push(&"é".as_bytes()[1..]).as_deref(), Some("é"));
    }

    #[test]
    fn test_invalid_byte_keeps_following_char_whole() {
        let mut buffer = FragmentBuffer::new();
        let euro = "€".as_bytes();
        let mut piece = vec![0xFF];
        piece.extend_from_slice(&euro[..2]);

        assert_eq!(buffer.push(&piece).as_deref(), Some("\u{FFFD}"));
        assert!(!buffer.is_empty());
        assert_eq!(buffer.push(&euro[2..]).as_deref(), Some("€"));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_invalid_bytes_between_text() {
        let mut buffer = FragmentBuffer::new();
        assert_eq!(buffer.push(b"a\xFF\xFEb").as_deref(), Some("a\u{FFFD}\u{FFFD}b"));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_residual_flushed_lossily() {
        let mut buffer = FragmentBuffer::new();
        assert_eq!(buffer.push(&"€".as_bytes()[..2]), None);
        assert_eq!(buffer.finish().as_deref(), Some("\u{FFFD}"));
        assert!(buffer.is_empty());
    }
}
