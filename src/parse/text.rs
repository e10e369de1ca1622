use std::str;

use thiserror::Error;

use crate::buffers::ReadableBuffer;

/// Errors returned when decoding text out of a buffer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The bytes are not valid UTF-8.
    #[error("Invalid UTF-8 sequence at byte {offset}")]
    InvalidUtf8 {
        /// Offset of the first byte of the invalid sequence.
        offset: usize,
    },
    /// The input ends in the middle of a multi-byte sequence.
    #[error("Truncated UTF-8 sequence at byte {offset}")]
    Truncated {
        /// Offset of the first byte of the truncated sequence.
        offset: usize,
    },
    /// A byte is outside of the ASCII range.
    #[error("Non-ASCII byte {byte:#04x} at byte {offset}")]
    NonAscii {
        /// Offset of the byte.
        offset: usize,
        /// The offending byte.
        byte: u8,
    },
}

/// Width of the UTF-8 sequence introduced by `lead`, `None` if it cannot start a sequence.
const fn sequence_width(lead: u8) -> Option<usize> {
    match lead {
        0x00..=0x7f => Some(1),
        0xc2..=0xdf => Some(2),
        0xe0..=0xef => Some(3),
        0xf0..=0xf4 => Some(4),
        _ => None,
    }
}

/// A streaming UTF-8 decoder.
///
/// Feed it contiguous chunks in order with [`Utf8Decoder::decode`]: a multi-byte sequence split
/// across two chunks is carried over and decoded once complete.
///
/// ```
/// use sluice::Utf8Decoder;
///
/// let mut decoder = Utf8Decoder::default();
/// let mut out = String::new();
/// let bytes = "é".as_bytes();
/// decoder.decode(&bytes[..1], &mut out).unwrap();
/// decoder.decode(&bytes[1..], &mut out).unwrap();
/// decoder.finish().unwrap();
/// assert_eq!(out, "é");
/// ```
#[derive(Debug, Default, Clone)]
pub struct Utf8Decoder {
    carry: [u8; 4],
    carry_len: usize,
    consumed: usize,
}

impl Utf8Decoder {
    /// Decodes `chunk` into `out`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::InvalidUtf8`] with the offset counted from the first chunk.
    pub fn decode(&mut self, chunk: &[u8], out: &mut String) -> Result<(), DecodeError> {
        let base = self.consumed;
        self.consumed += chunk.len();
        let mut chunk = chunk;

        if self.carry_len > 0 {
            let offset = base - self.carry_len;
            let width = sequence_width(self.carry[0]).ok_or(DecodeError::InvalidUtf8 { offset })?;
            let take = (width - self.carry_len).min(chunk.len());
            self.carry[self.carry_len..self.carry_len + take].copy_from_slice(&chunk[..take]);
            self.carry_len += take;
            chunk = &chunk[take..];
            // A bad continuation byte fails right away, wherever the chunks were split
            match str::from_utf8(&self.carry[..self.carry_len]) {
                Ok(decoded) => out.push_str(decoded),
                Err(e) if e.error_len().is_some() => {
                    return Err(DecodeError::InvalidUtf8 { offset });
                }
                // Still incomplete, so the chunk was used up
                Err(_) => return Ok(()),
            }
            self.carry_len = 0;
        }

        let base = self.consumed - chunk.len();
        match str::from_utf8(chunk) {
            Ok(s) => out.push_str(s),
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(str::from_utf8(&chunk[..valid]).unwrap_or_default());
                if e.error_len().is_some() {
                    return Err(DecodeError::InvalidUtf8 { offset: base + valid });
                }
                let rest = &chunk[valid..];
                self.carry[..rest.len()].copy_from_slice(rest);
                self.carry_len = rest.len();
            }
        }
        Ok(())
    }

    /// Checks that no sequence was left incomplete.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Truncated`] if the last chunk ended in the middle of a sequence.
    pub fn finish(self) -> Result<(), DecodeError> {
        match self.carry_len {
            0 => Ok(()),
            n => Err(DecodeError::Truncated {
                offset: self.consumed - n,
            }),
        }
    }
}

impl ReadableBuffer {
    /// Decodes the whole buffer as UTF-8, sequences may be split across segments.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::InvalidUtf8`] or [`DecodeError::Truncated`] with the offset of the
    /// offending sequence.
    pub fn decode_utf8(&self) -> Result<String, DecodeError> {
        let mut decoder = Utf8Decoder::default();
        let mut out = String::with_capacity(self.len());
        for span in self.spans() {
            decoder.decode(span, &mut out)?;
        }
        decoder.finish()?;
        Ok(out)
    }

    /// Decodes the whole buffer as ASCII.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::NonAscii`] at the first byte above `0x7f`.
    pub fn decode_ascii(&self) -> Result<String, DecodeError> {
        let mut out = String::with_capacity(self.len());
        let mut offset = 0;
        for span in self.spans() {
            if let Some(i) = span.iter().position(|b| !b.is_ascii()) {
                return Err(DecodeError::NonAscii {
                    offset: offset + i,
                    byte: span[i],
                });
            }
            out.extend(span.iter().copied().map(char::from));
            offset += span.len();
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Channel, MemoryPool};

    fn buffer(channel: &Channel, bytes: &[u8]) -> ReadableBuffer {
        let mut writer = channel.alloc(0).unwrap();
        writer.write(bytes).unwrap();
        writer.commit().unwrap();
        let buffer = channel.try_read().unwrap().unwrap().buffer;
        channel.advance_to(buffer.end()).unwrap();
        buffer
    }

    #[test]
    fn text_utf8_split_sequences() {
        let text = "aé€𝄞 ü ok";
        // Every block size splits the multi-byte sequences at a different place
        for block_size in 1..=8 {
            let channel = Channel::new(MemoryPool::builder().block_size(block_size).build());
            let buf = buffer(&channel, text.as_bytes());
            assert_eq!(buf.decode_utf8().unwrap(), text);
        }
    }

    #[test]
    fn text_utf8_errors() {
        let channel = Channel::new(MemoryPool::builder().block_size(3).build());

        // 1. Invalid continuation split across blocks
        let buf = buffer(&channel, &[b'a', b'b', 0xe2, 0x28, 0xa1]);
        assert_eq!(buf.decode_utf8(), Err(DecodeError::InvalidUtf8 { offset: 2 }));

        // 2. Invalid byte in the middle of a span
        let buf = buffer(&channel, &[b'a', 0xff, b'b']);
        assert_eq!(buf.decode_utf8(), Err(DecodeError::InvalidUtf8 { offset: 1 }));

        // 3. Truncated at the end
        let buf = buffer(&channel, &"xy€".as_bytes()[..4]);
        assert_eq!(buf.decode_utf8(), Err(DecodeError::Truncated { offset: 2 }));
    }

    #[test]
    fn text_utf8_errors_ignore_block_size() {
        let bytes = b"ab\xe2(";
        for block_size in 1..=4 {
            let channel = Channel::new(MemoryPool::builder().block_size(block_size).build());
            let buf = buffer(&channel, bytes);
            assert_eq!(buf.decode_utf8(), Err(DecodeError::InvalidUtf8 { offset: 2 }));
        }

        // The stray byte is reported by the chunk that carries it, before `finish`
        let mut decoder = Utf8Decoder::default();
        let mut out = String::new();
        decoder.decode(b"ab\xe2", &mut out).unwrap();
        assert_eq!(
            decoder.decode(b"(", &mut out),
            Err(DecodeError::InvalidUtf8 { offset: 2 })
        );
        assert_eq!(out, "ab");

        // An overlong lead is rejected on its second byte too
        let mut decoder = Utf8Decoder::default();
        decoder.decode(b"\xe0", &mut out).unwrap();
        assert_eq!(
            decoder.decode(b"\x80\x80", &mut out),
            Err(DecodeError::InvalidUtf8 { offset: 0 })
        );
    }

    #[test]
    fn text_ascii() {
        let channel = Channel::new(MemoryPool::builder().block_size(4).build());
        let buf = buffer(&channel, b"Hello World");
        assert_eq!(buf.decode_ascii().unwrap(), "Hello World");

        let buf = buffer(&channel, "Hello Wörld".as_bytes());
        assert_eq!(
            buf.decode_ascii(),
            Err(DecodeError::NonAscii { offset: 7, byte: 0xc3 })
        );
        assert_eq!(ReadableBuffer::default().decode_ascii().unwrap(), "");
    }
}
