use memchr::{memchr, memchr2, memchr3};

use crate::buffers::{Cursor, ReadableBuffer, cursor::SegmentSpans, unsafe_slice};

const LO: u64 = 0x0101_0101_0101_0101;
const HI: u64 = 0x8080_8080_8080_8080;

/// Flags the zero bytes of `word`. The lowest flagged byte is always a true zero, higher flags
/// may be false positives caused by borrow propagation.
#[inline(always)]
const fn zero_bytes(word: u64) -> u64 {
    word.wrapping_sub(LO) & !word & HI
}

/// Finds the first byte of `haystack` equal to any of `needles`.
///
/// One to three needles go through `memchr`, larger sets through a word-at-a-time scan.
pub(crate) fn find_any(needles: &[u8], haystack: &[u8]) -> Option<usize> {
    match *needles {
        [] => None,
        [a] => memchr(a, haystack),
        [a, b] => memchr2(a, b, haystack),
        [a, b, c] => memchr3(a, b, c, haystack),
        _ => find_any_swar(needles, haystack),
    }
}

fn find_any_swar(needles: &[u8], haystack: &[u8]) -> Option<usize> {
    let mut chunks = haystack.chunks_exact(8);
    let mut offset = 0;
    for chunk in &mut chunks {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        let word = u64::from_le_bytes(raw);
        let mask = needles
            .iter()
            .fold(0, |mask, &needle| mask | zero_bytes(word ^ (LO * u64::from(needle))));
        if mask != 0 {
            let lane = (mask.trailing_zeros() / 8) as usize;
            if needles.contains(unsafe_slice!(chunk, lane)) {
                return Some(offset + lane);
            }
            if let Some(i) = chunk.iter().position(|b| needles.contains(b)) {
                return Some(offset + i);
            }
        }
        offset += 8;
    }
    chunks
        .remainder()
        .iter()
        .position(|b| needles.contains(b))
        .map(|i| offset + i)
}

/// Returns `true` if `pattern` starts at the beginning of `head`, continuing into `rest`.
fn matches_at(head: &[u8], rest: SegmentSpans<'_>, pattern: &[u8]) -> bool {
    let n = head.len().min(pattern.len());
    if head[..n] != pattern[..n] {
        return false;
    }
    let mut pattern = &pattern[n..];
    for span in rest {
        if pattern.is_empty() {
            break;
        }
        let n = span.bytes.len().min(pattern.len());
        if span.bytes[..n] != pattern[..n] {
            return false;
        }
        pattern = &pattern[n..];
    }
    pattern.is_empty()
}

impl ReadableBuffer {
    /// Finds the first byte matching any of `needles`, with its offset from the start.
    fn find(&self, needles: &[u8]) -> Option<(Cursor, usize)> {
        let mut offset = 0;
        for span in self.start().spans_to(self.end()) {
            if let Some(i) = find_any(needles, span.bytes) {
                return Some((span.cursor_at(i), offset + i));
            }
            offset += span.bytes.len();
        }
        None
    }

    /// Finds the first occurrence of `pattern`, with its offset from the start.
    fn find_seq(&self, pattern: &[u8]) -> Option<(Cursor, usize)> {
        let Some(&first) = pattern.first() else {
            return Some((self.start().clone(), 0));
        };
        let mut offset = 0;
        let mut spans = self.start().spans_to(self.end());
        while let Some(span) = spans.next() {
            let mut from = 0;
            while let Some(i) = memchr(first, &span.bytes[from..]) {
                let at = from + i;
                if matches_at(&span.bytes[at..], spans.clone(), pattern) {
                    return Some((span.cursor_at(at), offset + at));
                }
                from = at + 1;
            }
            offset += span.bytes.len();
        }
        None
    }

    /// Returns a cursor at the first occurrence of `byte`, or the null cursor if there is none.
    pub fn index_of(&self, byte: u8) -> Cursor {
        self.find(&[byte]).map(|(cursor, _)| cursor).unwrap_or_default()
    }

    /// Returns a cursor at the first byte equal to any of `bytes`, or the null cursor.
    pub fn index_of_any(&self, bytes: &[u8]) -> Cursor {
        self.find(bytes).map(|(cursor, _)| cursor).unwrap_or_default()
    }

    /// Returns a cursor at the first occurrence of `pattern`, or the null cursor.
    ///
    /// The occurrence may straddle segment boundaries. An empty pattern matches at the start.
    pub fn index_of_seq(&self, pattern: &[u8]) -> Cursor {
        self.find_seq(pattern).map(|(cursor, _)| cursor).unwrap_or_default()
    }

    /// Returns the offset from the start of the first occurrence of `byte`.
    pub fn position_of(&self, byte: u8) -> Option<usize> {
        self.find(&[byte]).map(|(_, offset)| offset)
    }

    /// Splits the buffer at the first `delimiter`.
    ///
    /// Returns the bytes before the delimiter and a cursor right after it, or `None` when the
    /// delimiter is not there yet, meaning more data is needed.
    pub fn try_slice_to(&self, delimiter: u8) -> Option<(ReadableBuffer, Cursor)> {
        let (at, len) = self.find(&[delimiter])?;
        let (after, _) = at.seek(1, self.end());
        Some((self.prefix(at, len), after))
    }

    /// Splits the buffer at the first occurrence of the `delimiter` sequence.
    ///
    /// Same as [`ReadableBuffer::try_slice_to`] for multi-byte delimiters such as `\r\n`.
    pub fn try_slice_to_seq(&self, delimiter: &[u8]) -> Option<(ReadableBuffer, Cursor)> {
        let (at, len) = self.find_seq(delimiter)?;
        let (after, _) = at.seek(delimiter.len(), self.end());
        Some((self.prefix(at, len), after))
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::{Channel, MemoryPool};

    fn buffer(channel: &Channel, bytes: &[u8]) -> ReadableBuffer {
        let mut writer = channel.alloc(0).unwrap();
        writer.write(bytes).unwrap();
        writer.commit().unwrap();
        channel.try_read().unwrap().unwrap().buffer
    }

    fn channel(block_size: usize) -> Channel {
        Channel::new(MemoryPool::builder().block_size(block_size).build())
    }

    #[test]
    fn search_find_any() {
        let mut rng = rand::rng();
        for len in [0, 1, 7, 8, 9, 15, 16, 17, 64, 100] {
            for needles in [&b"\n"[..], b"\r\n", b"\r\n\t", b"\r\n\t ", b"abcdefgh"] {
                let haystack: Vec<u8> = (0..len).map(|_| rng.random_range(b'i'..=b'z')).collect();
                assert_eq!(find_any(needles, &haystack), None);
                for i in 0..len {
                    let mut haystack = haystack.clone();
                    haystack[i] = needles[i % needles.len()];
                    assert_eq!(find_any(needles, &haystack), Some(i), "{needles:?} at {i}");
                }
            }
        }
        assert_eq!(find_any(&[], b"abc"), None);
    }

    #[test]
    fn search_swar_false_positive() {
        // The borrow out of the zero lane flags the 0x01 lane above it as well
        let needles = [0x00, 0x10, 0x20, 0x30];
        let haystack = [0x41, 0x41, 0x00, 0x01, 0x41, 0x41, 0x41, 0x41, 0x41];
        assert_eq!(find_any(&needles, &haystack), Some(2));
        let haystack = [0x41, 0x41, 0x41, 0x01, 0x41, 0x41, 0x41, 0x41, 0x30];
        assert_eq!(find_any(&needles, &haystack), Some(8));
    }

    #[test]
    fn search_index_of_every_position() {
        let channel = channel(5);
        let mut bytes = vec![b'a'; 23];
        let buf = buffer(&channel, &bytes);
        assert!(buf.index_of(b'\n').is_null());
        channel.advance_to(buf.end()).unwrap();

        for i in 0..bytes.len() {
            bytes.fill(b'a');
            bytes[i] = b'#';
            let buf = buffer(&channel, &bytes);
            let at = buf.index_of(b'#');
            assert!(!at.is_null());
            let found = buf.slice_from(&at).unwrap();
            let expected = buf.slice(i).unwrap();
            assert_eq!(found.first_span().as_ptr(), expected.first_span().as_ptr());
            assert_eq!(buf.position_of(b'#'), Some(i));
            assert_eq!(buf.index_of_any(b"#$%&*"), at);
            channel.advance_to(buf.end()).unwrap();
        }
    }

    #[test]
    fn search_index_of_seq() {
        let channel = channel(4);
        let buf = buffer(&channel, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");

        // Straddling matches
        let at = buf.index_of_seq(b"\r\n\r\n");
        assert_eq!(Cursor::distance(buf.start(), &at).unwrap(), 23);
        let at = buf.index_of_seq(b"HTTP/1.1");
        assert_eq!(Cursor::distance(buf.start(), &at).unwrap(), 6);
        assert!(buf.index_of_seq(b"HTTP/2").is_null());
        assert_eq!(&buf.index_of_seq(b""), buf.start());

        let (line, after) = buf.try_slice_to_seq(b"\r\n").unwrap();
        assert_eq!(line, b"GET / HTTP/1.1");
        assert_eq!(buf.slice_from(&after).unwrap(), b"Host: x\r\n\r\n");
    }

    #[test]
    fn search_try_slice_to() {
        let channel = channel(4);
        let buf = buffer(&channel, b"key=va");
        let (key, after) = buf.try_slice_to(b'=').unwrap();
        assert_eq!(key, b"key");
        assert_eq!(buf.slice_from(&after).unwrap(), b"va");

        // Incomplete frame
        assert!(buf.try_slice_to(b';').is_none());
    }
}
