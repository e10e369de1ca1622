pub(crate) mod cursor;
mod readable;
pub(crate) mod segment;
mod writable;

pub use cursor::{Cursor, CursorError, Spans};
pub use readable::{BufferReader, ReadableBuffer};
pub(crate) use writable::Pending;
pub use writable::WritableBuffer;

// SAFETY: callers keep track of span indexes themselves and check their boundaries before
// accessing a span. The macros switch the redundant checks on in tests and off
// in all the other builds.
#[cfg(test)]
macro_rules! unsafe_slice {
    ($s:expr,$r:expr) => {
        &$s[$r]
    };
}

#[cfg(not(test))]
macro_rules! unsafe_slice {
    ($s:expr,$r:expr) => {{
        let slice = &*$s;
        let index = $r;
        unsafe { slice.get_unchecked(index) }
    }};
}

pub(crate) use unsafe_slice;

/// Traits for writing data to buffers.
pub mod writer {
    use core::num::NonZeroUsize;

    /// Error type indicating a write operation failed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DidntWrite;

    /// A trait for writing bytes into a buffer.
    ///
    /// This trait provides methods for writing data into buffers, with support for both partial
    /// writes and exact-length writes.
    pub trait Writer {
        /// Writes as many bytes as possible from `bytes` into the buffer.
        ///
        /// Returns the number of bytes actually written, which may be less than the length of
        /// `bytes` if the buffer has insufficient space.
        ///
        /// # Errors
        ///
        /// Returns `DidntWrite` if no bytes could be written.
        fn write(&mut self, bytes: &[u8]) -> Result<NonZeroUsize, DidntWrite>;

        /// Writes all bytes from `bytes` into the buffer.
        ///
        /// # Errors
        ///
        /// Returns `DidntWrite` if the buffer has insufficient space to write all bytes.
        fn write_exact(&mut self, bytes: &[u8]) -> Result<(), DidntWrite>;

        /// Returns the number of bytes that can still be written to this buffer.
        fn remaining(&self) -> usize;

        /// Writes a single byte to the buffer.
        ///
        /// # Errors
        ///
        /// Returns `DidntWrite` if the buffer is full.
        fn write_u8(&mut self, byte: u8) -> Result<(), DidntWrite> {
            self.write_exact(core::slice::from_ref(&byte))
        }

        /// Returns `true` if the buffer has space for more data.
        fn can_write(&self) -> bool {
            self.remaining() != 0
        }

        /// Provides a buffer of exactly `len` bytes to `write` to allow in-place writing.
        ///
        /// The closure `write` receives a mutable slice and must return the number of bytes it
        /// actually wrote.
        ///
        /// # Safety
        ///
        /// Caller must ensure that `write` returns an integer less than or equal to the length of
        /// the slice passed as argument.
        unsafe fn with_slot<F>(&mut self, len: usize, write: F) -> Result<NonZeroUsize, DidntWrite>
        where
            F: FnOnce(&mut [u8]) -> usize;
    }
}

/// Traits for reading data from buffers.
pub mod reader {
    use core::num::NonZeroUsize;

    /// Error type indicating a read operation failed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DidntRead;

    /// A trait for reading bytes from a buffer.
    pub trait Reader {
        /// Reads as many bytes as possible into `into`.
        ///
        /// Returns the number of bytes actually read, which may be less than the length of `into`
        /// if the buffer has insufficient data.
        ///
        /// # Errors
        ///
        /// Returns `DidntRead` if no bytes could be read.
        fn read(&mut self, into: &mut [u8]) -> Result<NonZeroUsize, DidntRead>;

        /// Reads exactly enough bytes to fill `into`.
        ///
        /// # Errors
        ///
        /// Returns `DidntRead` if the buffer has insufficient data.
        fn read_exact(&mut self, into: &mut [u8]) -> Result<(), DidntRead>;

        /// Returns the number of bytes remaining to be read from this buffer.
        fn remaining(&self) -> usize;

        /// Reads a single byte from the buffer.
        ///
        /// # Errors
        ///
        /// Returns `DidntRead` if the buffer is empty.
        fn read_u8(&mut self) -> Result<u8, DidntRead> {
            let mut byte = 0;
            let read = self.read(core::slice::from_mut(&mut byte))?;
            if read.get() == 1 { Ok(byte) } else { Err(DidntRead) }
        }

        /// Returns `true` if there is more data to read.
        fn can_read(&self) -> bool {
            self.remaining() != 0
        }
    }

    /// A trait for types that can provide a reader.
    pub trait HasReader {
        /// The type of reader this type provides.
        type Reader: Reader;

        /// Returns the most appropriate reader for `self`.
        fn reader(self) -> Self::Reader;
    }
}
