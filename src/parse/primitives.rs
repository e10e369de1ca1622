use crate::{
    buffers::{BufferReader, ReadableBuffer, WritableBuffer, reader::DidntRead},
    channel::ChannelError,
};

/// Largest primitive size, `u128`.
const MAX_SIZE: usize = 16;

mod sealed {
    pub trait Sealed {}
}

/// A fixed-size number that can be read from and written to a buffer.
///
/// Implemented for `u8` to `u128`, `i8` to `i128`, `f32` and `f64`. This trait is sealed.
pub trait Primitive: sealed::Sealed + Copy {
    /// Size in bytes of the encoded value.
    const SIZE: usize;

    #[doc(hidden)]
    fn from_be(bytes: &[u8]) -> Self;
    #[doc(hidden)]
    fn from_le(bytes: &[u8]) -> Self;
    #[doc(hidden)]
    fn put_be(self, into: &mut [u8]);
    #[doc(hidden)]
    fn put_le(self, into: &mut [u8]);
}

macro_rules! primitive {
    ($($t:ty),*) => {
        $(
            impl sealed::Sealed for $t {}

            impl Primitive for $t {
                const SIZE: usize = size_of::<$t>();

                #[inline]
                fn from_be(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; size_of::<$t>()];
                    raw.copy_from_slice(bytes);
                    <$t>::from_be_bytes(raw)
                }

                #[inline]
                fn from_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; size_of::<$t>()];
                    raw.copy_from_slice(bytes);
                    <$t>::from_le_bytes(raw)
                }

                #[inline]
                fn put_be(self, into: &mut [u8]) {
                    into.copy_from_slice(&self.to_be_bytes());
                }

                #[inline]
                fn put_le(self, into: &mut [u8]) {
                    into.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

primitive!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

impl ReadableBuffer {
    fn read_with<T: Primitive>(&self, decode: fn(&[u8]) -> T) -> Option<T> {
        if self.len() < T::SIZE {
            return None;
        }
        let first = self.first_span();
        if first.len() >= T::SIZE {
            return Some(decode(&first[..T::SIZE]));
        }
        let mut scratch = [0u8; MAX_SIZE];
        let scratch = &mut scratch[..T::SIZE];
        self.copy_to(scratch);
        Some(decode(scratch))
    }

    /// Reads a big-endian value from the start of the buffer, `None` if it is too short.
    pub fn read_big_endian<T: Primitive>(&self) -> Option<T> {
        self.read_with(T::from_be)
    }

    /// Reads a little-endian value from the start of the buffer, `None` if it is too short.
    pub fn read_little_endian<T: Primitive>(&self) -> Option<T> {
        self.read_with(T::from_le)
    }
}

impl BufferReader {
    /// Reads a big-endian value and moves past it.
    ///
    /// # Errors
    ///
    /// Returns `DidntRead` if not enough bytes are left.
    pub fn read_big_endian<T: Primitive>(&mut self) -> Result<T, DidntRead> {
        let value = self.as_buffer().read_big_endian().ok_or(DidntRead)?;
        self.skip(T::SIZE)?;
        Ok(value)
    }

    /// Reads a little-endian value and moves past it.
    ///
    /// # Errors
    ///
    /// Returns `DidntRead` if not enough bytes are left.
    pub fn read_little_endian<T: Primitive>(&mut self) -> Result<T, DidntRead> {
        let value = self.as_buffer().read_little_endian().ok_or(DidntRead)?;
        self.skip(T::SIZE)?;
        Ok(value)
    }
}

impl WritableBuffer {
    fn write_with<T: Primitive>(&mut self, value: T, encode: fn(T, &mut [u8])) -> Result<(), ChannelError> {
        if self.available() >= T::SIZE {
            encode(value, &mut self.memory()[..T::SIZE]);
            return self.advance(T::SIZE);
        }
        let mut scratch = [0u8; MAX_SIZE];
        let scratch = &mut scratch[..T::SIZE];
        encode(value, scratch);
        self.write(scratch)
    }

    /// Writes `value` in big-endian order, possibly across two blocks.
    ///
    /// # Errors
    ///
    /// Fails with [`ChannelError::Pool`] if the pool cannot provide more blocks.
    pub fn write_big_endian<T: Primitive>(&mut self, value: T) -> Result<(), ChannelError> {
        self.write_with(value, T::put_be)
    }

    /// Writes `value` in little-endian order, possibly across two blocks.
    ///
    /// # Errors
    ///
    /// Fails with [`ChannelError::Pool`] if the pool cannot provide more blocks.
    pub fn write_little_endian<T: Primitive>(&mut self, value: T) -> Result<(), ChannelError> {
        self.write_with(value, T::put_le)
    }
}
