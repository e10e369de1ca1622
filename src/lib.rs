//! Sluice: zero-copy byte channels over pooled memory, with cooperative backpressure and
//! segmented parsing.
//!
//! Sluice moves bytes from a producer (typically a socket reader) to a parser without copying
//! them and without allocating on the hot path. Memory comes from a [`MemoryPool`] of fixed-size
//! blocks, bytes travel through a [`Channel`] as a chain of segments, and the parser works
//! directly on the segments through a [`ReadableBuffer`] view, whatever the block boundaries.
//!
//! # Overview
//!
//! ```text
//!  PRODUCER                                                        User code
//! ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//!   alloc(min) ─► WritableBuffer ── write/append ──► commit / flush
//!                      │                                  │
//!                      │ lease                            │ link + wake reader
//!                      ▼                                  ▼
//!  MEMORY POOL    ┌─────────┐        CHANNEL    head                   tail
//!   slabs ──────► │ blocks  │ ─────────────────► [seg]──►[seg]──►[seg]
//!                 └─────────┘ ◄──── release ────  ▲ consumed   ▲ examined
//!                                                 │            │
//! ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~┼~~~~~~~~~~~~┼~~~~~~~~~~~~~
//!  CONSUMER                                       │            │    User code
//!   read().await ─► ReadableBuffer ── parse ──► advance(consumed, examined)
//! ```
//!
//! The writer fills the spare room of the last committed block first, then leases new blocks.
//! Nothing it writes is visible before [`WritableBuffer::commit`]. The reader receives every
//! committed byte not consumed yet and tells the channel how far it got:
//!
//! - bytes before the *consumed* cursor are released and their blocks return to the pool;
//! - if the *examined* cursor is at the end, the next [`Channel::read`] waits for new data,
//!   otherwise it completes right away.
//!
//! This split lets a parser look at an incomplete message, consume nothing, and wait for more.
//!
//! # Quick Start
//!
//! ```
//! use sluice::{Channel, MemoryPool};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let channel = Channel::new(MemoryPool::builder().block_size(8).build());
//!
//!     // Produce two lines, the second one incomplete
//!     let mut writer = channel.alloc(0)?;
//!     writer.write(b"GET /index\r\nHost: ex")?;
//!     writer.commit()?;
//!
//!     // Parse the complete line, leave the rest for later
//!     let read = channel.read().await?;
//!     let (line, after) = read.buffer.try_slice_to_seq(b"\r\n").ok_or("incomplete")?;
//!     assert_eq!(line.decode_ascii()?, "GET /index");
//!     assert!(read.buffer.slice_from(&after)?.try_slice_to_seq(b"\r\n").is_none());
//!     channel.advance(&after, read.buffer.end())?;
//!
//!     // The next read waits for the end of the second line
//!     let mut writer = channel.alloc(0)?;
//!     writer.write(b"ample.com\r\n")?;
//!     writer.commit()?;
//!     let read = channel.read().await?;
//!     assert_eq!(read.buffer, b"Host: example.com\r\n");
//!     channel.advance_to(read.buffer.end())?;
//!     Ok(())
//! }
//! ```
//!
//! # Memory
//!
//! A [`MemoryPool`] carves large slabs into blocks of `block_size` bytes. Leasing a block never
//! allocates once the pool is warm, and a leased [`Block`] returns to the pool when its last
//! reference is dropped. Blocks are reference counted: [`WritableBuffer::append`] and
//! [`ReadableBuffer::preserve`] share blocks instead of copying them.
//!
//! A [`ReadableBuffer`] obtained from a read is only valid until the next
//! [`Channel::advance`]. Call [`ReadableBuffer::preserve`] to keep the bytes beyond that point.
//!
//! # Backpressure
//!
//! A channel built with a pause threshold makes [`WritableBuffer::flush`] wait while too many
//! bytes are unconsumed:
//!
//! ```
//! use sluice::{Channel, MemoryPool};
//!
//! let channel = Channel::builder(MemoryPool::new())
//!     .pause_writer_threshold(64 * 1024)
//!     .resume_writer_threshold(16 * 1024)
//!     .build();
//! # drop(channel);
//! ```
//!
//! # Completion
//!
//! Either side ends the exchange with [`Channel::complete_writing`] or
//! [`Channel::complete_reading`]. An error passed there, wrapped in a [`CompletionError`], is
//! what the other side observes: a reader gets [`ChannelError::WriterFailed`], a writer gets
//! [`ChannelError::ReaderFailed`]. The channel releases its remaining blocks once both sides are
//! completed.
//!
//! The [`io`] module connects channels to tokio streams.
mod buffers;
mod channel;
pub mod io;
mod parse;
mod pool;
mod sync;

pub use buffers::{
    BufferReader, Cursor, CursorError, ReadableBuffer, Spans, WritableBuffer, reader, writer,
};
pub use channel::{
    Channel, ChannelBuilder, ChannelError, CompletionError, DEFAULT_PAUSE_WRITER_THRESHOLD,
    ReadFuture, ReadResult,
};
pub use parse::{DecodeError, Primitive, Utf8Decoder};
pub use pool::{
    Block, DEFAULT_BLOCK_SIZE, DEFAULT_BLOCKS_PER_SLAB, MemoryPool, MemoryPoolBuilder, PAGE_SIZE,
    PoolError, PoolStats,
};
