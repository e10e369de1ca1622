//! Adapters between channels and tokio byte streams.
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::channel::{Channel, ChannelError, CompletionError};

/// Errors returned by the copy adapters.
#[derive(Debug, Error)]
pub enum CopyError {
    /// The stream failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The channel rejected the operation, e.g. the other side completed with an error.
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Reports an I/O error to the other side of the channel and returns it to the caller.
fn propagate(error: io::Error, complete: impl FnOnce(Option<CompletionError>)) -> CopyError {
    let kind = error.kind();
    let error = CompletionError::from(error);
    complete(Some(error.clone()));
    CopyError::Io(io::Error::new(kind, error))
}

/// Pumps bytes from `reader` into `channel` until end of stream, then completes writing.
///
/// Reads go straight into the channel memory. Each read is flushed, so the writer backpressure
/// of the channel applies. A read error completes writing with that error, which the channel
/// reader observes as [`ChannelError::WriterFailed`].
///
/// Returns the number of bytes copied.
///
/// # Errors
///
/// Returns the stream error, or the channel error if the reader went away.
pub async fn copy_from_reader<R>(reader: &mut R, channel: &Channel) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let result = pump(reader, channel).await;
    channel.complete_writing(None);
    result
}

async fn pump<R>(reader: &mut R, channel: &Channel) -> Result<u64, CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut total = 0;
    loop {
        let mut writer = channel.alloc(0)?;
        let read = reader.read(writer.memory()).await;
        let n = match read {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) => {
                drop(writer);
                return Err(propagate(e, |error| channel.complete_writing(error)));
            }
        };
        writer.advance(n)?;
        writer.flush().await?;
        total += n as u64;
    }
}

/// Drains `channel` into `writer` until the channel writer completes, then completes reading.
///
/// Returns the number of bytes copied.
///
/// # Errors
///
/// Returns the stream error, which is also reported to the channel writer, or the channel error
/// such as [`ChannelError::WriterFailed`].
pub async fn copy_to_writer<W>(channel: &Channel, writer: &mut W) -> Result<u64, CopyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let result = drain(channel, writer).await;
    channel.complete_reading(None);
    result
}

async fn drain<W>(channel: &Channel, writer: &mut W) -> Result<u64, CopyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total = 0;
    loop {
        let result = channel.read().await?;
        for span in result.buffer.spans() {
            if let Err(e) = writer.write_all(span).await {
                return Err(propagate(e, |error| channel.complete_reading(error)));
            }
        }
        channel.advance_to(result.buffer.end())?;
        total += result.buffer.len() as u64;
        if result.is_completed {
            break;
        }
    }
    if let Err(e) = writer.flush().await {
        return Err(propagate(e, |error| channel.complete_reading(error)));
    }
    Ok(total)
}
