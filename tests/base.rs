use std::time::Duration;

use rand::Rng;
use sluice::{Channel, ChannelError, CompletionError, Cursor, MemoryPool, ReadableBuffer, io::copy_from_reader};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    time::timeout,
};

const N: u64 = 1_000;

fn channel(block_size: usize) -> Channel {
    Channel::new(MemoryPool::builder().block_size(block_size).build())
}

fn commit(channel: &Channel, bytes: &[u8]) {
    let mut writer = channel.alloc(0).unwrap();
    writer.write(bytes).unwrap();
    writer.commit().unwrap();
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    (0..len).map(|_| rng.random()).collect()
}

#[tokio::test]
async fn hello_world_single_span() {
    let channel = Channel::new(MemoryPool::new());
    commit(&channel, b"Hello World");

    let read = channel.read().await.unwrap();
    assert_eq!(read.buffer.len(), 11);
    assert!(read.buffer.is_single_span());
    assert_eq!(read.buffer, b"Hello World");
    assert_eq!(read.buffer.decode_ascii().unwrap(), "Hello World");
    channel.advance_to(read.buffer.end()).unwrap();
}

#[tokio::test]
async fn hello_world_across_blocks() {
    let pool = MemoryPool::new();
    let block_size = pool.block_size();
    let channel = Channel::new(pool);
    let mut writer = channel.alloc(0).unwrap();
    writer.write(&vec![b'a'; block_size - 5]).unwrap();
    writer.write(b"Hello World").unwrap();
    writer.commit().unwrap();

    let read = channel.read().await.unwrap();
    assert!(!read.buffer.is_single_span());
    let tail = read.buffer.slice(block_size - 5).unwrap();
    assert_eq!(tail.spans().collect::<Vec<_>>(), [&b"Hello"[..], b" World"]);
}

#[tokio::test]
async fn missing_delimiter_not_found() {
    let channel = channel(16);
    commit(&channel, &[b'x'; 100]);
    let read = channel.read().await.unwrap();
    assert!(read.buffer.index_of(b'\n').is_null());
    assert!(read.buffer.index_of_any(b"\r\n").is_null());
    assert_eq!(read.buffer.position_of(b'\n'), None);
}

#[tokio::test]
async fn partial_frame_then_retry() {
    let channel = channel(8);
    commit(&channel, b"PING 1234");

    // 1. No delimiter yet: consume nothing, examine everything
    let read = channel.read().await.unwrap();
    assert!(read.buffer.try_slice_to(b'\n').is_none());
    channel.advance(read.buffer.start(), read.buffer.end()).unwrap();
    assert!(channel.try_read().unwrap().is_none());

    // 2. The rest of the frame arrives
    commit(&channel, b"5\nPI");
    let read = channel.read().await.unwrap();
    let (frame, after) = read.buffer.try_slice_to(b'\n').unwrap();
    assert_eq!(frame, b"PING 12345");
    channel.advance(&after, read.buffer.end()).unwrap();
    assert_eq!(channel.unconsumed(), 2);
}

#[tokio::test]
async fn single_span_content() {
    let block_size = 64;
    let channel = channel(block_size);
    let mut rng = rand::rng();
    for _ in 0..100 {
        let bytes = random_bytes(rng.random_range(1..=block_size));
        // A fresh block for every write keeps it in a single span
        let mut writer = channel.alloc(block_size).unwrap();
        writer.write(&bytes).unwrap();
        writer.commit().unwrap();

        let read = channel.read().await.unwrap();
        assert!(read.buffer.is_single_span());
        assert_eq!(read.buffer.len(), bytes.len());
        assert_eq!(read.buffer.first_span(), bytes.as_slice());
        channel.advance_to(read.buffer.end()).unwrap();
    }
}

#[tokio::test]
async fn multi_span_content() {
    let block_size = 16;
    let channel = channel(block_size);
    let mut rng = rand::rng();
    for _ in 0..100 {
        let bytes = random_bytes(rng.random_range(block_size + 1..=block_size * 8));
        commit(&channel, &bytes);

        let read = channel.read().await.unwrap();
        assert!(!read.buffer.is_single_span());
        let spans: Vec<u8> = read.buffer.spans().flatten().copied().collect();
        assert_eq!(spans, bytes);
        assert_eq!(read.buffer.to_vec(), bytes);
        channel.advance_to(read.buffer.end()).unwrap();
    }
}

#[tokio::test]
async fn cursor_arithmetic() {
    let channel = channel(7);
    commit(&channel, &random_bytes(50));
    let read = channel.read().await.unwrap();
    let buffer = &read.buffer;
    let (start, end) = (buffer.start(), buffer.end());

    for i in 0..=buffer.len() {
        let cursor = start.offset(i, end).unwrap();
        assert_eq!(Cursor::distance(start, &cursor).unwrap(), i);
        assert_eq!(Cursor::distance(&cursor, end).unwrap(), buffer.len() - i);
        let slice = buffer.slice(i).unwrap();
        assert_eq!(Cursor::distance(slice.start(), &cursor).unwrap(), 0);
        assert_eq!(slice.len(), buffer.len() - i);
    }
}

#[tokio::test]
async fn preserve_survives_advance() {
    let pool = MemoryPool::builder().block_size(8).blocks_per_slab(4).build();
    let channel = Channel::new(pool.clone());
    let original = random_bytes(30);
    commit(&channel, &original);

    let read = channel.read().await.unwrap();
    let kept: ReadableBuffer = read.buffer.preserve();
    channel.advance_to(read.buffer.end()).unwrap();
    drop(read);

    // Released blocks are leased again and overwritten by new data
    for _ in 0..8 {
        commit(&channel, &[0xff; 30]);
        let read = channel.read().await.unwrap();
        channel.advance_to(read.buffer.end()).unwrap();
    }
    assert_eq!(kept.to_vec(), original);
    assert!(kept.is_preserved());

    let leased = pool.stats().leased_blocks;
    drop(kept);
    assert!(pool.stats().leased_blocks < leased);
}

#[tokio::test]
async fn concurrent_reads_fault() {
    let channel = channel(8);
    let mut first = channel.read();
    assert!(futures::poll!(&mut first).is_pending());

    let second = channel.read().await;
    assert!(matches!(second, Err(ChannelError::ConcurrentReads)));
    assert!(matches!(first.await, Err(ChannelError::ConcurrentReads)));
    assert!(matches!(channel.read().await, Err(ChannelError::ConcurrentReads)));
}

#[tokio::test]
async fn writer_backpressure() {
    let channel = Channel::builder(MemoryPool::builder().block_size(16).build())
        .pause_writer_threshold(32)
        .resume_writer_threshold(8)
        .build();

    let producer = tokio::spawn({
        let channel = channel.clone();
        async move {
            for i in 0..2u8 {
                let mut writer = channel.alloc(0).unwrap();
                writer.write(&[i; 16]).unwrap();
                writer.flush().await.unwrap();
            }
        }
    });

    // The second flush reaches the pause threshold
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!producer.is_finished());
    assert_eq!(channel.unconsumed(), 32);

    let read = channel.read().await.unwrap();
    channel.advance_to(read.buffer.end()).unwrap();
    timeout(Duration::from_secs(1), producer).await.unwrap().unwrap();
}

#[tokio::test]
async fn writer_cancellation_wakes_reader() {
    let channel = channel(8);
    let reader = tokio::spawn({
        let channel = channel.clone();
        async move { channel.read().await.map(|read| read.buffer.len()) }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    channel.complete_writing(Some(CompletionError::msg("cancelled")));

    let result = timeout(Duration::from_secs(1), reader).await.unwrap().unwrap();
    assert!(matches!(result, Err(ChannelError::WriterFailed(e)) if e.to_string() == "cancelled"));
}

#[tokio::test]
async fn reader_completion_releases_writer() {
    let channel = Channel::builder(MemoryPool::builder().block_size(16).build())
        .pause_writer_threshold(16)
        .build();
    let mut writer = channel.alloc(0).unwrap();
    writer.write(&[0; 16]).unwrap();
    let flush = tokio::spawn(writer.flush());

    tokio::time::sleep(Duration::from_millis(10)).await;
    channel.complete_reading(Some(CompletionError::msg("parse error")));
    timeout(Duration::from_secs(1), flush).await.unwrap().unwrap().unwrap();

    assert!(matches!(channel.alloc(0), Err(ChannelError::ReaderFailed(_))));
    assert_eq!(channel.reader_completion().await.unwrap().to_string(), "parse error");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tcp_lines() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        for i in 0..N {
            stream.write_all(format!("line {i}\n").as_bytes()).await.unwrap();
        }
        stream.shutdown().await.unwrap();
    });

    let (mut stream, _addr) = listener.accept().await.unwrap();
    let channel = Channel::builder(MemoryPool::builder().block_size(64).build())
        .pause_writer_threshold(1024)
        .build();
    let pump = tokio::spawn({
        let channel = channel.clone();
        async move { copy_from_reader(&mut stream, &channel).await }
    });

    // Parse complete lines, keep partial ones for the next read
    let mut lines = 0;
    loop {
        let read = channel.read().await.unwrap();
        let mut rest = read.buffer.clone();
        let mut consumed = rest.start().clone();
        while let Some((line, after)) = rest.try_slice_to(b'\n') {
            assert_eq!(line.decode_utf8().unwrap(), format!("line {lines}"));
            lines += 1;
            rest = rest.slice_from(&after).unwrap();
            consumed = after;
        }
        channel.advance(&consumed, read.buffer.end()).unwrap();
        if read.is_completed {
            assert!(rest.is_empty());
            break;
        }
    }
    channel.complete_reading(None);

    assert_eq!(lines, N);
    let copied = pump.await.unwrap().unwrap();
    assert!(copied > 0);
    client.await.unwrap();
}
