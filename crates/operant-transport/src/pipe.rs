//! Byte-pipe bridge
//!
//! Splits an async byte stream into the two channel ends the rest of the
//! engine speaks: an outlet whose batches are framed onto the pipe, and an
//! inbound receiver fed with every whole frame read from it. When the pipe
//! closes the inbound channel disconnects, which the task process treats
//! like a source that went away.

use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::RecvTimeoutError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use operant_core::OperantResult;
use operant_wire::{frame, link, FrameDecoder, LinkReceiver, LinkSender};

/// Read buffer size
const READ_CHUNK: usize = 8 * 1024;

/// How often the outbound forwarder checks whether the writer is gone
const FORWARD_POLL: Duration = Duration::from_millis(100);

/// Channel ends of a bridged pipe
#[derive(Debug)]
pub struct PipeEnds {
    /// Batches sent here are written to the pipe
    pub outlet: LinkSender,
    /// Batches read from the pipe
    pub inbound: LinkReceiver,
}

/// Bridge `stream` onto channel ends, running its I/O on `runtime`
pub fn bridge<S>(stream: S, runtime: &Handle) -> PipeEnds
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (inbound_tx, inbound) = link();
    let (outlet, outbound_rx) = link();

    runtime.spawn(start_read_loop(reader, inbound_tx));

    // Crossbeam receivers block; hand batches to the async writer from a blocking task
    let (write_tx, write_rx) = mpsc::unbounded_channel::<Bytes>();
    runtime.spawn_blocking(move || loop {
        match outbound_rx.recv_timeout(FORWARD_POLL) {
            Ok(batch) => {
                if write_tx.send(batch).is_err() {
                    break; // Writer gone
                }
            }
            Err(RecvTimeoutError::Timeout) if write_tx.is_closed() => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    });
    runtime.spawn(start_write_loop(writer, write_rx));

    PipeEnds { outlet, inbound }
}

/// Connect to a Unix domain socket and bridge it on the current runtime
#[cfg(unix)]
pub async fn connect_unix(path: impl AsRef<std::path::Path>) -> OperantResult<PipeEnds> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(bridge(stream, &Handle::current()))
}

async fn start_read_loop<S>(mut reader: ReadHalf<S>, inbound: LinkSender)
where
    S: AsyncRead + AsyncWrite + Send,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(pending = decoder.buffered(), "pipe closed");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("pipe read error: {}", e);
                break;
            }
        };
        decoder.extend(&buf[..n]);

        loop {
            match decoder.next_frame() {
                Ok(Some(batch)) => {
                    if inbound.send(batch).is_err() {
                        return; // Receiver dropped
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Stream is out of sync; nothing after this can be trusted
                    tracing::warn!("pipe framing error: {}", e);
                    return;
                }
            }
        }
    }
}

async fn start_write_loop<S>(mut writer: WriteHalf<S>, mut batches: mpsc::UnboundedReceiver<Bytes>)
where
    S: AsyncRead + AsyncWrite + Send,
{
    while let Some(batch) = batches.recv().await {
        let framed = frame(&batch);
        if let Err(e) = writer.write_all(&framed).await {
            tracing::warn!("pipe write error: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::warn!("pipe flush error: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}
