use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

use crate::error::{ExecutionError, ExecutionResult};

/// Create a single-producer, single-consumer frame pipe.
/// One frame is one codec message; frame boundaries are preserved.
/// Writes suspend when the reader is slow; reads observe end of stream
/// once the writer has been closed and the buffer drained.
pub fn pipe(buffer: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (PipeWriter { tx }, PipeReader { rx })
}

pub struct PipeWriter {
    tx: mpsc::Sender<Bytes>,
}

impl PipeWriter {
    pub async fn write(&self, frame: Bytes) -> ExecutionResult<()> {
        self.tx.send(frame).await.map_err(|_| ExecutionError::PipeClosed)
    }

    /// Closing the writer signals end of stream to the reader after drain.
    pub fn close(self) {}
}

pub struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
}

impl PipeReader {
    /// Read the next frame, or `None` once the writer is closed and the
    /// buffer has drained. Dropping the reader fails subsequent writes.
    pub async fn read(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Stream for PipeReader {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
