//! Outbound write queue.
//!
//! All writers funnel frames through an unbounded channel into a single
//! writer task that owns the write half of the socket. Enqueueing is
//! synchronous, so frames leave in the exact order callers submitted them,
//! and each submission carries a oneshot that resolves once the frame has
//! been flushed (or failed).

use futures::SinkExt;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
};
use tokio_util::codec::FramedWrite;
use tracing::debug;

use crate::{Result, WsError, codec::Encoder, frame::Frame};

enum Command {
    Write(WriteRequest),
    Shutdown,
}

struct WriteRequest {
    frame: Frame,
    done: oneshot::Sender<Result<()>>,
}

/// Resolves when the associated frame has been written and flushed.
pub struct Completion(oneshot::Receiver<Result<()>>);

impl Completion {
    /// Waits for the write to finish.
    ///
    /// Returns [`WsError::AlreadyClosed`] when the writer task went away
    /// before handling the frame.
    pub async fn wait(self) -> Result<()> {
        self.0.await.map_err(|_| WsError::AlreadyClosed)?
    }
}

/// Handle for submitting frames to the writer task.
#[derive(Clone)]
pub(crate) struct OutboundQueue {
    tx: mpsc::UnboundedSender<Command>,
}

impl OutboundQueue {
    /// Submits a frame for writing.
    ///
    /// The frame's position in the output is fixed at this call, not when
    /// the returned completion is awaited.
    pub(crate) fn enqueue(&self, frame: Frame) -> Result<Completion> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Write(WriteRequest { frame, done }))
            .map_err(|_| WsError::AlreadyClosed)?;
        Ok(Completion(rx))
    }

    /// Tells the writer task to drain pending frames and shut the socket
    /// down. Safe to call more than once.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// Spawns the writer task owning `sink` and returns the submission handle.
pub(crate) fn spawn_writer<W>(sink: FramedWrite<W, Encoder>) -> OutboundQueue
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_writer(sink, rx));
    OutboundQueue { tx }
}

async fn run_writer<W>(
    mut sink: FramedWrite<W, Encoder>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = rx.recv().await {
        match command {
            Command::Write(req) => {
                let res = sink.send(req.frame).await;
                // The submitter may have dropped its completion.
                let _ = req.done.send(res);
            }
            Command::Shutdown => break,
        }
    }
    if let Err(err) = sink.get_mut().shutdown().await {
        debug!("socket shutdown failed: {err}");
    }
}
