//! Concurrent draining of the scraper's stdout and stderr.
//!
//! Each pipe gets its own read task so a child blocked on a full stderr buffer
//! can never stall stdout (or the reverse). Both tasks feed one channel with a
//! single consumer, which assigns arrival sequence numbers and classifies.

use super::classify::classify;
use crate::error::StreamReadError;
use crate::model::{ScrapeEvent, StreamSource};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Raw messages sent by the per-pipe read tasks.
#[derive(Debug)]
enum PipeMessage {
    Line { source: StreamSource, text: String },
    Closed(StreamSource),
    Failed(StreamReadError),
}

/// What the consumer sees, in arrival order.
#[derive(Debug)]
pub enum StreamUpdate {
    Event(ScrapeEvent),
    Closed(StreamSource),
    Failed(StreamReadError),
}

pub struct EventStream {
    rx: UnboundedReceiver<PipeMessage>,
    next_seq: u64,
    readers: Vec<JoinHandle<()>>,
}

impl EventStream {
    /// Start one read task per pipe.
    pub fn spawn<O, E>(stdout: O, stderr: E) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<PipeMessage>();
        let readers = vec![
            tokio::spawn(pump(stdout, StreamSource::Stdout, tx.clone())),
            tokio::spawn(pump(stderr, StreamSource::Stderr, tx)),
        ];
        Self {
            rx,
            next_seq: 0,
            readers,
        }
    }

    /// Next update from either pipe. `None` once both pipes are finished.
    pub async fn next(&mut self) -> Option<StreamUpdate> {
        let update = match self.rx.recv().await? {
            PipeMessage::Line { source, text } => {
                let seq = self.next_seq;
                self.next_seq += 1;
                let kind = classify(source, &text);
                StreamUpdate::Event(ScrapeEvent {
                    seq,
                    source,
                    text,
                    kind,
                })
            }
            PipeMessage::Closed(source) => StreamUpdate::Closed(source),
            PipeMessage::Failed(err) => StreamUpdate::Failed(err),
        };
        Some(update)
    }

    /// Stop reading. Used when the child is gone but a descendant still holds a pipe.
    pub fn abandon(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
        self.rx.close();
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

async fn pump<R>(reader: R, source: StreamSource, tx: UnboundedSender<PipeMessage>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                debug!(stream = %source, "pipe closed");
                let _ = tx.send(PipeMessage::Closed(source));
                break;
            }
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                // Lossy decoding: a stray byte must not cost the rest of the stream.
                let text = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(PipeMessage::Line { source, text }).is_err() {
                    break;
                }
            }
            Err(error) => {
                warn!(stream = %source, %error, "pipe read failed");
                let _ = tx.send(PipeMessage::Failed(StreamReadError {
                    stream: source,
                    error,
                }));
                break;
            }
        }
    }
}
