//! Per-stream TTS playback serialization.
//!
//! Each media stream gets a FIFO of playback operations. At most one
//! operation runs at a time; the worker drains the queue iteratively, so a
//! long call never grows the stack. Clearing a queue aborts the in-flight
//! operation through its cancellation token and resolves (never rejects)
//! every queued operation without running it.

use crate::error::Result;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a playback operation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Completed,
    /// Cleared before or during playback. Not an error.
    Cancelled,
}

pub type PlayResult = Result<PlayOutcome>;

type PlayFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type PlayFn = Box<dyn FnOnce(CancellationToken) -> PlayFuture + Send>;

struct QueuedOp {
    play: PlayFn,
    done: oneshot::Sender<PlayResult>,
}

#[derive(Default)]
struct StreamQueue {
    queue: VecDeque<QueuedOp>,
    running: bool,
    current_cancel: Option<CancellationToken>,
}

/// FIFO playback queues keyed by stream id.
#[derive(Default)]
pub struct TtsQueue {
    streams: Mutex<HashMap<String, StreamQueue>>,
}

impl TtsQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enqueue a playback operation. The returned receiver resolves with
    /// the operation's outcome; a failed (non-cancelled) playback resolves
    /// to `Err` and the queue proceeds to the next item.
    pub fn enqueue(
        self: &Arc<Self>,
        stream_sid: &str,
        play: PlayFn,
    ) -> oneshot::Receiver<PlayResult> {
        let (done_tx, done_rx) = oneshot::channel();
        let spawn_worker = {
            let mut streams = self.streams.lock().unwrap();
            let entry = streams.entry(stream_sid.to_string()).or_default();
            entry.queue.push_back(QueuedOp {
                play,
                done: done_tx,
            });
            if entry.running {
                false
            } else {
                entry.running = true;
                true
            }
        };

        if spawn_worker {
            let queue = self.clone();
            let sid = stream_sid.to_string();
            tokio::spawn(async move {
                queue.drain(&sid).await;
            });
        }
        done_rx
    }

    /// Convenience wrapper taking an async closure.
    pub fn enqueue_fn<F, Fut>(
        self: &Arc<Self>,
        stream_sid: &str,
        play: F,
    ) -> oneshot::Receiver<PlayResult>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.enqueue(stream_sid, Box::new(move |cancel| Box::pin(play(cancel))))
    }

    /// Iterative worker: one operation at a time, in enqueue order.
    async fn drain(self: Arc<Self>, stream_sid: &str) {
        loop {
            let (op, cancel) = {
                let mut streams = self.streams.lock().unwrap();
                let Some(entry) = streams.get_mut(stream_sid) else {
                    return;
                };
                match entry.queue.pop_front() {
                    Some(op) => {
                        let cancel = CancellationToken::new();
                        entry.current_cancel = Some(cancel.clone());
                        (op, cancel)
                    }
                    None => {
                        entry.running = false;
                        entry.current_cancel = None;
                        return;
                    }
                }
            };

            let result = (op.play)(cancel.clone()).await;
            {
                let mut streams = self.streams.lock().unwrap();
                if let Some(entry) = streams.get_mut(stream_sid) {
                    entry.current_cancel = None;
                }
            }
            let outcome = match result {
                Ok(()) if cancel.is_cancelled() => Ok(PlayOutcome::Cancelled),
                Ok(()) => Ok(PlayOutcome::Completed),
                Err(e) => Err(e),
            };
            let _ = op.done.send(outcome);
        }
    }

    /// Abort the in-flight operation and drop everything queued behind it.
    /// Dropped operations resolve with [`PlayOutcome::Cancelled`]. Returns
    /// how many operations (in-flight excluded) were dropped.
    pub fn clear(&self, stream_sid: &str) -> usize {
        let mut streams = self.streams.lock().unwrap();
        let Some(entry) = streams.get_mut(stream_sid) else {
            return 0;
        };
        if let Some(cancel) = &entry.current_cancel {
            cancel.cancel();
        }
        let dropped = entry.queue.len();
        for op in entry.queue.drain(..) {
            let _ = op.done.send(Ok(PlayOutcome::Cancelled));
        }
        if dropped > 0 {
            debug!(stream_sid, dropped, "tts queue cleared");
        }
        dropped
    }

    /// Drop all bookkeeping for a stream (connection closed).
    pub fn remove_stream(&self, stream_sid: &str) {
        self.clear(stream_sid);
        self.streams.lock().unwrap().remove(stream_sid);
    }

    #[cfg(test)]
    fn queued_len(&self, stream_sid: &str) -> usize {
        self.streams
            .lock()
            .unwrap()
            .get(stream_sid)
            .map(|entry| entry.queue.len())
            .unwrap_or(0)
    }
}
