use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// One playback operation: given an abort signal, emit audio until done or
/// cancelled.
pub type PlayFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, PlayResult> + Send>;

pub type PlayResult = Result<(), PlaybackError>;

#[derive(Debug, thiserror::Error)]
#[error("playback failed: {0}")]
pub struct PlaybackError(pub String);

struct QueuedOp {
    play: PlayFn,
    done: oneshot::Sender<PlayResult>,
}

struct QueueInner {
    queue: VecDeque<QueuedOp>,
    /// Abort signal of the operation currently playing, if any.
    current: Option<CancellationToken>,
    closed: bool,
}

/// Per-stream FIFO of TTS playback operations.
///
/// At most one operation runs at a time; the worker drains the queue in an
/// iterative loop, so an arbitrarily long call never grows the stack.
/// Cancelled operations resolve (never reject); a genuine playback failure
/// rejects its own waiter and the queue moves on.
#[derive(Clone)]
pub struct TtsQueue {
    inner: Arc<Mutex<QueueInner>>,
    notify: Arc<Notify>,
}

impl TtsQueue {
    pub fn new() -> Self {
        let inner = Arc::new(Mutex::new(QueueInner {
            queue: VecDeque::new(),
            current: None,
            closed: false,
        }));
        let notify = Arc::new(Notify::new());

        tokio::spawn(worker(Arc::clone(&inner), Arc::clone(&notify)));

        Self { inner, notify }
    }

    /// Enqueue a playback operation. The returned receiver resolves when the
    /// operation completes, is cancelled, or fails.
    pub async fn enqueue(&self, play: PlayFn) -> oneshot::Receiver<PlayResult> {
        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                let _ = done_tx.send(Ok(()));
                return done_rx;
            }
            inner.queue.push_back(QueuedOp {
                play,
                done: done_tx,
            });
        }
        self.notify.notify_one();
        done_rx
    }

    /// Barge-in: abort the in-flight operation and drop everything queued.
    /// Dropped operations resolve without running. Ordering of later
    /// enqueues is unaffected.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(ref token) = inner.current {
            token.cancel();
        }
        for op in inner.queue.drain(..) {
            let _ = op.done.send(Ok(()));
        }
    }

    /// Shut the queue down; pending operations resolve without running.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        if let Some(ref token) = inner.current {
            token.cancel();
        }
        for op in inner.queue.drain(..) {
            let _ = op.done.send(Ok(()));
        }
        drop(inner);
        self.notify.notify_one();
    }
}

impl Default for TtsQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn worker(inner: Arc<Mutex<QueueInner>>, notify: Arc<Notify>) {
    loop {
        // Pop the next operation, or wait for one.
        let (op, token) = loop {
            {
                let mut guard = inner.lock().await;
                if guard.closed {
                    return;
                }
                if let Some(op) = guard.queue.pop_front() {
                    let token = CancellationToken::new();
                    guard.current = Some(token.clone());
                    break (op, token);
                }
            }
            notify.notified().await;
        };

        let result = (op.play)(token.clone()).await;

        // An aborted operation resolves regardless of what its future
        // returned on the way out.
        let result = if token.is_cancelled() { Ok(()) } else { result };
        let _ = op.done.send(result);

        inner.lock().await.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn recording_op(
        order: Arc<Mutex<Vec<usize>>>,
        id: usize,
        delay_ms: u64,
    ) -> PlayFn {
        Box::new(move |signal: CancellationToken| {
            Box::pin(async move {
                tokio::select! {
                    _ = signal.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                }
                order.lock().await.push(id);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn operations_complete_in_enqueue_order() {
        let queue = TtsQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let a = queue.enqueue(recording_op(Arc::clone(&order), 1, 30)).await;
        let b = queue.enqueue(recording_op(Arc::clone(&order), 2, 5)).await;
        let c = queue.enqueue(recording_op(Arc::clone(&order), 3, 1)).await;

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        c.await.unwrap().unwrap();

        assert_eq!(*order.lock().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn clear_cancels_in_flight_and_resolves_queued() {
        let queue = TtsQueue::new();
        let executed = Arc::new(AtomicUsize::new(0));

        let exec = Arc::clone(&executed);
        let first = queue
            .enqueue(Box::new(move |signal: CancellationToken| {
                Box::pin(async move {
                    // Emits "frames" until aborted.
                    loop {
                        if signal.is_cancelled() {
                            return Ok(());
                        }
                        exec.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                })
            }))
            .await;

        let exec2 = Arc::clone(&executed);
        let second = queue
            .enqueue(Box::new(move |_signal: CancellationToken| {
                Box::pin(async move {
                    exec2.fetch_add(1000, Ordering::SeqCst);
                    Ok(())
                })
            }))
            .await;

        // Let the first op emit a few frames, then barge in.
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.clear().await;

        // Both promises resolve (not reject), and the second never ran.
        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        assert!(executed.load(Ordering::SeqCst) < 1000);
    }

    #[tokio::test]
    async fn failed_playback_rejects_and_queue_proceeds() {
        let queue = TtsQueue::new();

        let bad = queue
            .enqueue(Box::new(|_signal: CancellationToken| {
                Box::pin(async { Err(PlaybackError("synth exploded".into())) })
            }))
            .await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let good = queue.enqueue(recording_op(Arc::clone(&order), 7, 1)).await;

        assert!(bad.await.unwrap().is_err());
        assert!(good.await.unwrap().is_ok());
        assert_eq!(*order.lock().await, vec![7]);
    }

    #[tokio::test]
    async fn enqueue_after_clear_still_plays() {
        let queue = TtsQueue::new();
        queue.clear().await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let op = queue.enqueue(recording_op(Arc::clone(&order), 9, 1)).await;
        assert!(op.await.unwrap().is_ok());
        assert_eq!(*order.lock().await, vec![9]);
    }
}
