use core::time::Duration;
use std::collections::BTreeSet;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

/// Coalesces bursts of keys.
///
/// Keys pushed while a burst is in progress are collected into a set. Once
/// `window` passes with no new arrivals, the set is handed to the flush
/// callback, so each distinct key is flushed once per burst no matter how
/// often it was pushed.
pub struct Debouncer<K> {
    tx: mpsc::UnboundedSender<K>,
    cancel: CancellationToken,
}

impl<K> Debouncer<K>
where
    K: Ord + Send + 'static,
{
    pub const DEFAULT_WINDOW: Duration = Duration::from_millis(300);

    /// Spawns the debouncing task. Must be called from within a Tokio runtime.
    pub fn new(window: Duration, flush: impl Fn(Vec<K>) + Send + 'static) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run(window, rx, cancel.clone(), flush));
        Self { tx, cancel }
    }

    /// Queues `key`. Returns `false` once the debouncer is stopped.
    pub fn push(&self, key: K) -> bool {
        self.tx.send(key).is_ok()
    }

    /// Stops the task, dropping anything still pending.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl<K> Drop for Debouncer<K> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run<K: Ord>(
    window: Duration,
    mut rx: mpsc::UnboundedReceiver<K>,
    cancel: CancellationToken,
    flush: impl Fn(Vec<K>),
) {
    let mut pending = BTreeSet::new();
    let mut deadline = Instant::now();
    loop {
        if pending.is_empty() {
            tokio::select! {
                () = cancel.cancelled() => break,
                key = rx.recv() => match key {
                    Some(key) => {
                        pending.insert(key);
                        deadline = Instant::now() + window;
                    }
                    None => break,
                },
            }
        } else {
            tokio::select! {
                () = cancel.cancelled() => break,
                key = rx.recv() => match key {
                    Some(key) => {
                        pending.insert(key);
                        deadline = Instant::now() + window;
                    }
                    None => {
                        flush(std::mem::take(&mut pending).into_iter().collect());
                        break;
                    }
                },
                () = tokio::time::sleep_until(deadline) => {
                    flush(std::mem::take(&mut pending).into_iter().collect());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (
        impl Fn(Vec<&'static str>) + Send + 'static,
        mpsc::UnboundedReceiver<Vec<&'static str>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |keys| {
                let _ = tx.send(keys);
            },
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_once_after_quiescence() {
        let (flush, mut flushed) = collector();
        let debouncer = Debouncer::new(Debouncer::<&str>::DEFAULT_WINDOW, flush);

        debouncer.push("b");
        tokio::time::sleep(Duration::from_millis(200)).await;
        debouncer.push("a");
        debouncer.push("b");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(flushed.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(flushed.try_recv().unwrap(), vec!["a", "b"]);
        assert!(flushed.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn separate_bursts_flush_separately() {
        let (flush, mut flushed) = collector();
        let debouncer = Debouncer::new(Duration::from_millis(50), flush);

        debouncer.push("x");
        assert_eq!(flushed.recv().await.unwrap(), vec!["x"]);
        debouncer.push("x");
        assert_eq!(flushed.recv().await.unwrap(), vec!["x"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_pending_keys() {
        let (flush, mut flushed) = collector();
        let debouncer = Debouncer::new(Duration::from_millis(50), flush);

        debouncer.push("x");
        tokio::task::yield_now().await;
        debouncer.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(flushed.try_recv().is_err());
        // The task has exited and dropped its receiver.
        assert!(!debouncer.push("y"));
    }
}
