use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default debounce window for redraw/recheck coalescing.
pub const DEBOUNCE_WAIT: Duration = Duration::from_millis(10);
pub const DEBOUNCE_MAX_WAIT: Duration = Duration::from_millis(20);

/// Leading+trailing edge debouncer.
///
/// The first call in a burst runs the callback immediately; further calls
/// within the window collapse into one trailing run once the burst goes
/// quiet for `wait` or `max_wait` has elapsed since the leading run.
/// Cancelling the token suppresses any pending trailing run, so a destroyed
/// owner never observes a late callback.
#[derive(Debug, Clone)]
pub struct Debouncer {
    tx: mpsc::UnboundedSender<()>,
}

impl Debouncer {
    pub fn new<F>(wait: Duration, max_wait: Duration, cancel: CancellationToken, callback: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        tokio::spawn(async move {
            loop {
                // Idle: wait for the first hit of a burst.
                tokio::select! {
                    () = cancel.cancelled() => return,
                    first = rx.recv() => {
                        if first.is_none() {
                            return;
                        }
                    }
                }

                callback();

                // Collect further hits until quiet or the hard deadline.
                let deadline = tokio::time::Instant::now() + max_wait;
                let mut pending = false;
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        _ = tokio::time::sleep(wait) => break,
                        _ = tokio::time::sleep_until(deadline) => break,
                        more = rx.recv() => match more {
                            Some(()) => pending = true,
                            None => {
                                if pending {
                                    callback();
                                }
                                return;
                            }
                        },
                    }
                }
                if pending {
                    callback();
                }
            }
        });
        Self { tx }
    }

    /// Request a (possibly coalesced) callback run.
    pub fn call(&self) {
        let _ = self.tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counted(cancel: &CancellationToken) -> (Debouncer, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let d = Debouncer::new(
            DEBOUNCE_WAIT,
            DEBOUNCE_MAX_WAIT,
            cancel.clone(),
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );
        (d, count)
    }

    #[tokio::test(start_paused = true)]
    async fn single_call_fires_once_on_leading_edge() {
        let cancel = CancellationToken::new();
        let (d, count) = counted(&cancel);

        d.call();
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // No trailing fire without further calls.
        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_leading_and_trailing() {
        let cancel = CancellationToken::new();
        let (d, count) = counted(&cancel);

        d.call();
        tokio::time::advance(Duration::from_millis(2)).await;
        d.call();
        d.call();
        d.call();
        // Let the worker pick up the burst before the quiet period elapses.
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_debouncer_drops_pending_trailing_run() {
        let cancel = CancellationToken::new();
        let (d, count) = counted(&cancel);

        d.call();
        tokio::time::advance(Duration::from_millis(2)).await;
        d.call();
        cancel.cancel();
        tokio::time::advance(Duration::from_millis(50)).await;

        // Only the leading run happened.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
