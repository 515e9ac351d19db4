use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const CHANNEL_CAPACITY: usize = 64;

/// Events flowing through the broadcast channel connecting all subsystems.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Periodic tick, once per second. `now_seconds` is monotonic,
    /// `unix_ms` is wall-clock.
    Tick { now_seconds: u64, unix_ms: i64 },

    /// A trigger was enabled or disabled (including destroy).
    TriggerEnabled { control_id: String, enabled: bool },

    /// A control was pressed or released, system-wide.
    ControlPressed { control_id: String, pressed: bool },

    /// An observing client connected.
    ClientConnect,

    /// Named variables changed value.
    VariablesChanged(Arc<HashSet<String>>),

    /// Debounced request to re-evaluate a trigger's condition.
    RecheckCondition(String),

    /// A delayed trigger watch (startup / client_connect) came due.
    TriggerEventFired { control_id: String, event_id: String },

    /// Shutdown the daemon.
    Shutdown,
}

/// Process-wide publish/subscribe bus with a 1-second tick source.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
    last_tick: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            last_tick: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Send failures mean no subscriber exists yet, which
    /// is fine during startup.
    pub fn emit(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    /// The seconds value of the most recent tick.
    pub fn last_tick(&self) -> u64 {
        self.last_tick.load(Ordering::Relaxed)
    }

    /// Spawn the strictly-periodic 1s tick task. Ticks may be skipped under
    /// load but are never emitted out of order.
    pub fn start_ticker(&self, cancel: CancellationToken) {
        let tx = self.tx.clone();
        let last_tick = self.last_tick.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = interval.tick() => {
                        let now_seconds = started.elapsed().as_secs();
                        last_tick.store(now_seconds, Ordering::Relaxed);
                        let unix_ms = chrono::Utc::now().timestamp_millis();
                        let _ = tx.send(BusEvent::Tick { now_seconds, unix_ms });
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticker_emits_monotonic_ticks() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let cancel = CancellationToken::new();
        bus.start_ticker(cancel.clone());

        let mut seen = Vec::new();
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(1)).await;
            if let Ok(BusEvent::Tick { now_seconds, .. }) = rx.try_recv() {
                seen.push(now_seconds);
            }
        }

        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(seen, sorted, "ticks must be strictly increasing");
        assert!(bus.last_tick() >= seen.last().copied().unwrap_or(0));

        cancel.cancel();
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.emit(BusEvent::ClientConnect);
    }
}
