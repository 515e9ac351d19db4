use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

const TOPIC_CHANNEL_CAPACITY: usize = 32;

pub fn control_config_topic(control_id: &str) -> String {
    format!("controls:config:{control_id}")
}

pub fn control_runtime_topic(control_id: &str) -> String {
    format!("controls:runtime:{control_id}")
}

pub const TRIGGERS_LIST_TOPIC: &str = "triggers:list";

pub const RECORDER_SESSIONS_TOPIC: &str = "action-recorder:sessions";

pub fn recorder_session_topic(session_id: &str) -> String {
    format!("action-recorder:session:{session_id}")
}

/// One update published to the observers of a topic.
#[derive(Debug, Clone)]
pub enum SyncMessage {
    /// Structural diff against the previously published snapshot.
    Patch(json_patch::Patch),

    /// The topic's subject was deleted; observers must drop cached state.
    Gone,
}

struct TopicState {
    last: Option<Value>,
    tx: broadcast::Sender<SyncMessage>,
}

impl TopicState {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(TOPIC_CHANNEL_CAPACITY);
        Self { last: None, tx }
    }
}

/// Differential sync channel: keeps a "last sent" snapshot per topic and
/// publishes JSON Patch diffs to observers on change.
///
/// With zero observers no diff is computed, but the cache is always replaced
/// so a late subscriber's first message is a full, correct snapshot.
pub struct SyncHub {
    topics: Mutex<HashMap<String, TopicState>>,
    diffs_computed: AtomicU64,
}

impl Default for SyncHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncHub {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            diffs_computed: AtomicU64::new(0),
        }
    }

    /// Join a topic: returns the current full snapshot (if any) and a live
    /// patch stream. Each call is an independent join.
    pub fn subscribe(&self, topic: &str) -> (Option<Value>, broadcast::Receiver<SyncMessage>) {
        let mut topics = self.topics.lock().expect("sync hub poisoned");
        let state = topics.entry(topic.to_string()).or_insert_with(TopicState::new);
        (state.last.clone(), state.tx.subscribe())
    }

    /// Publish a new snapshot for a topic.
    pub fn commit(&self, topic: &str, new_snapshot: Value) {
        let mut topics = self.topics.lock().expect("sync hub poisoned");
        let state = topics.entry(topic.to_string()).or_insert_with(TopicState::new);
        self.commit_state(state, new_snapshot);
    }

    /// Update one entry of an object-valued topic (trigger list, session
    /// list). `None` removes the entry.
    pub fn commit_key(&self, topic: &str, key: &str, entry: Option<Value>) {
        let mut topics = self.topics.lock().expect("sync hub poisoned");
        let state = topics.entry(topic.to_string()).or_insert_with(TopicState::new);

        let mut snapshot = match state.last.clone() {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        match entry {
            Some(value) => {
                snapshot.insert(key.to_string(), value);
            }
            None => {
                snapshot.remove(key);
            }
        }
        self.commit_state(state, Value::Object(snapshot));
    }

    /// Tombstone a topic and drop its cache.
    pub fn remove(&self, topic: &str) {
        let mut topics = self.topics.lock().expect("sync hub poisoned");
        if let Some(state) = topics.remove(topic) {
            let _ = state.tx.send(SyncMessage::Gone);
        }
    }

    /// Number of structural diffs computed so far. Used to verify that
    /// observer-less commits skip diff work.
    pub fn diff_count(&self) -> u64 {
        self.diffs_computed.load(Ordering::Relaxed)
    }

    fn commit_state(&self, state: &mut TopicState, new_snapshot: Value) {
        if state.tx.receiver_count() > 0 {
            let empty = Value::Object(serde_json::Map::new());
            let previous = state.last.as_ref().unwrap_or(&empty);
            let patch = json_patch::diff(previous, &new_snapshot);
            self.diffs_computed.fetch_add(1, Ordering::Relaxed);
            if !patch.0.is_empty() {
                let _ = state.tx.send(SyncMessage::Patch(patch));
            }
        }
        state.last = Some(new_snapshot);
    }
}
