use crate::error::{PanelError, Result};
use crate::instance::InstanceHost;
use crate::model::{clamp_index, new_id, ActionInstance, OptionsMap};
use crate::sync::{recorder_session_topic, SyncHub, RECORDER_SESSIONS_TOPIC};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
struct RecordingSession {
    id: String,
    instance_ids: Vec<String>,
    is_running: bool,
    action_delay: u64,
    actions: Vec<ActionInstance>,
}

impl RecordingSession {
    fn new() -> Self {
        Self {
            id: new_id(),
            instance_ids: Vec::new(),
            is_running: false,
            action_delay: 0,
            actions: Vec::new(),
        }
    }
}

/// Records actions reported by instances into an editable staging list.
/// There is always exactly one live session; saving or aborting replaces it
/// with a fresh one.
pub struct ActionRecorder {
    session: RecordingSession,
    instances: Arc<dyn InstanceHost>,
    hub: Arc<SyncHub>,

    /// Instances we have asked to report actions.
    currently_recording: HashSet<String>,
}

impl ActionRecorder {
    pub fn new(instances: Arc<dyn InstanceHost>, hub: Arc<SyncHub>) -> Self {
        let recorder = Self {
            session: RecordingSession::new(),
            instances,
            hub,
            currently_recording: HashSet::new(),
        };
        recorder.commit_changes();
        recorder
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn is_running(&self) -> bool {
        self.session.is_running
    }

    /// The staged actions, ready to be written into a control.
    pub fn session_actions(&self) -> Vec<ActionInstance> {
        self.session.actions.clone()
    }

    fn check_session(&self, session_id: &str) -> Result<()> {
        if self.session.id != session_id {
            return Err(PanelError::UnknownSession(session_id.to_string()));
        }
        Ok(())
    }

    // --- session lifecycle ----------------------------------------------

    /// Start or stop recording.
    pub fn set_recording(&mut self, session_id: &str, is_running: bool) -> Result<()> {
        self.check_session(session_id)?;
        if self.session.is_running != is_running {
            self.session.is_running = is_running;
            self.sync_recording();
        }
        self.commit_changes();
        Ok(())
    }

    /// Select which instances feed the session. Unknown ids are dropped.
    pub fn set_instance_ids(&mut self, session_id: &str, instance_ids: Vec<String>) -> Result<()> {
        self.check_session(session_id)?;
        let known: HashSet<String> = self.instances.known_instance_ids().into_iter().collect();
        self.session.instance_ids = instance_ids
            .into_iter()
            .filter(|id| known.contains(id))
            .collect();
        self.sync_recording();
        self.commit_changes();
        Ok(())
    }

    /// Initial delay stamped onto newly recorded actions.
    pub fn set_action_delay(&mut self, session_id: &str, delay: i64) -> Result<()> {
        self.check_session(session_id)?;
        if delay < 0 {
            return Err(PanelError::InvalidDelay(delay));
        }
        self.session.action_delay = delay as u64;
        self.commit_changes();
        Ok(())
    }

    /// Throw away the session, staged actions included.
    pub fn abort_session(&mut self, session_id: &str) -> Result<()> {
        self.check_session(session_id)?;
        self.destroy_session(false);
        Ok(())
    }

    /// Clear the staged actions but keep recording.
    pub fn discard_actions(&mut self, session_id: &str) -> Result<()> {
        self.check_session(session_id)?;
        self.session.actions.clear();
        self.commit_changes();
        Ok(())
    }

    /// Retire the current session and start a fresh one. Called after a save
    /// (keeping the instance selection) or an abort (dropping it).
    pub fn destroy_session(&mut self, preserve_instances: bool) {
        let old = std::mem::replace(&mut self.session, RecordingSession::new());
        if preserve_instances {
            self.session.instance_ids = old.instance_ids;
        }
        self.hub.remove(&recorder_session_topic(&old.id));
        self.hub.commit_key(RECORDER_SESSIONS_TOPIC, &old.id, None);
        self.sync_recording();
        self.commit_changes();
    }

    // --- staged action edits --------------------------------------------

    pub fn action_delete(&mut self, session_id: &str, action_id: &str) -> Result<bool> {
        self.check_session(session_id)?;
        let before = self.session.actions.len();
        self.session.actions.retain(|a| a.id != action_id);
        let changed = self.session.actions.len() != before;
        if changed {
            self.commit_changes();
        }
        Ok(changed)
    }

    pub fn action_duplicate(&mut self, session_id: &str, action_id: &str) -> Result<bool> {
        self.check_session(session_id)?;
        let Some(index) = self.session.actions.iter().position(|a| a.id == action_id) else {
            return Ok(false);
        };
        let mut copy = self.session.actions[index].clone();
        copy.id = new_id();
        // A duplicate is a deliberate edit; re-reports must not collapse it.
        copy.uniqueness_id = None;
        self.session.actions.insert(index + 1, copy);
        self.commit_changes();
        Ok(true)
    }

    pub fn action_set_delay(&mut self, session_id: &str, action_id: &str, delay: i64) -> Result<bool> {
        self.check_session(session_id)?;
        if delay < 0 {
            return Err(PanelError::InvalidDelay(delay));
        }
        let Some(action) = self.session.actions.iter_mut().find(|a| a.id == action_id) else {
            return Ok(false);
        };
        action.delay = delay as u64;
        self.commit_changes();
        Ok(true)
    }

    pub fn action_set_value(
        &mut self,
        session_id: &str,
        action_id: &str,
        key: &str,
        value: Value,
    ) -> Result<bool> {
        self.check_session(session_id)?;
        let Some(action) = self.session.actions.iter_mut().find(|a| a.id == action_id) else {
            return Ok(false);
        };
        action.options.insert(key.to_string(), value);
        self.commit_changes();
        Ok(true)
    }

    pub fn action_reorder(
        &mut self,
        session_id: &str,
        old_index: usize,
        new_index: usize,
    ) -> Result<bool> {
        self.check_session(session_id)?;
        if old_index >= self.session.actions.len() {
            return Ok(false);
        }
        let action = self.session.actions.remove(old_index);
        let new_index = clamp_index(new_index, self.session.actions.len());
        self.session.actions.insert(new_index, action);
        self.commit_changes();
        Ok(true)
    }

    // --- instance callbacks ---------------------------------------------

    /// An instance reported an action. Re-reports with the same uniqueness
    /// id update the existing entry in place instead of appending. Only the
    /// instance selection gates a report; a straggler that arrives after
    /// recording stopped but before the instance processed the stop is
    /// still staged.
    pub fn receive_action(
        &mut self,
        instance_id: &str,
        action_def: &str,
        options: OptionsMap,
        uniqueness_id: Option<&str>,
    ) {
        if !self.session.instance_ids.iter().any(|i| i == instance_id) {
            debug!("dropping recorded action from unselected instance {instance_id}");
            return;
        }

        if let Some(uniqueness_id) = uniqueness_id {
            if let Some(existing) = self.session.actions.iter_mut().find(|a| {
                a.instance == instance_id && a.uniqueness_id.as_deref() == Some(uniqueness_id)
            }) {
                existing.action = action_def.to_string();
                existing.options = options;
                self.commit_changes();
                return;
            }
        }

        self.session.actions.push(ActionInstance {
            id: new_id(),
            action: action_def.to_string(),
            instance: instance_id.to_string(),
            options,
            delay: self.session.action_delay,
            disabled: false,
            uniqueness_id: uniqueness_id.map(str::to_string),
        });
        self.commit_changes();
    }

    /// An instance went away: deselect it and drop its pending reports.
    pub fn forget_instance(&mut self, instance_id: &str) {
        self.currently_recording.remove(instance_id);
        let before = self.session.instance_ids.len();
        self.session.instance_ids.retain(|i| i != instance_id);
        if self.session.instance_ids.len() != before {
            self.commit_changes();
        }
    }

    /// Reconcile which instances should be reporting with which ones are,
    /// telling each one to start or stop. Failures are logged; the desired
    /// state is kept so a later sync retries.
    fn sync_recording(&mut self) {
        let desired: HashSet<String> = if self.session.is_running {
            self.session.instance_ids.iter().cloned().collect()
        } else {
            HashSet::new()
        };

        let starts = desired
            .difference(&self.currently_recording)
            .map(|id| (id, true));
        let stops = self
            .currently_recording
            .difference(&desired)
            .map(|id| (id, false));

        let mut calls = Vec::new();
        for (id, recording) in starts.chain(stops) {
            if let Some(handle) = self.instances.get(id) {
                let id = id.clone();
                let fut = handle.start_stop_recording_actions(recording);
                calls.push(async move {
                    if let Err(e) = fut.await {
                        let verb = if recording { "start" } else { "stop" };
                        warn!("instance {id} failed to {verb} recording: {e}");
                    }
                });
            }
        }
        if !calls.is_empty() {
            tokio::spawn(async move {
                join_all(calls).await;
            });
        }

        self.currently_recording = desired;
    }

    // --- sync ------------------------------------------------------------

    fn session_summary(&self) -> Value {
        json!({
            "id": self.session.id,
            "instance_ids": self.session.instance_ids,
            "is_running": self.session.is_running,
        })
    }

    fn commit_changes(&self) {
        let snapshot = serde_json::to_value(&self.session).unwrap_or(Value::Null);
        self.hub
            .commit(&recorder_session_topic(&self.session.id), snapshot);
        self.hub
            .commit_key(RECORDER_SESSIONS_TOPIC, &self.session.id, Some(self.session_summary()));
    }
}
