use crate::control::{
    ButtonControl, Control, ControlDeps, PageNumberControl, TriggerControl,
};
use crate::db::CONTROLS_DB_PREFIX;
use crate::error::{PanelError, Result};
use crate::event::BusEvent;
use crate::model::{RunActionExtras, SaveMode};
use crate::recorder::ActionRecorder;
use crate::runner::run_actions;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owner of every live control. All mutation funnels through the event loop,
/// so the registry itself needs no locking.
pub struct ControlsRegistry {
    controls: HashMap<String, Control>,
    recorder: ActionRecorder,
    deps: ControlDeps,
    cancel: CancellationToken,
}

impl ControlsRegistry {
    /// Build the registry and revive every persisted control. Records that
    /// fail to parse are skipped, not fatal.
    pub fn new(deps: ControlDeps, cancel: CancellationToken) -> Result<Self> {
        let recorder = ActionRecorder::new(deps.instances.clone(), deps.hub.clone());
        let mut registry = Self {
            controls: HashMap::new(),
            recorder,
            deps,
            cancel,
        };

        for key in registry.deps.db.keys_with_prefix(CONTROLS_DB_PREFIX) {
            let Some(control_id) = key.strip_prefix(CONTROLS_DB_PREFIX).map(str::to_string) else {
                continue;
            };
            let Some(record) = registry.deps.db.get_key(&key) else {
                continue;
            };
            match registry.revive(&control_id, &record) {
                Ok(()) => {}
                Err(e) => warn!("skipping control {control_id}: {e}"),
            }
        }
        info!("loaded {} controls", registry.controls.len());
        Ok(registry)
    }

    fn revive(&mut self, control_id: &str, record: &Value) -> Result<()> {
        let kind = record.get("type").and_then(|v| v.as_str()).unwrap_or("");
        let control = match kind {
            "button" => Control::Button(ButtonControl::new(
                control_id.to_string(),
                self.deps.clone(),
                &self.cancel,
                Some(record),
            )?),
            "pagenum" => Control::PageNumber(PageNumberControl::new(
                control_id.to_string(),
                self.deps.clone(),
                &self.cancel,
                Some(record),
            )?),
            "trigger" => Control::Trigger(TriggerControl::new(
                control_id.to_string(),
                self.deps.clone(),
                &self.cancel,
                Some(record),
            )?),
            other => {
                return Err(PanelError::BadControlRecord {
                    id: control_id.to_string(),
                    message: format!("unknown type: {other}"),
                })
            }
        };
        self.controls.insert(control_id.to_string(), control);
        Ok(())
    }

    pub fn control_ids(&self) -> Vec<String> {
        self.controls.keys().cloned().collect()
    }

    pub fn get(&self, control_id: &str) -> Result<&Control> {
        self.controls
            .get(control_id)
            .ok_or_else(|| PanelError::UnknownControl(control_id.to_string()))
    }

    pub fn get_mut(&mut self, control_id: &str) -> Result<&mut Control> {
        self.controls
            .get_mut(control_id)
            .ok_or_else(|| PanelError::UnknownControl(control_id.to_string()))
    }

    pub fn recorder(&mut self) -> &mut ActionRecorder {
        &mut self.recorder
    }

    // --- lifecycle ------------------------------------------------------

    pub fn create_button(&mut self, control_id: &str) -> Result<()> {
        let control = ButtonControl::new(
            control_id.to_string(),
            self.deps.clone(),
            &self.cancel,
            None,
        )?;
        self.replace_control(control_id, Control::Button(control));
        Ok(())
    }

    pub fn create_pagenum(&mut self, control_id: &str) -> Result<()> {
        let control = PageNumberControl::new(
            control_id.to_string(),
            self.deps.clone(),
            &self.cancel,
            None,
        )?;
        self.replace_control(control_id, Control::PageNumber(control));
        Ok(())
    }

    pub fn create_trigger(&mut self, control_id: &str) -> Result<()> {
        let control = TriggerControl::new(
            control_id.to_string(),
            self.deps.clone(),
            &self.cancel,
            None,
        )?;
        self.replace_control(control_id, Control::Trigger(control));
        Ok(())
    }

    fn replace_control(&mut self, control_id: &str, control: Control) {
        if let Some(old) = self.controls.insert(control_id.to_string(), control) {
            old.destroy();
        }
    }

    pub fn delete_control(&mut self, control_id: &str) -> Result<()> {
        let control = self
            .controls
            .remove(control_id)
            .ok_or_else(|| PanelError::UnknownControl(control_id.to_string()))?;
        control.destroy();
        Ok(())
    }

    // --- input ----------------------------------------------------------

    /// A surface pressed or released this control. The press is announced on
    /// the bus only for a control that exists, so a stray press cannot fire
    /// press watches.
    pub fn press_control(
        &mut self,
        control_id: &str,
        pressed: bool,
        surface_id: Option<String>,
    ) -> Result<()> {
        if !self.controls.contains_key(control_id) {
            return Err(PanelError::UnknownControl(control_id.to_string()));
        }
        self.deps.bus.emit(BusEvent::ControlPressed {
            control_id: control_id.to_string(),
            pressed,
        });

        let extras = RunActionExtras {
            control_id: control_id.to_string(),
            surface_id,
            ..RunActionExtras::default()
        };
        match self.get_mut(control_id)? {
            Control::Button(c) => {
                let actions = c.press(pressed);
                let relative = c.relative_delay();
                let cancel = c.common.cancel.clone();
                run_actions(self.deps.instances.clone(), actions, relative, extras, cancel);
            }
            Control::PageNumber(c) => c.press(pressed),
            Control::Trigger(_) => {}
        }
        Ok(())
    }

    /// A surface rotated the encoder under this control.
    pub fn rotate_control(
        &mut self,
        control_id: &str,
        right: bool,
        surface_id: Option<String>,
    ) -> Result<()> {
        let extras = RunActionExtras {
            control_id: control_id.to_string(),
            surface_id,
            ..RunActionExtras::default()
        };
        if let Control::Button(c) = self.get_mut(control_id)? {
            let actions = c.rotate(right);
            let relative = c.relative_delay();
            let cancel = c.common.cancel.clone();
            run_actions(self.deps.instances.clone(), actions, relative, extras, cancel);
        }
        Ok(())
    }

    /// Run a trigger's actions immediately, bypassing its enabled gate.
    pub fn test_trigger(&mut self, control_id: &str) -> Result<()> {
        self.fire_trigger(control_id, true)
    }

    fn fire_trigger(&mut self, control_id: &str, is_test: bool) -> Result<()> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let Control::Trigger(c) = self.get_mut(control_id)? else {
            return Err(PanelError::NotSupported("trigger execution"));
        };
        let Some(actions) = c.execute_actions(now_ms, is_test) else {
            return Ok(());
        };
        let relative = c.relative_delay();
        let cancel = c.common.cancel.clone();
        let extras = RunActionExtras {
            control_id: control_id.to_string(),
            ..RunActionExtras::default()
        };
        run_actions(self.deps.instances.clone(), actions, relative, extras, cancel);
        Ok(())
    }

    fn fire_matching_triggers(&mut self, matching: Vec<String>) {
        for control_id in matching {
            if let Err(e) = self.fire_trigger(&control_id, false) {
                warn!("trigger {control_id} failed to fire: {e}");
            }
        }
    }

    fn trigger_ids(&self) -> Vec<String> {
        self.controls
            .iter()
            .filter(|(_, c)| matches!(c, Control::Trigger(_)))
            .map(|(id, _)| id.clone())
            .collect()
    }

    // --- bus event handlers ---------------------------------------------

    /// Shared 1s tick: advance timer watches, fire what came due.
    pub fn on_tick(&mut self, now_seconds: u64, unix_ms: i64) {
        let mut due = Vec::new();
        for id in self.trigger_ids() {
            if let Ok(Control::Trigger(c)) = self.get_mut(&id) {
                for _ in 0..c.on_tick(now_seconds, unix_ms) {
                    due.push(id.clone());
                }
            }
        }
        self.fire_matching_triggers(due);
    }

    pub fn on_client_connect(&mut self) {
        for id in self.trigger_ids() {
            if let Ok(Control::Trigger(c)) = self.get_mut(&id) {
                c.on_client_connect();
            }
        }
    }

    /// A button was pressed somewhere: fire press/depress watches.
    pub fn on_control_pressed(&mut self, pressed: bool) {
        let matching: Vec<String> = self
            .controls
            .iter()
            .filter_map(|(id, c)| match c {
                Control::Trigger(t) if t.wants_press(pressed) => Some(id.clone()),
                _ => None,
            })
            .collect();
        self.fire_matching_triggers(matching);
    }

    pub fn on_variables_changed(&mut self, changed: &HashSet<String>) {
        let matching: Vec<String> = self
            .controls
            .iter()
            .filter_map(|(id, c)| match c {
                Control::Trigger(t) if t.variables_matched(changed) => Some(id.clone()),
                _ => None,
            })
            .collect();
        self.fire_matching_triggers(matching);
    }

    /// A delayed watch completed. Stale completions (watch edited or trigger
    /// disabled while the delay ran) are dropped silently.
    pub fn trigger_event_fired(&mut self, control_id: &str, event_id: &str) {
        let Ok(Control::Trigger(c)) = self.get_mut(control_id) else {
            return;
        };
        if !c.take_pending_event(event_id) {
            return;
        }
        if let Err(e) = self.fire_trigger(control_id, false) {
            warn!("trigger {control_id} failed to fire: {e}");
        }
    }

    /// The debounced condition recheck for one trigger.
    pub fn recheck_trigger_condition(&mut self, control_id: &str) {
        let Ok(Control::Trigger(c)) = self.get_mut(control_id) else {
            return;
        };
        if !c.recheck_condition() {
            return;
        }
        if let Err(e) = self.fire_trigger(control_id, false) {
            warn!("trigger {control_id} failed to fire: {e}");
        }
    }

    // --- instance fan-out -----------------------------------------------

    /// New feedback values arrived from an instance.
    pub fn update_feedback_values(&mut self, instance_id: &str, values: &HashMap<String, Value>) {
        for control in self.controls.values_mut() {
            control.update_feedback_values(instance_id, values);
        }
    }

    /// An instance was removed: purge every reference to it.
    pub fn forget_instance(&mut self, instance_id: &str) {
        for control in self.controls.values_mut() {
            control.forget_instance(instance_id);
        }
        self.recorder.forget_instance(instance_id);
    }

    /// Prune references to instances that no longer exist.
    pub fn verify_instance_ids(&mut self) {
        let known: HashSet<String> = self.deps.instances.known_instance_ids().into_iter().collect();
        for control in self.controls.values_mut() {
            control.verify_instance_ids(&known);
        }
    }

    // --- learn ----------------------------------------------------------

    /// Ask the owning instance for an action's live option values, then
    /// write them back. The control and action are re-validated after the
    /// call, in case they were edited while it ran.
    pub async fn action_learn(
        &mut self,
        control_id: &str,
        step_id: &str,
        set_id: &str,
        action_id: &str,
    ) -> Result<bool> {
        let Some(action) = self.get(control_id)?.find_action(step_id, set_id, action_id) else {
            return Ok(false);
        };
        let Some(handle) = self.deps.instances.get(&action.instance) else {
            return Ok(false);
        };
        let Some(options) = handle.action_learn_values(&action).await else {
            return Ok(false);
        };
        match self.get_mut(control_id) {
            Ok(control) => control.apply_learned_action_options(step_id, set_id, action_id, options),
            // Deleted while learning: drop the result.
            Err(_) => Ok(false),
        }
    }

    pub async fn feedback_learn(&mut self, control_id: &str, feedback_id: &str) -> Result<bool> {
        let Some(feedback) = self.get(control_id)?.find_feedback(feedback_id) else {
            return Ok(false);
        };
        let Some(handle) = self.deps.instances.get(&feedback.instance) else {
            return Ok(false);
        };
        let Some(options) = handle.feedback_learn_values(&feedback).await else {
            return Ok(false);
        };
        match self.get_mut(control_id) {
            Ok(control) => control.apply_learned_feedback_options(feedback_id, options),
            Err(_) => Ok(false),
        }
    }

    // --- recorder -------------------------------------------------------

    /// Write the recorded session into a control's action set, then retire
    /// the session (keeping its instance selection).
    pub fn recorder_save_to_control(
        &mut self,
        session_id: &str,
        control_id: &str,
        step_id: &str,
        set_id: &str,
        mode: &str,
    ) -> Result<()> {
        let mode = SaveMode::from_str(mode)?;
        if self.recorder.session_id() != session_id {
            return Err(PanelError::UnknownSession(session_id.to_string()));
        }
        if !self.controls.contains_key(control_id) {
            return Err(PanelError::UnknownControl(control_id.to_string()));
        }

        let actions = self.recorder.session_actions();
        let control = self.get_mut(control_id)?;
        // Bulk writes report false only when the target set does not exist.
        let written = match mode {
            SaveMode::Replace => control.action_replace_all(step_id, set_id, actions)?,
            SaveMode::Append => control.action_append(step_id, set_id, actions)?,
        };
        if !written {
            return Err(PanelError::UnknownSet {
                step: step_id.to_string(),
                set: set_id.to_string(),
            });
        }
        self.recorder.destroy_session(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::KeyValueStore;
    use crate::model::{ActionInstance, OptionsMap};
    use crate::testutil::{test_deps, MockInstanceHost};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn registry() -> (ControlsRegistry, Arc<MockInstanceHost>) {
        let (mut deps, _) = test_deps();
        let host = Arc::new(MockInstanceHost::with_instance("i1"));
        deps.instances = host.clone();
        let registry = ControlsRegistry::new(deps, CancellationToken::new()).unwrap();
        (registry, host)
    }

    fn action(id: &str) -> ActionInstance {
        ActionInstance {
            id: id.to_string(),
            action: id.to_string(),
            instance: "i1".to_string(),
            options: OptionsMap::new(),
            delay: 0,
            disabled: false,
            uniqueness_id: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn press_runs_the_down_set() {
        let (mut r, host) = registry();
        r.create_button("bank:1-1").unwrap();
        r.get_mut("bank:1-1")
            .unwrap()
            .action_add("0", "down", action("a1"))
            .unwrap();

        r.press_control("bank:1-1", true, None).unwrap();
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(host.executed_actions(), vec!["a1"]);
    }

    #[tokio::test]
    async fn unknown_control_press_is_an_error() {
        let (mut r, _) = registry();
        let mut rx = r.deps.bus.subscribe();
        assert!(matches!(
            r.press_control("bank:9-9", true, None),
            Err(PanelError::UnknownControl(_))
        ));
        // The rejected press must not reach press watches.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn button_press_fires_press_watches() {
        let (mut r, host) = registry();
        r.create_button("bank:1-1").unwrap();
        r.create_trigger("trigger:t1").unwrap();
        {
            let Control::Trigger(t) = r.get_mut("trigger:t1").unwrap() else {
                panic!("expected trigger");
            };
            t.options_set_field("enabled", &json!(true), false);
            t.event_add(crate::model::TriggerEventInstance {
                id: "e1".to_string(),
                event_type: crate::model::TriggerEventType::ButtonPress,
                enabled: true,
                options: OptionsMap::new(),
            });
            t.actions.add("0", "0", action("t-act"));
        }

        r.press_control("bank:1-1", true, None).unwrap();
        r.on_control_pressed(true);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(host.executed_actions(), vec!["t-act"]);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_fires_due_interval_triggers() {
        let (mut r, host) = registry();
        r.create_trigger("trigger:t1").unwrap();
        {
            let Control::Trigger(t) = r.get_mut("trigger:t1").unwrap() else {
                panic!("expected trigger");
            };
            t.options_set_field("enabled", &json!(true), false);
            t.event_add(crate::model::TriggerEventInstance {
                id: "e1".to_string(),
                event_type: crate::model::TriggerEventType::Interval,
                enabled: true,
                options: json!({ "seconds": 5 }).as_object().unwrap().clone(),
            });
            t.actions.add("0", "0", action("t-act"));
        }

        r.on_tick(4, 4000);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(host.executed_actions().is_empty());

        r.on_tick(5, 5000);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(host.executed_actions(), vec!["t-act"]);
    }

    #[tokio::test]
    async fn controls_are_revived_from_the_store() {
        let (mut deps, db) = test_deps();
        let host = Arc::new(MockInstanceHost::with_instance("i1"));
        deps.instances = host;
        let cancel = CancellationToken::new();
        {
            let mut r = ControlsRegistry::new(deps.clone(), cancel.clone()).unwrap();
            r.create_button("bank:1-1").unwrap();
            r.get_mut("bank:1-1")
                .unwrap()
                .action_add("0", "down", action("a1"))
                .unwrap();
        }
        // A corrupt record must not poison the reload.
        db.set_key("controls/bank:9-9", json!({ "type": "nonsense" }))
            .unwrap();

        let r = ControlsRegistry::new(deps, cancel).unwrap();
        assert_eq!(r.control_ids(), vec!["bank:1-1"]);
        assert_eq!(r.get("bank:1-1").unwrap().type_name(), "button");
        assert_eq!(r.get("bank:1-1").unwrap().get_all_actions().len(), 1);
    }

    #[tokio::test]
    async fn learn_writes_back_live_values() {
        let (mut r, host) = registry();
        let instance = host.add("i1");
        instance.set_learn_response(json!({ "level": 42 }).as_object().unwrap().clone());

        r.create_button("bank:1-1").unwrap();
        r.get_mut("bank:1-1")
            .unwrap()
            .action_add("0", "down", action("a1"))
            .unwrap();

        assert!(r.action_learn("bank:1-1", "0", "down", "a1").await.unwrap());
        let learned = r
            .get("bank:1-1")
            .unwrap()
            .find_action("0", "down", "a1")
            .unwrap();
        assert_eq!(learned.options["level"], json!(42));

        assert!(!r.action_learn("bank:1-1", "0", "down", "nope").await.unwrap());
    }

    #[tokio::test]
    async fn recorded_session_saves_into_a_button() {
        let (mut r, _) = registry();
        r.create_button("bank:1-1").unwrap();

        let session = r.recorder().session_id().to_string();
        r.recorder()
            .set_instance_ids(&session, vec!["i1".to_string()])
            .unwrap();
        r.recorder().set_recording(&session, true).unwrap();
        r.recorder()
            .receive_action("i1", "fader", OptionsMap::new(), None);

        r.recorder_save_to_control(&session, "bank:1-1", "0", "down", "replace")
            .unwrap();
        let saved = r.get("bank:1-1").unwrap().get_all_actions();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].action, "fader");

        // The save retired the session.
        assert_ne!(r.recorder().session_id(), session);
        assert!(matches!(
            r.recorder_save_to_control(&session, "bank:1-1", "0", "down", "replace"),
            Err(PanelError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn append_save_keeps_existing_actions() {
        let (mut r, _) = registry();
        r.create_button("bank:1-1").unwrap();
        r.get_mut("bank:1-1")
            .unwrap()
            .action_add("0", "down", action("pre"))
            .unwrap();

        let session = r.recorder().session_id().to_string();
        r.recorder()
            .set_instance_ids(&session, vec!["i1".to_string()])
            .unwrap();
        r.recorder().set_recording(&session, true).unwrap();
        r.recorder()
            .receive_action("i1", "rec", OptionsMap::new(), None);

        r.recorder_save_to_control(&session, "bank:1-1", "0", "down", "append")
            .unwrap();
        let saved = r.get("bank:1-1").unwrap().get_all_actions();
        let names: Vec<&str> = saved.iter().map(|a| a.action.as_str()).collect();
        assert_eq!(names, vec!["pre", "rec"]);
    }

    #[tokio::test]
    async fn save_rejects_bad_mode_and_missing_set() {
        let (mut r, _) = registry();
        r.create_button("bank:1-1").unwrap();
        let session = r.recorder().session_id().to_string();

        assert!(matches!(
            r.recorder_save_to_control(&session, "bank:1-1", "0", "down", "upsert"),
            Err(PanelError::InvalidSaveMode(_))
        ));
        assert!(matches!(
            r.recorder_save_to_control(&session, "bank:1-1", "7", "down", "replace"),
            Err(PanelError::UnknownSet { .. })
        ));
    }

    #[tokio::test]
    async fn forget_instance_sweeps_everything() {
        let (mut r, _) = registry();
        r.create_button("bank:1-1").unwrap();
        r.get_mut("bank:1-1")
            .unwrap()
            .action_add("0", "down", action("a1"))
            .unwrap();
        let session = r.recorder().session_id().to_string();
        r.recorder()
            .set_instance_ids(&session, vec!["i1".to_string()])
            .unwrap();

        r.forget_instance("i1");
        assert!(r.get("bank:1-1").unwrap().get_all_actions().is_empty());
    }

    #[tokio::test]
    async fn delete_control_is_terminal() {
        let (mut r, _) = registry();
        r.create_button("bank:1-1").unwrap();
        r.delete_control("bank:1-1").unwrap();
        assert!(matches!(
            r.delete_control("bank:1-1"),
            Err(PanelError::UnknownControl(_))
        ));
    }
}
