use super::watches::{MiscWatches, TimerWatches, VariableWatches};
use super::{ControlCommon, ControlDeps};
use crate::error::{PanelError, Result};
use crate::event::BusEvent;
use crate::fragment::{ActionFragment, FeedbackFragment};
use crate::model::{
    clamp_index, new_id, ActionInstance, ActionSets, FeedbackInstance, TriggerEventInstance,
    TriggerEventType,
};
use crate::sync::TRIGGERS_LIST_TOPIC;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerOptions {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub sort_order: i64,

    #[serde(default)]
    pub relative_delay: bool,
}

impl Default for TriggerOptions {
    fn default() -> Self {
        Self {
            name: "New Trigger".to_string(),
            enabled: false,
            sort_order: 0,
            relative_delay: false,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct TriggerConfig {
    #[serde(rename = "type")]
    kind: String,
    options: TriggerOptions,
    action_sets: ActionSets,
    condition: Vec<FeedbackInstance>,
    events: Vec<TriggerEventInstance>,
}

/// An event-driven control: declared watches fire a single action set,
/// optionally gated by a feedback condition.
pub struct TriggerControl {
    pub common: ControlCommon,
    pub(crate) actions: ActionFragment,
    pub(crate) condition: FeedbackFragment,
    options: TriggerOptions,
    events: Vec<TriggerEventInstance>,
    last_executed: Option<i64>,

    timer_watches: TimerWatches,
    misc_watches: MiscWatches,
    variable_watches: VariableWatches,

    /// Ids of armed condition_true events. The condition edge only fires
    /// while this is non-empty.
    condition_check_events: HashSet<String>,
    condition_last_value: bool,
}

impl TriggerControl {
    pub fn new(
        control_id: String,
        deps: ControlDeps,
        parent_cancel: &CancellationToken,
        storage: Option<&Value>,
    ) -> Result<Self> {
        // A trigger's "redraw" is a condition recheck, routed through the
        // event loop so the registry can borrow the control mutably.
        let bus = deps.bus.clone();
        let recheck_id = control_id.clone();
        let redraw = move || bus.emit(BusEvent::RecheckCondition(recheck_id.clone()));
        let common = ControlCommon::new(control_id, deps, parent_cancel, redraw);

        let (options, actions, condition, events) = match storage {
            None => (
                TriggerOptions::default(),
                ActionFragment::single_set(),
                FeedbackFragment::default(),
                Vec::new(),
            ),
            Some(value) => {
                let config: TriggerConfig = serde_json::from_value(value.clone()).map_err(|e| {
                    PanelError::BadControlRecord {
                        id: common.control_id.clone(),
                        message: e.to_string(),
                    }
                })?;
                if config.kind != "trigger" {
                    return Err(PanelError::BadControlRecord {
                        id: common.control_id.clone(),
                        message: format!("invalid type: {}", config.kind),
                    });
                }
                let mut steps = BTreeMap::new();
                steps.insert("0".to_string(), config.action_sets);
                (
                    config.options,
                    ActionFragment::new(steps),
                    FeedbackFragment::new(config.condition),
                    config.events,
                )
            }
        };

        let misc_watches = MiscWatches::new(
            common.control_id.clone(),
            common.deps.bus.clone(),
            common.cancel.clone(),
        );
        let mut control = Self {
            common,
            actions,
            condition,
            options,
            events,
            last_executed: None,
            timer_watches: TimerWatches::default(),
            misc_watches,
            variable_watches: VariableWatches::default(),
            condition_check_events: HashSet::new(),
            condition_last_value: false,
        };
        control.apply_enabled(control.options.enabled);
        control.setup_events();
        if storage.is_none() {
            control.commit(false);
        } else {
            control.send_trigger_list_change();
        }
        Ok(control)
    }

    pub fn to_config_json(&self) -> Value {
        serde_json::to_value(TriggerConfig {
            kind: "trigger".to_string(),
            options: self.options.clone(),
            action_sets: self
                .actions
                .steps()
                .get("0")
                .cloned()
                .unwrap_or_default(),
            condition: self.condition.feedbacks().to_vec(),
            events: self.events.clone(),
        })
        .expect("trigger config serializes")
    }

    pub fn commit(&self, redraw: bool) {
        self.common.commit_config(self.to_config_json(), redraw);
        self.send_trigger_list_change();
    }

    pub fn destroy(&self) {
        self.common.deps.bus.emit(BusEvent::TriggerEnabled {
            control_id: self.common.control_id.clone(),
            enabled: false,
        });
        self.common
            .deps
            .hub
            .commit_key(TRIGGERS_LIST_TOPIC, &self.common.control_id, None);
        self.common.destroy();
    }

    pub fn enabled(&self) -> bool {
        self.options.enabled
    }

    pub fn relative_delay(&self) -> bool {
        self.options.relative_delay
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    // --- options --------------------------------------------------------

    /// Update an option field. `sort_order` is owned by the list view and
    /// needs `force`; unknown keys are benign.
    pub fn options_set_field(&mut self, key: &str, value: &Value, force: bool) -> bool {
        let changed = match key {
            "name" => match value.as_str() {
                Some(name) => {
                    self.options.name = name.to_string();
                    true
                }
                None => false,
            },
            "enabled" => match value.as_bool() {
                Some(enabled) => {
                    self.apply_enabled(enabled);
                    true
                }
                None => false,
            },
            "sort_order" if force => match value.as_i64() {
                Some(order) => {
                    self.options.sort_order = order;
                    true
                }
                None => false,
            },
            "relative_delay" => match value.as_bool() {
                Some(relative) => {
                    self.options.relative_delay = relative;
                    true
                }
                None => false,
            },
            _ => false,
        };
        if changed {
            self.commit(false);
        }
        changed
    }

    fn apply_enabled(&mut self, enabled: bool) {
        self.options.enabled = enabled;
        self.timer_watches
            .set_enabled(enabled, self.common.deps.bus.last_tick());
        self.misc_watches.set_enabled(enabled);
        self.variable_watches.set_enabled(enabled);
        if !enabled {
            self.condition_last_value = false;
        }
        self.common.deps.bus.emit(BusEvent::TriggerEnabled {
            control_id: self.common.control_id.clone(),
            enabled,
        });
    }

    // --- events ---------------------------------------------------------

    pub fn events(&self) -> &[TriggerEventInstance] {
        &self.events
    }

    fn setup_events(&mut self) {
        let events = self.events.clone();
        for event in &events {
            if event.enabled {
                self.restart_event(event);
            }
        }
    }

    fn restart_event(&mut self, event: &TriggerEventInstance) {
        match event.event_type {
            TriggerEventType::Interval => self.timer_watches.set_interval(
                &event.id,
                &event.options,
                self.common.deps.bus.last_tick(),
            ),
            TriggerEventType::Timeofday => {
                self.timer_watches.set_time_of_day(&event.id, &event.options);
            }
            TriggerEventType::Startup => self.misc_watches.set_startup(&event.id, &event.options),
            TriggerEventType::ClientConnect => {
                self.misc_watches.set_client_connect(&event.id, &event.options);
            }
            TriggerEventType::ButtonPress => self.misc_watches.set_press(&event.id, true),
            TriggerEventType::ButtonDepress => self.misc_watches.set_press(&event.id, false),
            TriggerEventType::ConditionTrue => {
                self.condition_check_events.insert(event.id.clone());
            }
            TriggerEventType::VariableChanged => {
                self.variable_watches.set_variable(&event.id, &event.options);
            }
        }
    }

    fn stop_event(&mut self, event: &TriggerEventInstance) {
        match event.event_type {
            TriggerEventType::Interval => self.timer_watches.clear_interval(&event.id),
            TriggerEventType::Timeofday => self.timer_watches.clear_time_of_day(&event.id),
            TriggerEventType::Startup => self.misc_watches.clear_startup(&event.id),
            TriggerEventType::ClientConnect => self.misc_watches.clear_client_connect(&event.id),
            TriggerEventType::ButtonPress | TriggerEventType::ButtonDepress => {
                self.misc_watches.clear_press(&event.id);
            }
            TriggerEventType::ConditionTrue => {
                self.condition_check_events.remove(&event.id);
            }
            TriggerEventType::VariableChanged => self.variable_watches.clear_variable(&event.id),
        }
    }

    pub fn event_add(&mut self, event: TriggerEventInstance) -> bool {
        if event.enabled {
            self.restart_event(&event);
        }
        self.events.push(event);
        self.commit(false);
        true
    }

    pub fn event_duplicate(&mut self, id: &str) -> bool {
        let Some(index) = self.events.iter().position(|e| e.id == id) else {
            return false;
        };
        let mut copy = self.events[index].clone();
        copy.id = new_id();
        if copy.enabled {
            self.restart_event(&copy);
        }
        self.events.insert(index + 1, copy);
        self.commit(false);
        true
    }

    pub fn event_remove(&mut self, id: &str) -> bool {
        let Some(index) = self.events.iter().position(|e| e.id == id) else {
            return false;
        };
        let event = self.events.remove(index);
        self.stop_event(&event);
        self.commit(false);
        true
    }

    pub fn event_set_enabled(&mut self, id: &str, enabled: bool) -> bool {
        let Some(index) = self.events.iter().position(|e| e.id == id) else {
            return false;
        };
        self.events[index].enabled = enabled;
        let event = self.events[index].clone();
        if enabled {
            self.restart_event(&event);
        } else {
            self.stop_event(&event);
        }
        self.commit(false);
        true
    }

    /// Reorder an event in the display list. Watch state is unaffected.
    pub fn event_reorder(&mut self, old_index: usize, new_index: usize) -> bool {
        if old_index >= self.events.len() {
            return false;
        }
        let event = self.events.remove(old_index);
        let new_index = clamp_index(new_index, self.events.len());
        self.events.insert(new_index, event);
        self.commit(false);
        true
    }

    pub fn event_set_option(&mut self, id: &str, key: &str, value: Value) -> bool {
        let Some(index) = self.events.iter().position(|e| e.id == id) else {
            return false;
        };
        self.events[index].options.insert(key.to_string(), value);
        let event = self.events[index].clone();
        if event.enabled {
            // Re-arm with the new options.
            self.restart_event(&event);
        }
        self.commit(false);
        true
    }

    // --- firing ---------------------------------------------------------

    /// Collect the action set for a run. A test run bypasses the enabled
    /// flag and the condition and leaves the last-executed timestamp alone.
    pub fn execute_actions(&mut self, now_unix_ms: i64, is_test: bool) -> Option<Vec<ActionInstance>> {
        if !is_test {
            if !self.options.enabled || !self.condition.check_value_as_boolean() {
                return None;
            }
            self.last_executed = Some(now_unix_ms);
            self.send_trigger_list_change();
        }
        Some(
            self.actions
                .actions_in("0", "0")
                .map(<[ActionInstance]>::to_vec)
                .unwrap_or_default(),
        )
    }

    /// Re-evaluate the condition, returning whether a false-to-true edge
    /// should fire the trigger.
    pub fn recheck_condition(&mut self) -> bool {
        let new_value = self.condition.check_value_as_boolean();
        let fire = !self.condition_check_events.is_empty()
            && self.options.enabled
            && !self.condition_last_value
            && new_value;
        self.condition_last_value = new_value;
        fire
    }

    /// Advance timer watches by one bus tick, returning how many came due.
    pub fn on_tick(&mut self, now_seconds: u64, unix_ms: i64) -> u32 {
        self.timer_watches.on_tick(now_seconds, unix_ms)
    }

    pub fn on_client_connect(&mut self) {
        self.misc_watches.on_client_connect();
    }

    pub fn wants_press(&self, pressed: bool) -> bool {
        self.misc_watches.wants_press(pressed)
    }

    pub fn variables_matched(&self, changed: &HashSet<String>) -> bool {
        self.variable_watches.matches(changed)
    }

    /// Validate a delayed watch completion. Stale completions (the watch was
    /// edited or the trigger disabled while the delay ran) return false.
    pub fn take_pending_event(&mut self, event_id: &str) -> bool {
        self.misc_watches.take_pending(event_id)
    }

    // --- trigger list ---------------------------------------------------

    fn event_description(event: &TriggerEventInstance) -> String {
        match event.event_type {
            TriggerEventType::Interval => TimerWatches::interval_description(&event.options),
            TriggerEventType::Timeofday => TimerWatches::time_of_day_description(&event.options),
            TriggerEventType::Startup => "On startup".to_string(),
            TriggerEventType::ClientConnect => "On client connect".to_string(),
            TriggerEventType::ButtonPress => "On any button press".to_string(),
            TriggerEventType::ButtonDepress => "On any button depress".to_string(),
            TriggerEventType::ConditionTrue => "When the condition becomes true".to_string(),
            TriggerEventType::VariableChanged => VariableWatches::description(&event.options),
        }
    }

    pub fn trigger_list_entry(&self) -> Value {
        let description: Vec<String> = self
            .events
            .iter()
            .filter(|e| e.enabled)
            .map(Self::event_description)
            .collect();
        json!({
            "type": "trigger",
            "name": self.options.name,
            "enabled": self.options.enabled,
            "sort_order": self.options.sort_order,
            "relative_delay": self.options.relative_delay,
            "last_executed": self.last_executed,
            "description": description.join("; "),
        })
    }

    fn send_trigger_list_change(&self) {
        self.common.deps.hub.commit_key(
            TRIGGERS_LIST_TOPIC,
            &self.common.control_id,
            Some(self.trigger_list_entry()),
        );
    }
}
