use super::{ControlCommon, ControlDeps};
use crate::error::{PanelError, Result};
use crate::fragment::{ActionFragment, FeedbackFragment};
use crate::model::{
    sorted_step_ids, ActionInstance, ActionSets, ButtonStyle, FeedbackInstance, OptionsMap,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

pub const SET_DOWN: &str = "down";
pub const SET_UP: &str = "up";
pub const SET_ROTATE_LEFT: &str = "rotate_left";
pub const SET_ROTATE_RIGHT: &str = "rotate_right";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonOptions {
    /// Advance to the next step automatically after a release.
    #[serde(default = "default_true")]
    pub step_auto_progress: bool,

    /// Interpret action delays as relative to the previous action.
    #[serde(default)]
    pub relative_delay: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ButtonOptions {
    fn default() -> Self {
        Self {
            step_auto_progress: true,
            relative_delay: false,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ButtonConfig {
    #[serde(rename = "type")]
    kind: String,
    style: ButtonStyle,
    options: ButtonOptions,
    steps: BTreeMap<String, ActionSets>,
    feedbacks: Vec<FeedbackInstance>,
}

/// A bitmap-rendered control with steps, action-sets and feedbacks.
pub struct ButtonControl {
    pub common: ControlCommon,
    pub(crate) actions: ActionFragment,
    pub(crate) feedbacks: FeedbackFragment,
    style: ButtonStyle,
    options: ButtonOptions,
    current_step_id: String,
    pushed: bool,
}

fn default_sets() -> ActionSets {
    let mut sets = ActionSets::new();
    for set in [SET_DOWN, SET_UP, SET_ROTATE_LEFT, SET_ROTATE_RIGHT] {
        sets.insert(set.to_string(), Vec::new());
    }
    sets
}

impl ButtonControl {
    pub fn new(
        control_id: String,
        deps: ControlDeps,
        parent_cancel: &CancellationToken,
        storage: Option<&Value>,
    ) -> Result<Self> {
        let redraw = ControlCommon::graphics_redraw(&deps, &control_id);
        let common = ControlCommon::new(control_id, deps, parent_cancel, redraw);

        let control = match storage {
            None => {
                let mut steps = BTreeMap::new();
                steps.insert("0".to_string(), default_sets());
                let control = Self {
                    common,
                    actions: ActionFragment::new(steps),
                    feedbacks: FeedbackFragment::default(),
                    style: ButtonStyle::default(),
                    options: ButtonOptions::default(),
                    current_step_id: "0".to_string(),
                    pushed: false,
                };
                control.commit(true);
                control
            }
            Some(value) => {
                let config: ButtonConfig = serde_json::from_value(value.clone()).map_err(|e| {
                    PanelError::BadControlRecord {
                        id: common.control_id.clone(),
                        message: e.to_string(),
                    }
                })?;
                if config.kind != "button" {
                    return Err(PanelError::BadControlRecord {
                        id: common.control_id.clone(),
                        message: format!("invalid type: {}", config.kind),
                    });
                }
                let current_step_id = sorted_step_ids(config.steps.keys())
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| "0".to_string());
                Self {
                    common,
                    actions: ActionFragment::new(config.steps),
                    feedbacks: FeedbackFragment::new(config.feedbacks),
                    style: config.style,
                    options: config.options,
                    current_step_id,
                    pushed: false,
                }
            }
        };
        Ok(control)
    }

    pub fn to_config_json(&self) -> Value {
        serde_json::to_value(ButtonConfig {
            kind: "button".to_string(),
            style: self.style.clone(),
            options: self.options.clone(),
            steps: self.actions.steps().clone(),
            feedbacks: self.feedbacks.feedbacks().to_vec(),
        })
        .expect("button config serializes")
    }

    pub fn to_runtime_json(&self) -> Value {
        json!({
            "current_step": self.active_step_index(),
            "pushed": self.pushed,
        })
    }

    pub fn commit(&self, redraw: bool) {
        self.common.commit_config(self.to_config_json(), redraw);
    }

    fn commit_runtime(&self) {
        self.common.trigger_redraw();
        self.common.commit_runtime(self.to_runtime_json());
    }

    pub fn relative_delay(&self) -> bool {
        self.options.relative_delay
    }

    pub fn pushed(&self) -> bool {
        self.pushed
    }

    /// The processed draw style, with enabled feedbacks applied in order.
    pub fn draw_style(&self) -> ButtonStyle {
        self.feedbacks.style_for(&self.style)
    }

    /// Update base style fields from a partial diff.
    pub fn style_set_fields(&mut self, diff: &OptionsMap) -> bool {
        let changed = self.style.apply_partial(diff);
        if changed {
            self.commit(true);
        }
        changed
    }

    /// Update an option field. Unknown keys are benign.
    pub fn options_set_field(&mut self, key: &str, value: &Value) -> bool {
        let changed = match (key, value.as_bool()) {
            ("step_auto_progress", Some(v)) => {
                self.options.step_auto_progress = v;
                true
            }
            ("relative_delay", Some(v)) => {
                self.options.relative_delay = v;
                true
            }
            _ => false,
        };
        if changed {
            self.commit(false);
        }
        changed
    }

    // --- steps ----------------------------------------------------------

    pub fn step_ids(&self) -> Vec<String> {
        sorted_step_ids(self.actions.steps().keys())
    }

    /// Index of the current (next to execute) step.
    pub fn active_step_index(&self) -> usize {
        self.step_ids()
            .iter()
            .position(|id| *id == self.current_step_id)
            .unwrap_or(0)
    }

    pub fn current_step_id(&self) -> &str {
        &self.current_step_id
    }

    /// Add a step after the highest existing id, returning its id.
    pub fn step_add(&mut self) -> String {
        let next = self
            .actions
            .steps()
            .keys()
            .filter_map(|id| id.parse::<u64>().ok())
            .max()
            .map_or(0, |max| max + 1);
        let id = next.to_string();
        self.actions.steps_mut().insert(id.clone(), default_sets());
        self.commit(true);
        id
    }

    /// Remove a step. The last remaining step cannot be removed; removing
    /// the current step moves current to the first remaining one.
    pub fn step_remove(&mut self, step_id: &str) -> bool {
        if self.actions.steps().len() <= 1 || !self.actions.steps().contains_key(step_id) {
            return false;
        }
        self.actions.steps_mut().remove(step_id);
        if self.current_step_id == step_id {
            if let Some(first) = self.step_ids().into_iter().next() {
                self.current_step_id = first;
            }
            self.commit_runtime();
        }
        self.commit(true);
        true
    }

    /// Swap the contents of two steps.
    pub fn step_swap(&mut self, step_a: &str, step_b: &str) -> bool {
        let steps = self.actions.steps_mut();
        if !steps.contains_key(step_a) || !steps.contains_key(step_b) || step_a == step_b {
            return false;
        }
        let a = steps.remove(step_a).unwrap_or_default();
        let b = steps.remove(step_b).unwrap_or_default();
        steps.insert(step_a.to_string(), b);
        steps.insert(step_b.to_string(), a);
        self.commit(true);
        true
    }

    /// Make the step at `index` (in numeric id order) the next to execute.
    pub fn step_make_current(&mut self, index: usize) -> bool {
        let Some(step_id) = self.step_ids().into_iter().nth(index) else {
            return false;
        };
        self.current_step_id = step_id;
        self.commit_runtime();
        true
    }

    /// Make a specific step the next to execute, by id.
    pub fn step_select_next(&mut self, step_id: &str) -> bool {
        if !self.actions.steps().contains_key(step_id) {
            return false;
        }
        self.current_step_id = step_id.to_string();
        self.commit_runtime();
        true
    }

    /// Progress through the steps by a relative amount, wrapping around the
    /// numerically-ordered id list.
    pub fn step_advance_delta(&mut self, amount: i64) -> bool {
        let ids = self.step_ids();
        if ids.is_empty() {
            return false;
        }
        let current = self.active_step_index() as i64;
        let next = (current + amount).rem_euclid(ids.len() as i64) as usize;
        self.current_step_id = ids[next].clone();
        self.commit_runtime();
        true
    }

    // --- input ----------------------------------------------------------

    /// Handle a press or release: returns the actions of the current step's
    /// down/up set. A release auto-advances the step when configured.
    pub fn press(&mut self, pressed: bool) -> Vec<ActionInstance> {
        self.pushed = pressed;
        let set_id = if pressed { SET_DOWN } else { SET_UP };
        let actions = self
            .actions
            .actions_in(&self.current_step_id, set_id)
            .map(<[ActionInstance]>::to_vec)
            .unwrap_or_default();

        if !pressed && self.options.step_auto_progress {
            self.step_advance_delta(1);
        } else {
            self.commit_runtime();
        }

        actions
    }

    /// Handle a rotation: returns the matching rotate set of the current
    /// step. Rotation never advances the step.
    pub fn rotate(&self, right: bool) -> Vec<ActionInstance> {
        let set_id = if right { SET_ROTATE_RIGHT } else { SET_ROTATE_LEFT };
        self.actions
            .actions_in(&self.current_step_id, set_id)
            .map(<[ActionInstance]>::to_vec)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_deps;

    fn button() -> ButtonControl {
        let (deps, _) = test_deps();
        let cancel = CancellationToken::new();
        ButtonControl::new("bank:1-1".to_string(), deps, &cancel, None).unwrap()
    }

    fn action(id: &str) -> ActionInstance {
        ActionInstance {
            id: id.to_string(),
            action: "go".to_string(),
            instance: "i1".to_string(),
            options: OptionsMap::new(),
            delay: 0,
            disabled: false,
            uniqueness_id: None,
        }
    }

    #[tokio::test]
    async fn new_button_has_one_step_with_default_sets() {
        let b = button();
        assert_eq!(b.step_ids(), vec!["0"]);
        assert_eq!(b.active_step_index(), 0);
        let config = b.to_config_json();
        assert_eq!(config["type"], "button");
        assert!(config["steps"]["0"]["down"].is_array());
    }

    #[tokio::test]
    async fn step_advance_wraps_around() {
        let mut b = button();
        b.step_add();
        b.step_add();
        assert_eq!(b.step_ids(), vec!["0", "1", "2"]);

        assert!(b.step_advance_delta(1));
        assert_eq!(b.current_step_id(), "1");
        assert!(b.step_advance_delta(2));
        assert_eq!(b.current_step_id(), "0");
        assert!(b.step_advance_delta(-1));
        assert_eq!(b.current_step_id(), "2");
    }

    #[tokio::test]
    async fn step_remove_protects_last_step_and_fixes_current() {
        let mut b = button();
        assert!(!b.step_remove("0"), "last step cannot be removed");

        b.step_add();
        assert!(b.step_select_next("1"));
        assert!(b.step_remove("1"));
        assert_eq!(b.current_step_id(), "0");
        assert!(!b.step_remove("1"), "already gone");
    }

    #[tokio::test]
    async fn step_make_current_by_index() {
        let mut b = button();
        b.step_add();
        assert!(b.step_make_current(1));
        assert_eq!(b.current_step_id(), "1");
        assert!(!b.step_make_current(5));
    }

    #[tokio::test]
    async fn press_returns_current_down_set_and_advances_on_release() {
        let mut b = button();
        b.step_add();
        b.actions.add("0", SET_DOWN, action("a"));
        b.actions.add("1", SET_DOWN, action("b"));

        let down = b.press(true);
        assert_eq!(down.len(), 1);
        assert_eq!(down[0].id, "a");
        assert_eq!(b.current_step_id(), "0", "press does not advance");

        let up = b.press(false);
        assert!(up.is_empty());
        assert_eq!(b.current_step_id(), "1", "release advances");

        let down = b.press(true);
        assert_eq!(down[0].id, "b");
    }

    #[tokio::test]
    async fn rotation_does_not_advance() {
        let mut b = button();
        b.actions.add("0", SET_ROTATE_LEFT, action("l"));
        b.actions.add("0", SET_ROTATE_RIGHT, action("r"));

        assert_eq!(b.rotate(false)[0].id, "l");
        assert_eq!(b.rotate(true)[0].id, "r");
        assert_eq!(b.current_step_id(), "0");
    }

    #[tokio::test]
    async fn config_round_trips_through_storage() {
        let (deps, _) = test_deps();
        let cancel = CancellationToken::new();
        let mut b =
            ButtonControl::new("bank:1-2".to_string(), deps.clone(), &cancel, None).unwrap();
        b.actions.add("0", SET_DOWN, action("a"));
        b.style_set_fields(
            &serde_json::json!({ "text": "CAM 1" })
                .as_object()
                .unwrap()
                .clone(),
        );
        let stored = b.to_config_json();

        let restored =
            ButtonControl::new("bank:1-2".to_string(), deps, &cancel, Some(&stored)).unwrap();
        assert_eq!(restored.to_config_json(), stored);
        assert_eq!(restored.draw_style().text, "CAM 1");
    }

    #[tokio::test]
    async fn bad_storage_type_is_rejected() {
        let (deps, _) = test_deps();
        let cancel = CancellationToken::new();
        let bad = serde_json::json!({
            "type": "trigger",
            "style": {}, "options": {}, "steps": {}, "feedbacks": []
        });
        let result = ButtonControl::new("bank:1-3".to_string(), deps, &cancel, Some(&bad));
        assert!(matches!(result, Err(PanelError::BadControlRecord { .. })));
    }
}
