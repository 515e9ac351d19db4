pub mod button;
pub mod pagenum;
pub mod trigger;
pub mod watches;

pub use button::ButtonControl;
pub use pagenum::PageNumberControl;
pub use trigger::TriggerControl;

use crate::db::{control_db_key, persist_best_effort, KeyValueStore};
use crate::debounce::{Debouncer, DEBOUNCE_MAX_WAIT, DEBOUNCE_WAIT};
use crate::error::{PanelError, Result};
use crate::event::EventBus;
use crate::graphics::GraphicsHandle;
use crate::instance::InstanceHost;
use crate::model::{ActionInstance, FeedbackInstance, OptionsMap};
use crate::sync::{control_config_topic, control_runtime_topic, SyncHub};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Collaborators shared by every control.
#[derive(Clone)]
pub struct ControlDeps {
    pub db: Arc<dyn KeyValueStore>,
    pub hub: Arc<SyncHub>,
    pub graphics: Arc<dyn GraphicsHandle>,
    pub instances: Arc<dyn InstanceHost>,
    pub bus: EventBus,
}

/// Per-control plumbing: persistence, diff broadcast and the debounced
/// redraw. The redraw callback differs per control kind (bitmap invalidation
/// for buttons, condition recheck for triggers).
pub struct ControlCommon {
    pub control_id: String,
    pub deps: ControlDeps,
    pub cancel: CancellationToken,
    redraw: Debouncer,
}

impl ControlCommon {
    pub fn new<F>(
        control_id: String,
        deps: ControlDeps,
        parent_cancel: &CancellationToken,
        redraw: F,
    ) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let cancel = parent_cancel.child_token();
        let redraw = Debouncer::new(DEBOUNCE_WAIT, DEBOUNCE_MAX_WAIT, cancel.clone(), redraw);
        Self {
            control_id,
            deps,
            cancel,
            redraw,
        }
    }

    /// A common-case redraw callback: invalidate this control's bitmap.
    pub fn graphics_redraw(deps: &ControlDeps, control_id: &str) -> impl Fn() + Send + 'static {
        let graphics = deps.graphics.clone();
        let control_id = control_id.to_string();
        move || graphics.invalidate_control(&control_id)
    }

    /// Request a coalesced redraw.
    pub fn trigger_redraw(&self) {
        self.redraw.call();
    }

    /// Post-process a change: redraw, persist, diff-broadcast.
    pub fn commit_config(&self, snapshot: Value, redraw: bool) {
        if redraw {
            self.redraw.call();
        }
        persist_best_effort(
            self.deps.db.as_ref(),
            &control_db_key(&self.control_id),
            snapshot.clone(),
        );
        self.deps
            .hub
            .commit(&control_config_topic(&self.control_id), snapshot);
    }

    /// Broadcast transient (non-persisted) state.
    pub fn commit_runtime(&self, snapshot: Value) {
        self.deps
            .hub
            .commit(&control_runtime_topic(&self.control_id), snapshot);
    }

    /// Tombstone both topics, drop the persisted record and cancel every
    /// task owned by this control (debounce, delayed watches).
    pub fn destroy(&self) {
        self.deps.hub.remove(&control_config_topic(&self.control_id));
        self.deps
            .hub
            .remove(&control_runtime_topic(&self.control_id));
        if let Err(e) = self.deps.db.delete_key(&control_db_key(&self.control_id)) {
            warn!("failed to delete control {}: {e}", self.control_id);
        }
        self.cancel.cancel();
    }
}

/// A live control. Variants share the generic command surface below;
/// capability-specific operations (steps, events) fail with `NotSupported`
/// on variants that lack them.
pub enum Control {
    Button(ButtonControl),
    PageNumber(PageNumberControl),
    Trigger(TriggerControl),
}

impl Control {
    pub fn control_id(&self) -> &str {
        &self.common().control_id
    }

    pub fn common(&self) -> &ControlCommon {
        match self {
            Control::Button(c) => &c.common,
            Control::PageNumber(c) => &c.common,
            Control::Trigger(c) => &c.common,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Control::Button(_) => "button",
            Control::PageNumber(_) => "pagenum",
            Control::Trigger(_) => "trigger",
        }
    }

    pub fn to_config_json(&self) -> Value {
        match self {
            Control::Button(c) => c.to_config_json(),
            Control::PageNumber(c) => c.to_config_json(),
            Control::Trigger(c) => c.to_config_json(),
        }
    }

    /// Post-process a change to this control: redraw, persist, broadcast.
    pub fn commit(&self, redraw: bool) {
        match self {
            Control::Button(c) => c.commit(redraw),
            Control::PageNumber(c) => c.commit(redraw),
            Control::Trigger(c) => c.commit(redraw),
        }
    }

    pub fn destroy(&self) {
        match self {
            Control::Button(c) => c.common.destroy(),
            Control::PageNumber(c) => c.common.destroy(),
            Control::Trigger(c) => c.destroy(),
        }
    }

    /// Bitmap dimensions of this control, `None` for non-drawable kinds.
    pub fn bitmap_size(&self) -> Option<crate::graphics::BitmapSize> {
        let common = self.common();
        common.deps.graphics.bitmap_size(&common.control_id)
    }

    /// Render a preview bitmap of the processed draw style. Only buttons
    /// have one; headless backends return `None`.
    pub fn draw_preview(&self) -> Option<Vec<u8>> {
        match self {
            Control::Button(c) => c.common.deps.graphics.draw_preview(&c.draw_style()),
            Control::PageNumber(_) | Control::Trigger(_) => None,
        }
    }

    /// Flattened view of every action, across all steps and sets.
    pub fn get_all_actions(&self) -> Vec<ActionInstance> {
        match self {
            Control::Button(c) => c.actions.all_actions().into_iter().cloned().collect(),
            Control::PageNumber(_) => Vec::new(),
            Control::Trigger(c) => c.actions.all_actions().into_iter().cloned().collect(),
        }
    }

    // --- action surface -------------------------------------------------

    fn with_actions<R>(
        &mut self,
        f: impl FnOnce(&mut crate::fragment::ActionFragment, &str, &str) -> R,
        step_id: &str,
        set_id: &str,
    ) -> Result<R> {
        match self {
            Control::Button(c) => Ok(f(&mut c.actions, step_id, set_id)),
            // Triggers have exactly one implicit step/set.
            Control::Trigger(c) => Ok(f(&mut c.actions, "0", "0")),
            Control::PageNumber(_) => Err(PanelError::NotSupported("actions")),
        }
    }

    pub fn action_add(&mut self, step_id: &str, set_id: &str, action: ActionInstance) -> Result<bool> {
        let changed = self.with_actions(|a, step, set| a.add(step, set, action), step_id, set_id)?;
        if changed {
            self.commit(true);
        }
        Ok(changed)
    }

    pub fn action_append(
        &mut self,
        step_id: &str,
        set_id: &str,
        actions: Vec<ActionInstance>,
    ) -> Result<bool> {
        let changed =
            self.with_actions(|a, step, set| a.append(step, set, actions), step_id, set_id)?;
        if changed {
            self.commit(true);
        }
        Ok(changed)
    }

    pub fn action_replace_all(
        &mut self,
        step_id: &str,
        set_id: &str,
        actions: Vec<ActionInstance>,
    ) -> Result<bool> {
        let changed =
            self.with_actions(|a, step, set| a.replace_all(step, set, actions), step_id, set_id)?;
        if changed {
            self.commit(true);
        }
        Ok(changed)
    }

    pub fn action_duplicate(&mut self, step_id: &str, set_id: &str, id: &str) -> Result<bool> {
        let changed = self.with_actions(|a, step, set| a.duplicate(step, set, id), step_id, set_id)?;
        if changed {
            self.commit(true);
        }
        Ok(changed)
    }

    pub fn action_remove(&mut self, step_id: &str, set_id: &str, id: &str) -> Result<bool> {
        let changed = self.with_actions(|a, step, set| a.remove(step, set, id), step_id, set_id)?;
        if changed {
            self.commit(true);
        }
        Ok(changed)
    }

    pub fn action_set_enabled(
        &mut self,
        step_id: &str,
        set_id: &str,
        id: &str,
        enabled: bool,
    ) -> Result<bool> {
        let changed = self.with_actions(
            |a, step, set| a.set_enabled(step, set, id, enabled),
            step_id,
            set_id,
        )?;
        if changed {
            self.commit(false);
        }
        Ok(changed)
    }

    pub fn action_set_delay(
        &mut self,
        step_id: &str,
        set_id: &str,
        id: &str,
        delay: i64,
    ) -> Result<bool> {
        let changed = self.with_actions(
            |a, step, set| a.set_delay(step, set, id, delay),
            step_id,
            set_id,
        )??;
        if changed {
            self.commit(false);
        }
        Ok(changed)
    }

    pub fn action_set_option(
        &mut self,
        step_id: &str,
        set_id: &str,
        id: &str,
        key: &str,
        value: Value,
    ) -> Result<bool> {
        let changed = self.with_actions(
            |a, step, set| a.set_option(step, set, id, key, value),
            step_id,
            set_id,
        )?;
        if changed {
            self.commit(false);
        }
        Ok(changed)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn action_reorder(
        &mut self,
        drag_step: &str,
        drag_set: &str,
        drag_index: usize,
        drop_step: &str,
        drop_set: &str,
        drop_index: usize,
    ) -> Result<bool> {
        let changed = match self {
            Control::Button(c) => c.actions.reorder(
                drag_step, drag_set, drag_index, drop_step, drop_set, drop_index,
            ),
            Control::Trigger(c) => c
                .actions
                .reorder("0", "0", drag_index, "0", "0", drop_index),
            Control::PageNumber(_) => return Err(PanelError::NotSupported("actions")),
        };
        if changed {
            self.commit(false);
        }
        Ok(changed)
    }

    /// Replace an action's definition and options in place (upgrade path).
    pub fn action_replace(&mut self, id: &str, action_def: &str, options: OptionsMap) -> Result<bool> {
        let changed = match self {
            Control::Button(c) => c.actions.replace(id, action_def, options),
            Control::Trigger(c) => c.actions.replace(id, action_def, options),
            Control::PageNumber(_) => return Err(PanelError::NotSupported("actions")),
        };
        if changed {
            self.commit(false);
        }
        Ok(changed)
    }

    pub fn find_action(&self, step_id: &str, set_id: &str, id: &str) -> Option<ActionInstance> {
        match self {
            Control::Button(c) => c.actions.find(step_id, set_id, id).cloned(),
            Control::Trigger(c) => c.actions.find("0", "0", id).cloned(),
            Control::PageNumber(_) => None,
        }
    }

    /// Write back learned option values, unless the action was deleted while
    /// learning was in flight.
    pub fn apply_learned_action_options(
        &mut self,
        step_id: &str,
        set_id: &str,
        id: &str,
        options: OptionsMap,
    ) -> Result<bool> {
        let changed = self.with_actions(
            |a, step, set| a.apply_learned_options(step, set, id, options),
            step_id,
            set_id,
        )?;
        if changed {
            self.commit(false);
        }
        Ok(changed)
    }

    // --- feedback surface -----------------------------------------------

    fn feedbacks_mut(&mut self) -> Result<&mut crate::fragment::FeedbackFragment> {
        match self {
            Control::Button(c) => Ok(&mut c.feedbacks),
            Control::Trigger(c) => Ok(&mut c.condition),
            Control::PageNumber(_) => Err(PanelError::NotSupported("feedbacks")),
        }
    }

    pub fn feedback_add(&mut self, feedback: FeedbackInstance) -> Result<bool> {
        let changed = self.feedbacks_mut()?.add(feedback);
        if changed {
            self.commit(true);
        }
        Ok(changed)
    }

    pub fn feedback_duplicate(&mut self, id: &str) -> Result<bool> {
        let changed = self.feedbacks_mut()?.duplicate(id);
        if changed {
            self.commit(true);
        }
        Ok(changed)
    }

    pub fn feedback_remove(&mut self, id: &str) -> Result<bool> {
        let changed = self.feedbacks_mut()?.remove(id);
        if changed {
            self.commit(true);
        }
        Ok(changed)
    }

    pub fn feedback_set_enabled(&mut self, id: &str, enabled: bool) -> Result<bool> {
        let changed = self.feedbacks_mut()?.set_enabled(id, enabled);
        if changed {
            self.commit(true);
        }
        Ok(changed)
    }

    pub fn feedback_set_option(&mut self, id: &str, key: &str, value: Value) -> Result<bool> {
        let changed = self.feedbacks_mut()?.set_option(id, key, value);
        if changed {
            self.commit(true);
        }
        Ok(changed)
    }

    pub fn feedback_set_style_fields(&mut self, id: &str, diff: OptionsMap) -> Result<bool> {
        let changed = self.feedbacks_mut()?.set_style_fields(id, diff);
        if changed {
            self.commit(true);
        }
        Ok(changed)
    }

    pub fn feedback_reorder(&mut self, old_index: usize, new_index: usize) -> Result<bool> {
        let changed = self.feedbacks_mut()?.reorder(old_index, new_index);
        if changed {
            self.commit(true);
        }
        Ok(changed)
    }

    /// Replace options/style in place (instance upgrade result).
    pub fn feedback_replace(&mut self, updated: &FeedbackInstance) -> Result<bool> {
        let changed = self.feedbacks_mut()?.replace(updated);
        if changed {
            self.commit(true);
        }
        Ok(changed)
    }

    pub fn find_feedback(&self, id: &str) -> Option<FeedbackInstance> {
        match self {
            Control::Button(c) => c.feedbacks.find(id).cloned(),
            Control::Trigger(c) => c.condition.find(id).cloned(),
            Control::PageNumber(_) => None,
        }
    }

    pub fn apply_learned_feedback_options(&mut self, id: &str, options: OptionsMap) -> Result<bool> {
        let changed = self.feedbacks_mut()?.apply_learned_options(id, options);
        if changed {
            self.commit(true);
        }
        Ok(changed)
    }

    // --- instance fan-out ----------------------------------------------

    /// Cache new feedback values from an instance; buttons redraw, triggers
    /// recheck their condition.
    pub fn update_feedback_values(&mut self, instance_id: &str, values: &HashMap<String, Value>) {
        match self {
            Control::Button(c) => {
                if c.feedbacks.update_values(instance_id, values) {
                    c.common.trigger_redraw();
                }
            }
            Control::Trigger(c) => {
                if c.condition.update_values(instance_id, values) {
                    c.common.trigger_redraw();
                }
            }
            Control::PageNumber(_) => {}
        }
    }

    /// Purge everything referencing a removed instance. Commits if anything
    /// changed; returns whether it did.
    pub fn forget_instance(&mut self, instance_id: &str) -> bool {
        let changed = match self {
            Control::Button(c) => {
                let actions = c.actions.forget_instance(instance_id);
                let feedbacks = c.feedbacks.forget_instance(instance_id);
                actions || feedbacks
            }
            Control::Trigger(c) => {
                let actions = c.actions.forget_instance(instance_id);
                let condition = c.condition.forget_instance(instance_id);
                actions || condition
            }
            Control::PageNumber(_) => false,
        };
        if changed {
            self.commit(true);
        }
        changed
    }

    /// Prune references to unknown instances after an import. Commits if
    /// anything changed.
    pub fn verify_instance_ids(&mut self, known: &HashSet<String>) -> bool {
        let changed = match self {
            Control::Button(c) => {
                let actions = c.actions.verify_instance_ids(known);
                let feedbacks = c.feedbacks.verify_instance_ids(known);
                actions || feedbacks
            }
            Control::Trigger(c) => {
                let actions = c.actions.verify_instance_ids(known);
                let condition = c.condition.verify_instance_ids(known);
                actions || condition
            }
            Control::PageNumber(_) => false,
        };
        if changed {
            self.commit(true);
        }
        changed
    }

    // --- event surface (triggers only) ----------------------------------

    fn trigger_mut(&mut self) -> Result<&mut TriggerControl> {
        match self {
            Control::Trigger(c) => Ok(c),
            _ => Err(PanelError::NotSupported("events")),
        }
    }

    pub fn event_add(&mut self, event: crate::model::TriggerEventInstance) -> Result<bool> {
        Ok(self.trigger_mut()?.event_add(event))
    }

    pub fn event_duplicate(&mut self, id: &str) -> Result<bool> {
        Ok(self.trigger_mut()?.event_duplicate(id))
    }

    pub fn event_remove(&mut self, id: &str) -> Result<bool> {
        Ok(self.trigger_mut()?.event_remove(id))
    }

    pub fn event_set_enabled(&mut self, id: &str, enabled: bool) -> Result<bool> {
        Ok(self.trigger_mut()?.event_set_enabled(id, enabled))
    }

    pub fn event_reorder(&mut self, old_index: usize, new_index: usize) -> Result<bool> {
        Ok(self.trigger_mut()?.event_reorder(old_index, new_index))
    }

    pub fn event_set_option(&mut self, id: &str, key: &str, value: Value) -> Result<bool> {
        Ok(self.trigger_mut()?.event_set_option(id, key, value))
    }
}
