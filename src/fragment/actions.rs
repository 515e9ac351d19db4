use crate::error::{PanelError, Result};
use crate::model::{clamp_index, new_id, ActionInstance, ActionSets, OptionsMap};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Ordered action lists grouped into named sets within steps.
///
/// Mutation methods only change state and report whether anything changed;
/// the owning control decides when to commit. Missing action ids are benign
/// (`false`), a missing step/set makes the whole operation fail without
/// partial mutation.
#[derive(Debug, Clone, Default)]
pub struct ActionFragment {
    steps: BTreeMap<String, ActionSets>,
}

impl ActionFragment {
    pub fn new(steps: BTreeMap<String, ActionSets>) -> Self {
        Self { steps }
    }

    /// A fragment with a single implicit step/set "0", for controls without
    /// multi-step semantics.
    pub fn single_set() -> Self {
        let mut sets = ActionSets::new();
        sets.insert("0".to_string(), Vec::new());
        let mut steps = BTreeMap::new();
        steps.insert("0".to_string(), sets);
        Self { steps }
    }

    pub fn steps(&self) -> &BTreeMap<String, ActionSets> {
        &self.steps
    }

    pub fn steps_mut(&mut self) -> &mut BTreeMap<String, ActionSets> {
        &mut self.steps
    }

    pub fn set_exists(&self, step_id: &str, set_id: &str) -> bool {
        self.steps
            .get(step_id)
            .is_some_and(|sets| sets.contains_key(set_id))
    }

    pub fn actions_in(&self, step_id: &str, set_id: &str) -> Option<&[ActionInstance]> {
        self.steps
            .get(step_id)
            .and_then(|sets| sets.get(set_id))
            .map(Vec::as_slice)
    }

    fn set_mut(&mut self, step_id: &str, set_id: &str) -> Option<&mut Vec<ActionInstance>> {
        self.steps.get_mut(step_id)?.get_mut(set_id)
    }

    /// Append an action to a set. Fails on an unknown step/set.
    pub fn add(&mut self, step_id: &str, set_id: &str, action: ActionInstance) -> bool {
        match self.set_mut(step_id, set_id) {
            Some(set) => {
                set.push(action);
                true
            }
            None => false,
        }
    }

    /// Clone an action with a fresh id, inserted directly after the original.
    pub fn duplicate(&mut self, step_id: &str, set_id: &str, id: &str) -> bool {
        let Some(set) = self.set_mut(step_id, set_id) else {
            return false;
        };
        let Some(index) = set.iter().position(|a| a.id == id) else {
            return false;
        };
        let mut copy = set[index].clone();
        copy.id = new_id();
        set.insert(index + 1, copy);
        true
    }

    pub fn remove(&mut self, step_id: &str, set_id: &str, id: &str) -> bool {
        let Some(set) = self.set_mut(step_id, set_id) else {
            return false;
        };
        let before = set.len();
        set.retain(|a| a.id != id);
        set.len() != before
    }

    /// Disabled actions are skipped at run-time and never sent to instances.
    pub fn set_enabled(&mut self, step_id: &str, set_id: &str, id: &str, enabled: bool) -> bool {
        let Some(action) = self.find_mut(step_id, set_id, id) else {
            return false;
        };
        action.disabled = !enabled;
        true
    }

    /// Set an action's delay. Negative delays are rejected before any
    /// mutation.
    pub fn set_delay(&mut self, step_id: &str, set_id: &str, id: &str, delay: i64) -> Result<bool> {
        if delay < 0 {
            return Err(PanelError::InvalidDelay(delay));
        }
        let Some(action) = self.find_mut(step_id, set_id, id) else {
            return Ok(false);
        };
        action.delay = delay as u64;
        Ok(true)
    }

    pub fn set_option(
        &mut self,
        step_id: &str,
        set_id: &str,
        id: &str,
        key: &str,
        value: Value,
    ) -> bool {
        let Some(action) = self.find_mut(step_id, set_id, id) else {
            return false;
        };
        action.options.insert(key.to_string(), value);
        true
    }

    /// Move an action within a set or across sets. Indices are clamped to
    /// `[0, len]`; an unknown source or destination set fails with the
    /// fragment untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn reorder(
        &mut self,
        drag_step: &str,
        drag_set: &str,
        drag_index: usize,
        drop_step: &str,
        drop_set: &str,
        drop_index: usize,
    ) -> bool {
        if !self.set_exists(drag_step, drag_set) || !self.set_exists(drop_step, drop_set) {
            return false;
        }

        let moved = {
            let source = self
                .set_mut(drag_step, drag_set)
                .expect("source set checked above");
            let drag_index = clamp_index(drag_index, source.len());
            if drag_index < source.len() {
                Some(source.remove(drag_index))
            } else {
                None
            }
        };

        if let Some(action) = moved {
            let dest = self
                .set_mut(drop_step, drop_set)
                .expect("destination set checked above");
            let drop_index = clamp_index(drop_index, dest.len());
            dest.insert(drop_index, action);
        }

        true
    }

    /// Bulk substitute a set's contents (recorder "replace" save).
    pub fn replace_all(&mut self, step_id: &str, set_id: &str, actions: Vec<ActionInstance>) -> bool {
        match self.set_mut(step_id, set_id) {
            Some(set) => {
                *set = actions;
                true
            }
            None => false,
        }
    }

    /// Bulk append to a set (recorder "append" save).
    pub fn append(&mut self, step_id: &str, set_id: &str, actions: Vec<ActionInstance>) -> bool {
        match self.set_mut(step_id, set_id) {
            Some(set) => {
                set.extend(actions);
                true
            }
            None => false,
        }
    }

    /// Replace an action's definition and options in place, anywhere in the
    /// fragment. Used by instance upgrade results.
    pub fn replace(&mut self, id: &str, action_def: &str, options: OptionsMap) -> bool {
        for sets in self.steps.values_mut() {
            for set in sets.values_mut() {
                if let Some(action) = set.iter_mut().find(|a| a.id == id) {
                    action.action = action_def.to_string();
                    action.options = options;
                    return true;
                }
            }
        }
        false
    }

    /// Overwrite an action's options if it still exists. Used for learn
    /// write-backs that raced a delete.
    pub fn apply_learned_options(
        &mut self,
        step_id: &str,
        set_id: &str,
        id: &str,
        options: OptionsMap,
    ) -> bool {
        let Some(action) = self.find_mut(step_id, set_id, id) else {
            return false;
        };
        action.options = options;
        true
    }

    /// Strip all actions referencing a removed instance.
    pub fn forget_instance(&mut self, instance_id: &str) -> bool {
        let mut changed = false;
        for sets in self.steps.values_mut() {
            for set in sets.values_mut() {
                let before = set.len();
                set.retain(|a| a.instance != instance_id);
                changed |= set.len() != before;
            }
        }
        changed
    }

    /// Prune actions referencing instance ids outside the known set.
    /// Used after import; the caller decides whether to commit.
    pub fn verify_instance_ids(&mut self, known: &HashSet<String>) -> bool {
        let mut changed = false;
        for sets in self.steps.values_mut() {
            for set in sets.values_mut() {
                let before = set.len();
                set.retain(|a| known.contains(&a.instance));
                changed |= set.len() != before;
            }
        }
        changed
    }

    pub fn find(&self, step_id: &str, set_id: &str, id: &str) -> Option<&ActionInstance> {
        self.steps
            .get(step_id)?
            .get(set_id)?
            .iter()
            .find(|a| a.id == id)
    }

    fn find_mut(&mut self, step_id: &str, set_id: &str, id: &str) -> Option<&mut ActionInstance> {
        self.set_mut(step_id, set_id)?.iter_mut().find(|a| a.id == id)
    }

    /// Flattened view across all steps and sets.
    pub fn all_actions(&self) -> Vec<&ActionInstance> {
        self.steps
            .values()
            .flat_map(|sets| sets.values())
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(id: &str, instance: &str) -> ActionInstance {
        ActionInstance {
            id: id.to_string(),
            action: "go".to_string(),
            instance: instance.to_string(),
            options: OptionsMap::new(),
            delay: 0,
            disabled: false,
            uniqueness_id: None,
        }
    }

    fn button_fragment() -> ActionFragment {
        let mut sets = ActionSets::new();
        sets.insert(
            "down".to_string(),
            vec![action("a", "i1"), action("b", "i1"), action("c", "i2")],
        );
        sets.insert("up".to_string(), vec![action("d", "i1")]);
        let mut steps = BTreeMap::new();
        steps.insert("0".to_string(), sets);
        ActionFragment::new(steps)
    }

    fn ids(fragment: &ActionFragment, step: &str, set: &str) -> Vec<String> {
        fragment
            .actions_in(step, set)
            .unwrap()
            .iter()
            .map(|a| a.id.clone())
            .collect()
    }

    #[test]
    fn add_remove_keeps_exact_surviving_ids() {
        let mut f = button_fragment();
        assert!(f.add("0", "down", action("e", "i1")));
        assert!(f.remove("0", "down", "b"));
        assert!(!f.remove("0", "down", "b"), "second remove is a no-op");
        let ids = ids(&f, "0", "down");
        assert_eq!(ids, vec!["a", "c", "e"]);
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn add_to_unknown_set_fails() {
        let mut f = button_fragment();
        assert!(!f.add("0", "rotate_left", action("x", "i1")));
        assert!(!f.add("9", "down", action("x", "i1")));
    }

    #[test]
    fn duplicate_inserts_after_original_with_fresh_id() {
        let mut f = button_fragment();
        assert!(f.duplicate("0", "down", "a"));
        let down = f.actions_in("0", "down").unwrap();
        assert_eq!(down.len(), 4);
        assert_eq!(down[0].id, "a");
        assert_ne!(down[1].id, "a");
        assert_eq!(down[1].action, down[0].action);
    }

    #[test]
    fn reorder_across_sets_moves_the_action() {
        let mut f = button_fragment();
        assert!(f.reorder("0", "down", 2, "0", "up", 0));
        assert_eq!(ids(&f, "0", "down"), vec!["a", "b"]);
        assert_eq!(ids(&f, "0", "up"), vec!["c", "d"]);
    }

    #[test]
    fn reorder_to_unknown_set_leaves_source_untouched() {
        let mut f = button_fragment();
        assert!(!f.reorder("0", "down", 2, "0", "rotate_left", 0));
        assert_eq!(ids(&f, "0", "down"), vec!["a", "b", "c"]);
    }

    #[test]
    fn reorder_clamps_out_of_range_indices() {
        let mut f = button_fragment();
        // Source index past the end moves nothing but still succeeds.
        assert!(f.reorder("0", "down", 99, "0", "up", 0));
        assert_eq!(ids(&f, "0", "down"), vec!["a", "b", "c"]);

        // Destination index past the end appends.
        assert!(f.reorder("0", "down", 0, "0", "up", 99));
        assert_eq!(ids(&f, "0", "up"), vec!["d", "a"]);
    }

    #[test]
    fn negative_delay_is_rejected_before_mutation() {
        let mut f = button_fragment();
        assert!(matches!(
            f.set_delay("0", "down", "a", -5),
            Err(PanelError::InvalidDelay(-5))
        ));
        assert_eq!(f.find("0", "down", "a").unwrap().delay, 0);

        assert!(f.set_delay("0", "down", "a", 250).unwrap());
        assert_eq!(f.find("0", "down", "a").unwrap().delay, 250);

        // Missing action id is benign.
        assert!(!f.set_delay("0", "down", "nope", 10).unwrap());
    }

    #[test]
    fn forget_instance_strips_only_that_instance() {
        let mut f = button_fragment();
        assert!(f.forget_instance("i1"));
        assert_eq!(ids(&f, "0", "down"), vec!["c"]);
        assert!(f.actions_in("0", "up").unwrap().is_empty());
        assert!(!f.forget_instance("i1"), "nothing left to strip");
    }

    #[test]
    fn verify_instance_ids_prunes_unknown_refs() {
        let mut f = button_fragment();
        let known: HashSet<String> = ["i2".to_string()].into();
        assert!(f.verify_instance_ids(&known));
        assert_eq!(ids(&f, "0", "down"), vec!["c"]);
    }

    #[test]
    fn replace_updates_in_place() {
        let mut f = button_fragment();
        let mut options = OptionsMap::new();
        options.insert("speed".to_string(), serde_json::json!(2));
        assert!(f.replace("b", "fade", options));
        let b = f.find("0", "down", "b").unwrap();
        assert_eq!(b.action, "fade");
        assert_eq!(b.options.get("speed"), Some(&serde_json::json!(2)));

        assert!(!f.replace("nope", "fade", OptionsMap::new()));
    }

    #[test]
    fn all_actions_flattens_every_set() {
        let f = button_fragment();
        assert_eq!(f.all_actions().len(), 4);
    }
}
