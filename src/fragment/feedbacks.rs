use crate::model::{clamp_index, new_id, ButtonStyle, FeedbackInstance, OptionsMap};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Ordered feedback list with boolean/style evaluation.
///
/// Current values are pushed in by instances and cached here by feedback id;
/// evaluation never blocks on an instance round-trip.
#[derive(Debug, Clone, Default)]
pub struct FeedbackFragment {
    feedbacks: Vec<FeedbackInstance>,
    cached_values: HashMap<String, Value>,
}

impl FeedbackFragment {
    pub fn new(feedbacks: Vec<FeedbackInstance>) -> Self {
        Self {
            feedbacks,
            cached_values: HashMap::new(),
        }
    }

    pub fn feedbacks(&self) -> &[FeedbackInstance] {
        &self.feedbacks
    }

    pub fn add(&mut self, feedback: FeedbackInstance) -> bool {
        self.feedbacks.push(feedback);
        true
    }

    pub fn duplicate(&mut self, id: &str) -> bool {
        let Some(index) = self.feedbacks.iter().position(|f| f.id == id) else {
            return false;
        };
        let mut copy = self.feedbacks[index].clone();
        copy.id = new_id();
        self.feedbacks.insert(index + 1, copy);
        true
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.feedbacks.len();
        self.feedbacks.retain(|f| f.id != id);
        if self.feedbacks.len() != before {
            self.cached_values.remove(id);
            true
        } else {
            false
        }
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> bool {
        let Some(feedback) = self.feedbacks.iter_mut().find(|f| f.id == id) else {
            return false;
        };
        feedback.disabled = !enabled;
        true
    }

    pub fn set_option(&mut self, id: &str, key: &str, value: Value) -> bool {
        let Some(feedback) = self.feedbacks.iter_mut().find(|f| f.id == id) else {
            return false;
        };
        feedback.options.insert(key.to_string(), value);
        true
    }

    /// Update the style override of a boolean feedback.
    pub fn set_style_fields(&mut self, id: &str, diff: OptionsMap) -> bool {
        let Some(feedback) = self.feedbacks.iter_mut().find(|f| f.id == id) else {
            return false;
        };
        let style = feedback.style.get_or_insert_with(OptionsMap::new);
        for (key, value) in diff {
            style.insert(key, value);
        }
        true
    }

    pub fn reorder(&mut self, old_index: usize, new_index: usize) -> bool {
        if old_index >= self.feedbacks.len() {
            return false;
        }
        let feedback = self.feedbacks.remove(old_index);
        let new_index = clamp_index(new_index, self.feedbacks.len());
        self.feedbacks.insert(new_index, feedback);
        true
    }

    /// Replace options/style in place, located by id. Used by instance
    /// upgrade results.
    pub fn replace(&mut self, updated: &FeedbackInstance) -> bool {
        let Some(feedback) = self.feedbacks.iter_mut().find(|f| f.id == updated.id) else {
            return false;
        };
        feedback.feedback_type = updated.feedback_type.clone();
        feedback.options = updated.options.clone();
        feedback.style = updated.style.clone();
        true
    }

    /// Overwrite a feedback's options if it still exists. Used for learn
    /// write-backs that raced a delete.
    pub fn apply_learned_options(&mut self, id: &str, options: OptionsMap) -> bool {
        let Some(feedback) = self.feedbacks.iter_mut().find(|f| f.id == id) else {
            return false;
        };
        feedback.options = options;
        true
    }

    pub fn find(&self, id: &str) -> Option<&FeedbackInstance> {
        self.feedbacks.iter().find(|f| f.id == id)
    }

    /// Cache new values reported by an instance. Only values addressed to
    /// feedbacks of that instance are accepted. Returns whether anything
    /// changed.
    pub fn update_values(&mut self, instance_id: &str, values: &HashMap<String, Value>) -> bool {
        let mut changed = false;
        for feedback in &self.feedbacks {
            if feedback.instance != instance_id {
                continue;
            }
            if let Some(value) = values.get(&feedback.id) {
                if self.cached_values.get(&feedback.id) != Some(value) {
                    self.cached_values.insert(feedback.id.clone(), value.clone());
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn clear_instance_values(&mut self, instance_id: &str) -> bool {
        let ids: Vec<String> = self
            .feedbacks
            .iter()
            .filter(|f| f.instance == instance_id)
            .map(|f| f.id.clone())
            .collect();
        let mut changed = false;
        for id in ids {
            changed |= self.cached_values.remove(&id).is_some();
        }
        changed
    }

    /// Strip all feedbacks referencing a removed instance.
    pub fn forget_instance(&mut self, instance_id: &str) -> bool {
        let before = self.feedbacks.len();
        self.feedbacks.retain(|f| f.instance != instance_id);
        let changed = self.feedbacks.len() != before;
        if changed {
            let surviving: HashSet<&str> = self.feedbacks.iter().map(|f| f.id.as_str()).collect();
            self.cached_values.retain(|id, _| surviving.contains(id.as_str()));
        }
        changed
    }

    /// Prune feedbacks referencing instance ids outside the known set.
    pub fn verify_instance_ids(&mut self, known: &HashSet<String>) -> bool {
        let before = self.feedbacks.len();
        self.feedbacks.retain(|f| known.contains(&f.instance));
        self.feedbacks.len() != before
    }

    /// Evaluate the list as one boolean: AND of every enabled feedback's
    /// cached boolean value. A value that has never been reported counts as
    /// false; object-valued (style) results do not participate. An empty or
    /// all-disabled list is true, so absence of a condition never blocks.
    pub fn check_value_as_boolean(&self) -> bool {
        let mut result = true;
        for feedback in &self.feedbacks {
            if feedback.disabled {
                continue;
            }
            match self.cached_values.get(&feedback.id) {
                Some(Value::Bool(value)) => result = result && *value,
                Some(Value::Object(_)) => {}
                _ => result = false,
            }
        }
        result
    }

    /// Compute the draw style: enabled feedbacks apply in list order, later
    /// entries overriding earlier per field. A boolean feedback contributes
    /// its own style override while true; an object-valued result is applied
    /// directly as a partial style.
    pub fn style_for(&self, base: &ButtonStyle) -> ButtonStyle {
        let mut style = base.clone();
        for feedback in &self.feedbacks {
            if feedback.disabled {
                continue;
            }
            match self.cached_values.get(&feedback.id) {
                Some(Value::Bool(true)) => {
                    if let Some(overrides) = &feedback.style {
                        style.apply_partial(overrides);
                    }
                }
                Some(Value::Object(partial)) => {
                    style.apply_partial(partial);
                }
                _ => {}
            }
        }
        style
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn feedback(id: &str, instance: &str) -> FeedbackInstance {
        FeedbackInstance {
            id: id.to_string(),
            feedback_type: "state".to_string(),
            instance: instance.to_string(),
            options: OptionsMap::new(),
            style: None,
            disabled: false,
        }
    }

    fn values(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(id, v)| (id.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn empty_list_is_true() {
        let f = FeedbackFragment::default();
        assert!(f.check_value_as_boolean());
    }

    #[test]
    fn all_disabled_list_is_true() {
        let mut f = FeedbackFragment::new(vec![feedback("a", "i1")]);
        f.update_values("i1", &values(&[("a", json!(false))]));
        f.set_enabled("a", false);
        assert!(f.check_value_as_boolean());
    }

    #[test]
    fn and_semantics_with_explicit_false() {
        let mut f = FeedbackFragment::new(vec![feedback("a", "i1"), feedback("b", "i1")]);
        f.update_values("i1", &values(&[("a", json!(true)), ("b", json!(false))]));
        assert!(!f.check_value_as_boolean());

        f.update_values("i1", &values(&[("b", json!(true))]));
        assert!(f.check_value_as_boolean());
    }

    #[test]
    fn unreported_value_blocks_the_condition() {
        let f = FeedbackFragment::new(vec![feedback("a", "i1")]);
        assert!(!f.check_value_as_boolean());
    }

    #[test]
    fn update_values_ignores_other_instances() {
        let mut f = FeedbackFragment::new(vec![feedback("a", "i1")]);
        assert!(!f.update_values("i2", &values(&[("a", json!(true))])));
        assert!(f.update_values("i1", &values(&[("a", json!(true))])));
        assert!(!f.update_values("i1", &values(&[("a", json!(true))])), "no change");
    }

    #[test]
    fn style_applies_in_order_last_write_wins() {
        let mut a = feedback("a", "i1");
        a.style = Some(
            json!({ "bgcolor": 0xff0000, "text": "A" })
                .as_object()
                .unwrap()
                .clone(),
        );
        let mut b = feedback("b", "i1");
        b.style = Some(json!({ "bgcolor": 0x00ff00 }).as_object().unwrap().clone());

        let mut f = FeedbackFragment::new(vec![a, b]);
        f.update_values("i1", &values(&[("a", json!(true)), ("b", json!(true))]));

        let style = f.style_for(&ButtonStyle::default());
        assert_eq!(style.bgcolor, 0x00ff00);
        assert_eq!(style.text, "A");
    }

    #[test]
    fn reorder_and_duplicate_keep_ids_consistent() {
        let mut f = FeedbackFragment::new(vec![feedback("a", "i1"), feedback("b", "i1")]);
        assert!(f.reorder(0, 5));
        assert_eq!(f.feedbacks()[1].id, "a");

        assert!(f.duplicate("b"));
        assert_eq!(f.feedbacks().len(), 3);
        assert_ne!(f.feedbacks()[1].id, "b");

        assert!(f.remove("a"));
        assert!(!f.remove("a"));
    }

    #[test]
    fn forget_instance_strips_feedbacks_and_cache() {
        let mut f = FeedbackFragment::new(vec![feedback("a", "i1"), feedback("b", "i2")]);
        f.update_values("i1", &values(&[("a", json!(true))]));
        assert!(f.forget_instance("i1"));
        assert_eq!(f.feedbacks().len(), 1);
        assert_eq!(f.feedbacks()[0].id, "b");
    }
}
