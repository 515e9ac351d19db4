use crate::error::{PanelError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Option maps attached to actions, feedbacks and events.
pub type OptionsMap = serde_json::Map<String, Value>;

/// Action sets of one step, keyed by set id ("down", "up", "rotate_left", ...).
pub type ActionSets = BTreeMap<String, Vec<ActionInstance>>;

/// Generate a fresh opaque id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One invocation of a named, parameterized operation against an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionInstance {
    pub id: String,

    /// Action definition id within the owning instance.
    pub action: String,

    /// Id of the instance this action executes against.
    pub instance: String,

    #[serde(default)]
    pub options: OptionsMap,

    /// Delay in milliseconds before execution, within a run.
    #[serde(default)]
    pub delay: u64,

    #[serde(default)]
    pub disabled: bool,

    /// Set for recorded actions, to replace re-reports in place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uniqueness_id: Option<String>,
}

/// A query of an instance's state, used as a boolean condition or a style contributor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackInstance {
    pub id: String,

    /// Feedback definition id within the owning instance.
    #[serde(rename = "type")]
    pub feedback_type: String,

    /// Id of the instance this feedback queries.
    pub instance: String,

    #[serde(default)]
    pub options: OptionsMap,

    /// Style fields applied to the button when a boolean feedback is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<OptionsMap>,

    #[serde(default)]
    pub disabled: bool,
}

/// The kinds of watches a trigger can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEventType {
    Interval,
    Timeofday,
    Startup,
    ClientConnect,
    ButtonPress,
    ButtonDepress,
    ConditionTrue,
    VariableChanged,
}

/// One declared watch on a trigger. List order is display order only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEventInstance {
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: TriggerEventType,

    pub enabled: bool,

    #[serde(default)]
    pub options: OptionsMap,
}

/// Base draw style of a button, before feedback overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonStyle {
    #[serde(default)]
    pub text: String,

    /// Font size: "auto" or a pixel count as a string.
    #[serde(default = "default_size")]
    pub size: String,

    /// Foreground color, 0xRRGGBB.
    #[serde(default = "default_color")]
    pub color: u32,

    /// Background color, 0xRRGGBB.
    #[serde(default)]
    pub bgcolor: u32,
}

fn default_size() -> String {
    "auto".to_string()
}

fn default_color() -> u32 {
    0x00ff_ffff
}

impl Default for ButtonStyle {
    fn default() -> Self {
        Self {
            text: String::new(),
            size: default_size(),
            color: default_color(),
            bgcolor: 0,
        }
    }
}

impl ButtonStyle {
    /// Apply a partial style on top of this one. Unknown fields are ignored,
    /// known fields with the wrong JSON type are skipped.
    pub fn apply_partial(&mut self, partial: &OptionsMap) -> bool {
        let mut changed = false;
        if let Some(text) = partial.get("text").and_then(Value::as_str) {
            if self.text != text {
                self.text = text.to_string();
                changed = true;
            }
        }
        if let Some(size) = partial.get("size") {
            let size = match size {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            };
            if let Some(size) = size {
                if self.size != size {
                    self.size = size;
                    changed = true;
                }
            }
        }
        if let Some(color) = partial.get("color").and_then(Value::as_u64) {
            if self.color != color as u32 {
                self.color = color as u32;
                changed = true;
            }
        }
        if let Some(bgcolor) = partial.get("bgcolor").and_then(Value::as_u64) {
            if self.bgcolor != bgcolor as u32 {
                self.bgcolor = bgcolor as u32;
                changed = true;
            }
        }
        changed
    }
}

/// How recorded actions are written into a target action set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    Replace,
    Append,
}

impl FromStr for SaveMode {
    type Err = PanelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "replace" => Ok(SaveMode::Replace),
            "append" => Ok(SaveMode::Append),
            other => Err(PanelError::InvalidSaveMode(other.to_string())),
        }
    }
}

/// Addressing context passed to instances alongside an action.
#[derive(Debug, Clone, Default)]
pub struct RunActionExtras {
    pub control_id: String,
    pub surface_id: Option<String>,
    pub page: Option<u32>,
    pub bank: Option<u32>,
}

/// Step ids ordered numerically ("2" before "10").
pub fn sorted_step_ids<'a>(ids: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut ids: Vec<String> = ids.cloned().collect();
    ids.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));
    ids
}

/// Clamp a client-supplied index into `[0, len]`.
pub fn clamp_index(index: usize, len: usize) -> usize {
    index.min(len)
}
