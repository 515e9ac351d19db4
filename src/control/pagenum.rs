use super::{ControlCommon, ControlDeps};
use crate::error::{PanelError, Result};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The page-number indicator. It has no configuration of its own; a press
/// is a navigation gesture handled by the owner, not an action source.
pub struct PageNumberControl {
    pub common: ControlCommon,
}

impl PageNumberControl {
    pub fn new(
        control_id: String,
        deps: ControlDeps,
        parent_cancel: &CancellationToken,
        storage: Option<&Value>,
    ) -> Result<Self> {
        let redraw = ControlCommon::graphics_redraw(&deps, &control_id);
        let common = ControlCommon::new(control_id, deps, parent_cancel, redraw);

        if let Some(value) = storage {
            let kind = value.get("type").and_then(|v| v.as_str()).unwrap_or("");
            if kind != "pagenum" {
                return Err(PanelError::BadControlRecord {
                    id: common.control_id.clone(),
                    message: format!("invalid type: {kind}"),
                });
            }
        }

        let control = Self { common };
        if storage.is_none() {
            control.commit(true);
        }
        Ok(control)
    }

    pub fn to_config_json(&self) -> Value {
        json!({ "type": "pagenum" })
    }

    pub fn commit(&self, redraw: bool) {
        self.common.commit_config(self.to_config_json(), redraw);
    }

    /// Presses are navigation, not actions. Only the release is meaningful.
    pub fn press(&self, pressed: bool) {
        if !pressed {
            debug!("pagenum {} released, navigate home", self.common.control_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_deps;

    #[tokio::test]
    async fn config_is_a_bare_type_tag() {
        let (deps, _) = test_deps();
        let cancel = CancellationToken::new();
        let control =
            PageNumberControl::new("bank:1-0".to_string(), deps, &cancel, None).unwrap();
        assert_eq!(control.to_config_json(), json!({ "type": "pagenum" }));
    }

    #[tokio::test]
    async fn wrong_type_tag_is_rejected() {
        let (deps, _) = test_deps();
        let cancel = CancellationToken::new();
        let bad = json!({ "type": "button" });
        let result = PageNumberControl::new("bank:1-0".to_string(), deps, &cancel, Some(&bad));
        assert!(matches!(result, Err(PanelError::BadControlRecord { .. })));
    }
}
