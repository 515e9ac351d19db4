use crate::error::Result;
use crate::model::{ActionInstance, FeedbackInstance, OptionsMap, RunActionExtras};
use futures::future::BoxFuture;
use std::sync::Arc;

/// One connected device-integration instance. Calls cross a process/network
/// boundary, so everything is async and may fail or time out.
pub trait InstanceHandle: Send + Sync {
    /// Execute an action against the device.
    fn execute_action(
        &self,
        action: &ActionInstance,
        extras: &RunActionExtras,
    ) -> BoxFuture<'static, Result<()>>;

    /// Ask the instance for the current live values of an action's options.
    /// `None` means the instance could not (or chose not to) answer.
    fn action_learn_values(&self, action: &ActionInstance) -> BoxFuture<'static, Option<OptionsMap>>;

    /// Ask the instance for the current live values of a feedback's options.
    fn feedback_learn_values(
        &self,
        feedback: &FeedbackInstance,
    ) -> BoxFuture<'static, Option<OptionsMap>>;

    /// Tell the instance to start or stop reporting actions for recording.
    fn start_stop_recording_actions(&self, recording: bool) -> BoxFuture<'static, Result<()>>;
}

/// Registry of connected instances.
pub trait InstanceHost: Send + Sync {
    fn known_instance_ids(&self) -> Vec<String>;

    fn get(&self, instance_id: &str) -> Option<Arc<dyn InstanceHandle>>;
}

/// Host with no instances; used by `--check` and as a test default.
#[derive(Debug, Default)]
pub struct EmptyInstanceHost;

impl InstanceHost for EmptyInstanceHost {
    fn known_instance_ids(&self) -> Vec<String> {
        Vec::new()
    }

    fn get(&self, _instance_id: &str) -> Option<Arc<dyn InstanceHandle>> {
        None
    }
}
