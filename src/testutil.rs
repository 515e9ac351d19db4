//! Shared fakes for unit tests.

use crate::control::ControlDeps;
use crate::db::MemoryStore;
use crate::error::{PanelError, Result};
use crate::event::EventBus;
use crate::graphics::NullGraphics;
use crate::instance::{InstanceHandle, InstanceHost};
use crate::model::{ActionInstance, FeedbackInstance, OptionsMap, RunActionExtras};
use crate::sync::SyncHub;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Default collaborators for control tests. The store is returned separately
/// so tests can inspect persisted records.
pub fn test_deps() -> (ControlDeps, Arc<MemoryStore>) {
    let db = Arc::new(MemoryStore::default());
    let deps = ControlDeps {
        db: db.clone(),
        hub: Arc::new(SyncHub::new()),
        graphics: Arc::new(NullGraphics),
        instances: Arc::new(MockInstanceHost::default()),
        bus: EventBus::new(),
    };
    (deps, db)
}

/// Scripted instance that records every call.
pub struct MockInstance {
    executed: Arc<Mutex<Vec<String>>>,
    pub learn_response: Mutex<Option<OptionsMap>>,
    pub recording_calls: Mutex<Vec<bool>>,
    pub fail_recording: AtomicBool,
}

impl MockInstance {
    fn new(executed: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            executed,
            learn_response: Mutex::new(None),
            recording_calls: Mutex::new(Vec::new()),
            fail_recording: AtomicBool::new(false),
        }
    }

    pub fn set_learn_response(&self, options: OptionsMap) {
        *self.learn_response.lock().unwrap() = Some(options);
    }

    pub fn recording_calls(&self) -> Vec<bool> {
        self.recording_calls.lock().unwrap().clone()
    }
}

impl InstanceHandle for MockInstance {
    fn execute_action(
        &self,
        action: &ActionInstance,
        _extras: &RunActionExtras,
    ) -> BoxFuture<'static, Result<()>> {
        self.executed.lock().unwrap().push(action.id.clone());
        Box::pin(async { Ok(()) })
    }

    fn action_learn_values(
        &self,
        _action: &ActionInstance,
    ) -> BoxFuture<'static, Option<OptionsMap>> {
        let response = self.learn_response.lock().unwrap().clone();
        Box::pin(async move { response })
    }

    fn feedback_learn_values(
        &self,
        _feedback: &FeedbackInstance,
    ) -> BoxFuture<'static, Option<OptionsMap>> {
        let response = self.learn_response.lock().unwrap().clone();
        Box::pin(async move { response })
    }

    fn start_stop_recording_actions(&self, recording: bool) -> BoxFuture<'static, Result<()>> {
        self.recording_calls.lock().unwrap().push(recording);
        let fail = self.fail_recording.load(Ordering::Relaxed);
        Box::pin(async move {
            if fail {
                Err(PanelError::Instance("recording refused".to_string()))
            } else {
                Ok(())
            }
        })
    }
}

/// Host over a fixed set of mock instances, with a shared execution log to
/// observe cross-instance ordering.
#[derive(Default)]
pub struct MockInstanceHost {
    instances: Mutex<HashMap<String, Arc<MockInstance>>>,
    executed: Arc<Mutex<Vec<String>>>,
}

impl MockInstanceHost {
    pub fn with_instance(instance_id: &str) -> Self {
        let host = Self::default();
        host.add(instance_id);
        host
    }

    pub fn add(&self, instance_id: &str) -> Arc<MockInstance> {
        let instance = Arc::new(MockInstance::new(self.executed.clone()));
        self.instances
            .lock()
            .unwrap()
            .insert(instance_id.to_string(), instance.clone());
        instance
    }

    /// Action ids in execution order, across all instances.
    pub fn executed_actions(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

impl InstanceHost for MockInstanceHost {
    fn known_instance_ids(&self) -> Vec<String> {
        self.instances.lock().unwrap().keys().cloned().collect()
    }

    fn get(&self, instance_id: &str) -> Option<Arc<dyn InstanceHandle>> {
        self.instances
            .lock()
            .unwrap()
            .get(instance_id)
            .map(|i| i.clone() as Arc<dyn InstanceHandle>)
    }
}
