use crate::instance::InstanceHost;
use crate::model::{ActionInstance, RunActionExtras};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Group enabled actions by their effective delay, ascending. Within one
/// group the original set order is kept.
///
/// With relative delays each action's effective delay is the sum of its own
/// and every earlier enabled action's; with absolute delays it is the
/// action's own value.
pub fn group_actions(
    actions: Vec<ActionInstance>,
    relative_delay: bool,
) -> BTreeMap<u64, Vec<ActionInstance>> {
    let mut groups: BTreeMap<u64, Vec<ActionInstance>> = BTreeMap::new();
    let mut cumulative = 0u64;
    for action in actions {
        if action.disabled {
            continue;
        }
        let effective = if relative_delay {
            cumulative = cumulative.saturating_add(action.delay);
            cumulative
        } else {
            action.delay
        };
        groups.entry(effective).or_default().push(action);
    }
    groups
}

/// Run a set of actions on a spawned task, honoring delays. Individual
/// failures are logged and never abort the run; cancelling the token stops
/// any not-yet-due group.
pub fn run_actions(
    instances: Arc<dyn InstanceHost>,
    actions: Vec<ActionInstance>,
    relative_delay: bool,
    extras: RunActionExtras,
    cancel: CancellationToken,
) {
    let groups = group_actions(actions, relative_delay);
    if groups.is_empty() {
        return;
    }

    tokio::spawn(async move {
        let mut elapsed = 0u64;
        for (delay, group) in groups {
            let gap = delay.saturating_sub(elapsed);
            if gap > 0 {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("action run for {} aborted", extras.control_id);
                        return;
                    }
                    () = tokio::time::sleep(Duration::from_millis(gap)) => {}
                }
                elapsed = delay;
            }
            for action in &group {
                execute_one(instances.as_ref(), action, &extras).await;
            }
        }
    });
}

async fn execute_one(
    instances: &dyn InstanceHost,
    action: &ActionInstance,
    extras: &RunActionExtras,
) {
    let Some(handle) = instances.get(&action.instance) else {
        warn!(
            "action {} skipped: unknown instance {}",
            action.action, action.instance
        );
        return;
    };
    if let Err(e) = handle.execute_action(action, extras).await {
        warn!(
            "action {} on {} failed: {e}",
            action.action, action.instance
        );
    }
}
