use crate::config::{AppConfig, GridConfig};
use crate::control::ControlDeps;
use crate::db::{JsonFileStore, KeyValueStore};
use crate::error::Result;
use crate::event::{BusEvent, EventBus};
use crate::graphics::{GraphicsHandle, NullGraphics};
use crate::instance::{EmptyInstanceHost, InstanceHost};
use crate::registry::ControlsRegistry;
use crate::sync::SyncHub;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run the paneld daemon.
///
/// # Errors
/// Returns `PanelError` if the database cannot be opened or a persisted
/// control set cannot be loaded.
pub async fn run(config: AppConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    let bus = EventBus::new();

    let db: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::open(&config.paneld.db_path)?);
    let deps = ControlDeps {
        db,
        hub: Arc::new(SyncHub::new()),
        graphics: Arc::new(NullGraphics) as Arc<dyn GraphicsHandle>,
        instances: Arc::new(EmptyInstanceHost) as Arc<dyn InstanceHost>,
        bus: bus.clone(),
    };

    let mut registry = ControlsRegistry::new(deps, cancel.clone())?;
    seed_grid(&mut registry, &config.grid)?;

    bus.start_ticker(cancel.clone());
    let mut rx = bus.subscribe();

    info!(
        "paneld daemon running, {} controls",
        registry.control_ids().len()
    );

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            () = async { tokio::signal::ctrl_c().await.ok(); } => {
                info!("received SIGINT, shutting down");
                break;
            }
            event = rx.recv() => {
                match event {
                    Ok(e) => e,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("event loop lagged, missed {n} events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        if handle_event(event, &mut registry) {
            break;
        }
    }

    info!("daemon shutting down...");
    cancel.cancel();
    info!("daemon stopped");
    Ok(())
}

/// Handle a single bus event. Returns `true` if the daemon should shut down.
fn handle_event(event: BusEvent, registry: &mut ControlsRegistry) -> bool {
    match event {
        BusEvent::Tick {
            now_seconds,
            unix_ms,
        } => registry.on_tick(now_seconds, unix_ms),

        BusEvent::ControlPressed { pressed, .. } => registry.on_control_pressed(pressed),

        BusEvent::ClientConnect => registry.on_client_connect(),

        BusEvent::VariablesChanged(changed) => registry.on_variables_changed(&changed),

        BusEvent::RecheckCondition(control_id) => registry.recheck_trigger_condition(&control_id),

        BusEvent::TriggerEventFired {
            control_id,
            event_id,
        } => registry.trigger_event_fired(&control_id, &event_id),

        // Informational, consumed by observers.
        BusEvent::TriggerEnabled { .. } => {}

        BusEvent::Shutdown => {
            info!("shutdown event received");
            return true;
        }
    }

    false
}

/// First run against an empty database: lay out the configured grid, a page
/// number control at slot 0 and a blank button in every other slot.
fn seed_grid(registry: &mut ControlsRegistry, grid: &GridConfig) -> Result<()> {
    if !registry.control_ids().is_empty() {
        return Ok(());
    }

    info!(
        "empty database, seeding {} pages of {} controls",
        grid.pages,
        grid.buttons_per_page()
    );
    for page in 1..=grid.pages {
        registry.create_pagenum(&format!("bank:{page}-0"))?;
        for slot in 1..grid.buttons_per_page() {
            registry.create_button(&format!("bank:{page}-{slot}"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_deps;

    #[tokio::test]
    async fn seeding_only_touches_an_empty_registry() {
        let (deps, _) = test_deps();
        let cancel = CancellationToken::new();
        let mut registry = ControlsRegistry::new(deps, cancel).unwrap();

        let grid = GridConfig::default();
        seed_grid(&mut registry, &grid).unwrap();
        assert_eq!(registry.control_ids().len(), 15);
        assert_eq!(registry.get("bank:1-0").unwrap().type_name(), "pagenum");
        assert_eq!(registry.get("bank:1-7").unwrap().type_name(), "button");

        // A second seed pass must not reset anything.
        registry.delete_control("bank:1-7").unwrap();
        seed_grid(&mut registry, &grid).unwrap();
        assert_eq!(registry.control_ids().len(), 14);
    }

    #[tokio::test]
    async fn shutdown_event_stops_the_loop() {
        let (deps, _) = test_deps();
        let cancel = CancellationToken::new();
        let mut registry = ControlsRegistry::new(deps, cancel).unwrap();

        assert!(!handle_event(BusEvent::ClientConnect, &mut registry));
        assert!(handle_event(BusEvent::Shutdown, &mut registry));
    }
}
