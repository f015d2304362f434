//! PMA gateway server
//!
//! Wires the registries, adapter framework, sync coordinator, action
//! pipeline, push hub and stores together and serves the HTTP surface.

mod config;
mod virtual_adapter;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use pma_adapters::AdapterRegistry;
use pma_api::{AppState, AuthService};
use pma_events::{Hub, HEARTBEAT_PERIOD};
use pma_registries::Registries;
use pma_store::SqliteStore;
use pma_sync::SyncCoordinator;
use pma_unified::{ActionPipeline, UnifiedService};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::GatewayConfig;
use virtual_adapter::VirtualAdapter;

/// The assembled gateway.
pub struct Gateway {
    pub registries: Arc<Registries>,
    pub adapters: Arc<AdapterRegistry>,
    pub hub: Arc<Hub>,
    pub sync: Arc<SyncCoordinator>,
    pub state: AppState,
}

impl Gateway {
    /// Build every component from the configuration.
    pub fn build(config: &GatewayConfig) -> anyhow::Result<Self> {
        let store = Arc::new(
            SqliteStore::open(&config.database_path, config.secret.as_deref())
                .with_context(|| format!("opening database at {}", config.database_path))?,
        );

        let registries = Arc::new(Registries::new());
        let hub = Arc::new(Hub::new());
        let adapters = Arc::new(AdapterRegistry::new(hub.clone()));
        let metrics: Arc<dyn pma_store::MetricsStore> = store.clone();
        let sync = Arc::new(SyncCoordinator::new(
            registries.clone(),
            adapters.clone(),
            hub.clone(),
            Some(metrics),
        ));

        let pipeline = ActionPipeline::new(registries.clone(), adapters.clone(), hub.clone());
        let service = Arc::new(UnifiedService::new(
            registries.clone(),
            adapters.clone(),
            pipeline,
            sync.clone(),
            hub.clone(),
        ));

        let jwt_secret = config
            .secret
            .clone()
            .unwrap_or_else(|| "pma-gateway-insecure-default".to_string());
        if config.secret.is_none() {
            warn!("No secret configured; tokens are signed with the default key");
        }
        let auth = Arc::new(AuthService::new(store, jwt_secret));

        Ok(Self {
            registries,
            adapters,
            hub: hub.clone(),
            sync,
            state: AppState { service, hub, auth },
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = GatewayConfig::load(GatewayConfig::path_from_env())?;
    let gateway = Gateway::build(&config)?;

    if config.virtual_source {
        gateway
            .adapters
            .register(Arc::new(VirtualAdapter::new()))
            .await
            .context("registering virtual source")?;
    }

    // The registry is reconstructed from adapter snapshots at start-up
    let results = gateway.sync.sync_from_all_sources().await;
    info!(
        sources = results.len(),
        failed = results.iter().filter(|r| !r.success).count(),
        entities = gateway.registries.entities.len(),
        "Initial sync finished"
    );

    Hub::spawn_heartbeat(gateway.hub.clone(), HEARTBEAT_PERIOD);
    SyncCoordinator::spawn_periodic(
        gateway.sync.clone(),
        Duration::from_secs(config.sync_interval_secs.max(5)),
    );

    pma_api::start_server(gateway.state, &config.http_addr)
        .await
        .context("serving HTTP")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pma_core::Action;

    fn test_config(dir: &tempfile::TempDir) -> GatewayConfig {
        GatewayConfig {
            database_path: dir
                .path()
                .join("gateway.db")
                .to_string_lossy()
                .into_owned(),
            secret: Some("test-secret".to_string()),
            virtual_source: true,
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_boot_sync_populates_registries() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::build(&test_config(&dir)).unwrap();
        gateway
            .adapters
            .register(Arc::new(VirtualAdapter::new()))
            .await
            .unwrap();

        let results = gateway.sync.sync_from_all_sources().await;
        assert!(results.iter().all(|r| r.success));
        assert_eq!(gateway.registries.entities.len(), 4);
        assert_eq!(gateway.registries.rooms.len(), 2);

        // Room membership arrived symmetric
        let room = gateway.registries.rooms.get("virtual_room_living").unwrap();
        assert!(room.contains("virtual_light_ceiling"));
        let light = gateway
            .registries
            .entities
            .get("virtual_light_ceiling")
            .unwrap();
        assert_eq!(light.room_id.as_deref(), Some("virtual_room_living"));
    }

    #[tokio::test]
    async fn test_end_to_end_action_through_service() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = Gateway::build(&test_config(&dir)).unwrap();
        gateway
            .adapters
            .register(Arc::new(VirtualAdapter::new()))
            .await
            .unwrap();
        gateway.sync.sync_from_all_sources().await;

        let result = gateway
            .state
            .service
            .execute_action(Action::new("virtual_light_ceiling", "turn_on"))
            .await
            .unwrap();
        assert!(result.success);

        let entity = gateway
            .registries
            .entities
            .get("virtual_light_ceiling")
            .unwrap();
        assert_eq!(entity.state, pma_core::EntityState::On);
    }
}
