//! Engine wiring: one store, shared by every engine the routes call.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tracing::info;

use pharmastock_core::DomainResult;
use pharmastock_infra::{
    AllocationManager, BatchLedger, InMemoryInventoryStore, InventoryStore, PostgresInventoryStore, ProductCatalog,
    PurchaseIntake, SaleEngine,
};
use pharmastock_purchasing::IntakePolicy;

use crate::config::AppConfig;

#[derive(Clone)]
pub struct AppServices {
    pub intake: PurchaseIntake,
    pub allocations: AllocationManager,
    pub catalog: ProductCatalog,
    pub sales: SaleEngine,
    pub ledger: BatchLedger,
}

impl AppServices {
    pub fn new(store: Arc<dyn InventoryStore>, policy: IntakePolicy) -> Self {
        Self {
            intake: PurchaseIntake::new(store.clone(), policy),
            allocations: AllocationManager::new(store.clone()),
            catalog: ProductCatalog::new(store.clone()),
            sales: SaleEngine::new(store.clone()),
            ledger: BatchLedger::new(store),
        }
    }

    /// Engines over a fresh in-memory store.
    pub fn in_memory(lock_timeout: Duration, policy: IntakePolicy) -> Self {
        Self::new(Arc::new(InMemoryInventoryStore::with_lock_timeout(lock_timeout)), policy)
    }
}

/// Pick the store from configuration: Postgres when a URL is set, in-memory otherwise.
pub async fn build_services(config: &AppConfig) -> DomainResult<AppServices> {
    let Some(url) = config.database_url.as_deref() else {
        info!("no DATABASE_URL set; using the in-memory store");
        return Ok(AppServices::in_memory(config.lock_timeout, config.intake));
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(config.lock_timeout)
        .connect(url)
        .await
        .map_err(|e| pharmastock_core::DomainError::storage(format!("connect: {e}")))?;

    let store = PostgresInventoryStore::new(pool, config.lock_timeout);
    store.ensure_schema().await?;
    info!("connected to postgres");

    Ok(AppServices::new(Arc::new(store), config.intake))
}
