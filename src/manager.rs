//! The single coordinator owning the cache.
//!
//! Readers take a shared lock and derive their views from the current
//! state. Mutations (rebuild, refresh, snapshot load, backfill) are
//! serialized by a writer mutex, so at most one is in flight at a time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::builder::CacheBuilder;
use crate::cache::{EntityCache, SnapshotStorage};
use crate::config::CrmConfig;
use crate::crm::client::CrmApi;
use crate::crm::methods;
use crate::crm::notify::Notifier;
use crate::crm::types::EntityKind;
use crate::drivers::{self, DriverDeliveries, DriverIndex};
use crate::error::LookupError;
use crate::nested::{build_nested, delivery_detail, DeliveryBlock, DeliveryDetail, NestedStructure};
use crate::refresh;

/// Outcome of one incremental refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
  pub notified: usize,
  pub merged: usize,
}

pub struct DeliveryManager<C: CrmApi, N: Notifier> {
  api: C,
  notifier: N,
  storage: Box<dyn SnapshotStorage>,
  page_size: u32,
  chunk_size: usize,
  cache: RwLock<EntityCache>,
  writer: Mutex<()>,
}

impl<C: CrmApi, N: Notifier> DeliveryManager<C, N> {
  /// Create a manager with an empty cache. Call [`Self::initialize`] to fill it.
  pub fn new(api: C, notifier: N, storage: Box<dyn SnapshotStorage>, crm: &CrmConfig) -> Self {
    Self {
      api,
      notifier,
      storage,
      page_size: crm.page_size,
      chunk_size: crm.id_chunk_size,
      cache: RwLock::new(EntityCache::new()),
      writer: Mutex::new(()),
    }
  }

  /// Load the snapshot if there is one, otherwise rebuild from the CRM.
  /// `force_reload` always rebuilds.
  pub async fn initialize(&self, force_reload: bool) {
    if !force_reload && self.storage.exists() {
      if self.load_snapshot().await {
        info!("Cache loaded from {}", self.storage.describe());
        for (kind, table) in self.cache.read().await.tables() {
          debug!("{}: {} records", kind, table.len());
        }
        return;
      }
      warn!("Snapshot unusable, rebuilding from CRM");
    }
    self.full_rebuild().await;
    info!("Cache rebuilt and saved to {}", self.storage.describe());
  }

  fn builder(&self) -> CacheBuilder<'_, C> {
    CacheBuilder::new(&self.api, self.page_size, self.chunk_size)
  }

  /// Fetch everything into a new cache, swap it in and persist it.
  pub async fn full_rebuild(&self) {
    let _writer = self.writer.lock().await;
    let fresh = self.builder().build().await;
    if fresh.is_empty() {
      warn!("CRM returned no supplies; the cache is empty");
    }
    *self.cache.write().await = fresh;
    self.persist().await;
  }

  /// Notify drivers about newly ready deliveries, merge everything
  /// modified since `since`, then persist.
  pub async fn refresh(&self, since: DateTime<Utc>) -> RefreshSummary {
    let _writer = self.writer.lock().await;
    let builder = self.builder();

    let notified = {
      let cache = self.cache.read().await;
      refresh::notify_ready_deliveries(&builder, &self.notifier, &cache).await
    };

    let updates = refresh::fetch_modified(&builder, since).await;
    let merged = refresh::merge_updates(&mut *self.cache.write().await, updates);
    info!("Refresh merged {} records, sent {} notifications", merged, notified);

    self.persist().await;
    RefreshSummary { notified, merged }
  }

  /// Re-fetch document download URLs for the cached waybills and powers of
  /// attorney, then persist.
  pub async fn backfill_document_urls(&self) {
    let _writer = self.writer.lock().await;
    let mut working = self.cache.read().await.clone();
    self.builder().backfill_document_urls(&mut working).await;
    *self.cache.write().await = working;
    self.persist().await;
  }

  /// Replace the cache with the stored snapshot. On failure the current
  /// cache is kept and `false` is returned.
  pub async fn load_snapshot(&self) -> bool {
    let _writer = self.writer.lock().await;
    match self.storage.load() {
      Ok(loaded) => {
        *self.cache.write().await = loaded;
        true
      }
      Err(e) => {
        error!("Failed to load snapshot: {}", e);
        false
      }
    }
  }

  /// Write the current cache to storage. Failures are logged.
  #[allow(dead_code)]
  pub async fn save_snapshot(&self) {
    let _writer = self.writer.lock().await;
    self.persist().await;
  }

  async fn persist(&self) {
    let cache = self.cache.read().await;
    if let Err(e) = self.storage.save(&cache) {
      error!("Failed to save snapshot: {}", e);
    }
  }

  /// A copy of the current cache.
  pub async fn cache_snapshot(&self) -> EntityCache {
    self.cache.read().await.clone()
  }

  pub async fn get_nested_structure(&self) -> NestedStructure {
    build_nested(&*self.cache.read().await)
  }

  pub async fn get_delivery_detail(&self, delivery_id: i64) -> Result<DeliveryDetail, LookupError> {
    delivery_detail(&*self.cache.read().await, delivery_id)
  }

  pub async fn get_deliveries_by_driver(&self, driver_id: Option<i64>, active_only: bool) -> DriverDeliveries {
    let nested = self.get_nested_structure().await;
    drivers::deliveries_by_driver(&nested, driver_id, active_only)
  }

  pub async fn build_driver_index(&self) -> DriverIndex {
    drivers::build_driver_index(&self.get_nested_structure().await)
  }

  /// Resolve `index` against a structure built from the current cache.
  /// The index must come from the same cache state to resolve correctly.
  pub async fn resolve_driver_index(&self, index: &DriverIndex) -> BTreeMap<i64, Vec<DeliveryBlock>> {
    drivers::resolve_paths(&self.get_nested_structure().await, index)
  }

  /// Build and resolve a driver index from one consistent cache state.
  pub async fn drivers_deliveries(&self) -> BTreeMap<i64, Vec<DeliveryBlock>> {
    let nested = self.get_nested_structure().await;
    drivers::resolve_paths(&nested, &drivers::build_driver_index(&nested))
  }

  pub async fn find_driver_by_phone(&self, raw_phone: &str) -> Option<i64> {
    drivers::find_driver_by_phone(&*self.cache.read().await, raw_phone)
  }

  /// Ask the CRM to move an item to another stage. The cache is not
  /// touched; the change arrives with the next refresh.
  pub async fn move_to_stage(&self, kind: EntityKind, entity_id: i64, stage_id: &str) -> bool {
    let Some(entity_type_id) = kind.entity_type_id() else {
      warn!("Cannot change stage of {}: not a smart-process type", kind);
      return false;
    };

    let params = json!({
      "entityTypeId": entity_type_id,
      "id": entity_id,
      "fields": {"stageId": stage_id},
    });
    match self.api.call(methods::ITEM_UPDATE, &params).await {
      Ok(_) => {
        info!("Moved {} {} to stage {}", kind, entity_id, stage_id);
        true
      }
      Err(e) => {
        error!("Failed to move {} {} to stage {}: {}", kind, entity_id, stage_id, e);
        false
      }
    }
  }
}
