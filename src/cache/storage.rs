//! Snapshot storage trait and JSON file implementation.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;

use super::store::{EntityCache, Table};
use crate::crm::types::{EntityKind, Record};

/// Trait for snapshot storage backends.
pub trait SnapshotStorage: Send + Sync {
  /// Whether a snapshot is available to load.
  fn exists(&self) -> bool;

  /// Read the whole cache.
  fn load(&self) -> Result<EntityCache>;

  /// Write the whole cache, replacing any previous snapshot.
  fn save(&self, cache: &EntityCache) -> Result<()>;

  /// Human-readable location, for logs.
  fn describe(&self) -> String;
}

/// Storage implementation that doesn't persist anything.
#[cfg(test)]
pub struct NoopStorage;

#[cfg(test)]
impl SnapshotStorage for NoopStorage {
  fn exists(&self) -> bool {
    false
  }

  fn load(&self) -> Result<EntityCache> {
    Err(eyre!("No snapshot storage configured"))
  }

  fn save(&self, _cache: &EntityCache) -> Result<()> {
    Ok(()) // Discard
  }

  fn describe(&self) -> String {
    "nowhere".to_string()
  }
}

/// Snapshot stored as a single JSON document:
/// `{"<kind>": {"<id>": {record}, ...}, ...}`.
///
/// Writes rewrite the whole file in place, so an interrupted save can leave
/// a truncated snapshot behind. A full rebuild recovers from that.
pub struct JsonFileStorage {
  path: PathBuf,
}

impl JsonFileStorage {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  #[cfg(test)]
  pub fn path(&self) -> &std::path::Path {
    &self.path
  }
}

impl SnapshotStorage for JsonFileStorage {
  fn exists(&self) -> bool {
    self.path.exists()
  }

  fn load(&self) -> Result<EntityCache> {
    let contents = std::fs::read_to_string(&self.path)
      .map_err(|e| eyre!("Failed to read snapshot {}: {}", self.path.display(), e))?;

    let raw: BTreeMap<String, BTreeMap<String, Record>> = serde_json::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse snapshot {}: {}", self.path.display(), e))?;

    Ok(rekey(raw))
  }

  fn save(&self, cache: &EntityCache) -> Result<()> {
    if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create snapshot directory: {}", e))?;
    }

    let data = serde_json::to_vec_pretty(cache)
      .map_err(|e| eyre!("Failed to serialize snapshot: {}", e))?;

    std::fs::write(&self.path, data)
      .map_err(|e| eyre!("Failed to write snapshot {}: {}", self.path.display(), e))
  }

  fn describe(&self) -> String {
    self.path.display().to_string()
  }
}

/// Turn the string-keyed JSON document back into numeric-keyed tables.
/// Unknown kinds and non-numeric keys are dropped with a warning.
fn rekey(raw: BTreeMap<String, BTreeMap<String, Record>>) -> EntityCache {
  let mut tables: BTreeMap<EntityKind, Table> = BTreeMap::new();

  for (kind_name, entries) in raw {
    let kind = match kind_name.parse::<EntityKind>() {
      Ok(kind) => kind,
      Err(e) => {
        warn!("Ignoring snapshot table: {}", e);
        continue;
      }
    };

    let table = tables.entry(kind).or_default();
    for (key, record) in entries {
      match key.trim().parse::<i64>() {
        Ok(id) => {
          table.insert(id, record);
        }
        Err(_) => warn!("Ignoring {} entry with non-numeric key '{}'", kind, key),
      }
    }
  }

  EntityCache::from_tables(tables)
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn sample_cache() -> EntityCache {
    let mut cache = EntityCache::new();
    cache.bulk_set(
      EntityKind::Supply,
      vec![Record::from_value(json!({"ID": "10", "TITLE": "Поставка 10", "UF_CRM_1728985624": "77"})).unwrap()],
    );
    cache.bulk_set(
      EntityKind::Delivery,
      vec![Record::from_value(json!({
        "id": 3,
        "parentId1040": 2,
        "stageId": "DT1048_9:NEW",
        "product_rows": [{"product_name": "Sand", "quantity": 2, "unit": "t"}]
      }))
      .unwrap()],
    );
    cache.insert(
      EntityKind::MarchrutniyList,
      3,
      Record::from_value(json!({"downloadUrl": null})).unwrap(),
    );
    cache
  }

  #[test]
  fn test_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let storage = JsonFileStorage::new(dir.path().join("cache.json"));
    let cache = sample_cache();

    assert!(!storage.exists());
    storage.save(&cache).unwrap();
    assert!(storage.exists());

    let loaded = storage.load().unwrap();
    assert_eq!(loaded, cache);
    assert_eq!(loaded.ids(EntityKind::Supply), vec![10]);
  }

  #[test]
  fn test_file_uses_string_keys() {
    let dir = tempfile::tempdir().unwrap();
    let storage = JsonFileStorage::new(dir.path().join("cache.json"));
    storage.save(&sample_cache()).unwrap();

    let raw: serde_json::Value =
      serde_json::from_str(&std::fs::read_to_string(storage.path()).unwrap()).unwrap();
    assert_eq!(raw["delivery"]["3"]["stageId"], json!("DT1048_9:NEW"));
    assert_eq!(raw["marchrutniy_list"]["3"]["downloadUrl"], json!(null));
  }

  #[test]
  fn test_load_rekeys_and_skips_bad_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.json");
    std::fs::write(
      &path,
      r#"{"contact": {"5": {"ID": "5", "PHONE": "7999"}, "x": {"ID": "x"}}, "unknown": {"1": {}}}"#,
    )
    .unwrap();

    let loaded = JsonFileStorage::new(&path).load().unwrap();

    assert_eq!(loaded.ids(EntityKind::Contact), vec![5]);
    // Missing kinds come back as empty tables
    assert_eq!(loaded.len(EntityKind::Delivery), 0);
  }

  #[test]
  fn test_load_corrupt_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.json");
    std::fs::write(&path, "{\"delivery\": {\"1\": ").unwrap();

    assert!(JsonFileStorage::new(&path).load().is_err());
  }

  #[test]
  fn test_noop_storage() {
    assert!(!NoopStorage.exists());
    assert!(NoopStorage.save(&sample_cache()).is_ok());
    assert!(NoopStorage.load().is_err());
  }
}
