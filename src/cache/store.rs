//! In-memory entity tables keyed by numeric record ID.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;

use crate::crm::types::{EntityKind, Record};

pub type Table = BTreeMap<i64, Record>;

static EMPTY_TABLE: Table = BTreeMap::new();

/// One table per entity kind. Every key equals its record's own ID.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct EntityCache {
  tables: BTreeMap<EntityKind, Table>,
}

impl Default for EntityCache {
  fn default() -> Self {
    Self::new()
  }
}

impl EntityCache {
  /// An empty cache with a table for every kind.
  pub fn new() -> Self {
    Self {
      tables: EntityKind::ALL.into_iter().map(|k| (k, Table::new())).collect(),
    }
  }

  pub fn table(&self, kind: EntityKind) -> &Table {
    self.tables.get(&kind).unwrap_or(&EMPTY_TABLE)
  }

  pub fn get(&self, kind: EntityKind, id: i64) -> Option<&Record> {
    self.table(kind).get(&id)
  }

  pub fn get_mut(&mut self, kind: EntityKind, id: i64) -> Option<&mut Record> {
    self.tables.get_mut(&kind).and_then(|t| t.get_mut(&id))
  }

  pub fn records(&self, kind: EntityKind) -> impl Iterator<Item = &Record> {
    self.table(kind).values()
  }

  pub fn ids(&self, kind: EntityKind) -> Vec<i64> {
    self.table(kind).keys().copied().collect()
  }

  pub fn len(&self, kind: EntityKind) -> usize {
    self.table(kind).len()
  }

  pub fn is_empty(&self) -> bool {
    self.tables.values().all(BTreeMap::is_empty)
  }

  /// Insert under an explicit key. Used for derived tables whose records
  /// carry no ID of their own.
  pub fn insert(&mut self, kind: EntityKind, id: i64, record: Record) {
    self.tables.entry(kind).or_default().insert(id, record);
  }

  /// Upsert records by their own ID. Entries not present in `records` are
  /// left alone. Records without a readable ID are skipped.
  ///
  /// Returns how many records were stored.
  pub fn bulk_set(&mut self, kind: EntityKind, records: impl IntoIterator<Item = Record>) -> usize {
    let table = self.tables.entry(kind).or_default();
    let mut stored = 0;
    for record in records {
      match record.id() {
        Some(id) => {
          table.insert(id, record);
          stored += 1;
        }
        None => warn!("Skipping {} record without a numeric id", kind),
      }
    }
    stored
  }

  pub fn tables(&self) -> impl Iterator<Item = (EntityKind, &Table)> {
    self.tables.iter().map(|(k, t)| (*k, t))
  }

  /// Build a cache from already keyed tables, filling in missing kinds.
  pub fn from_tables(tables: BTreeMap<EntityKind, Table>) -> Self {
    let mut cache = Self::new();
    cache.tables.extend(tables);
    cache
  }
}
