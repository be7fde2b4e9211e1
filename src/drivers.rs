//! Driver-centric views over the nested structure.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;

use crate::cache::EntityCache;
use crate::crm::types::{fields, normalize_phone, EntityKind, Record};
use crate::nested::{DeliveryBlock, NestedStructure};

/// Stage markers of finished deliveries.
const TERMINAL_MARKERS: [&str; 2] = ["SUCCESS", "FAIL"];

/// Position of a delivery block inside a nested structure:
/// `structure[supply_id].shipments[shipment_index].delivery_block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeliveryPath {
  pub supply_id: i64,
  pub shipment_index: usize,
}

/// Driver ID -> paths of their deliveries, in tree order.
///
/// Paths are positional, so they only make sense against a structure built
/// from the same cache state as the index.
pub type DriverIndex = BTreeMap<i64, Vec<DeliveryPath>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DriverGroup {
  pub contact: Option<Record>,
  pub deliveries: Vec<DeliveryBlock>,
}

/// Either every driver's group or a single driver's.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DriverDeliveries {
  All(BTreeMap<i64, DriverGroup>),
  One(DriverGroup),
}

pub fn is_terminal_stage(stage_id: &str) -> bool {
  TERMINAL_MARKERS.iter().any(|m| stage_id.contains(m))
}

/// Walk the structure once, recording where each driver's deliveries live.
pub fn build_driver_index(nested: &NestedStructure) -> DriverIndex {
  let mut index = DriverIndex::new();
  for (&supply_id, node) in nested {
    for (shipment_index, entry) in node.shipments.iter().enumerate() {
      let Some(driver_id) = entry.delivery_block.as_ref().and_then(DeliveryBlock::driver_id) else {
        continue;
      };
      index.entry(driver_id).or_default().push(DeliveryPath {
        supply_id,
        shipment_index,
      });
    }
  }
  index
}

pub fn resolve_path(nested: &NestedStructure, path: DeliveryPath) -> Option<&DeliveryBlock> {
  nested
    .get(&path.supply_id)?
    .shipments
    .get(path.shipment_index)?
    .delivery_block
    .as_ref()
}

/// Dereference every path in the index. Paths that no longer resolve are
/// logged and dropped.
pub fn resolve_paths(nested: &NestedStructure, index: &DriverIndex) -> BTreeMap<i64, Vec<DeliveryBlock>> {
  index
    .iter()
    .map(|(&driver_id, paths)| {
      let blocks = paths
        .iter()
        .filter_map(|&path| {
          let block = resolve_path(nested, path);
          if block.is_none() {
            warn!("Driver {} path {:?} no longer resolves", driver_id, path);
          }
          block.cloned()
        })
        .collect();
      (driver_id, blocks)
    })
    .collect()
}

/// Group deliveries that have a resolved driver contact by driver.
/// With `active_only`, deliveries in a terminal stage are left out.
pub fn group_by_driver(nested: &NestedStructure, active_only: bool) -> BTreeMap<i64, DriverGroup> {
  // Groups are created empty on first sight of a driver
  let mut grouped: BTreeMap<i64, DriverGroup> = BTreeMap::new();

  for node in nested.values() {
    for entry in &node.shipments {
      let Some(block) = &entry.delivery_block else {
        continue;
      };
      let Some(driver_id) = block.driver_id() else {
        continue;
      };
      if active_only && is_terminal_stage(block.delivery.stage_id()) {
        continue;
      }

      let group = grouped.entry(driver_id).or_default();
      group.contact = block.contact.clone();
      group.deliveries.push(block.clone());
    }
  }

  grouped
}

/// All groups, or one driver's group (empty if the driver has none).
pub fn deliveries_by_driver(
  nested: &NestedStructure,
  driver_id: Option<i64>,
  active_only: bool,
) -> DriverDeliveries {
  let mut grouped = group_by_driver(nested, active_only);
  match driver_id {
    Some(id) => DriverDeliveries::One(grouped.remove(&id).unwrap_or_default()),
    None => DriverDeliveries::All(grouped),
  }
}

/// Find the contact whose stored phone matches `raw_phone` digit for digit.
pub fn find_driver_by_phone(cache: &EntityCache, raw_phone: &str) -> Option<i64> {
  let target = normalize_phone(raw_phone);
  if target.is_empty() {
    return None;
  }

  cache
    .table(EntityKind::Contact)
    .iter()
    .find(|(_, contact)| {
      contact
        .str_field(fields::PHONE)
        .is_some_and(|phone| normalize_phone(phone) == target)
    })
    .map(|(&id, _)| id)
}
