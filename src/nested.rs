//! Parent/child tree rebuilt from the flat entity tables.
//!
//! supply -> shipments -> delivery -> loading, unloading, waybill, power of
//! attorney, route sheet, driver, product rows; purchases hang off the
//! shipment next to its delivery.
//!
//! Links are resolved purely through foreign-key fields. A child whose
//! parent is not cached is simply absent from the tree. Children are visited
//! in ascending ID order, and where a parent has several children of a
//! single-valued kind (delivery per shipment, loading per delivery, ...)
//! the first one wins.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::cache::EntityCache;
use crate::crm::types::{EntityKind, Record};
use crate::error::LookupError;

pub type NestedStructure = BTreeMap<i64, SupplyNode>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupplyNode {
  pub supply: Record,
  pub deal: Option<Record>,
  pub shipments: Vec<ShipmentEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShipmentEntry {
  pub shipment: Record,
  pub delivery_block: Option<DeliveryBlock>,
  pub purchases: Vec<Record>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryBlock {
  pub delivery: Record,
  pub loading: Option<Record>,
  pub unloading: Option<Record>,
  pub nacladnaya: Option<Record>,
  pub doverennost: Option<Record>,
  pub marchrutniy_list: Option<Record>,
  /// Driver
  pub contact: Option<Record>,
  pub product_rows: Vec<Value>,
}

impl DeliveryBlock {
  pub fn delivery_id(&self) -> Option<i64> {
    self.delivery.id()
  }

  pub fn driver_id(&self) -> Option<i64> {
    self.contact.as_ref().and_then(Record::id)
  }
}

/// Everything known about one delivery, resolved up and down the FK chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryDetail {
  pub delivery: Record,
  pub driver: Option<Record>,
  pub loading: Option<Record>,
  pub unloading: Option<Record>,
  pub nacladnaya: Option<Record>,
  pub doverennost: Option<Record>,
  pub marchrutniy_list: Option<Record>,
  pub shipment: Option<Record>,
  pub supply: Option<Record>,
  pub deal: Option<Record>,
  pub purchases: Vec<Record>,
  pub product_rows: Vec<Value>,
}

/// Children of each kind grouped by parent ID, built once per tree.
struct ChildIndex<'a> {
  by_parent: HashMap<EntityKind, HashMap<i64, Vec<&'a Record>>>,
}

impl<'a> ChildIndex<'a> {
  fn new(cache: &'a EntityCache, kinds: &[EntityKind]) -> Self {
    let mut by_parent: HashMap<EntityKind, HashMap<i64, Vec<&'a Record>>> = HashMap::new();
    for &kind in kinds {
      let groups = by_parent.entry(kind).or_default();
      for record in cache.records(kind) {
        match record.parent_id(kind) {
          Some(parent) => groups.entry(parent).or_default().push(record),
          None => debug!("{} {:?} has no parent reference", kind, record.id()),
        }
      }
    }
    Self { by_parent }
  }

  fn children(&self, kind: EntityKind, parent: i64) -> &[&'a Record] {
    self
      .by_parent
      .get(&kind)
      .and_then(|groups| groups.get(&parent))
      .map(Vec::as_slice)
      .unwrap_or_default()
  }

  fn first(&self, kind: EntityKind, parent: i64) -> Option<Record> {
    self.children(kind, parent).first().map(|r| (*r).clone())
  }
}

/// Rebuild the supply tree from the cache.
pub fn build_nested(cache: &EntityCache) -> NestedStructure {
  let index = ChildIndex::new(
    cache,
    &[
      EntityKind::Shipment,
      EntityKind::Delivery,
      EntityKind::Purchase,
      EntityKind::Loading,
      EntityKind::Unloading,
      EntityKind::Nacladnaya,
      EntityKind::Doverennost,
    ],
  );

  cache
    .table(EntityKind::Supply)
    .iter()
    .map(|(&supply_id, supply)| {
      let shipments = index
        .children(EntityKind::Shipment, supply_id)
        .iter()
        .filter_map(|shipment| shipment_entry(cache, &index, shipment))
        .collect();

      let node = SupplyNode {
        supply: supply.clone(),
        deal: supply
          .deal_id()
          .and_then(|id| cache.get(EntityKind::Deal, id))
          .cloned(),
        shipments,
      };
      (supply_id, node)
    })
    .collect()
}

fn shipment_entry(cache: &EntityCache, index: &ChildIndex<'_>, shipment: &Record) -> Option<ShipmentEntry> {
  let shipment_id = shipment.id()?;

  let delivery_block = index
    .children(EntityKind::Delivery, shipment_id)
    .first()
    .and_then(|delivery| delivery_block(cache, index, delivery));

  Some(ShipmentEntry {
    shipment: shipment.clone(),
    delivery_block,
    purchases: index
      .children(EntityKind::Purchase, shipment_id)
      .iter()
      .map(|r| (*r).clone())
      .collect(),
  })
}

fn delivery_block(cache: &EntityCache, index: &ChildIndex<'_>, delivery: &Record) -> Option<DeliveryBlock> {
  let delivery_id = delivery.id()?;

  Some(DeliveryBlock {
    delivery: delivery.clone(),
    loading: index.first(EntityKind::Loading, delivery_id),
    unloading: index.first(EntityKind::Unloading, delivery_id),
    nacladnaya: index.first(EntityKind::Nacladnaya, delivery_id),
    doverennost: index.first(EntityKind::Doverennost, delivery_id),
    marchrutniy_list: cache.get(EntityKind::MarchrutniyList, delivery_id).cloned(),
    contact: driver_of(cache, delivery),
    product_rows: delivery.product_rows(),
  })
}

fn driver_of(cache: &EntityCache, delivery: &Record) -> Option<Record> {
  delivery
    .driver_id()
    .and_then(|id| cache.get(EntityKind::Contact, id))
    .cloned()
}

/// First `kind` record whose FK points at `parent`, in ID order.
fn first_child(cache: &EntityCache, kind: EntityKind, parent: i64) -> Option<Record> {
  cache
    .records(kind)
    .find(|r| r.parent_id(kind) == Some(parent))
    .cloned()
}

/// Resolve one delivery with all of its related records.
pub fn delivery_detail(cache: &EntityCache, delivery_id: i64) -> Result<DeliveryDetail, LookupError> {
  let delivery = cache
    .get(EntityKind::Delivery, delivery_id)
    .ok_or(LookupError::DeliveryNotFound(delivery_id))?;

  let shipment_id = delivery.parent_id(EntityKind::Delivery);
  let shipment = shipment_id.and_then(|id| cache.get(EntityKind::Shipment, id));
  let supply = shipment
    .and_then(|s| s.parent_id(EntityKind::Shipment))
    .and_then(|id| cache.get(EntityKind::Supply, id));
  let deal = supply
    .and_then(Record::deal_id)
    .and_then(|id| cache.get(EntityKind::Deal, id));

  let purchases = match shipment_id {
    Some(id) => cache
      .records(EntityKind::Purchase)
      .filter(|p| p.parent_id(EntityKind::Purchase) == Some(id))
      .cloned()
      .collect(),
    None => Vec::new(),
  };

  Ok(DeliveryDetail {
    delivery: delivery.clone(),
    driver: driver_of(cache, delivery),
    loading: first_child(cache, EntityKind::Loading, delivery_id),
    unloading: first_child(cache, EntityKind::Unloading, delivery_id),
    nacladnaya: first_child(cache, EntityKind::Nacladnaya, delivery_id),
    doverennost: first_child(cache, EntityKind::Doverennost, delivery_id),
    marchrutniy_list: cache.get(EntityKind::MarchrutniyList, delivery_id).cloned(),
    shipment: shipment.cloned(),
    supply: supply.cloned(),
    deal: deal.cloned(),
    purchases,
    product_rows: delivery.product_rows(),
  })
}
