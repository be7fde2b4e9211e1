//! Full cache load from the CRM.
//!
//! Stages run in a fixed order because each one filters on IDs discovered
//! by the one before it:
//!
//! supplies -> deals -> shipments -> deliveries (+ route sheets) ->
//! purchases -> driver contacts -> loading/unloading/waybill/power of
//! attorney (+ document URLs) -> product rows.
//!
//! A stage whose requests fail contributes whatever it managed to fetch;
//! later stages carry on with that.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::cache::EntityCache;
use crate::crm::api_types::{primary_phone, ApiGeneratedDocument, ApiProductRow};
use crate::crm::client::CrmApi;
use crate::crm::methods;
use crate::crm::paginate::{chunked, fetch_all};
use crate::crm::types::{fields, normalize_phone, EntityKind, ProductRow, Record};

/// Deals whose title starts with this are supplies.
pub const SUPPLY_TITLE_PREFIX: &str = "Поставка";

pub struct CacheBuilder<'a, C: CrmApi> {
  api: &'a C,
  page_size: u32,
  chunk_size: usize,
}

impl<'a, C: CrmApi> CacheBuilder<'a, C> {
  pub fn new(api: &'a C, page_size: u32, chunk_size: usize) -> Self {
    Self {
      api,
      page_size,
      chunk_size,
    }
  }

  /// Fetch everything from scratch into a new cache.
  pub async fn build(&self) -> EntityCache {
    let mut cache = EntityCache::new();

    self.load_supplies(&mut cache).await;
    self.load_deals(&mut cache).await;

    self
      .load_children(&mut cache, EntityKind::Shipment, EntityKind::Supply)
      .await;
    self
      .load_children(&mut cache, EntityKind::Delivery, EntityKind::Shipment)
      .await;
    let delivery_ids = cache.ids(EntityKind::Delivery);
    synthesize_route_sheets(&mut cache, &delivery_ids);
    self
      .load_children(&mut cache, EntityKind::Purchase, EntityKind::Shipment)
      .await;

    self.load_driver_contacts(&mut cache).await;

    for kind in [
      EntityKind::Loading,
      EntityKind::Unloading,
      EntityKind::Nacladnaya,
      EntityKind::Doverennost,
    ] {
      self.load_children(&mut cache, kind, EntityKind::Delivery).await;
      if matches!(kind, EntityKind::Nacladnaya | EntityKind::Doverennost) {
        self.attach_document_urls(&mut cache, kind).await;
      }
    }

    self.attach_product_rows(&mut cache).await;

    cache
  }

  async fn load_supplies(&self, cache: &mut EntityCache) {
    info!("Loading supplies (deals titled '{}...')", SUPPLY_TITLE_PREFIX);
    let params = json!({
      "filter": {"title": format!("%{}%", SUPPLY_TITLE_PREFIX)},
      "order": {"ID": "ASC"},
      "select": ["*", "UF_*"],
    });

    // The wildcard filter also matches titles containing the prefix elsewhere
    let supplies = to_records(
      EntityKind::Supply,
      fetch_all(self.api, methods::DEAL_LIST, &params, self.page_size).await,
    )
    .into_iter()
    .filter(|r| {
      r.str_field(fields::TITLE)
        .is_some_and(|t| t.starts_with(SUPPLY_TITLE_PREFIX))
    });

    let stored = cache.bulk_set(EntityKind::Supply, supplies);
    info!("Loaded {} supplies", stored);
  }

  async fn load_deals(&self, cache: &mut EntityCache) {
    let deal_ids: Vec<i64> = cache
      .records(EntityKind::Supply)
      .filter_map(|supply| {
        let id = supply.deal_id();
        if id.is_none() {
          debug!("Supply {:?} has no linked deal", supply.id());
        }
        id
      })
      .collect::<BTreeSet<_>>()
      .into_iter()
      .collect();

    if deal_ids.is_empty() {
      info!("No deals referenced by supplies");
      return;
    }

    for chunk in chunked(&deal_ids, self.chunk_size) {
      let params = json!({
        "filter": {"ID": chunk},
        "order": {"ID": "ASC"},
        "select": ["*", "UF_*"],
      });
      let deals = fetch_all(self.api, methods::DEAL_LIST, &params, self.page_size).await;
      cache.bulk_set(EntityKind::Deal, to_records(EntityKind::Deal, deals));
    }
    info!("Loaded {} deals", cache.len(EntityKind::Deal));
  }

  /// Fetch every `kind` record whose parent FK points at a cached `parent` record.
  async fn load_children(&self, cache: &mut EntityCache, kind: EntityKind, parent: EntityKind) {
    let parent_ids = cache.ids(parent);
    let Some(parent_field) = kind.parent_field() else {
      warn!("{} has no parent field", kind);
      return;
    };
    if parent_ids.is_empty() {
      info!("No {} records to load {} for", parent, kind);
      return;
    }

    let mut loaded = 0;
    let mut processed = 0;
    for chunk in chunked(&parent_ids, self.chunk_size) {
      processed += chunk.len();
      let mut filter = serde_json::Map::new();
      filter.insert(parent_field.to_string(), json!(chunk));
      let records = self.fetch_items(kind, Value::Object(filter)).await;
      loaded += cache.bulk_set(kind, records);
      info!(
        "Loaded {} {} ({} of {} {} processed)",
        loaded,
        kind,
        processed,
        parent_ids.len(),
        parent
      );
    }
  }

  /// List smart-process items of `kind` matching `filter`.
  pub async fn fetch_items(&self, kind: EntityKind, filter: Value) -> Vec<Record> {
    let Some(entity_type_id) = kind.entity_type_id() else {
      warn!("{} is not a smart-process type", kind);
      return Vec::new();
    };

    let params = json!({
      "entityTypeId": entity_type_id,
      "filter": filter,
      "order": {"id": "ASC"},
      "select": ["*", "UF_*"],
    });
    to_records(
      kind,
      fetch_all(self.api, methods::ITEM_LIST, &params, self.page_size).await,
    )
  }

  async fn load_driver_contacts(&self, cache: &mut EntityCache) {
    let mut driver_ids = BTreeSet::new();
    for delivery in cache.records(EntityKind::Delivery) {
      match (delivery.driver_id(), delivery.raw_driver()) {
        (Some(id), _) => {
          driver_ids.insert(id);
        }
        (None, Some(raw)) => warn!("Invalid driver id {} on delivery {:?}", raw, delivery.id()),
        (None, None) => {}
      }
    }

    if driver_ids.is_empty() {
      info!("No driver contacts referenced by deliveries");
      return;
    }
    info!("Loading {} driver contacts", driver_ids.len());

    let driver_ids: Vec<i64> = driver_ids.into_iter().collect();
    for chunk in chunked(&driver_ids, self.chunk_size) {
      let params = json!({
        "filter": {"ID": chunk},
        "select": ["*", "PHONE", "EMAIL"],
      });
      let contacts = to_records(
        EntityKind::Contact,
        fetch_all(self.api, methods::CONTACT_LIST, &params, self.page_size).await,
      )
      .into_iter()
      .map(with_normalized_phone);
      let stored = cache.bulk_set(EntityKind::Contact, contacts);
      info!("Loaded {} driver contacts", stored);
    }
  }

  /// Re-fetch generated PDF links for every cached waybill and power of
  /// attorney.
  pub async fn backfill_document_urls(&self, cache: &mut EntityCache) {
    for kind in [EntityKind::Nacladnaya, EntityKind::Doverennost] {
      self.attach_document_urls(cache, kind).await;
    }
  }

  /// Merge generated PDF links into waybills or powers of attorney.
  async fn attach_document_urls(&self, cache: &mut EntityCache, kind: EntityKind) {
    let Some(entity_type_id) = kind.entity_type_id() else {
      return;
    };
    let ids = cache.ids(kind);
    if ids.is_empty() {
      return;
    }

    let mut attached = 0;
    for chunk in chunked(&ids, self.chunk_size) {
      let params = json!({
        "entityTypeId": entity_type_id,
        "filter": {"id": chunk},
        "order": {"id": "asc"},
      });
      for raw in fetch_all(self.api, methods::DOCUMENT_LIST, &params, self.page_size).await {
        let doc: ApiGeneratedDocument = match serde_json::from_value(raw) {
          Ok(doc) => doc,
          Err(e) => {
            warn!("Skipping malformed {} document: {}", kind, e);
            continue;
          }
        };
        match cache.get_mut(kind, doc.id) {
          Some(record) => {
            record.insert(fields::DOWNLOAD_URL, doc.pdf_url);
            attached += 1;
          }
          None => warn!("Document {} has no cached {}", doc.id, kind),
        }
      }
    }
    info!("Attached {} download URLs to {} {}", attached, ids.len(), kind);
  }

  async fn attach_product_rows(&self, cache: &mut EntityCache) {
    let delivery_ids = cache.ids(EntityKind::Delivery);
    let owner_type = EntityKind::Delivery
      .entity_type_id()
      .map(|id| format!("T{:x}", id))
      .unwrap_or_default();

    // Rows per delivery, created empty on first insert
    let mut grouped: BTreeMap<i64, Vec<ProductRow>> = BTreeMap::new();
    for chunk in chunked(&delivery_ids, self.chunk_size) {
      let params = json!({
        "filter": {"=ownerType": owner_type, "=ownerId": chunk},
      });
      for raw in fetch_all(self.api, methods::PRODUCT_ROW_LIST, &params, self.page_size).await {
        match serde_json::from_value::<ApiProductRow>(raw) {
          Ok(row) => grouped.entry(row.owner_id).or_default().push(row.into()),
          Err(e) => warn!("Skipping malformed product row: {}", e),
        }
      }
    }

    for id in delivery_ids {
      let rows = grouped.remove(&id).unwrap_or_default();
      if let Some(delivery) = cache.get_mut(EntityKind::Delivery, id) {
        let rows: Vec<Value> = rows.into_iter().map(ProductRow::into_value).collect();
        delivery.insert(fields::PRODUCT_ROWS, rows);
      }
    }
  }
}

/// One route sheet per delivery, holding the URL from the delivery's file field.
pub fn synthesize_route_sheets(cache: &mut EntityCache, delivery_ids: &[i64]) {
  for &id in delivery_ids {
    let url = cache
      .get(EntityKind::Delivery, id)
      .and_then(Record::route_sheet_url)
      .map(String::from);
    let mut sheet = Record::default();
    sheet.insert(fields::DOWNLOAD_URL, url);
    cache.insert(EntityKind::MarchrutniyList, id, sheet);
  }
}

/// Replace a contact's phone list with its first number, digits only.
fn with_normalized_phone(mut contact: Record) -> Record {
  let phone = primary_phone(&contact)
    .map(|p| normalize_phone(&p))
    .unwrap_or_default();
  contact.insert(fields::PHONE, phone);
  contact
}

fn to_records(kind: EntityKind, values: Vec<Value>) -> Vec<Record> {
  values
    .into_iter()
    .filter_map(|value| {
      let record = Record::from_value(value);
      if record.is_none() {
        warn!("Skipping non-object {} record", kind);
      }
      record
    })
    .collect()
}
