//! Incremental refresh: notify drivers about ready deliveries, then merge
//! records modified since a timestamp.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::builder::{synthesize_route_sheets, CacheBuilder};
use crate::cache::EntityCache;
use crate::crm::client::CrmApi;
use crate::crm::notify::{DeliveryNotice, NoticeOutcome, Notifier};
use crate::crm::types::{fields, EntityKind, Record};
use crate::drivers::group_by_driver;
use crate::nested::build_nested;

/// Stage of a delivery that is ready to be handed to its driver.
pub const READY_STAGE: &str = "DT1048_9:1";

/// Records modified since the last refresh, per kind.
pub type Updates = Vec<(EntityKind, Vec<Record>)>;

/// Notify about every remote delivery in the ready stage that is not yet
/// listed among its driver's active deliveries.
///
/// The whole remote delivery list is scanned on every call, not only the
/// recently modified part. A ready delivery that already sits in the
/// driver's group under a terminal stage is not considered present and gets
/// notified again.
///
/// Returns the number of notices actually posted. Skipped notices are
/// logged and not counted.
pub async fn notify_ready_deliveries<C: CrmApi, N: Notifier>(
  builder: &CacheBuilder<'_, C>,
  notifier: &N,
  cache: &EntityCache,
) -> usize {
  let remote = builder.fetch_items(EntityKind::Delivery, json!({})).await;
  let ready: Vec<(i64, i64)> = remote
    .iter()
    .filter(|d| d.stage_id() == READY_STAGE)
    .filter_map(|d| Some((d.id()?, d.driver_id()?)))
    .collect();
  if ready.is_empty() {
    return 0;
  }

  let active = group_by_driver(&build_nested(cache), true);
  let mut sent = 0;

  for (delivery_id, driver_id) in ready {
    let already_has = active.get(&driver_id).is_some_and(|group| {
      group
        .deliveries
        .iter()
        .any(|b| b.delivery_id() == Some(delivery_id))
    });
    if already_has {
      continue;
    }

    let notice = DeliveryNotice {
      delivery_id,
      driver_id,
    };
    match notifier.notify(&notice).await {
      Ok(NoticeOutcome::Sent(response)) => {
        info!(
          "Delivery {} for driver {} sent to notification webhook: {}",
          delivery_id, driver_id, response
        );
        sent += 1;
      }
      Ok(NoticeOutcome::Skipped) => info!(
        "Notification for delivery {} skipped: no webhook configured",
        delivery_id
      ),
      Err(e) => error!("Failed to notify about delivery {}: {}", delivery_id, e),
    }
  }

  sent
}

/// Fetch records of every smart-process kind modified at or after `since`.
pub async fn fetch_modified<C: CrmApi>(builder: &CacheBuilder<'_, C>, since: DateTime<Utc>) -> Updates {
  let since = since.to_rfc3339();
  info!("Fetching entities modified since {}", since);

  let mut updates = Updates::new();
  for kind in EntityKind::ITEM_KINDS {
    let records = builder
      .fetch_items(kind, json!({ ">=DATE_MODIFY": since }))
      .await;
    info!("{} {} records modified", records.len(), kind);
    updates.push((kind, records));
  }
  updates
}

/// Upsert fetched records by ID. Nothing is deleted.
///
/// The list endpoint does not return derived fields, so they are carried
/// over from the cached record: product rows on deliveries (`[]` when there
/// were none) and download URLs on waybills and powers of attorney.
/// Merged deliveries also get their route sheet re-derived.
///
/// Returns the number of records merged.
pub fn merge_updates(cache: &mut EntityCache, updates: Updates) -> usize {
  let mut merged = 0;
  for (kind, mut records) in updates {
    match kind {
      EntityKind::Delivery => {
        carry_over(cache, kind, &mut records, fields::PRODUCT_ROWS, Some(json!([])));
        let ids: Vec<i64> = records.iter().filter_map(Record::id).collect();
        merged += cache.bulk_set(kind, records);
        synthesize_route_sheets(cache, &ids);
      }
      EntityKind::Nacladnaya | EntityKind::Doverennost => {
        carry_over(cache, kind, &mut records, fields::DOWNLOAD_URL, None);
        merged += cache.bulk_set(kind, records);
      }
      _ => merged += cache.bulk_set(kind, records),
    }
  }
  merged
}

/// Copy `field` from the cached version of each record that lacks it, or
/// set `fallback` when the cached version has none either.
fn carry_over(
  cache: &EntityCache,
  kind: EntityKind,
  records: &mut [Record],
  field: &str,
  fallback: Option<Value>,
) {
  for record in records.iter_mut().filter(|r| !r.contains(field)) {
    let previous = record
      .id()
      .and_then(|id| cache.get(kind, id))
      .and_then(|cached| cached.get(field))
      .cloned();
    if let Some(value) = previous.or_else(|| fallback.clone()) {
      record.insert(field, value);
    }
  }
}
