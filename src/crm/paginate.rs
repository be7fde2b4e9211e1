//! Offset pagination over CRM list methods.

use serde_json::Value;
use tracing::{debug, error};

use super::api_types::ResultEnvelope;
use super::client::CrmApi;

/// Fetch every page of a list method.
///
/// Each request carries `start`/`limit`; the CRM reports the offset of the
/// following page as `next` and omits it on the last page. A failed request
/// ends the loop and returns the records gathered so far.
pub async fn fetch_all<C: CrmApi>(api: &C, method: &str, params: &Value, page_size: u32) -> Vec<Value> {
  let mut all_records = Vec::new();
  let mut start = 0u64;

  loop {
    let mut page_params = params.clone();
    if let Some(obj) = page_params.as_object_mut() {
      obj.insert("start".into(), start.into());
      obj.insert("limit".into(), page_size.into());
    }

    let response = match api.call(method, &page_params).await {
      Ok(response) => response,
      Err(e) => {
        error!("Request {} failed at offset {}: {}", method, start, e);
        break;
      }
    };

    let records = ResultEnvelope::decode(response.result).into_records();
    debug!("{} offset {}: {} records", method, start, records.len());
    all_records.extend(records);

    match response.next {
      // Guard against a server echoing the same offset forever
      Some(next) if next > start => start = next,
      _ => break,
    }
  }

  all_records
}

/// Split IDs into request-sized chunks.
pub fn chunked<T: Clone>(ids: &[T], size: usize) -> impl Iterator<Item = Vec<T>> + '_ {
  ids.chunks(size.max(1)).map(<[T]>::to_vec)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::FakeCrm;
  use serde_json::json;

  fn deliveries(n: i64) -> Vec<Value> {
    (1..=n)
      .map(|id| json!({"id": id, "parentId1040": 1, "stageId": "DT1048_9:NEW"}))
      .collect()
  }

  #[tokio::test]
  async fn test_fetch_all_follows_next() {
    let crm = FakeCrm::new().with_items(1048, deliveries(7));

    let records = fetch_all(&crm, "crm.item.list", &json!({"entityTypeId": 1048}), 3).await;

    assert_eq!(records.len(), 7);
    assert_eq!(crm.calls_to("crm.item.list").len(), 3);
    let offsets: Vec<_> = crm
      .calls_to("crm.item.list")
      .iter()
      .map(|p| p["start"].as_u64().unwrap())
      .collect();
    assert_eq!(offsets, vec![0, 3, 6]);
  }

  #[tokio::test]
  async fn test_fetch_all_returns_partial_results_on_failure() {
    let crm = FakeCrm::new()
      .with_items(1048, deliveries(5))
      .fail_after("crm.item.list", 1);

    let records = fetch_all(&crm, "crm.item.list", &json!({"entityTypeId": 1048}), 2).await;

    assert_eq!(records.len(), 2);
  }

  #[tokio::test]
  async fn test_fetch_all_unwraps_plain_lists() {
    let crm = FakeCrm::new().with_deals(vec![
      json!({"ID": "1", "TITLE": "Поставка 1"}),
      json!({"ID": "2", "TITLE": "Поставка 2"}),
    ]);

    let records = fetch_all(&crm, "crm.deal.list", &json!({"filter": {}}), 50).await;

    assert_eq!(records.len(), 2);
  }

  #[test]
  fn test_chunked() {
    let ids: Vec<i64> = (1..=5).collect();
    let chunks: Vec<_> = chunked(&ids, 2).collect();
    assert_eq!(chunks, vec![vec![1, 2], vec![3, 4], vec![5]]);
    assert_eq!(chunked(&ids, 0).count(), 5);
  }
}
