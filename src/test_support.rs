//! In-memory CRM and notifier used by unit tests.

use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::crm::api_types::ApiResponse;
use crate::crm::client::CrmApi;
use crate::crm::methods;
use crate::crm::notify::{DeliveryNotice, NoticeOutcome, Notifier};
use crate::crm::types::value_as_i64;

/// Serves list methods from canned datasets, applying ID-list, parent and
/// wildcard filters and offset pagination the way the CRM does.
#[derive(Default)]
pub struct FakeCrm {
  deals: Vec<Value>,
  contacts: Vec<Value>,
  items: HashMap<u64, Vec<Value>>,
  modified: HashMap<u64, Vec<Value>>,
  documents: HashMap<u64, Vec<Value>>,
  product_rows: Vec<Value>,
  /// Method -> number of calls that succeed before every later call fails
  failures: HashMap<String, usize>,
  calls: Mutex<Vec<(String, Value)>>,
}

impl FakeCrm {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_deals(mut self, deals: Vec<Value>) -> Self {
    self.deals = deals;
    self
  }

  pub fn with_contacts(mut self, contacts: Vec<Value>) -> Self {
    self.contacts = contacts;
    self
  }

  pub fn with_items(mut self, entity_type_id: u64, items: Vec<Value>) -> Self {
    self.items.insert(entity_type_id, items);
    self
  }

  /// Records returned for a `>=DATE_MODIFY` filter.
  pub fn with_modified(mut self, entity_type_id: u64, items: Vec<Value>) -> Self {
    self.modified.insert(entity_type_id, items);
    self
  }

  pub fn with_documents(mut self, entity_type_id: u64, documents: Vec<Value>) -> Self {
    self.documents.insert(entity_type_id, documents);
    self
  }

  pub fn with_product_rows(mut self, rows: Vec<Value>) -> Self {
    self.product_rows = rows;
    self
  }

  pub fn fail_after(mut self, method: &str, successes: usize) -> Self {
    self.failures.insert(method.to_string(), successes);
    self
  }

  pub fn failing(self, method: &str) -> Self {
    self.fail_after(method, 0)
  }

  /// Params of every call made to `method`, in order.
  pub fn calls_to(&self, method: &str) -> Vec<Value> {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(m, _)| m == method)
      .map(|(_, p)| p.clone())
      .collect()
  }

  fn respond(&self, method: &str, params: &Value) -> Result<ApiResponse> {
    let filter = params
      .get("filter")
      .and_then(Value::as_object)
      .cloned()
      .unwrap_or_default();
    let type_id = params.get("entityTypeId").and_then(Value::as_u64).unwrap_or(0);

    let (source, envelope): (Vec<Value>, Option<&str>) = match method {
      methods::DEAL_LIST => (self.deals.clone(), None),
      methods::CONTACT_LIST => (self.contacts.clone(), None),
      methods::ITEM_LIST => {
        let source = if filter.contains_key(">=DATE_MODIFY") {
          self.modified.get(&type_id)
        } else {
          self.items.get(&type_id)
        };
        (source.cloned().unwrap_or_default(), Some("items"))
      }
      methods::DOCUMENT_LIST => (
        self.documents.get(&type_id).cloned().unwrap_or_default(),
        Some("documents"),
      ),
      methods::PRODUCT_ROW_LIST => (self.product_rows.clone(), Some("productRows")),
      methods::ITEM_UPDATE => {
        return Ok(response(json!({"item": params.get("fields").cloned()}), None));
      }
      other => return Err(eyre!("Method not found: {}", other)),
    };

    let matching: Vec<Value> = source
      .into_iter()
      .filter(|record| matches_filter(record, &filter))
      .collect();

    let start = params.get("start").and_then(Value::as_u64).unwrap_or(0) as usize;
    let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(50) as usize;
    let total = matching.len();
    let page: Vec<Value> = matching.into_iter().skip(start).take(limit).collect();
    let next = (start + limit < total).then_some((start + limit) as u64);

    let result = match envelope {
      Some(key) => {
        let mut obj = Map::new();
        obj.insert(key.to_string(), Value::Array(page));
        Value::Object(obj)
      }
      None => Value::Array(page),
    };
    Ok(response(result, next))
  }
}

fn response(result: Value, next: Option<u64>) -> ApiResponse {
  ApiResponse {
    result,
    next,
    error: None,
    error_description: None,
  }
}

/// Look a field up exactly, then case-insensitively (`title` vs `TITLE`).
fn field<'a>(record: &'a Value, key: &str) -> Option<&'a Value> {
  let obj = record.as_object()?;
  obj.get(key).or_else(|| {
    obj
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(key))
      .map(|(_, v)| v)
  })
}

fn matches_filter(record: &Value, filter: &Map<String, Value>) -> bool {
  filter.iter().all(|(key, condition)| {
    if key.starts_with(">=") || key == "=ownerType" {
      return true;
    }
    let key = key.trim_start_matches('=');
    let Some(actual) = field(record, key) else {
      return false;
    };
    match condition {
      Value::Array(allowed) => {
        let id = value_as_i64(actual);
        id.is_some() && allowed.iter().any(|v| value_as_i64(v) == id)
      }
      Value::String(pattern) if pattern.contains('%') => {
        let needle = pattern.trim_matches('%');
        actual.as_str().is_some_and(|s| s.contains(needle))
      }
      other => value_as_i64(other).is_some() && value_as_i64(other) == value_as_i64(actual),
    }
  })
}

impl CrmApi for FakeCrm {
  async fn call(&self, method: &str, params: &Value) -> Result<ApiResponse> {
    let method = method.trim_start_matches('/').trim_end_matches(".json");
    let previous = {
      let mut calls = self.calls.lock().unwrap();
      let previous = calls.iter().filter(|(m, _)| m == method).count();
      calls.push((method.to_string(), params.clone()));
      previous
    };

    if let Some(successes) = self.failures.get(method) {
      if previous >= *successes {
        return Err(eyre!("simulated failure of {}", method));
      }
    }

    self.respond(method, params)
  }
}

/// Remembers every notice it is asked to send.
#[derive(Default)]
pub struct RecordingNotifier {
  pub sent: Mutex<Vec<DeliveryNotice>>,
  pub fail: bool,
}

impl RecordingNotifier {
  pub fn failing() -> Self {
    Self {
      fail: true,
      ..Self::default()
    }
  }

  pub fn sent(&self) -> Vec<DeliveryNotice> {
    self.sent.lock().unwrap().clone()
  }
}

impl Notifier for RecordingNotifier {
  async fn notify(&self, notice: &DeliveryNotice) -> Result<NoticeOutcome> {
    self.sent.lock().unwrap().push(notice.clone());
    if self.fail {
      return Err(eyre!("webhook unavailable"));
    }
    Ok(NoticeOutcome::Sent("ok".to_string()))
  }
}

/// Notifier with nowhere to send; every notice is skipped.
pub struct NullNotifier;

impl Notifier for NullNotifier {
  async fn notify(&self, _notice: &DeliveryNotice) -> Result<NoticeOutcome> {
    Ok(NoticeOutcome::Skipped)
  }
}

/// Two supplies, one decoy deal, three shipments, three deliveries with
/// two drivers, and sub-documents for delivery 300.
pub fn sample_crm() -> FakeCrm {
  FakeCrm::new()
    .with_deals(vec![
      json!({"ID": "1", "TITLE": "Поставка щебня", "UF_CRM_1728985624": "90"}),
      json!({"ID": "2", "TITLE": "Поставка песка", "UF_CRM_1728985624": "91"}),
      json!({"ID": "3", "TITLE": "Возврат: Поставка цемента", "UF_CRM_1728985624": "92"}),
      json!({"ID": "90", "TITLE": "Client deal A"}),
      json!({"ID": "91", "TITLE": "Client deal B"}),
    ])
    .with_items(
      1040,
      vec![
        json!({"id": 100, "parentId2": 1, "title": "Shipment 100"}),
        json!({"id": 101, "parentId2": 1, "title": "Shipment 101"}),
        json!({"id": 102, "parentId2": 2, "title": "Shipment 102"}),
        json!({"id": 199, "parentId2": 3, "title": "Decoy shipment"}),
      ],
    )
    .with_items(
      1048,
      vec![
        json!({"id": 300, "parentId1040": 100, "stageId": "DT1048_9:NEW", "ufCrm6_1729602194": "500",
               "ufCrm6_1729602373": {"url": "https://crm/route/300.pdf"}}),
        json!({"id": 301, "parentId1040": 101, "stageId": "DT1048_9:SUCCESS", "ufCrm6_1729602194": 500}),
        json!({"id": 302, "parentId1040": 102, "stageId": "DT1048_9:PREPARATION", "ufCrm6_1729602194": "501"}),
      ],
    )
    .with_items(1044, vec![json!({"id": 400, "parentId1040": 100})])
    .with_items(1060, vec![json!({"id": 600, "parentId1048": 300})])
    .with_items(1056, vec![json!({"id": 610, "parentId1048": 300})])
    .with_items(1064, vec![json!({"id": 620, "parentId1048": 300})])
    .with_items(1068, vec![json!({"id": 630, "parentId1048": 301})])
    .with_documents(1064, vec![json!({"id": "620", "pdfUrl": "https://crm/doc/620.pdf"})])
    .with_documents(1068, vec![json!({"id": 630, "pdfUrl": "https://crm/doc/630.pdf"})])
    .with_contacts(vec![
      json!({"ID": "500", "NAME": "Ivan", "PHONE": [{"VALUE": "+7 (999) 123-45-67"}]}),
      json!({"ID": "501", "NAME": "Petr"}),
    ])
    .with_product_rows(vec![
      json!({"ownerId": 300, "ownerType": "T418", "productName": "Щебень", "quantity": 20, "measureName": "т"}),
      json!({"ownerId": 300, "ownerType": "T418", "productName": "Песок", "quantity": 5, "measureName": "т"}),
    ])
}
