//! Serde-deserializable types matching CRM REST responses.
//!
//! List methods wrap their records differently: some return a bare array,
//! smart-process methods return `{"items": [...]}`, the document generator
//! returns `{"documents": [...]}` and product rows come back as
//! `{"productRows": [...]}`.

use serde::Deserialize;
use serde_json::Value;

use super::types::{ProductRow, Record};

/// Envelope of every CRM REST response.
#[derive(Debug, Deserialize)]
pub struct ApiResponse {
  #[serde(default)]
  pub result: Value,
  /// Offset of the next page; absent on the final page
  pub next: Option<u64>,
  pub error: Option<String>,
  pub error_description: Option<String>,
}

impl ApiResponse {
  /// Error reported by the CRM in an otherwise well-formed response.
  pub fn error_message(&self) -> Option<String> {
    self.error.as_ref().map(|code| match &self.error_description {
      Some(desc) if !desc.is_empty() => format!("{}: {}", code, desc),
      _ => code.clone(),
    })
  }
}

/// Shape of a list result, checked in fixed priority order.
#[derive(Debug, PartialEq)]
pub enum ResultEnvelope {
  List(Vec<Value>),
  Items(Vec<Value>),
  Documents(Vec<Value>),
  ProductRows(Vec<Value>),
  /// Anything else (null, scalar, object without a known list key)
  Empty,
}

impl ResultEnvelope {
  pub fn decode(result: Value) -> Self {
    match result {
      Value::Array(list) => Self::List(list),
      Value::Object(mut obj) => {
        if let Some(Value::Array(items)) = obj.remove("items") {
          Self::Items(items)
        } else if let Some(Value::Array(docs)) = obj.remove("documents") {
          Self::Documents(docs)
        } else if let Some(Value::Array(rows)) = obj.remove("productRows") {
          Self::ProductRows(rows)
        } else {
          Self::Empty
        }
      }
      _ => Self::Empty,
    }
  }

  pub fn into_records(self) -> Vec<Value> {
    match self {
      Self::List(v) | Self::Items(v) | Self::Documents(v) | Self::ProductRows(v) => v,
      Self::Empty => Vec::new(),
    }
  }
}

// ============================================================================
// Document generator and product rows
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiGeneratedDocument {
  #[serde(deserialize_with = "deserialize_id")]
  pub id: i64,
  #[serde(rename = "pdfUrl")]
  pub pdf_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiProductRow {
  #[serde(rename = "ownerId", deserialize_with = "deserialize_id")]
  pub owner_id: i64,
  #[serde(rename = "productName", default)]
  pub product_name: Value,
  #[serde(default)]
  pub quantity: Value,
  #[serde(rename = "measureName", default)]
  pub measure_name: Value,
}

impl From<ApiProductRow> for ProductRow {
  fn from(row: ApiProductRow) -> Self {
    ProductRow {
      product_name: row.product_name,
      quantity: row.quantity,
      unit: row.measure_name,
    }
  }
}

/// Contact phone entry (`PHONE: [{"VALUE": "+7...", "VALUE_TYPE": "WORK"}]`).
#[derive(Debug, Deserialize)]
pub struct ApiMultiField {
  #[serde(rename = "VALUE", default)]
  pub value: String,
}

/// First phone number of a contact, if any.
pub fn primary_phone(contact: &Record) -> Option<String> {
  let phones: Vec<ApiMultiField> =
    serde_json::from_value(contact.get("PHONE")?.clone()).ok()?;
  phones.into_iter().next().map(|p| p.value)
}

/// IDs arrive as numbers or numeric strings depending on the method.
fn deserialize_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let value = Value::deserialize(deserializer)?;
  super::types::value_as_i64(&value)
    .ok_or_else(|| serde::de::Error::custom(format!("invalid id: {}", value)))
}
