//! Domain types for CRM entities.
//!
//! Records are kept exactly as the CRM returns them. Field names are not
//! uniform across entity kinds (`ID`/`TITLE` on deals and contacts,
//! `id`/`parentId1040` on smart-process items), so accessors take the
//! field name and the well-known names live in [`fields`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Well-known field names used to stitch entities together.
pub mod fields {
  /// Deal ID referenced by a supply
  pub const SUPPLY_DEAL: &str = "UF_CRM_1728985624";
  /// Driver contact ID referenced by a delivery
  pub const DELIVERY_DRIVER: &str = "ufCrm6_1729602194";
  /// Route sheet file object on a delivery (`{"url": ...}`)
  pub const DELIVERY_ROUTE_SHEET: &str = "ufCrm6_1729602373";
  pub const STAGE_ID: &str = "stageId";
  pub const TITLE: &str = "TITLE";
  pub const PHONE: &str = "PHONE";
  pub const PRODUCT_ROWS: &str = "product_rows";
  pub const DOWNLOAD_URL: &str = "downloadUrl";
}

/// Every table held by the entity cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
  Supply,
  Deal,
  Shipment,
  Delivery,
  Purchase,
  Loading,
  Unloading,
  /// Waybill
  Nacladnaya,
  /// Power of attorney
  Doverennost,
  /// Route sheet, synthesized from deliveries
  MarchrutniyList,
  Contact,
}

impl EntityKind {
  pub const ALL: [EntityKind; 11] = [
    EntityKind::Delivery,
    EntityKind::Shipment,
    EntityKind::Purchase,
    EntityKind::Unloading,
    EntityKind::Loading,
    EntityKind::Deal,
    EntityKind::Supply,
    EntityKind::Contact,
    EntityKind::Nacladnaya,
    EntityKind::Doverennost,
    EntityKind::MarchrutniyList,
  ];

  /// Smart-process kinds fetched through `crm.item.list`, in refresh order.
  pub const ITEM_KINDS: [EntityKind; 7] = [
    EntityKind::Shipment,
    EntityKind::Purchase,
    EntityKind::Delivery,
    EntityKind::Unloading,
    EntityKind::Loading,
    EntityKind::Nacladnaya,
    EntityKind::Doverennost,
  ];

  pub fn name(self) -> &'static str {
    match self {
      Self::Supply => "supply",
      Self::Deal => "deal",
      Self::Shipment => "shipment",
      Self::Delivery => "delivery",
      Self::Purchase => "purchase",
      Self::Loading => "loading",
      Self::Unloading => "unloading",
      Self::Nacladnaya => "nacladnaya",
      Self::Doverennost => "doverennost",
      Self::MarchrutniyList => "marchrutniy_list",
      Self::Contact => "contact",
    }
  }

  /// CRM smart-process type ID, for kinds served by `crm.item.*`.
  pub fn entity_type_id(self) -> Option<u32> {
    match self {
      Self::Shipment => Some(1040),
      Self::Purchase => Some(1044),
      Self::Delivery => Some(1048),
      Self::Unloading => Some(1056),
      Self::Loading => Some(1060),
      Self::Nacladnaya => Some(1064),
      Self::Doverennost => Some(1068),
      _ => None,
    }
  }

  /// Foreign-key field pointing at this kind's parent record.
  pub fn parent_field(self) -> Option<&'static str> {
    match self {
      Self::Shipment => Some("parentId2"),
      Self::Delivery | Self::Purchase => Some("parentId1040"),
      Self::Loading | Self::Unloading | Self::Nacladnaya | Self::Doverennost => {
        Some("parentId1048")
      }
      _ => None,
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for EntityKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|kind| kind.name() == s)
      .ok_or_else(|| format!("unknown entity type '{}'", s))
  }
}

/// A CRM record: an open JSON object with its original field names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
  /// Build a record from a JSON value; non-objects yield `None`.
  pub fn from_value(value: Value) -> Option<Self> {
    match value {
      Value::Object(map) => Some(Self(map)),
      _ => None,
    }
  }

  pub fn get(&self, field: &str) -> Option<&Value> {
    self.0.get(field)
  }

  pub fn insert(&mut self, field: &str, value: impl Into<Value>) {
    self.0.insert(field.to_string(), value.into());
  }

  pub fn contains(&self, field: &str) -> bool {
    self.0.contains_key(field)
  }

  /// The record's own numeric ID (`id` on items, `ID` on deals and contacts).
  pub fn id(&self) -> Option<i64> {
    self.int_field("id").or_else(|| self.int_field("ID"))
  }

  /// Read a field as an integer. Numeric strings are accepted.
  pub fn int_field(&self, field: &str) -> Option<i64> {
    self.get(field).and_then(value_as_i64)
  }

  pub fn str_field(&self, field: &str) -> Option<&str> {
    self.get(field).and_then(Value::as_str)
  }

  /// Parent record ID according to `kind`'s foreign-key field.
  pub fn parent_id(&self, kind: EntityKind) -> Option<i64> {
    kind.parent_field().and_then(|field| self.int_field(field))
  }

  /// Driver contact assigned to a delivery. Empty and zero values mean unassigned.
  pub fn driver_id(&self) -> Option<i64> {
    self.int_field(fields::DELIVERY_DRIVER).filter(|id| *id != 0)
  }

  /// Raw driver field, for reporting values that fail to parse.
  pub fn raw_driver(&self) -> Option<&Value> {
    self
      .get(fields::DELIVERY_DRIVER)
      .filter(|v| !is_blank(v))
  }

  pub fn stage_id(&self) -> &str {
    self.str_field(fields::STAGE_ID).unwrap_or_default()
  }

  /// Deal linked to a supply.
  pub fn deal_id(&self) -> Option<i64> {
    self.int_field(fields::SUPPLY_DEAL)
  }

  /// URL nested inside a delivery's route sheet file field.
  pub fn route_sheet_url(&self) -> Option<&str> {
    self
      .get(fields::DELIVERY_ROUTE_SHEET)
      .and_then(|v| v.get("url"))
      .and_then(Value::as_str)
  }

  pub fn product_rows(&self) -> Vec<Value> {
    self
      .get(fields::PRODUCT_ROWS)
      .and_then(Value::as_array)
      .cloned()
      .unwrap_or_default()
  }
}

fn is_blank(value: &Value) -> bool {
  match value {
    Value::Null => true,
    Value::String(s) => s.trim().is_empty(),
    Value::Bool(b) => !b,
    Value::Number(n) => n.as_i64() == Some(0),
    _ => false,
  }
}

/// Interpret a JSON value as an integer ID.
pub fn value_as_i64(value: &Value) -> Option<i64> {
  match value {
    Value::Number(n) => n
      .as_i64()
      .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

/// Strip everything but digits from a phone number.
pub fn normalize_phone(raw: &str) -> String {
  raw.chars().filter(char::is_ascii_digit).collect()
}

/// Summary of a product line item attached to a delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductRow {
  pub product_name: Value,
  pub quantity: Value,
  pub unit: Value,
}

impl ProductRow {
  pub fn into_value(self) -> Value {
    serde_json::json!({
      "product_name": self.product_name,
      "quantity": self.quantity,
      "unit": self.unit,
    })
  }
}
