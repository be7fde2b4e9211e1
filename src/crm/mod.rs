pub mod api_types;
pub mod client;
pub mod notify;
pub mod paginate;
pub mod types;

/// REST method names
pub mod methods {
  pub const DEAL_LIST: &str = "crm.deal.list";
  pub const CONTACT_LIST: &str = "crm.contact.list";
  pub const ITEM_LIST: &str = "crm.item.list";
  pub const ITEM_UPDATE: &str = "crm.item.update";
  pub const PRODUCT_ROW_LIST: &str = "crm.item.productrow.list";
  pub const DOCUMENT_LIST: &str = "crm.documentgenerator.document.list";
}
