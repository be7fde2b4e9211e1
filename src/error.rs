use thiserror::Error;

/// Lookups the caller can act on. Everything else degrades to partial data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LookupError {
  #[error("Delivery {0} not found in cache")]
  DeliveryNotFound(i64),
}
