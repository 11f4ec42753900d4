//! The attribute codec boundary.
//!
//! The session never inspects record fields or builds filter syntax itself.
//! Everything that turns domain terms into wire terms goes through a
//! [`Registry`].

use thiserror::Error;

use crate::attribute::{Attribute, AttributeSet};

/// A failure reported by a [`Registry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct MappingError(pub String);

impl MappingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Converts domain records to attribute sets and back, and translates
/// logical filters and attribute names into their wire form.
pub trait Registry: Send + Sync {
    /// The domain record type produced by searches.
    type Record: Send;
    /// The value type carried by a domain modification.
    type Value: Send + Sync;

    fn encode(&self, record: &Self::Record) -> Result<AttributeSet, MappingError>;

    fn decode(&self, attributes: AttributeSet) -> Result<Self::Record, MappingError>;

    fn translate_filter(&self, filter: &str) -> Result<String, MappingError>;

    fn translate_attribute_names(&self, names: &[String]) -> Result<Vec<String>, MappingError>;

    /// Expand one domain modification into the wire-level attributes it
    /// touches. Every returned attribute receives the modification's op.
    fn translate_modification(
        &self,
        name: &str,
        value: &Self::Value,
    ) -> Result<AttributeSet, MappingError>;
}

/// A pass-through registry whose records are raw attribute sets.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttributeRegistry;

impl Registry for AttributeRegistry {
    type Record = AttributeSet;
    type Value = Vec<String>;

    fn encode(&self, record: &AttributeSet) -> Result<AttributeSet, MappingError> {
        Ok(record.clone())
    }

    fn decode(&self, attributes: AttributeSet) -> Result<AttributeSet, MappingError> {
        Ok(attributes)
    }

    fn translate_filter(&self, filter: &str) -> Result<String, MappingError> {
        Ok(filter.to_string())
    }

    fn translate_attribute_names(&self, names: &[String]) -> Result<Vec<String>, MappingError> {
        Ok(names.to_vec())
    }

    fn translate_modification(
        &self,
        name: &str,
        value: &Vec<String>,
    ) -> Result<AttributeSet, MappingError> {
        Ok(std::iter::once(Attribute::new(name, value.iter().cloned())).collect())
    }
}
