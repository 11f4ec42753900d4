//! Domain modifications and their wire-level form.

use serde::{Deserialize, Serialize};

use crate::attribute::Attribute;
use crate::error::{Error, Result};

/// The kind of change applied to an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModOp {
    Add,
    Delete,
    Replace,
}

impl ModOp {
    /// Decode a numeric operation code (0 = add, 1 = delete, 2 = replace).
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(ModOp::Add),
            1 => Ok(ModOp::Delete),
            2 => Ok(ModOp::Replace),
            other => Err(Error::InvalidArgument(format!(
                "unknown modification operation code: {other}"
            ))),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            ModOp::Add => 0,
            ModOp::Delete => 1,
            ModOp::Replace => 2,
        }
    }
}

/// One domain-level modification: an op applied to a named record field.
#[derive(Debug, Clone, PartialEq)]
pub struct Modification<V> {
    pub op: ModOp,
    pub name: String,
    pub value: V,
}

/// An ordered sequence of modifications for a single entry. The server
/// applies the whole set atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct ModificationSet<V> {
    modifications: Vec<Modification<V>>,
}

impl<V> Default for ModificationSet<V> {
    fn default() -> Self {
        Self {
            modifications: Vec::new(),
        }
    }
}

impl<V> ModificationSet<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, op: ModOp, name: impl Into<String>, value: V) -> &mut Self {
        self.modifications.push(Modification {
            op,
            name: name.into(),
            value,
        });
        self
    }

    /// Add a modification from a numeric op code, failing fast on an
    /// unknown code.
    pub fn add_code(&mut self, code: i32, name: impl Into<String>, value: V) -> Result<&mut Self> {
        let op = ModOp::from_code(code)?;
        Ok(self.add(op, name, value))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Modification<V>> {
        self.modifications.iter()
    }

    pub fn len(&self) -> usize {
        self.modifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modifications.is_empty()
    }
}

/// A wire-level attribute change inside a modify request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    pub op: ModOp,
    pub attribute: Attribute,
}
