//! Search requests, scopes and sort keys.

use serde::{Deserialize, Serialize};

use crate::control::ControlSet;

/// How far below the base a search reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Base,
    #[default]
    OneLevel,
    Subtree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// One attribute in a sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub attribute: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// An ordered list of sort fields; the first field is the primary key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SortKey {
    fields: Vec<SortField>,
}

impl SortKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ascending(attribute: impl Into<String>) -> Self {
        Self::new().then(attribute, SortDirection::Ascending)
    }

    pub fn descending(attribute: impl Into<String>) -> Self {
        Self::new().then(attribute, SortDirection::Descending)
    }

    pub fn then(mut self, attribute: impl Into<String>, direction: SortDirection) -> Self {
        self.fields.push(SortField {
            attribute: attribute.into(),
            direction,
        });
        self
    }

    pub fn fields(&self) -> &[SortField] {
        &self.fields
    }

    pub fn primary(&self) -> Option<&SortField> {
        self.fields.first()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The same key with every field's attribute name replaced by `names`,
    /// position for position.
    pub(crate) fn with_attributes(&self, names: Vec<String>) -> Self {
        Self {
            fields: self
                .fields
                .iter()
                .zip(names)
                .map(|(field, attribute)| SortField {
                    attribute,
                    direction: field.direction,
                })
                .collect(),
        }
    }
}

/// A search as the caller describes it, in domain terms.
///
/// Unset limits and scope fall back to the session's configuration. A size
/// limit of 0 means unlimited.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub base: String,
    pub filter: String,
    pub scope: Option<Scope>,
    /// `None` selects all attributes.
    pub attributes: Option<Vec<String>>,
    pub size_limit: Option<u32>,
    /// Server-side time limit in seconds; 0 means none.
    pub time_limit: Option<u32>,
    pub sort: Option<SortKey>,
    pub batch_size: Option<u32>,
}

impl SearchRequest {
    pub fn new(base: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            filter: filter.into(),
            scope: None,
            attributes: None,
            size_limit: None,
            time_limit: None,
            sort: None,
            batch_size: None,
        }
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn attributes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn size_limit(mut self, limit: u32) -> Self {
        self.size_limit = Some(limit);
        self
    }

    pub fn time_limit(mut self, seconds: u32) -> Self {
        self.time_limit = Some(seconds);
        self
    }

    pub fn sort(mut self, key: SortKey) -> Self {
        self.sort = Some(key);
        self
    }

    /// Append a field to the sort key, creating it if needed.
    pub fn sort_by(mut self, attribute: impl Into<String>, direction: SortDirection) -> Self {
        let key = self.sort.take().unwrap_or_default();
        self.sort = Some(key.then(attribute, direction));
        self
    }

    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// The sort key, if one was given with at least one field.
    pub fn sort_key(&self) -> Option<&SortKey> {
        self.sort.as_ref().filter(|k| !k.is_empty())
    }
}

/// A search in wire terms: filter and attribute names already translated,
/// defaults resolved and controls attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSearch {
    pub base: String,
    pub scope: Scope,
    pub filter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Vec<String>>,
    #[serde(default)]
    pub size_limit: u32,
    #[serde(default)]
    pub time_limit: u32,
    #[serde(default)]
    pub batch_size: u32,
    #[serde(default, skip_serializing_if = "ControlSet::is_empty")]
    pub controls: ControlSet,
}
