//! Optional server controls attached to a search.
//!
//! Sort, virtual list view, paged results and persistent search are modeled
//! as tagged variants rather than distinct search types. A [`ControlSet`]
//! only holds controls that were asked for, and rejects incompatible
//! combinations when it is built.

use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::cookie::Cookie;
use crate::error::{Error, Result};
use crate::result::ResultCode;
use crate::search::SortKey;

/// Where a virtual list view window is anchored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum VlvTarget {
    /// A 1-based rank. `content_count` is the client's estimate of the list
    /// size, 0 when unknown; the server scales `offset` when it differs.
    Offset { offset: u32, content_count: u32 },
    /// The first entry whose primary sort value is at or after `value`.
    GreaterOrEqual { value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlvRequest {
    pub before: u32,
    pub after: u32,
    pub target: VlvTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagedResultsRequest {
    /// Page size. A size of 0 with a cookie releases the server's state.
    pub size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<Cookie>,
}

/// A bit set of change kinds a persistent search reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeTypes(u8);

impl ChangeTypes {
    pub const ADD: ChangeTypes = ChangeTypes(1);
    pub const DELETE: ChangeTypes = ChangeTypes(2);
    pub const MODIFY: ChangeTypes = ChangeTypes(4);
    pub const MOD_DN: ChangeTypes = ChangeTypes(8);

    pub const fn all() -> Self {
        ChangeTypes(1 | 2 | 4 | 8)
    }

    pub const fn empty() -> Self {
        ChangeTypes(0)
    }

    pub fn contains(self, kind: ChangeKind) -> bool {
        self.0 & kind.flag().0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for ChangeTypes {
    fn default() -> Self {
        Self::all()
    }
}

impl BitOr for ChangeTypes {
    type Output = ChangeTypes;

    fn bitor(self, rhs: Self) -> Self {
        ChangeTypes(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Add,
    Delete,
    Modify,
    ModDn,
}

impl ChangeKind {
    pub fn flag(self) -> ChangeTypes {
        match self {
            ChangeKind::Add => ChangeTypes::ADD,
            ChangeKind::Delete => ChangeTypes::DELETE,
            ChangeKind::Modify => ChangeTypes::MODIFY,
            ChangeKind::ModDn => ChangeTypes::MOD_DN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentSearchRequest {
    #[serde(default)]
    pub change_types: ChangeTypes,
    /// Skip the initial result set and report only later changes.
    #[serde(default)]
    pub changes_only: bool,
    /// Attach an entry-change notice to every reported entry.
    #[serde(default)]
    pub return_entry_change: bool,
}

/// The entry-change notice attached to a persistent search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryChange {
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_dn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_number: Option<u64>,
}

/// A control sent with a search request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestControl {
    Sort { key: SortKey },
    VirtualListView(VlvRequest),
    PagedResults(PagedResultsRequest),
    PersistentSearch(PersistentSearchRequest),
}

impl RequestControl {
    fn name(&self) -> &'static str {
        match self {
            RequestControl::Sort { .. } => "sort",
            RequestControl::VirtualListView(_) => "virtual list view",
            RequestControl::PagedResults(_) => "paged results",
            RequestControl::PersistentSearch(_) => "persistent search",
        }
    }

    /// Whether this control shapes the result set (at most one per search).
    fn is_exclusive(&self) -> bool {
        !matches!(self, RequestControl::Sort { .. })
    }
}

/// A validated set of request controls.
///
/// At most one of virtual list view, paged results and persistent search may
/// be present. Virtual list view requires a sort control, and a persistent
/// search cannot be sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlSet {
    controls: Vec<RequestControl>,
}

impl ControlSet {
    pub fn new(controls: Vec<RequestControl>) -> Result<Self> {
        for (i, control) in controls.iter().enumerate() {
            if controls[..i]
                .iter()
                .any(|c| std::mem::discriminant(c) == std::mem::discriminant(control))
            {
                return Err(Error::UnsupportedOperation(format!(
                    "duplicate {} control",
                    control.name()
                )));
            }
            if matches!(control, RequestControl::Sort { key } if key.is_empty()) {
                return Err(Error::UnsupportedOperation(
                    "sort control requires at least one sort field".to_string(),
                ));
            }
        }

        let exclusive: Vec<&str> = controls
            .iter()
            .filter(|c| c.is_exclusive())
            .map(RequestControl::name)
            .collect();
        if exclusive.len() > 1 {
            return Err(Error::UnsupportedOperation(format!(
                "controls cannot be combined: {}",
                exclusive.join(", ")
            )));
        }

        let set = Self { controls };
        if set.vlv().is_some() && set.sort().is_none() {
            return Err(Error::UnsupportedOperation(
                "virtual list view requires a sort key".to_string(),
            ));
        }
        if set.persistent().is_some() && set.sort().is_some() {
            return Err(Error::UnsupportedOperation(
                "persistent search cannot be sorted".to_string(),
            ));
        }
        Ok(set)
    }

    pub fn sort(&self) -> Option<&SortKey> {
        self.controls.iter().find_map(|c| match c {
            RequestControl::Sort { key } => Some(key),
            _ => None,
        })
    }

    pub fn vlv(&self) -> Option<&VlvRequest> {
        self.controls.iter().find_map(|c| match c {
            RequestControl::VirtualListView(v) => Some(v),
            _ => None,
        })
    }

    pub fn paged(&self) -> Option<&PagedResultsRequest> {
        self.controls.iter().find_map(|c| match c {
            RequestControl::PagedResults(p) => Some(p),
            _ => None,
        })
    }

    pub fn persistent(&self) -> Option<&PersistentSearchRequest> {
        self.controls.iter().find_map(|c| match c {
            RequestControl::PersistentSearch(p) => Some(p),
            _ => None,
        })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RequestControl> {
        self.controls.iter()
    }

    pub fn len(&self) -> usize {
        self.controls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlvResponse {
    /// 1-based rank of the target entry.
    pub target_position: u32,
    /// The server's current estimate of the list size.
    pub content_count: u32,
    pub result: ResultCode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagedResultsResponse {
    #[serde(default)]
    pub size_estimate: u32,
    /// Empty when the result set is exhausted.
    pub cookie: Cookie,
}

/// A control returned with the final result of a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseControl {
    Sort { result: ResultCode },
    VirtualListView(VlvResponse),
    PagedResults(PagedResultsResponse),
}

impl ResponseControl {
    pub fn find_sort(controls: &[ResponseControl]) -> Option<ResultCode> {
        controls.iter().find_map(|c| match c {
            ResponseControl::Sort { result } => Some(*result),
            _ => None,
        })
    }

    pub fn find_vlv(controls: &[ResponseControl]) -> Option<&VlvResponse> {
        controls.iter().find_map(|c| match c {
            ResponseControl::VirtualListView(v) => Some(v),
            _ => None,
        })
    }

    pub fn find_paged(controls: &[ResponseControl]) -> Option<&PagedResultsResponse> {
        controls.iter().find_map(|c| match c {
            ResponseControl::PagedResults(p) => Some(p),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sort() -> RequestControl {
        RequestControl::Sort {
            key: SortKey::ascending("uid"),
        }
    }

    fn vlv() -> RequestControl {
        RequestControl::VirtualListView(VlvRequest {
            before: 0,
            after: 9,
            target: VlvTarget::Offset {
                offset: 1,
                content_count: 0,
            },
        })
    }

    fn paged() -> RequestControl {
        RequestControl::PagedResults(PagedResultsRequest {
            size: 10,
            cookie: None,
        })
    }

    fn persistent() -> RequestControl {
        RequestControl::PersistentSearch(PersistentSearchRequest {
            change_types: ChangeTypes::all(),
            changes_only: true,
            return_entry_change: true,
        })
    }

    #[test]
    fn test_only_requested_controls_are_present() {
        let set = ControlSet::new(vec![paged()]).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.sort().is_none());
        assert!(set.paged().is_some());

        let set = ControlSet::new(vec![sort(), paged()]).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_exclusive_controls_are_rejected() {
        for controls in [
            vec![sort(), vlv(), paged()],
            vec![paged(), persistent()],
            vec![sort(), vlv(), persistent()],
        ] {
            let err = ControlSet::new(controls).unwrap_err();
            assert!(matches!(err, Error::UnsupportedOperation(_)));
        }
    }

    #[test]
    fn test_vlv_requires_sort() {
        assert!(matches!(
            ControlSet::new(vec![vlv()]),
            Err(Error::UnsupportedOperation(_))
        ));
        assert!(ControlSet::new(vec![sort(), vlv()]).is_ok());
    }

    #[test]
    fn test_persistent_search_cannot_be_sorted() {
        assert!(matches!(
            ControlSet::new(vec![sort(), persistent()]),
            Err(Error::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_duplicates_and_empty_sort_rejected() {
        assert!(ControlSet::new(vec![sort(), sort()]).is_err());
        let empty = RequestControl::Sort {
            key: SortKey::new(),
        };
        assert!(ControlSet::new(vec![empty]).is_err());
    }

    #[test]
    fn test_change_types() {
        let types = ChangeTypes::ADD | ChangeTypes::DELETE;
        assert!(types.contains(ChangeKind::Add));
        assert!(!types.contains(ChangeKind::Modify));
        assert!(ChangeTypes::all().contains(ChangeKind::ModDn));
    }

    #[test]
    fn test_wire_form_of_controls() {
        let set = ControlSet::new(vec![sort(), paged()]).unwrap();
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json[0]["type"], "sort");
        assert_eq!(json[0]["key"][0]["attribute"], "uid");
        assert_eq!(json[1]["type"], "paged_results");
        assert_eq!(json[1]["size"], 10);
    }
}
