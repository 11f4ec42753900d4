//! In-memory directory tree behind the reference server.
//!
//! Entries live in a `BTreeMap` keyed by normalized DN behind a
//! `parking_lot::RwLock`: searches take the read lock, writes the write lock.
//! Every committed write is published on a broadcast channel so persistent
//! searches can follow changes.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dirsession_core::{
    AttributeChange, AttributeSet, AttributeValue, ChangeKind, Cookie, EntryChange, ModOp,
    PagedResultsRequest, PagedResultsResponse, ProtocolError, RawEntry, ResponseControl,
    ResultCode, Scope, SortDirection, SortField, SortKey, VlvRequest, VlvResponse, VlvTarget,
    WireSearch,
};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::filter::{Filter, compare_values};
use crate::protocol::WireResult;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// First byte of every server-issued paging cookie. Client seek cookies are
/// at most 8 bytes, so a 9-byte cookie with this tag is never a seek.
const SERVER_COOKIE_TAG: u8 = 0xff;

/// A committed change, as published to persistent searches.
#[derive(Debug, Clone)]
pub struct ChangeNotice {
    pub kind: ChangeKind,
    pub dn: String,
    pub previous_dn: Option<String>,
    pub change_number: u64,
    /// The entry after the change; for deletes, the entry as it was.
    pub attributes: AttributeSet,
}

/// Entries, final result and response controls of one search.
#[derive(Debug)]
pub struct SearchOutcome {
    pub entries: Vec<RawEntry>,
    pub result: WireResult,
    pub controls: Vec<ResponseControl>,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    dn: String,
    attributes: AttributeSet,
}

#[derive(Debug, Default)]
struct DirectoryState {
    entries: BTreeMap<String, StoredEntry>,
    maintenance: bool,
    change_number: u64,
}

impl DirectoryState {
    fn check_available(&self) -> Result<(), ProtocolError> {
        if self.maintenance {
            return Err(ProtocolError::new(
                ResultCode::UNAVAILABLE,
                "directory is in maintenance mode",
            ));
        }
        Ok(())
    }
}

/// A shareable handle to one in-memory directory.
#[derive(Clone)]
pub struct Directory {
    state: Arc<RwLock<DirectoryState>>,
    changes: broadcast::Sender<ChangeNotice>,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(DirectoryState::default())),
            changes,
        }
    }

    /// Create a naming context. Unlike [`Directory::add`], its parent need
    /// not exist.
    pub fn add_suffix(&self, dn: &str) -> Result<(), ProtocolError> {
        let key = normalize_dn(dn)?;
        let mut state = self.state.write();
        if state.entries.contains_key(&key) {
            return Ok(());
        }
        let mut attributes = AttributeSet::new();
        attributes.insert("objectClass", ["top"]);
        add_rdn_value(&mut attributes, dn);
        state.entries.insert(
            key,
            StoredEntry {
                dn: dn.trim().to_string(),
                attributes,
            },
        );
        debug!(dn, "naming context created");
        Ok(())
    }

    /// While on, every operation fails with `UNAVAILABLE`.
    pub fn set_maintenance(&self, on: bool) {
        self.state.write().maintenance = on;
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotice> {
        self.changes.subscribe()
    }

    pub fn add(&self, dn: &str, mut attributes: AttributeSet) -> Result<(), ProtocolError> {
        let key = normalize_dn(dn)?;
        let mut state = self.state.write();
        state.check_available()?;
        if state.entries.contains_key(&key) {
            return Err(ProtocolError::new(
                ResultCode::ENTRY_ALREADY_EXISTS,
                format!("entry already exists: {dn}"),
            ));
        }
        let parent_exists = parent_of(&key).is_some_and(|p| state.entries.contains_key(p));
        if !parent_exists {
            return Err(ProtocolError::new(
                ResultCode::NO_SUCH_OBJECT,
                format!("parent of {dn} does not exist"),
            ));
        }

        add_rdn_value(&mut attributes, dn);
        let entry = StoredEntry {
            dn: dn.trim().to_string(),
            attributes,
        };
        self.publish(&mut state, ChangeKind::Add, &entry);
        state.entries.insert(key, entry);
        Ok(())
    }

    pub fn delete(&self, dn: &str) -> Result<(), ProtocolError> {
        let key = normalize_dn(dn)?;
        let mut state = self.state.write();
        state.check_available()?;
        if !state.entries.contains_key(&key) {
            return Err(no_such_object(dn));
        }
        let child_suffix = format!(",{key}");
        if state.entries.keys().any(|k| k.ends_with(&child_suffix)) {
            return Err(ProtocolError::new(
                ResultCode::NOT_ALLOWED_ON_NON_LEAF,
                format!("entry has children: {dn}"),
            ));
        }
        if let Some(entry) = state.entries.remove(&key) {
            self.publish(&mut state, ChangeKind::Delete, &entry);
        }
        Ok(())
    }

    /// Apply all changes or none.
    pub fn modify(&self, dn: &str, changes: &[AttributeChange]) -> Result<(), ProtocolError> {
        let key = normalize_dn(dn)?;
        let mut state = self.state.write();
        state.check_available()?;
        let Some(current) = state.entries.get(&key) else {
            return Err(no_such_object(dn));
        };

        let mut updated = current.clone();
        for change in changes {
            apply_change(&mut updated.attributes, change)?;
        }
        self.publish(&mut state, ChangeKind::Modify, &updated);
        state.entries.insert(key, updated);
        Ok(())
    }

    fn publish(&self, state: &mut DirectoryState, kind: ChangeKind, entry: &StoredEntry) {
        state.change_number += 1;
        debug!(dn = %entry.dn, ?kind, change_number = state.change_number, "change committed");
        // No receivers is not an error.
        let _ = self.changes.send(ChangeNotice {
            kind,
            dn: entry.dn.clone(),
            previous_dn: None,
            change_number: state.change_number,
            attributes: entry.attributes.clone(),
        });
    }

    /// Run a non-persistent search, or the initial phase of a persistent one.
    pub fn search(
        &self,
        search: &WireSearch,
        paging: &mut PagingState,
    ) -> Result<SearchOutcome, ProtocolError> {
        let started = Instant::now();
        let filter = Filter::parse(&search.filter)?;
        let base = normalize_dn(&search.base)?;
        let state = self.state.read();
        state.check_available()?;
        if !state.entries.contains_key(&base) {
            return Err(no_such_object(&search.base));
        }

        let mut matched: Vec<&StoredEntry> = state
            .entries
            .iter()
            .filter(|(key, _)| in_scope(key, &base, search.scope))
            .map(|(_, entry)| entry)
            .filter(|entry| filter.matches(&entry.attributes))
            .collect();
        if search.time_limit > 0
            && started.elapsed() > Duration::from_secs(u64::from(search.time_limit))
        {
            return Err(ProtocolError::new(
                ResultCode::TIME_LIMIT_EXCEEDED,
                "time limit exceeded",
            ));
        }

        let mut controls = Vec::new();
        if let Some(key) = search.controls.sort() {
            sort_entries(&mut matched, key);
            controls.push(ResponseControl::Sort {
                result: ResultCode::SUCCESS,
            });
        }

        let mut selected = if let Some(vlv) = search.controls.vlv() {
            let (window, response) = virtual_list_window(&matched, vlv, search.controls.sort());
            controls.push(ResponseControl::VirtualListView(response));
            window
        } else if let Some(paged) = search.controls.paged() {
            let (page, response) = paging.page(search, &matched, paged)?;
            controls.push(ResponseControl::PagedResults(response));
            page
        } else if search.controls.persistent().is_some_and(|p| p.changes_only) {
            Vec::new()
        } else {
            matched
        };

        let mut result = WireResult::success();
        let limit = search.size_limit as usize;
        if limit > 0 && selected.len() > limit {
            selected.truncate(limit);
            result = ProtocolError::new(ResultCode::SIZE_LIMIT_EXCEEDED, "size limit exceeded").into();
        }

        let entries = selected
            .into_iter()
            .map(|entry| RawEntry {
                dn: entry.dn.clone(),
                attributes: project(&entry.attributes, search.attributes.as_deref()),
                change: None,
            })
            .collect();
        Ok(SearchOutcome {
            entries,
            result,
            controls,
        })
    }
}

/// The entry a persistent search reports for `notice`, if it matches.
pub fn change_entry(search: &WireSearch, filter: &Filter, notice: &ChangeNotice) -> Option<RawEntry> {
    let persistent = search.controls.persistent()?;
    if !persistent.change_types.contains(notice.kind) {
        return None;
    }
    let base = normalize_dn(&search.base).ok()?;
    let dn = normalize_dn(&notice.dn).ok()?;
    if !in_scope(&dn, &base, search.scope) || !filter.matches(&notice.attributes) {
        return None;
    }
    let change = persistent.return_entry_change.then(|| EntryChange {
        kind: notice.kind,
        previous_dn: notice.previous_dn.clone(),
        change_number: Some(notice.change_number),
    });
    Some(RawEntry {
        dn: notice.dn.clone(),
        attributes: project(&notice.attributes, search.attributes.as_deref()),
        change,
    })
}

// ---------------------------------------------------------------------------
// Paged results
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PagedCursor {
    fingerprint: String,
    offset: usize,
}

/// Paged-results positions held for one client connection. Each cookie is
/// valid for exactly one follow-up request with the same search.
#[derive(Debug, Default)]
pub struct PagingState {
    cursors: HashMap<u64, PagedCursor>,
    next_id: u64,
}

impl PagingState {
    pub fn outstanding(&self) -> usize {
        self.cursors.len()
    }

    fn page<'e>(
        &mut self,
        search: &WireSearch,
        matched: &[&'e StoredEntry],
        request: &PagedResultsRequest,
    ) -> Result<(Vec<&'e StoredEntry>, PagedResultsResponse), ProtocolError> {
        let total = matched.len();
        let fingerprint = fingerprint(search);
        let cookie = request.cookie.as_ref().filter(|c| !c.is_empty());

        if request.size == 0 {
            if let Some(id) = cookie.and_then(|c| server_cookie_id(c.as_bytes())) {
                self.cursors.remove(&id);
                debug!(id, "paged results state released");
            }
            return Ok((Vec::new(), response(total, Vec::new())));
        }

        let offset = match cookie {
            None => 0,
            Some(cookie) => match server_cookie_id(cookie.as_bytes()) {
                Some(id) => {
                    self.cursors
                        .remove(&id)
                        .filter(|c| c.fingerprint == fingerprint)
                        .ok_or_else(|| {
                            ProtocolError::new(
                                ResultCode::UNWILLING_TO_PERFORM,
                                "invalid paged results cookie",
                            )
                        })?
                        .offset
                }
                None => seek_offset(cookie.as_bytes())?,
            },
        };

        let start = offset.min(total);
        let end = start.saturating_add(request.size as usize).min(total);
        let next = if end < total {
            let id = self.next_id;
            self.next_id += 1;
            self.cursors.insert(
                id,
                PagedCursor {
                    fingerprint,
                    offset: end,
                },
            );
            let mut bytes = vec![SERVER_COOKIE_TAG];
            bytes.extend_from_slice(&id.to_be_bytes());
            bytes
        } else {
            Vec::new()
        };
        Ok((matched[start..end].to_vec(), response(total, next)))
    }
}

fn response(total: usize, cookie: Vec<u8>) -> PagedResultsResponse {
    PagedResultsResponse {
        size_estimate: u32::try_from(total).unwrap_or(u32::MAX),
        cookie: Cookie::from_server(cookie),
    }
}

fn server_cookie_id(bytes: &[u8]) -> Option<u64> {
    match bytes {
        [SERVER_COOKIE_TAG, rest @ ..] if rest.len() == 8 => {
            let mut id = [0u8; 8];
            id.copy_from_slice(rest);
            Some(u64::from_be_bytes(id))
        }
        _ => None,
    }
}

/// A client-built cookie: the big-endian 0-based rank to start at.
fn seek_offset(bytes: &[u8]) -> Result<usize, ProtocolError> {
    if bytes.len() > 8 {
        return Err(ProtocolError::new(
            ResultCode::UNWILLING_TO_PERFORM,
            "invalid paged results cookie",
        ));
    }
    let rank = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    Ok(usize::try_from(rank).unwrap_or(usize::MAX))
}

fn fingerprint(search: &WireSearch) -> String {
    format!(
        "{}|{:?}|{}|{:?}",
        search.base.to_ascii_lowercase(),
        search.scope,
        search.filter,
        search.controls.sort()
    )
}

// ---------------------------------------------------------------------------
// Sorting and virtual list view
// ---------------------------------------------------------------------------

/// Sort value of an entry: its smallest value ascending, its largest
/// descending.
fn sort_value(entry: &StoredEntry, field: &SortField) -> Option<String> {
    let values = entry
        .attributes
        .get(&field.attribute)?
        .values
        .iter()
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
    match field.direction {
        SortDirection::Ascending => values.min_by(|a, b| compare_values(a, b)),
        SortDirection::Descending => values.max_by(|a, b| compare_values(a, b)),
    }
}

/// Entries missing a sort attribute go last in either direction.
fn sort_entries(entries: &mut [&StoredEntry], key: &SortKey) {
    entries.sort_by(|a, b| {
        for field in key.fields() {
            let ordering = match (sort_value(a, field), sort_value(b, field)) {
                (Some(a), Some(b)) => match field.direction {
                    SortDirection::Ascending => compare_values(&a, &b),
                    SortDirection::Descending => compare_values(&b, &a),
                },
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn virtual_list_window<'e>(
    matched: &[&'e StoredEntry],
    request: &VlvRequest,
    sort: Option<&SortKey>,
) -> (Vec<&'e StoredEntry>, VlvResponse) {
    let total = matched.len();
    let count = u32::try_from(total).unwrap_or(u32::MAX);
    let target = match &request.target {
        VlvTarget::Offset {
            offset: 0,
            ..
        } => {
            return (
                Vec::new(),
                VlvResponse {
                    target_position: 0,
                    content_count: count,
                    result: ResultCode::OFFSET_RANGE_ERROR,
                },
            );
        }
        VlvTarget::Offset {
            offset,
            content_count,
        } => {
            let offset = *offset as usize;
            let estimate = *content_count as usize;
            // Scale the client's offset to the real list size.
            let position = if estimate == 0 || estimate == total {
                offset
            } else {
                ((offset * total + estimate / 2) / estimate).max(1)
            };
            position.min(total + 1)
        }
        VlvTarget::GreaterOrEqual { value } => {
            let field = sort.and_then(SortKey::primary);
            matched
                .iter()
                .position(|entry| {
                    let Some(field) = field else { return false };
                    sort_value(entry, field).is_some_and(|v| {
                        let ordering = compare_values(&v, value);
                        match field.direction {
                            SortDirection::Ascending => ordering != Ordering::Less,
                            SortDirection::Descending => ordering != Ordering::Greater,
                        }
                    })
                })
                .map_or(total + 1, |i| i + 1)
        }
    };

    // 1-based, inclusive.
    let first = target.saturating_sub(request.before as usize).max(1);
    let last = target.saturating_add(request.after as usize).min(total);
    let window = if first <= last {
        matched[first - 1..last].to_vec()
    } else {
        Vec::new()
    };
    (
        window,
        VlvResponse {
            target_position: u32::try_from(target).unwrap_or(u32::MAX),
            content_count: count,
            result: ResultCode::SUCCESS,
        },
    )
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Lowercase each RDN and drop whitespace around separators.
pub fn normalize_dn(dn: &str) -> Result<String, ProtocolError> {
    let trimmed = dn.trim();
    if trimmed.is_empty() {
        return Err(invalid_dn(dn));
    }
    let mut rdns = Vec::new();
    for rdn in trimmed.split(',') {
        let rdn = rdn.trim();
        match rdn.split_once('=') {
            Some((attr, value)) if !attr.trim().is_empty() && !value.trim().is_empty() => {
                rdns.push(format!(
                    "{}={}",
                    attr.trim().to_lowercase(),
                    value.trim().to_lowercase()
                ));
            }
            _ => return Err(invalid_dn(dn)),
        }
    }
    Ok(rdns.join(","))
}

fn parent_of(key: &str) -> Option<&str> {
    key.split_once(',').map(|(_, parent)| parent)
}

fn in_scope(key: &str, base: &str, scope: Scope) -> bool {
    match scope {
        Scope::Base => key == base,
        Scope::OneLevel => parent_of(key) == Some(base),
        Scope::Subtree => {
            key == base
                || key
                    .strip_suffix(base)
                    .is_some_and(|prefix| prefix.ends_with(','))
        }
    }
}

/// Make sure the entry carries the value named in its RDN.
fn add_rdn_value(attributes: &mut AttributeSet, dn: &str) {
    let rdn = dn.trim().split(',').next().unwrap_or_default();
    if let Some((attr, value)) = rdn.split_once('=') {
        let (attr, value) = (attr.trim(), value.trim());
        let present = attributes
            .get(attr)
            .is_some_and(|a| {
                let wanted = AttributeValue::from(value);
                a.values.iter().any(|v| same_value(v, &wanted))
            });
        if !present {
            attributes.insert(attr, [value]);
        }
    }
}

fn project(attributes: &AttributeSet, selection: Option<&[String]>) -> AttributeSet {
    let mut projected = attributes.clone();
    if let Some(selection) = selection {
        projected.retain_selected(selection);
    }
    projected
}

fn same_value(a: &AttributeValue, b: &AttributeValue) -> bool {
    match (a.as_text(), b.as_text()) {
        (Some(a), Some(b)) => compare_values(a, b) == Ordering::Equal,
        _ => a.as_bytes() == b.as_bytes(),
    }
}

fn apply_change(attributes: &mut AttributeSet, change: &AttributeChange) -> Result<(), ProtocolError> {
    let name = change.attribute.name.as_str();
    let values = &change.attribute.values;
    match change.op {
        ModOp::Add => {
            if let Some(existing) = attributes.get(name) {
                if let Some(dup) = values
                    .iter()
                    .find(|v| existing.values.iter().any(|e| same_value(e, v)))
                {
                    return Err(ProtocolError::new(
                        ResultCode::ATTRIBUTE_OR_VALUE_EXISTS,
                        format!("{name} already has value {:?}", dup.as_text().unwrap_or("<binary>")),
                    ));
                }
            }
            attributes.insert(name, values.iter().cloned());
        }
        ModOp::Delete => {
            let Some(existing) = attributes.get_mut(name) else {
                return Err(no_such_attribute(name));
            };
            if values.is_empty() {
                attributes.remove(name);
                return Ok(());
            }
            for value in values {
                let pos = existing
                    .values
                    .iter()
                    .position(|e| same_value(e, value))
                    .ok_or_else(|| no_such_attribute(name))?;
                existing.values.remove(pos);
            }
            if existing.values.is_empty() {
                attributes.remove(name);
            }
        }
        ModOp::Replace => {
            if values.is_empty() {
                attributes.remove(name);
            } else {
                attributes.set(name, values.iter().cloned());
            }
        }
    }
    Ok(())
}

fn no_such_object(dn: &str) -> ProtocolError {
    ProtocolError::new(ResultCode::NO_SUCH_OBJECT, format!("no such entry: {dn}"))
}

fn no_such_attribute(name: &str) -> ProtocolError {
    ProtocolError::new(ResultCode::NO_SUCH_ATTRIBUTE, format!("no such attribute value: {name}"))
}

fn invalid_dn(dn: &str) -> ProtocolError {
    ProtocolError::new(ResultCode::INVALID_DN_SYNTAX, format!("invalid DN: {dn:?}"))
}
