//! Scripted connection and a small typed registry shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::attribute::{Attribute, AttributeSet};
use crate::connection::{Connection, ConnectionPool, MessageId, ProtocolVersion, RawEntry, SearchMessage};
use crate::modification::AttributeChange;
use crate::registry::{MappingError, Registry};
use crate::result::ProtocolError;
use crate::search::WireSearch;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct User {
    pub uid: String,
    pub name: String,
}

impl User {
    pub fn new(uid: &str, name: &str) -> Self {
        Self {
            uid: uid.to_string(),
            name: name.to_string(),
        }
    }
}

/// Maps the domain field `name` onto the wire attribute `cn`, and onto both
/// `cn` and `displayName` when modified.
#[derive(Debug, Default)]
pub(crate) struct UserRegistry;

impl Registry for UserRegistry {
    type Record = User;
    type Value = String;

    fn encode(&self, user: &User) -> Result<AttributeSet, MappingError> {
        let mut attributes = AttributeSet::new();
        attributes.insert("objectClass", ["person"]);
        attributes.insert("uid", [user.uid.as_str()]);
        attributes.insert("cn", [user.name.as_str()]);
        Ok(attributes)
    }

    fn decode(&self, attributes: AttributeSet) -> Result<User, MappingError> {
        let field = |name: &str| {
            attributes
                .first_text(name)
                .map(str::to_string)
                .ok_or_else(|| MappingError::new(format!("missing {name}")))
        };
        Ok(User {
            uid: field("uid")?,
            name: field("cn")?,
        })
    }

    fn translate_filter(&self, filter: &str) -> Result<String, MappingError> {
        let translated = filter.replace("name=", "cn=");
        if translated.starts_with('(') {
            Ok(translated)
        } else {
            Ok(format!("({translated})"))
        }
    }

    fn translate_attribute_names(&self, names: &[String]) -> Result<Vec<String>, MappingError> {
        Ok(names
            .iter()
            .map(|n| if n == "name" { "cn".to_string() } else { n.clone() })
            .collect())
    }

    fn translate_modification(&self, name: &str, value: &String) -> Result<AttributeSet, MappingError> {
        let mut attributes = AttributeSet::new();
        if name == "name" {
            attributes.push(Attribute::new("cn", [value.as_str()]));
            attributes.push(Attribute::new("displayName", [value.as_str()]));
        } else {
            attributes.push(Attribute::new(name, [value.as_str()]));
        }
        Ok(attributes)
    }
}

pub(crate) fn entry(dn: &str, uid: &str, name: &str) -> RawEntry {
    let mut attributes = AttributeSet::new();
    attributes.insert("uid", [uid]);
    attributes.insert("cn", [name]);
    RawEntry {
        dn: dn.to_string(),
        attributes,
        change: None,
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

enum Script {
    Fail(ProtocolError),
    Messages(VecDeque<Result<SearchMessage, ProtocolError>>),
}

struct MockState {
    version: ProtocolVersion,
    log: Vec<String>,
    searches: Vec<WireSearch>,
    modifications: Vec<Vec<AttributeChange>>,
    write_results: VecDeque<Result<(), ProtocolError>>,
    scripts: VecDeque<Script>,
    streams: HashMap<MessageId, VecDeque<Result<SearchMessage, ProtocolError>>>,
    next_id: MessageId,
    acquire_error: Option<ProtocolError>,
    released: usize,
}

/// A pool whose connections replay scripted responses and record every call.
///
/// Searches without a script complete immediately with no entries. A
/// scripted search whose messages run out never completes.
pub(crate) struct MockPool {
    state: Arc<Mutex<MockState>>,
}

impl MockPool {
    pub fn new() -> Arc<Self> {
        Self::with_version(ProtocolVersion::V3)
    }

    pub fn with_version(version: ProtocolVersion) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(MockState {
                version,
                log: Vec::new(),
                searches: Vec::new(),
                modifications: Vec::new(),
                write_results: VecDeque::new(),
                scripts: VecDeque::new(),
                streams: HashMap::new(),
                next_id: 1,
                acquire_error: None,
                released: 0,
            })),
        })
    }

    /// Script the next search: `Err` fails the request itself, `Ok` queues
    /// its messages.
    pub fn push_search(&self, script: Result<Vec<SearchMessage>, ProtocolError>) {
        let script = match script {
            Ok(messages) => Script::Messages(messages.into_iter().map(Ok).collect()),
            Err(e) => Script::Fail(e),
        };
        self.state.lock().scripts.push_back(script);
    }

    /// End the most recently scripted search with a failure.
    pub fn push_search_failure(&self, err: ProtocolError) {
        let mut state = self.state.lock();
        match state.scripts.back_mut() {
            Some(Script::Messages(messages)) => messages.push_back(Err(err)),
            _ => state
                .scripts
                .push_back(Script::Messages(VecDeque::from([Err(err)]))),
        }
    }

    /// Script the result of the next add, delete or modify.
    pub fn push_write_result(&self, result: Result<(), ProtocolError>) {
        self.state.lock().write_results.push_back(result);
    }

    pub fn fail_acquire(&self, err: ProtocolError) {
        self.state.lock().acquire_error = Some(err);
    }

    pub fn released(&self) -> usize {
        self.state.lock().released
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    pub fn searches(&self) -> Vec<WireSearch> {
        self.state.lock().searches.clone()
    }

    pub fn modifications(&self) -> Vec<Vec<AttributeChange>> {
        self.state.lock().modifications.clone()
    }
}

pub(crate) struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    fn write(&self, entry: String) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        state.log.push(entry);
        state.write_results.pop_front().unwrap_or(Ok(()))
    }
}

impl ConnectionPool for MockPool {
    type Connection = MockConnection;

    async fn acquire(&self) -> Result<MockConnection, ProtocolError> {
        if let Some(err) = self.state.lock().acquire_error.clone() {
            return Err(err);
        }
        Ok(MockConnection {
            state: self.state.clone(),
        })
    }

    fn release(&self, _connection: MockConnection) {
        self.state.lock().released += 1;
    }
}

impl Connection for MockConnection {
    fn protocol_version(&self) -> ProtocolVersion {
        self.state.lock().version
    }

    async fn set_protocol_version(&mut self, version: ProtocolVersion) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        state.log.push(format!("set_version {}", u8::from(version)));
        state.version = version;
        Ok(())
    }

    async fn add(&mut self, dn: &str, _attributes: &AttributeSet) -> Result<(), ProtocolError> {
        self.write(format!("add {dn}"))
    }

    async fn delete(&mut self, dn: &str) -> Result<(), ProtocolError> {
        self.write(format!("delete {dn}"))
    }

    async fn modify(&mut self, dn: &str, changes: &[AttributeChange]) -> Result<(), ProtocolError> {
        self.state.lock().modifications.push(changes.to_vec());
        self.write(format!("modify {dn}"))
    }

    async fn search(&mut self, search: &WireSearch) -> Result<MessageId, ProtocolError> {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.log.push(format!("search {id} {}", search.base));
        state.searches.push(search.clone());
        let messages = match state.scripts.pop_front() {
            Some(Script::Fail(err)) => return Err(err),
            Some(Script::Messages(messages)) => messages,
            None => VecDeque::from([Ok(SearchMessage::Done(Vec::new()))]),
        };
        state.streams.insert(id, messages);
        Ok(id)
    }

    async fn next_message(&mut self, id: MessageId) -> Result<SearchMessage, ProtocolError> {
        let next = self
            .state
            .lock()
            .streams
            .get_mut(&id)
            .and_then(VecDeque::pop_front);
        match next {
            Some(message) => message,
            None => std::future::pending().await,
        }
    }

    async fn abandon(&mut self, id: MessageId) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        state.log.push(format!("abandon {id}"));
        state.streams.remove(&id);
        Ok(())
    }
}
