//! Attribute sets: the wire-level representation of a directory entry.

use serde::{Deserialize, Serialize};

/// A single attribute value, either text or raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Text(String),
    Binary(Vec<u8>),
}

impl AttributeValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            AttributeValue::Binary(_) => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AttributeValue::Text(s) => s.as_bytes(),
            AttributeValue::Binary(b) => b,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::Text(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::Text(s)
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(b: Vec<u8>) -> Self {
        AttributeValue::Binary(b)
    }
}

/// A named attribute with zero or more values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(default)]
    pub values: Vec<AttributeValue>,
}

impl Attribute {
    pub fn new<N, I, V>(name: N, values: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = V>,
        V: Into<AttributeValue>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Case-insensitive name comparison.
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// An ordered mapping from attribute name to values.
///
/// Names are unique within a set under ASCII case folding. Insertion order is
/// preserved, and inserting under a name that differs only by case merges the
/// values into the existing attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Attribute>", into = "Vec<Attribute>")]
pub struct AttributeSet {
    attributes: Vec<Attribute>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add values under `name`, merging with an existing attribute of the
    /// same (case-insensitive) name.
    pub fn insert<N, I, V>(&mut self, name: N, values: I)
    where
        N: Into<String>,
        I: IntoIterator<Item = V>,
        V: Into<AttributeValue>,
    {
        self.push(Attribute::new(name, values));
    }

    /// Add a whole attribute, merging with an existing one of the same name.
    pub fn push(&mut self, attribute: Attribute) {
        match self.get_mut(&attribute.name) {
            Some(existing) => existing.values.extend(attribute.values),
            None => self.attributes.push(attribute),
        }
    }

    /// Replace all values of `name`, or add the attribute if absent.
    pub fn set<N, I, V>(&mut self, name: N, values: I)
    where
        N: Into<String>,
        I: IntoIterator<Item = V>,
        V: Into<AttributeValue>,
    {
        let attribute = Attribute::new(name, values);
        match self.get_mut(&attribute.name) {
            Some(existing) => existing.values = attribute.values,
            None => self.attributes.push(attribute),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.is_named(name))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.attributes.iter_mut().find(|a| a.is_named(name))
    }

    pub fn remove(&mut self, name: &str) -> Option<Attribute> {
        let pos = self.attributes.iter().position(|a| a.is_named(name))?;
        Some(self.attributes.remove(pos))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// First text value of `name`, if any.
    pub fn first_text(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|a| a.values.first())
            .and_then(AttributeValue::as_text)
    }

    /// All text values of `name`; binary values are skipped.
    pub fn texts(&self, name: &str) -> Vec<&str> {
        self.get(name)
            .map(|a| a.values.iter().filter_map(AttributeValue::as_text).collect())
            .unwrap_or_default()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|a| a.name.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Attribute> {
        self.attributes.iter()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Keep only the selected attribute names. `*` keeps everything and
    /// `1.1` keeps nothing.
    pub fn retain_selected(&mut self, selection: &[String]) {
        if selection.iter().any(|s| s == "*") {
            return;
        }
        self.attributes
            .retain(|a| selection.iter().any(|s| a.is_named(s)));
    }
}

impl IntoIterator for AttributeSet {
    type Item = Attribute;
    type IntoIter = std::vec::IntoIter<Attribute>;

    fn into_iter(self) -> Self::IntoIter {
        self.attributes.into_iter()
    }
}

impl<'a> IntoIterator for &'a AttributeSet {
    type Item = &'a Attribute;
    type IntoIter = std::slice::Iter<'a, Attribute>;

    fn into_iter(self) -> Self::IntoIter {
        self.attributes.iter()
    }
}

impl FromIterator<Attribute> for AttributeSet {
    fn from_iter<T: IntoIterator<Item = Attribute>>(iter: T) -> Self {
        let mut set = AttributeSet::new();
        for attribute in iter {
            set.push(attribute);
        }
        set
    }
}

impl From<Vec<Attribute>> for AttributeSet {
    fn from(attributes: Vec<Attribute>) -> Self {
        attributes.into_iter().collect()
    }
}

impl From<AttributeSet> for Vec<Attribute> {
    fn from(set: AttributeSet) -> Self {
        set.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_merges_case_insensitively() {
        let mut set = AttributeSet::new();
        set.insert("mail", ["a@example.com"]);
        set.insert("MAIL", ["b@example.com"]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.texts("Mail"), vec!["a@example.com", "b@example.com"]);
        // The first spelling wins.
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["mail"]);
    }

    #[test]
    fn test_decoding_merges_names_differing_in_case() {
        let json = r#"[{"name":"cn","values":["a"]},{"name":"CN","values":["b"]}]"#;
        let set: AttributeSet = serde_json::from_str(json).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.texts("cn"), vec!["a", "b"]);
        assert_eq!(
            serde_json::to_string(&set).unwrap(),
            r#"[{"name":"cn","values":["a","b"]}]"#
        );
    }

    #[test]
    fn test_set_replaces_values() {
        let mut set = AttributeSet::new();
        set.insert("cn", ["Alice"]);
        set.set("CN", ["Alice Smith"]);
        assert_eq!(set.first_text("cn"), Some("Alice Smith"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_order_is_preserved() {
        let mut set = AttributeSet::new();
        set.insert("uid", ["u1"]);
        set.insert("cn", ["c1"]);
        set.insert("sn", ["s1"]);
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["uid", "cn", "sn"]);
    }

    #[test]
    fn test_retain_selected() {
        let mut set = AttributeSet::new();
        set.insert("uid", ["u1"]);
        set.insert("cn", ["c1"]);
        set.insert("sn", ["s1"]);

        let mut all = set.clone();
        all.retain_selected(&["*".to_string()]);
        assert_eq!(all.len(), 3);

        let mut none = set.clone();
        none.retain_selected(&["1.1".to_string()]);
        assert!(none.is_empty());

        set.retain_selected(&["CN".to_string(), "uid".to_string()]);
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["uid", "cn"]);
    }

    #[test]
    fn test_binary_values_are_not_text() {
        let mut set = AttributeSet::new();
        set.insert("jpegPhoto", [vec![0xffu8, 0xd8]]);
        assert_eq!(set.first_text("jpegPhoto"), None);
        assert_eq!(set.get("jpegphoto").unwrap().values[0].as_bytes(), &[0xff, 0xd8]);
    }
}
