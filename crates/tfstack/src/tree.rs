//! nested view over flat, dot-separated keys
//!
//! The provisioner reports outputs as a flat map. Expressions address them as nested objects
//! (`dependency.vpc.outputs.id`). [ValueTree] folds the flat keys into a tree and flattens it back.
//!
//! Only leaves carry a value, interior nodes exist to hold children.
use crate::value::Value;
use indexmap::IndexMap;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ValueTree {
    root: IndexMap<String, Node>,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Node {
    value: Option<Value>,
    children: IndexMap<String, Node>,
}

impl ValueTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a flat map into a tree
    pub fn from_flat<I, K>(flat: I) -> Result<Self, TreeError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let mut tree = Self::new();
        for (key, value) in flat {
            tree.insert(key.as_ref(), value)?;
        }
        Ok(tree)
    }

    /// Insert a value at a dotted key
    ///
    /// Inserting the same key again replaces the value.
    pub fn insert(&mut self, key: &str, value: Value) -> Result<(), TreeError> {
        let path: Vec<&str> = key.split('.').collect();
        if path.iter().any(|segment| segment.is_empty()) {
            return Err(TreeError::InvalidKey(key.to_string()));
        }

        let node = self.get_or_insert(&path, key)?;
        if !node.children.is_empty() {
            return Err(TreeError::Conflict(key.to_string()));
        }

        node.value = Some(value);
        Ok(())
    }

    fn get_or_insert(&mut self, path: &[&str], key: &str) -> Result<&mut Node, TreeError> {
        let mut node = self.root.entry(path[0].to_string()).or_default();

        for segment in &path[1..] {
            if node.value.is_some() {
                return Err(TreeError::Conflict(key.to_string()));
            }
            node = node.children.entry(segment.to_string()).or_default();
        }

        Ok(node)
    }

    /// Flatten back into dot-separated keys
    pub fn flatten(&self) -> IndexMap<String, Value> {
        let mut flat = IndexMap::new();
        for (key, node) in &self.root {
            node.flatten_into(key.clone(), &mut flat);
        }
        flat
    }

    /// Top level entries as nested object values
    pub fn roots(&self) -> impl Iterator<Item = (&str, Value)> {
        self.root
            .iter()
            .map(|(key, node)| (key.as_str(), node.to_value()))
    }

    /// The whole tree as one object value
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.roots()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Move all entries of `other` into this tree
    pub fn extend(&mut self, other: ValueTree) -> Result<(), TreeError> {
        for (key, value) in other.flatten() {
            self.insert(&key, value)?;
        }
        Ok(())
    }
}

impl Node {
    fn flatten_into(&self, prefix: String, flat: &mut IndexMap<String, Value>) {
        if let Some(value) = &self.value {
            flat.insert(prefix, value.clone());
            return;
        }

        for (key, child) in &self.children {
            child.flatten_into(format!("{prefix}.{key}"), flat);
        }
    }

    fn to_value(&self) -> Value {
        if let Some(value) = &self.value {
            return value.clone();
        }

        Value::Object(
            self.children
                .iter()
                .map(|(key, child)| (key.clone(), child.to_value()))
                .collect(),
        )
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum TreeError {
    #[error("key `{0}` is both a value and a parent of other values")]
    Conflict(String),
    #[error("key `{0}` contains an empty segment")]
    InvalidKey(String),
}
