use std::fmt;
use std::hash::Hasher;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

/// Name of the reserved label that carries the metric family name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Separator written between hashed components in [`LabelSet::hash64`].
///
/// `0xff` cannot occur in UTF-8 encoded label data, so hashing never
/// confuses `("ab", "c")` with `("a", "bc")`.
const HASH_SEPARATOR: u8 = 0xff;

/// Returns `true` if `name` is a valid label name.
///
/// Valid names match `[a-zA-Z_][a-zA-Z0-9_]*`. The empty string is not a
/// valid name.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A single name/value pair.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct Label {
    /// The label name.
    pub name: String,
    /// The label value.
    pub value: String,
}

impl Label {
    /// Creates a label from a name and a value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:?}", self.name, self.value)
    }
}

/// An ordered set of unique labels identifying a time series.
///
/// The set is stored sorted by label name. Two sets compare equal exactly
/// when their sorted pair sequences are equal, regardless of the order in
/// which the labels were supplied. Labels with empty values are kept as real
/// members; [`LabelSet::get`] cannot distinguish them from absent names, but
/// equality and [`LabelSet::hash64`] can.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct LabelSet(Vec<Label>);

impl LabelSet {
    /// Creates a label set, sorting the labels by name.
    ///
    /// Duplicate names collapse to a single entry; the sort is stable, so
    /// the first of the duplicates in the input wins.
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        labels.dedup_by(|a, b| a.name == b.name);
        Self(labels)
    }

    /// Creates a label set from name/value pairs.
    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(name, value)| Label::new(name, value))
                .collect(),
        )
    }

    /// Returns the value of the label with the given name.
    ///
    /// Returns the empty string if no such label exists.
    pub fn get(&self, name: &str) -> &str {
        match self.0.binary_search_by(|label| label.name.as_str().cmp(name)) {
            Ok(index) => &self.0[index].value,
            Err(_) => "",
        }
    }

    /// Returns `true` if a label with the given name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.0
            .binary_search_by(|label| label.name.as_str().cmp(name))
            .is_ok()
    }

    /// Returns the number of labels in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the set contains no labels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the labels in name order.
    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    /// Computes the 64-bit identity hash of this label set.
    ///
    /// The hash is FNV-1a over all `(name, value)` pairs in name order with
    /// a separator byte after every component. It depends only on the pair
    /// values, never on insertion order, and is stable across processes, so
    /// equal series hash to the same shard on every run.
    pub fn hash64(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        for label in &self.0 {
            hasher.write(label.name.as_bytes());
            hasher.write(&[HASH_SEPARATOR]);
            hasher.write(label.value.as_bytes());
            hasher.write(&[HASH_SEPARATOR]);
        }
        hasher.finish()
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (index, label) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{label}")?;
        }
        write!(f, "}}")
    }
}

impl IntoIterator for LabelSet {
    type Item = Label;
    type IntoIter = std::vec::IntoIter<Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a LabelSet {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<Label> for LabelSet {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// A transient builder deriving a new [`LabelSet`] from an existing one.
///
/// Reads through the builder are not supported; all reads go against the
/// base set, all writes are collected and merged by [`LabelBuilder::labels`].
/// Builders are short-lived, one per rewrite step.
#[derive(Debug)]
pub struct LabelBuilder<'a> {
    base: &'a LabelSet,
    add: Vec<Label>,
    del: Vec<String>,
}

impl<'a> LabelBuilder<'a> {
    /// Creates a builder seeded with the given base set.
    pub fn new(base: &'a LabelSet) -> Self {
        Self {
            base,
            add: Vec::new(),
            del: Vec::new(),
        }
    }

    /// Sets a label, overwriting a pending or inherited value of the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let label = Label::new(name, value);
        self.del.retain(|del| del != &label.name);
        if let Some(pending) = self.add.iter_mut().find(|add| add.name == label.name) {
            pending.value = label.value;
        } else {
            self.add.push(label);
        }
        self
    }

    /// Deletes a label. Deleting an absent name is a no-op.
    pub fn del(&mut self, name: &str) -> &mut Self {
        self.add.retain(|add| add.name != name);
        if !self.del.iter().any(|del| del == name) {
            self.del.push(name.to_owned());
        }
        self
    }

    /// Commits the pending operations into a new sorted [`LabelSet`].
    pub fn labels(&self) -> LabelSet {
        let mut labels: Vec<Label> = self
            .base
            .iter()
            .filter(|label| {
                !self.del.iter().any(|del| del == &label.name)
                    && !self.add.iter().any(|add| add.name == label.name)
            })
            .cloned()
            .collect();
        labels.extend(self.add.iter().cloned());
        LabelSet::new(labels)
    }
}
