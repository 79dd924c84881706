//! Rule-driven label rewriting.
//!
//! Relabeling runs before a sample is admitted to the queue. An ordered list
//! of [`RelabelRule`]s is applied to the sample's label set; each rule reads
//! the committed output of the previous one. A rule can rewrite labels or
//! drop the sample altogether, so the rule list is the admission contract of
//! the write path.
//!
//! Rules are validated and their patterns compiled exactly once, at
//! configuration time, by [`RelabelRule::new`]. Compiled patterns are
//! immutable and shared across evaluations; [`process`] never compiles or
//! fails, it only rewrites.
//!
//! ```
//! use ferry_model::LabelSet;
//! use ferry_relabel::{process, RelabelAction, RelabelConfig, RelabelRule};
//!
//! let rule = RelabelRule::new(&RelabelConfig {
//!     action: RelabelAction::Replace,
//!     source_labels: vec!["addr".to_owned()],
//!     regex: "([^:]+):(\\d+)".to_owned(),
//!     target_label: "host".to_owned(),
//!     replacement: "$1".to_owned(),
//!     ..Default::default()
//! })
//! .unwrap();
//!
//! let labels = LabelSet::from_pairs([("addr", "a.example:80")]);
//! let labels = process(labels, &[rule]).unwrap();
//! assert_eq!(labels.get("host"), "a.example");
//! ```

#![warn(missing_docs)]

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ferry_model::{is_valid_label_name, LabelBuilder, LabelSet};

/// Any error that may occur while building relabel rules.
#[derive(Debug, Error)]
pub enum RelabelError {
    /// A rule carried a pattern that does not compile.
    #[error("invalid regular expression {pattern:?}")]
    InvalidRegex {
        /// The offending pattern.
        pattern: String,
        /// The compilation failure.
        #[source]
        source: Box<regex::Error>,
    },

    /// A rule action requires a target label, but none was configured.
    #[error("relabel action {action} requires a target label")]
    MissingTargetLabel {
        /// The action missing its target.
        action: RelabelAction,
    },

    /// A rule action requires a literal, valid target label name.
    #[error("{target:?} is not a valid target label for action {action}")]
    InvalidTargetLabel {
        /// The offending target label.
        target: String,
        /// The action the target was configured for.
        action: RelabelAction,
    },

    /// The hashmod action requires a modulus greater than zero.
    #[error("relabel action hashmod requires a modulus greater than zero")]
    InvalidModulus,
}

/// The action performed by a relabel rule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelabelAction {
    /// Sets the target label from the replacement template on a match.
    #[default]
    Replace,
    /// Drops the sample unless the pattern matches the whole probe string.
    Keep,
    /// Drops the sample if the pattern matches the whole probe string.
    Drop,
    /// Sets the target label to the probe string's digest modulo the modulus.
    HashMod,
    /// Copies values of matching label names to rewritten names.
    LabelMap,
    /// Deletes all labels with matching names.
    LabelDrop,
    /// Deletes all labels whose names do not match.
    LabelKeep,
}

impl RelabelAction {
    /// Returns the lowercase configuration name of this action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Keep => "keep",
            Self::Drop => "drop",
            Self::HashMod => "hashmod",
            Self::LabelMap => "labelmap",
            Self::LabelDrop => "labeldrop",
            Self::LabelKeep => "labelkeep",
        }
    }
}

impl fmt::Display for RelabelAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for one relabel rule.
///
/// The probe string fed to the pattern is the values of `source_labels`
/// (missing labels read as the empty string) joined with `separator`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RelabelConfig {
    /// Labels whose values form the probe string.
    pub source_labels: Vec<String>,
    /// Separator placed between the source label values.
    pub separator: String,
    /// Pattern matched against the probe string.
    ///
    /// For [`RelabelAction::Drop`] and [`RelabelAction::Keep`] the pattern
    /// is anchored and must match the entire probe string; all other actions
    /// match anywhere in their input.
    pub regex: String,
    /// Modulus for [`RelabelAction::HashMod`].
    pub modulus: u64,
    /// The label to set or delete; a template for [`RelabelAction::Replace`].
    pub target_label: String,
    /// The template the new label value is expanded from.
    pub replacement: String,
    /// The action to perform.
    pub action: RelabelAction,
}

impl Default for RelabelConfig {
    fn default() -> Self {
        Self {
            source_labels: Vec::new(),
            separator: ";".to_owned(),
            regex: "(.*)".to_owned(),
            modulus: 0,
            target_label: String::new(),
            replacement: "$1".to_owned(),
            action: RelabelAction::default(),
        }
    }
}

/// A validated relabel rule with compiled patterns.
#[derive(Clone, Debug)]
pub struct RelabelRule {
    action: RelabelAction,
    source_labels: Vec<String>,
    separator: String,
    /// Unanchored pattern, used by all actions except drop and keep.
    regex: Regex,
    /// The same pattern wrapped in `^(?:…)$`, used by drop and keep.
    anchored: Regex,
    modulus: u64,
    target_label: String,
    replacement: String,
}

impl RelabelRule {
    /// Validates a [`RelabelConfig`] and compiles its patterns.
    pub fn new(config: &RelabelConfig) -> Result<Self, RelabelError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|source| RelabelError::InvalidRegex {
                pattern: config.regex.clone(),
                source: Box::new(source),
            })
        };

        let regex = compile(&config.regex)?;
        let anchored = compile(&format!("^(?:{})$", config.regex))?;

        match config.action {
            RelabelAction::Replace if config.target_label.is_empty() => {
                return Err(RelabelError::MissingTargetLabel {
                    action: config.action,
                });
            }
            RelabelAction::HashMod => {
                if config.modulus == 0 {
                    return Err(RelabelError::InvalidModulus);
                }
                if config.target_label.is_empty() {
                    return Err(RelabelError::MissingTargetLabel {
                        action: config.action,
                    });
                }
                if !is_valid_label_name(&config.target_label) {
                    return Err(RelabelError::InvalidTargetLabel {
                        target: config.target_label.clone(),
                        action: config.action,
                    });
                }
            }
            _ => {}
        }

        Ok(Self {
            action: config.action,
            source_labels: config.source_labels.clone(),
            separator: config.separator.clone(),
            regex,
            anchored,
            modulus: config.modulus,
            target_label: config.target_label.clone(),
            replacement: config.replacement.clone(),
        })
    }

    /// Applies this rule to a label set.
    ///
    /// Returns `None` when the rule decides to drop the sample. All reads go
    /// against the input set; writes are committed into the returned set.
    fn apply(&self, lset: &LabelSet) -> Option<LabelSet> {
        let values: Vec<&str> = self
            .source_labels
            .iter()
            .map(|name| lset.get(name))
            .collect();
        let val = values.join(&self.separator);

        let mut builder = LabelBuilder::new(lset);

        match self.action {
            RelabelAction::Drop => {
                if self.anchored.is_match(&val) {
                    return None;
                }
            }
            RelabelAction::Keep => {
                if !self.anchored.is_match(&val) {
                    return None;
                }
            }
            RelabelAction::Replace => {
                // No match, no replacement.
                let Some(captures) = self.regex.captures(&val) else {
                    return Some(builder.labels());
                };

                let mut target = String::new();
                captures.expand(&self.target_label, &mut target);
                if !is_valid_label_name(&target) {
                    builder.del(&self.target_label);
                    return Some(builder.labels());
                }

                let mut replacement = String::new();
                captures.expand(&self.replacement, &mut replacement);
                if replacement.is_empty() {
                    builder.del(&self.target_label);
                } else {
                    builder.set(target, replacement);
                }
            }
            RelabelAction::HashMod => {
                let digest = md5::compute(val.as_bytes());
                let mut word = [0u8; 8];
                word.copy_from_slice(&digest.0[..8]);
                let shard = u64::from_be_bytes(word) % self.modulus;
                builder.set(self.target_label.as_str(), shard.to_string());
            }
            RelabelAction::LabelMap => {
                for label in lset {
                    if self.regex.is_match(&label.name) {
                        let name = self
                            .regex
                            .replace_all(&label.name, self.replacement.as_str());
                        builder.set(name.into_owned(), label.value.clone());
                    }
                }
            }
            RelabelAction::LabelDrop => {
                for label in lset {
                    if self.regex.is_match(&label.name) {
                        builder.del(&label.name);
                    }
                }
            }
            RelabelAction::LabelKeep => {
                for label in lset {
                    if !self.regex.is_match(&label.name) {
                        builder.del(&label.name);
                    }
                }
            }
        }

        Some(builder.labels())
    }
}

/// Compiles a list of configurations into rules, failing on the first
/// invalid entry.
pub fn compile(configs: &[RelabelConfig]) -> Result<Vec<RelabelRule>, RelabelError> {
    configs.iter().map(RelabelRule::new).collect()
}

/// Applies the rules in order and returns the rewritten label set.
///
/// The output of each rule is the input of the next. Returns `None` as soon
/// as any rule drops the sample.
pub fn process(labels: LabelSet, rules: &[RelabelRule]) -> Option<LabelSet> {
    let mut labels = labels;
    for rule in rules {
        labels = rule.apply(&labels)?;
    }
    Some(labels)
}
