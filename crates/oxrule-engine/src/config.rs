//! Rule file format.
//!
//! A rule file holds one or more YAML documents, each with a `groups` list.
//! Parsing records the source file and an md5 checksum of every group so
//! reloads can tell changed groups apart from untouched ones.

use crate::error::ConfigError;
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::hash::Hasher;
use std::time::Duration;

pub const DEFAULT_DATASOURCE_TYPE: &str = "prometheus";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleFile {
    #[serde(default)]
    groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub datasource_type: Option<String>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub eval_offset: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub eval_delay: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_alignment: Option<bool>,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub concurrency: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Vec<String>>,
    /// `Name: value` pairs sent with every datasource request.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<String>,
    /// `Name: value` pairs sent with every notification of this group.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notifier_headers: Vec<String>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    #[serde(skip)]
    pub file: String,
    #[serde(skip)]
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub record: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alert: String,
    pub expr: String,
    #[serde(default, rename = "for", with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub for_duration: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub keep_firing_for: Option<Duration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub debug: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_entries_limit: Option<usize>,
}

impl RuleConfig {
    pub fn name(&self) -> &str {
        if self.record.is_empty() {
            &self.alert
        } else {
            &self.record
        }
    }

    pub fn is_alerting(&self) -> bool {
        !self.alert.is_empty()
    }

    /// Stable identity of the rule inside its group.
    ///
    /// Built from the expression, the rule kind and name, and the labels as
    /// written in the file, so it survives reloads as long as those do not
    /// change.
    pub fn id(&self) -> u64 {
        let mut h = FnvHasher::default();
        h.write(self.expr.as_bytes());
        if self.is_alerting() {
            h.write(b"alerting");
            h.write(self.alert.as_bytes());
        } else {
            h.write(b"recording");
            h.write(self.record.as_bytes());
        }
        for (k, v) in &self.labels {
            h.write(k.as_bytes());
            h.write(v.as_bytes());
            h.write(&[0xff]);
        }
        h.finish()
    }

    fn validate(&self) -> Result<(), String> {
        if self.record.is_empty() == self.alert.is_empty() {
            return Err("either `record` or `alert` must be set".to_string());
        }
        if self.expr.trim().is_empty() {
            return Err("expression can't be empty".to_string());
        }
        if !self.record.is_empty() {
            if !is_valid_metric_name(&self.record) {
                return Err(format!("invalid recording rule name {:?}", self.record));
            }
            if self.for_duration.is_some() || self.keep_firing_for.is_some() {
                return Err("`for` and `keep_firing_for` are only allowed for alerting rules".to_string());
            }
        }
        Ok(())
    }
}

impl GroupConfig {
    pub fn datasource_type(&self) -> &str {
        self.datasource_type
            .as_deref()
            .unwrap_or(DEFAULT_DATASOURCE_TYPE)
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("group name must be set".to_string());
        }
        if let Some(offset) = self.eval_offset {
            let interval = self.interval.unwrap_or_default();
            if offset > interval {
                return Err(format!(
                    "eval_offset should be smaller than interval; now eval_offset: {}, interval: {}",
                    humantime::format_duration(offset),
                    humantime::format_duration(interval)
                ));
            }
        }
        if self.limit < 0 {
            return Err(format!("invalid limit {}, shouldn't be less than 0", self.limit));
        }
        if self.concurrency < 0 {
            return Err(format!(
                "invalid concurrency {}, shouldn't be less than 0",
                self.concurrency
            ));
        }
        for h in self.headers.iter().chain(&self.notifier_headers) {
            parse_header(h)?;
        }
        Ok(())
    }

    /// Datasource headers as a name/value map.
    pub fn header_map(&self) -> BTreeMap<String, String> {
        headers_to_map(&self.headers)
    }

    pub fn notifier_header_map(&self) -> BTreeMap<String, String> {
        headers_to_map(&self.notifier_headers)
    }
}

fn parse_header(h: &str) -> Result<(String, String), String> {
    match h.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("header {h:?} must be in `Name: value` format")),
    }
}

fn headers_to_map(headers: &[String]) -> BTreeMap<String, String> {
    headers.iter().filter_map(|h| parse_header(h).ok()).collect()
}

fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

fn checksum(g: &GroupConfig) -> String {
    let body = serde_yaml::to_string(g).unwrap_or_default();
    format!("{:x}", md5::compute(body.as_bytes()))
}

/// Parses and validates the content of one rule file.
pub fn parse_file(file: &str, data: &str) -> Result<Vec<GroupConfig>, ConfigError> {
    let mut groups = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(data) {
        let rf = RuleFile::deserialize(doc).map_err(|e| ConfigError::Yaml {
            path: file.to_string(),
            source: e,
        })?;
        groups.extend(rf.groups);
    }

    let mut names = HashSet::new();
    for g in &mut groups {
        let group_err = |reason: String| ConfigError::Group {
            file: file.to_string(),
            group: g.name.clone(),
            reason,
        };
        g.validate().map_err(group_err)?;
        if !names.insert(g.name.clone()) {
            return Err(group_err(format!("group name {:?} duplicate in file", g.name)));
        }

        let mut ids = HashSet::new();
        for r in &g.rules {
            r.validate().map_err(|reason| ConfigError::Rule {
                group: g.name.clone(),
                rule: r.name().to_string(),
                reason,
            })?;
            if !ids.insert(r.id()) {
                return Err(ConfigError::Rule {
                    group: g.name.clone(),
                    rule: r.name().to_string(),
                    reason: "is a duplicate in group".to_string(),
                });
            }
        }

        g.checksum = checksum(g);
        g.file = file.to_string();
    }
    Ok(groups)
}

/// Loads every file matching `patterns`, ordered by file then group name.
pub fn load(patterns: &[String]) -> Result<Vec<GroupConfig>, ConfigError> {
    let mut files = Vec::new();
    for pattern in patterns {
        let paths = glob::glob(pattern).map_err(|e| ConfigError::Pattern {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
        for entry in paths {
            let path = entry.map_err(|e| ConfigError::Pattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            files.push(path.to_string_lossy().into_owned());
        }
    }
    files.sort();
    files.dedup();

    let mut groups = Vec::new();
    for file in &files {
        let data = std::fs::read_to_string(file).map_err(|e| ConfigError::Io {
            path: file.clone(),
            source: e,
        })?;
        groups.extend(parse_file(file, &data)?);
    }
    groups.sort_by(|a, b| a.file.cmp(&b.file).then_with(|| a.name.cmp(&b.name)));
    if groups.is_empty() {
        tracing::warn!(patterns = ?patterns, "No rule groups found");
    }
    Ok(groups)
}
