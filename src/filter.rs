//! Subscription filters and the in-memory matcher.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::event::{Event, Tag};

/// Reasons a filter or change-feed option object fails to parse.
#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("invalid: filter must be a JSON object")]
    NotObject,
    #[error("invalid: filter field {0} is malformed")]
    BadField(String),
}

/// Conjunctive predicate over an event's fields and tags.
///
/// Within one filter every present field must hold; filters in the same
/// subscription combine by disjunction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<u64>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<u64>,
    pub limit: Option<u64>,
    /// Tag predicates from `#X` keys, keyed by the single-letter tag name.
    pub tags: BTreeMap<char, Vec<String>>,
}

fn string_array(val: &Value, field: &str) -> Result<Vec<String>, FilterError> {
    let arr = val
        .as_array()
        .ok_or_else(|| FilterError::BadField(field.to_string()))?;
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| FilterError::BadField(field.to_string()))
        })
        .collect()
}

fn kind_array(val: &Value, field: &str) -> Result<Vec<u32>, FilterError> {
    let arr = val
        .as_array()
        .ok_or_else(|| FilterError::BadField(field.to_string()))?;
    arr.iter()
        .map(|v| {
            v.as_u64()
                .and_then(|k| u32::try_from(k).ok())
                .ok_or_else(|| FilterError::BadField(field.to_string()))
        })
        .collect()
}

impl Filter {
    /// Parse a filter from its JSON object form.
    ///
    /// Unknown plain keys are ignored; `#` keys must name a single ASCII
    /// letter so the indexed and in-memory paths agree on what can match.
    pub fn from_value(val: &Value) -> Result<Self, FilterError> {
        let obj = val.as_object().ok_or(FilterError::NotObject)?;
        let mut filter = Filter::default();
        for (key, value) in obj {
            match key.as_str() {
                "ids" => filter.ids = Some(string_array(value, key)?),
                "authors" => filter.authors = Some(string_array(value, key)?),
                "kinds" => filter.kinds = Some(kind_array(value, key)?),
                "since" => {
                    filter.since =
                        Some(value.as_u64().ok_or_else(|| FilterError::BadField(key.clone()))?)
                }
                "until" => {
                    filter.until =
                        Some(value.as_u64().ok_or_else(|| FilterError::BadField(key.clone()))?)
                }
                "limit" => {
                    filter.limit =
                        Some(value.as_u64().ok_or_else(|| FilterError::BadField(key.clone()))?)
                }
                k if k.starts_with('#') => {
                    let mut rest = k.chars().skip(1);
                    let letter = match (rest.next(), rest.next()) {
                        (Some(c), None) if c.is_ascii_alphabetic() => c,
                        _ => return Err(FilterError::BadField(key.clone())),
                    };
                    filter.tags.insert(letter, string_array(value, key)?);
                }
                _ => {}
            }
        }
        Ok(filter)
    }

    /// True when the event satisfies every predicate of this filter.
    ///
    /// `limit` is not a predicate and is ignored here.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.is_empty() && !ids.iter().any(|id| id == &ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.is_empty() && !authors.iter().any(|a| a == &ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.is_empty() && !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if ev.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if ev.created_at > until {
                return false;
            }
        }
        for (letter, values) in &self.tags {
            if values.is_empty() {
                continue;
            }
            let name = letter.to_string();
            let hit = ev.tags.iter().any(|Tag(fields)| match fields.as_slice() {
                [t, val, ..] => t == &name && values.iter().any(|v| v == val),
                _ => false,
            });
            if !hit {
                return false;
            }
        }
        true
    }
}

/// True when any filter in the set matches the event.
pub fn matches_any(ev: &Event, filters: &[Filter]) -> bool {
    filters.iter().any(|f| f.matches(ev))
}

/// Options accepted by the `CHANGES` and `CHANGES_SUB` commands.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangesOptions {
    /// Last sequence the client has observed.
    pub since: i64,
    pub limit: Option<u64>,
    pub kinds: Option<Vec<u32>>,
    pub authors: Option<Vec<String>>,
}

impl ChangesOptions {
    /// Parse change-feed options from their JSON object form.
    pub fn from_value(val: &Value) -> Result<Self, FilterError> {
        let obj = val.as_object().ok_or(FilterError::NotObject)?;
        let mut opts = ChangesOptions::default();
        for (key, value) in obj {
            match key.as_str() {
                "since" => {
                    opts.since =
                        value.as_i64().ok_or_else(|| FilterError::BadField(key.clone()))?
                }
                "limit" => {
                    opts.limit =
                        Some(value.as_u64().ok_or_else(|| FilterError::BadField(key.clone()))?)
                }
                "kinds" => opts.kinds = Some(kind_array(value, key)?),
                "authors" => opts.authors = Some(string_array(value, key)?),
                _ => {}
            }
        }
        Ok(opts)
    }

    /// Whether a live event belongs on this feed.
    ///
    /// Only `kinds` and `authors` apply; `since` bounds the replay, not
    /// live delivery.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.is_empty() && !kinds.contains(&ev.kind) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.is_empty() && !authors.iter().any(|a| a == &ev.pubkey) {
                return false;
            }
        }
        true
    }
}
