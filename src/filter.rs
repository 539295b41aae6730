//! NIP-01 subscription filters.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::event::Event;

/// Filter sent in `REQ` messages and evaluated locally against the event store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    /// Tag value constraints keyed by single-letter tag name (`#d`, `#t`, ...).
    pub tags: BTreeMap<char, Vec<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn tag<I, S>(mut self, name: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .insert(name, values.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `ev` satisfies every constraint (`limit` is ignored here).
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        for (name, values) in &self.tags {
            let mut buf = [0u8; 4];
            let name = name.encode_utf8(&mut buf);
            let hit = ev.tags.iter().any(|t| {
                t.name() == Some(name) && t.value().is_some_and(|v| values.iter().any(|x| x == v))
            });
            if !hit {
                return false;
            }
        }
        self.since.map_or(true, |s| ev.created_at >= s)
            && self.until.map_or(true, |u| ev.created_at <= u)
    }

    /// Convert into the JSON object used for `REQ` messages.
    pub fn to_json(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(ids) = &self.ids {
            map.insert("ids".into(), strings(ids));
        }
        if let Some(authors) = &self.authors {
            map.insert("authors".into(), strings(authors));
        }
        if let Some(kinds) = &self.kinds {
            map.insert(
                "kinds".into(),
                Value::Array(kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        for (name, values) in &self.tags {
            map.insert(format!("#{name}"), strings(values));
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::Number(until.into()));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::Number(limit.into()));
        }
        map
    }

    /// Build a `Filter` from a NIP-01 filter JSON object. Unknown keys and
    /// multi-letter tag keys are skipped.
    pub fn from_json(val: &Value) -> Self {
        let mut tags = BTreeMap::new();
        if let Some(obj) = val.as_object() {
            for (key, v) in obj {
                let mut chars = key.chars();
                if let (Some('#'), Some(name), None) = (chars.next(), chars.next(), chars.next()) {
                    if let Some(values) = string_array(v) {
                        tags.insert(name, values);
                    }
                }
            }
        }
        let kinds = val.get("kinds").and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_u64().and_then(|u| u32::try_from(u).ok()))
                .collect()
        });
        Filter {
            ids: val.get("ids").and_then(string_array),
            authors: val.get("authors").and_then(string_array),
            kinds,
            tags,
            since: val.get("since").and_then(|v| v.as_u64()),
            until: val.get("until").and_then(|v| v.as_u64()),
            limit: val
                .get("limit")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize),
        }
    }
}

fn strings(values: &[String]) -> Value {
    Value::Array(values.iter().cloned().map(Value::String).collect())
}

fn string_array(v: &Value) -> Option<Vec<String>> {
    v.as_array().map(|arr| {
        arr.iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{tests::bare_event, Tag};

    #[test]
    fn from_json_fields() {
        let val = serde_json::json!({
            "ids": ["i1"],
            "authors": ["a1", "a2"],
            "kinds": [1, 2],
            "#d": ["slug"],
            "#t": ["tag"],
            "#long": ["skipped"],
            "since": 1,
            "until": 2,
            "limit": 3
        });
        let f = Filter::from_json(&val);
        assert_eq!(f.ids.unwrap(), vec!["i1".to_string()]);
        assert_eq!(f.authors.unwrap(), vec!["a1".to_string(), "a2".to_string()]);
        assert_eq!(f.kinds.unwrap(), vec![1, 2]);
        assert_eq!(f.tags.get(&'d').unwrap(), &vec!["slug".to_string()]);
        assert_eq!(f.tags.get(&'t').unwrap(), &vec!["tag".to_string()]);
        assert_eq!(f.tags.len(), 2);
        assert_eq!(f.since, Some(1));
        assert_eq!(f.until, Some(2));
        assert_eq!(f.limit, Some(3));
    }

    #[test]
    fn from_json_defaults() {
        let f = Filter::from_json(&serde_json::json!({}));
        assert_eq!(f, Filter::default());
    }

    #[test]
    fn to_json_uses_hash_prefixed_tag_keys() {
        let f = Filter::new()
            .kinds([30_023])
            .authors(["p1"])
            .tag('d', ["library"])
            .since(5)
            .limit(1);
        let json = Value::Object(f.to_json());
        assert_eq!(
            json,
            serde_json::json!({
                "kinds": [30023],
                "authors": ["p1"],
                "#d": ["library"],
                "since": 5,
                "limit": 1
            })
        );
        assert_eq!(Filter::from_json(&json), f);
    }

    #[test]
    fn matches_every_constraint() {
        let mut ev = bare_event("aa11", "p1", 30_023, Some("slug"), 10);
        ev.tags.push(Tag::new(["t", "news"]));
        assert!(Filter::new().matches(&ev));
        assert!(Filter::new().kinds([30_023]).tag('d', ["slug"]).matches(&ev));
        assert!(Filter::new().tag('t', ["other", "news"]).matches(&ev));
        assert!(!Filter::new().tag('t', ["other"]).matches(&ev));
        assert!(!Filter::new().authors(["p2"]).matches(&ev));
        assert!(!Filter::new().ids(["bb22"]).matches(&ev));
        assert!(Filter::new().since(10).until(10).matches(&ev));
        assert!(!Filter::new().since(11).matches(&ev));
        assert!(!Filter::new().until(9).matches(&ev));
    }
}
