use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single photo as served by the feed endpoint.
///
/// Identity is `id`; every other field may be refreshed by a later fetch.
/// Fields the viewer does not know about are kept in `extra` so they survive
/// a merge untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_content_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_view_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Item {
    pub fn new<I: Into<String>>(id: I) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// Parsed creation time, or `None` when absent or unparseable.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.created_time.as_deref()?)
    }

    fn sort_key(&self) -> i64 {
        self.created_at()
            .map(|ts| ts.timestamp_millis())
            .unwrap_or(0)
    }

    /// Overlays the fields present in `newer` onto `self`.
    ///
    /// Absent fields (and explicit JSON nulls) keep the current value.
    pub fn absorb(&mut self, newer: Item) {
        let Item {
            id: _,
            name,
            created_time,
            thumbnail_link,
            web_content_link,
            web_view_link,
            qr_code_url,
            extra,
        } = newer;

        overlay(&mut self.name, name);
        overlay(&mut self.created_time, created_time);
        overlay(&mut self.thumbnail_link, thumbnail_link);
        overlay(&mut self.web_content_link, web_content_link);
        overlay(&mut self.web_view_link, web_view_link);
        overlay(&mut self.qr_code_url, qr_code_url);
        for (key, value) in extra {
            if !value.is_null() {
                self.extra.insert(key, value);
            }
        }
    }
}

fn overlay(slot: &mut Option<String>, value: Option<String>) {
    if value.is_some() {
        *slot = value;
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Newest-first, id-unique, size-capped list of photos.
#[derive(Debug, Clone)]
pub struct Feed {
    items: Vec<Item>,
    max_items: usize,
}

impl Feed {
    pub fn new(max_items: usize) -> Self {
        Self {
            items: Vec::new(),
            max_items: max_items.max(1),
        }
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Item> {
        self.items.get(index)
    }

    pub fn newest_id(&self) -> Option<&str> {
        self.items.first().map(|item| item.id.as_str())
    }

    /// Merges a freshly fetched batch into the feed.
    pub fn merge(&mut self, incoming: Vec<Item>) {
        self.items = merge_items(&self.items, incoming, self.max_items);
    }
}

/// Overlays `incoming` onto `existing` by id, then sorts newest-first,
/// dedupes and keeps at most `max_items`.
pub fn merge_items(existing: &[Item], incoming: Vec<Item>, max_items: usize) -> Vec<Item> {
    let mut merged: Vec<Item> = Vec::with_capacity(existing.len() + incoming.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for item in existing.iter().cloned().chain(incoming) {
        if item.id.is_empty() {
            continue;
        }
        match positions.get(&item.id) {
            Some(&pos) => merged[pos].absorb(item),
            None => {
                positions.insert(item.id.clone(), merged.len());
                merged.push(item);
            }
        }
    }

    sort_newest_first(&mut merged);
    let mut merged = dedupe(merged);
    merged.truncate(max_items);
    merged
}

fn sort_newest_first(items: &mut [Item]) {
    // sort_by_key is stable, so ties keep first-seen order.
    items.sort_by_key(|item| std::cmp::Reverse(item.sort_key()));
}

fn dedupe(items: Vec<Item>) -> Vec<Item> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| !item.id.is_empty() && seen.insert(item.id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, created: &str) -> Item {
        Item {
            id: id.into(),
            name: Some(format!("photo {id}")),
            created_time: Some(created.into()),
            ..Default::default()
        }
    }

    fn ids(items: &[Item]) -> Vec<&str> {
        items.iter().map(|item| item.id.as_str()).collect()
    }

    #[test]
    fn overlapping_fetches_never_duplicate_ids() {
        let first = vec![
            item("a", "2024-05-01T10:00:00Z"),
            item("b", "2024-05-01T09:00:00Z"),
            item("c", "2024-05-01T08:00:00Z"),
        ];
        let merged = merge_items(&[], first, 500);
        let second = vec![
            item("b", "2024-05-01T09:00:00Z"),
            item("c", "2024-05-01T08:00:00Z"),
            item("d", "2024-05-01T11:00:00Z"),
        ];
        let merged = merge_items(&merged, second, 500);
        assert_eq!(ids(&merged), vec!["d", "a", "b", "c"]);
    }

    #[test]
    fn merged_feed_is_sorted_newest_first() {
        let batch = vec![
            item("old", "2023-01-01T00:00:00Z"),
            item("new", "2024-06-01T00:00:00+02:00"),
            item("mid", "2024-01-01T00:00:00Z"),
        ];
        let merged = merge_items(&[], batch, 10);
        let times: Vec<i64> = merged.iter().map(Item::sort_key).collect();
        assert!(times.windows(2).all(|pair| pair[0] >= pair[1]));
        assert_eq!(ids(&merged), vec!["new", "mid", "old"]);
    }

    #[test]
    fn truncation_keeps_the_newest() {
        let batch: Vec<Item> = (0..8)
            .map(|n| item(&n.to_string(), &format!("2024-01-0{}T00:00:00Z", n + 1)))
            .collect();
        let merged = merge_items(&[], batch, 5);
        assert_eq!(ids(&merged), vec!["7", "6", "5", "4", "3"]);
    }

    #[test]
    fn absent_fields_are_preserved_on_refetch() {
        let mut original = item("a", "2024-05-01T10:00:00Z");
        original.thumbnail_link = Some("https://lh3.example/a=s220".into());
        let merged = merge_items(&[], vec![original], 10);

        let refreshed: Vec<Item> =
            serde_json::from_str(r#"[{"id":"a","name":"renamed","thumbnailLink":null}]"#)
                .unwrap();
        let merged = merge_items(&merged, refreshed, 10);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].name.as_deref(), Some("renamed"));
        assert_eq!(
            merged[0].thumbnail_link.as_deref(),
            Some("https://lh3.example/a=s220")
        );
        assert_eq!(
            merged[0].created_time.as_deref(),
            Some("2024-05-01T10:00:00Z")
        );
    }

    #[test]
    fn unknown_fields_survive_and_merge() {
        let first: Vec<Item> =
            serde_json::from_str(r#"[{"id":"a","mimeType":"image/jpeg","size":"12"}]"#).unwrap();
        let second: Vec<Item> = serde_json::from_str(r#"[{"id":"a","size":"40"}]"#).unwrap();
        let merged = merge_items(&merge_items(&[], first, 10), second, 10);
        assert_eq!(merged[0].extra.get("mimeType"), Some(&Value::from("image/jpeg")));
        assert_eq!(merged[0].extra.get("size"), Some(&Value::from("40")));
    }

    #[test]
    fn items_without_id_are_dropped() {
        let batch: Vec<Item> =
            serde_json::from_str(r#"[{"name":"anonymous"},{"id":"","name":"blank"},{"id":"x"}]"#)
                .unwrap();
        let merged = merge_items(&[], batch, 10);
        assert_eq!(ids(&merged), vec!["x"]);
    }

    #[test]
    fn missing_or_bad_timestamps_sort_last_and_stable() {
        let batch = vec![
            Item::new("undated-1"),
            item("garbage", "not a date"),
            item("dated", "2020-02-02"),
            Item::new("undated-2"),
        ];
        let merged = merge_items(&[], batch, 10);
        assert_eq!(
            ids(&merged),
            vec!["dated", "undated-1", "garbage", "undated-2"]
        );
    }

    #[test]
    fn feed_tracks_newest_id() {
        let mut feed = Feed::new(3);
        assert_eq!(feed.newest_id(), None);
        feed.merge(vec![item("a", "2024-01-01T00:00:00Z")]);
        feed.merge(vec![item("b", "2024-01-02T00:00:00Z")]);
        assert_eq!(feed.newest_id(), Some("b"));
        assert_eq!(feed.len(), 2);
    }
}
