//! Query shaping: sort order and pagination.

use harbor_model::{Record, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SortOrder {
    /// Smallest first. Nulls sort before everything else.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

/// Sorts results by one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortBy {
    /// Field name.
    pub field: String,
    /// Direction.
    pub order: SortOrder,
}

impl SortBy {
    /// Ascending sort on `field`.
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Ascending,
        }
    }

    /// Descending sort on `field`.
    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Descending,
        }
    }
}

/// A page of results: `limit` items starting at `page * limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Zero-based page index.
    pub page: usize,
    /// Page size.
    pub limit: usize,
}

impl Page {
    /// The first page of `limit` items.
    #[must_use]
    pub const fn first(limit: usize) -> Self {
        Self { page: 0, limit }
    }
}

/// Sorting and pagination for a query.
///
/// Without sort keys results come back in primary-key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Sort keys, most significant first.
    pub sort: Vec<SortBy>,
    /// Optional page.
    pub page: Option<Page>,
}

impl QueryOptions {
    /// No sorting, no paging.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sort key.
    #[must_use]
    pub fn sort(mut self, sort: SortBy) -> Self {
        self.sort.push(sort);
        self
    }

    /// Sets the page.
    #[must_use]
    pub fn page(mut self, page: usize, limit: usize) -> Self {
        self.page = Some(Page { page, limit });
        self
    }

    /// Sorts and pages `records` in place.
    pub fn apply(&self, records: &mut Vec<Record>) {
        if !self.sort.is_empty() {
            records.sort_by(|a, b| self.compare(a, b));
        }
        if let Some(page) = self.page {
            let start = page.page.saturating_mul(page.limit).min(records.len());
            let end = start.saturating_add(page.limit).min(records.len());
            records.drain(end..);
            records.drain(..start);
        }
    }

    fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for sort in &self.sort {
            let ord = compare_values(a.get(&sort.field), b.get(&sort.field));
            let ord = match sort.order {
                SortOrder::Ascending => ord,
                SortOrder::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posts() -> Vec<Record> {
        vec![
            Record::new("Post").with("id", "a").with("rating", 3),
            Record::new("Post").with("id", "b").with("rating", 5),
            Record::new("Post").with("id", "c"),
            Record::new("Post").with("id", "d").with("rating", 1),
        ]
    }

    fn ids(records: &[Record]) -> Vec<&str> {
        records.iter().filter_map(|r| r.get("id").as_text()).collect()
    }

    #[test]
    fn sorts_with_nulls_first() {
        let mut records = posts();
        QueryOptions::new()
            .sort(SortBy::ascending("rating"))
            .apply(&mut records);
        assert_eq!(ids(&records), ["c", "d", "a", "b"]);
    }

    #[test]
    fn descending_then_paged() {
        let mut records = posts();
        QueryOptions::new()
            .sort(SortBy::descending("rating"))
            .page(1, 2)
            .apply(&mut records);
        assert_eq!(ids(&records), ["d", "c"]);
    }

    #[test]
    fn page_past_end_is_empty() {
        let mut records = posts();
        QueryOptions::new().page(5, 10).apply(&mut records);
        assert!(records.is_empty());
    }
}
