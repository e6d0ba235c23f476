//! A deliberately small query language over JSON documents.
//!
//! Paths are dotted (`members._id`). Arrays met along a path fan out, and an
//! array at the leaf matches when any element does, so `members._id = x`
//! finds roles that list `x` as a member.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::time;

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(String, Value),
    /// Timestamp at path is at or before the bound.
    Lte(String, DateTime<Utc>),
    /// Path is absent or null.
    Missing(String),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(path.into(), value.into())
    }

    pub fn id(id: &str) -> Self {
        Filter::eq("_id", id)
    }

    pub fn lte(path: impl Into<String>, bound: DateTime<Utc>) -> Self {
        Filter::Lte(path.into(), bound)
    }

    pub fn missing(path: impl Into<String>) -> Self {
        Filter::Missing(path.into())
    }

    /// Conjunction, flattening nested `And`s and dropping `All`.
    pub fn and(self, other: Filter) -> Self {
        let mut parts = Vec::new();
        for f in [self, other] {
            match f {
                Filter::All => {}
                Filter::And(inner) => parts.extend(inner),
                other => parts.push(other),
            }
        }
        match parts.len() {
            0 => Filter::All,
            1 => parts.remove(0),
            _ => Filter::And(parts),
        }
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(path, expected) => values_at(doc, path).into_iter().any(|v| v == expected),
            Filter::Lte(path, bound) => values_at(doc, path)
                .into_iter()
                .filter_map(time::parse)
                .any(|ts| ts <= *bound),
            Filter::Missing(path) => values_at(doc, path).into_iter().all(Value::is_null),
            Filter::And(parts) => parts.iter().all(|f| f.matches(doc)),
        }
    }
}

/// Every value reachable at `path`, fanning out through arrays.
pub fn values_at<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![doc];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value {
                Value::Object(map) => {
                    if let Some(child) = map.get(segment) {
                        next.push(child);
                    }
                }
                Value::Array(items) => {
                    for item in items {
                        if let Some(child) = item.get(segment) {
                            next.push(child);
                        }
                    }
                }
                _ => {}
            }
        }
        current = next;
    }

    let mut out = Vec::with_capacity(current.len());
    for value in current {
        out.push(value);
        if let Value::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Sorting and paging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// How the values at a sort path compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKind {
    Number,
    Time,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
    pub path: String,
    pub order: Order,
    pub kind: SortKind,
}

impl Sort {
    pub fn asc(path: impl Into<String>, kind: SortKind) -> Self {
        Self {
            path: path.into(),
            order: Order::Asc,
            kind,
        }
    }

    pub fn desc(path: impl Into<String>, kind: SortKind) -> Self {
        Self {
            path: path.into(),
            order: Order::Desc,
            kind,
        }
    }

    /// Missing values sort before present ones in ascending order.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let left = values_at(a, &self.path).into_iter().next();
        let right = values_at(b, &self.path).into_iter().next();
        let ordering = match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(l), Some(r)) => match self.kind {
                SortKind::Number => {
                    let l = l.as_f64().unwrap_or(f64::MIN);
                    let r = r.as_f64().unwrap_or(f64::MIN);
                    l.partial_cmp(&r).unwrap_or(Ordering::Equal)
                }
                SortKind::Time => time::parse(l).cmp(&time::parse(r)),
                SortKind::Text => l.as_str().unwrap_or("").cmp(r.as_str().unwrap_or("")),
            },
        };
        match self.order {
            Order::Asc => ordering,
            Order::Desc => ordering.reverse(),
        }
    }
}

/// A filtered, ordered, paged read.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub filter: Filter,
    pub sort: Vec<Sort>,
    pub top: Option<usize>,
    pub skip: usize,
}

impl Query {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            sort: Vec::new(),
            top: None,
            skip: 0,
        }
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn top(mut self, top: usize) -> Self {
        self.top = Some(top);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        self.sort
            .iter()
            .map(|s| s.compare(a, b))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl From<Filter> for Query {
    fn from(filter: Filter) -> Self {
        Query::new(filter)
    }
}

/// Translate a plain JSON equality object into a filter. Operators are not
/// supported; nested objects are compared as whole values.
pub fn filter_from_json(value: &Value) -> Filter {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Filter::eq(k.clone(), v.clone()))
            .fold(Filter::All, Filter::and),
        _ => Filter::All,
    }
}
