//! Sorting and keyset pagination.
//!
//! Every listing orders documents by `(sort value, id)` so that the order
//! is total. A page ends with an opaque cursor naming the last returned
//! position; the next page starts strictly after it, which keeps pages
//! free of overlap and gaps while other documents are inserted.
//!
//! Cursor format:
//!
//! ```text
//! sorted by a field   hex(sort value bytes) "-" hex(id)
//! sorted by id        id
//! ```
//!
//! Sort values serialize as UTF-8 text, 8-byte big-endian integers, or the
//! 8-byte big-endian IEEE-754 bit pattern of a float.

use std::cmp::Ordering;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{StateError, StateResult};
use crate::store::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortOrder {
    type Err = StateError;

    fn from_str(s: &str) -> StateResult<Self> {
        match s {
            "" | "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(StateError::BadInput(format!("invalid sort order {other:?}"))),
        }
    }
}

/// Encoding of a sort field's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Text,
    Int,
    Float,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SortValue {
    Text(String),
    Int(i64),
    Float(f64),
}

impl SortValue {
    pub fn compare(&self, other: &SortValue) -> Ordering {
        match (self, other) {
            (SortValue::Text(a), SortValue::Text(b)) => a.cmp(b),
            (SortValue::Int(a), SortValue::Int(b)) => a.cmp(b),
            (SortValue::Float(a), SortValue::Float(b)) => a.total_cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SortValue::Text(_) => 0,
            SortValue::Int(_) => 1,
            SortValue::Float(_) => 2,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SortValue::Text(s) => s.as_bytes().to_vec(),
            SortValue::Int(i) => i.to_be_bytes().to_vec(),
            SortValue::Float(f) => f.to_bits().to_be_bytes().to_vec(),
        }
    }

    pub fn from_bytes(kind: ValueKind, bytes: &[u8]) -> StateResult<Self> {
        let eight = || -> StateResult<[u8; 8]> {
            bytes
                .try_into()
                .map_err(|_| StateError::BadInput("invalid cursor".to_string()))
        };
        match kind {
            ValueKind::Text => String::from_utf8(bytes.to_vec())
                .map(SortValue::Text)
                .map_err(|_| StateError::BadInput("invalid cursor".to_string())),
            ValueKind::Int => Ok(SortValue::Int(i64::from_be_bytes(eight()?))),
            ValueKind::Float => Ok(SortValue::Float(f64::from_bits(u64::from_be_bytes(
                eight()?,
            )))),
        }
    }
}

/// A field a document listing can be ordered by.
pub trait SortField<D>: Copy {
    fn kind(&self) -> ValueKind;
    fn value_of(&self, doc: &D) -> SortValue;
}

/// Pagination and ordering parameters of a listing.
#[derive(Debug, Clone)]
pub struct ListQuery<S> {
    /// Page size; zero returns everything after the cursor.
    pub limit: usize,
    pub cursor: Option<String>,
    /// `None` orders by id alone.
    pub sort: Option<S>,
    pub order: SortOrder,
}

impl<S> Default for ListQuery<S> {
    fn default() -> Self {
        Self {
            limit: 0,
            cursor: None,
            sort: None,
            order: SortOrder::Asc,
        }
    }
}

impl<S> ListQuery<S> {
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn sort_by(mut self, field: S, order: SortOrder) -> Self {
        self.sort = Some(field);
        self.order = order;
        self
    }
}

/// One page of a listing plus the metadata needed to fetch the next.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Page<D> {
    #[serde(skip)]
    pub items: Vec<D>,
    /// Matching documents before pagination.
    pub total_result_size: usize,
    pub returned_result_size: usize,
    /// Present only when more documents follow this page.
    pub next_page_cursor: Option<String>,
}

/// Total order used by listings and leases.
pub(crate) fn compare_docs<D: Document, S: SortField<D>>(
    sort: Option<S>,
    order: SortOrder,
    a: &D,
    b: &D,
) -> Ordering {
    let by_value = match sort {
        Some(field) => field.value_of(a).compare(&field.value_of(b)),
        None => Ordering::Equal,
    };
    let ordering = by_value.then_with(|| a.key().cmp(b.key()));
    match order {
        SortOrder::Asc => ordering,
        SortOrder::Desc => ordering.reverse(),
    }
}

/// Last-seen position decoded from a cursor.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Position {
    value: Option<SortValue>,
    id: String,
}

impl Position {
    fn of<D: Document, S: SortField<D>>(sort: Option<S>, doc: &D) -> Self {
        Self {
            value: sort.map(|field| field.value_of(doc)),
            id: doc.key().to_string(),
        }
    }

    fn encode(&self) -> String {
        match &self.value {
            Some(value) => format!(
                "{}-{}",
                hex::encode(value.to_bytes()),
                hex::encode(self.id.as_bytes())
            ),
            None => self.id.clone(),
        }
    }

    fn decode(cursor: &str, kind: Option<ValueKind>) -> StateResult<Self> {
        let invalid = || StateError::BadInput(format!("invalid cursor {cursor:?}"));
        match kind {
            None => {
                if cursor.is_empty() {
                    return Err(invalid());
                }
                Ok(Self {
                    value: None,
                    id: cursor.to_string(),
                })
            }
            Some(kind) => {
                let (value_hex, id_hex) = cursor.split_once('-').ok_or_else(invalid)?;
                let value_bytes = hex::decode(value_hex).map_err(|_| invalid())?;
                let id_bytes = hex::decode(id_hex).map_err(|_| invalid())?;
                let id = String::from_utf8(id_bytes).map_err(|_| invalid())?;
                if id.is_empty() {
                    return Err(invalid());
                }
                let value = SortValue::from_bytes(kind, &value_bytes).map_err(|_| invalid())?;
                Ok(Self {
                    value: Some(value),
                    id,
                })
            }
        }
    }

    fn compare_to<D: Document, S: SortField<D>>(&self, sort: Option<S>, doc: &D) -> Ordering {
        let by_value = match (&self.value, sort) {
            (Some(value), Some(field)) => value.compare(&field.value_of(doc)),
            _ => Ordering::Equal,
        };
        by_value.then_with(|| self.id.as_str().cmp(doc.key()))
    }
}

/// Sort the filtered documents and cut out the page described by `query`.
pub(crate) fn paginate<D: Document, S: SortField<D>>(
    mut docs: Vec<D>,
    query: &ListQuery<S>,
) -> StateResult<Page<D>> {
    let total_result_size = docs.len();
    let sort = query.sort;
    let order = query.order;

    let after = match query.cursor.as_deref() {
        Some(cursor) => Some(Position::decode(cursor, sort.map(|f| f.kind()))?),
        None => None,
    };

    docs.sort_by(|a, b| compare_docs(sort, order, a, b));

    if let Some(position) = &after {
        // Keep only documents strictly after the cursor in listing order.
        docs.retain(|doc| {
            let pos_vs_doc = position.compare_to(sort, doc);
            match order {
                SortOrder::Asc => pos_vs_doc == Ordering::Less,
                SortOrder::Desc => pos_vs_doc == Ordering::Greater,
            }
        });
    }

    let more = query.limit > 0 && docs.len() > query.limit;
    if more {
        docs.truncate(query.limit);
    }
    let next_page_cursor = match (more, docs.last()) {
        (true, Some(last)) => Some(Position::of(sort, last).encode()),
        _ => None,
    };

    Ok(Page {
        returned_result_size: docs.len(),
        items: docs,
        total_result_size,
        next_page_cursor,
    })
}
