// ABOUTME: Query descriptors combining a title predicate with ordered sort keys.
// ABOUTME: Also holds the single evaluation routine every Storage implementation uses.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::model::Movie;

/// Errors raised when a descriptor cannot be evaluated as written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("title predicate is empty after folding; use Predicate::All instead")]
    EmptyNeedle,

    #[error("sort field {0:?} appears more than once")]
    DuplicateSortField(SortField),
}

/// Direction of a sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortOrder {
    Forward,
    Reverse,
}

/// Record field a sort key orders by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortField {
    Title,
    Id,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub field: SortField,
    pub order: SortOrder,
}

impl SortKey {
    pub fn new(field: SortField, order: SortOrder) -> Self {
        Self { field, order }
    }
}

/// Filter half of a descriptor. The needle of `TitleContains` is stored
/// already folded so equal search inputs produce equal predicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Predicate {
    All,
    TitleContains(String),
}

impl Predicate {
    /// Build a title predicate from raw search text. Text that folds to
    /// nothing matches everything.
    pub fn title_contains(search: &str) -> Self {
        let needle = fold(search);
        if needle.is_empty() {
            Predicate::All
        } else {
            Predicate::TitleContains(needle)
        }
    }

    pub fn matches(&self, movie: &Movie) -> bool {
        match self {
            Predicate::All => true,
            Predicate::TitleContains(needle) => fold(&movie.title).contains(needle.as_str()),
        }
    }
}

/// A predicate plus sort keys in priority order (first key is primary).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub predicate: Predicate,
    pub sort: Vec<SortKey>,
}

impl Default for QueryDescriptor {
    fn default() -> Self {
        Self::all()
    }
}

impl QueryDescriptor {
    /// Match everything in the default order.
    pub fn all() -> Self {
        Self {
            predicate: Predicate::All,
            sort: Vec::new(),
        }
    }

    /// Derive a descriptor from the view parameters held in application state.
    /// Title is the primary key when both sorts are set.
    pub fn from_view(
        search: &str,
        title_sort: Option<SortOrder>,
        id_sort: Option<SortOrder>,
    ) -> Self {
        let mut sort = Vec::new();
        if let Some(order) = title_sort {
            sort.push(SortKey::new(SortField::Title, order));
        }
        if let Some(order) = id_sort {
            sort.push(SortKey::new(SortField::Id, order));
        }
        Self {
            predicate: Predicate::title_contains(search),
            sort,
        }
    }

    pub fn validate(&self) -> Result<(), QueryError> {
        if let Predicate::TitleContains(needle) = &self.predicate
            && needle.is_empty()
        {
            return Err(QueryError::EmptyNeedle);
        }
        for (i, key) in self.sort.iter().enumerate() {
            if self.sort[..i].iter().any(|k| k.field == key.field) {
                return Err(QueryError::DuplicateSortField(key.field));
            }
        }
        Ok(())
    }

    /// Filter and order `records`. An empty sort list orders by title
    /// ascending. Remaining ties are broken by id, in the direction of the
    /// last sort key, so reversing a title sort reverses the whole result.
    pub fn evaluate<'a, I>(&self, records: I) -> Result<Vec<Movie>, QueryError>
    where
        I: IntoIterator<Item = &'a Movie>,
    {
        self.validate()?;

        let mut keyed: Vec<(String, &Movie)> = records
            .into_iter()
            .filter(|m| self.predicate.matches(m))
            .map(|m| (fold(&m.title), m))
            .collect();

        let tie_break = self.sort.last().map_or(SortOrder::Forward, |key| key.order);

        keyed.sort_by(|(a_title, a), (b_title, b)| {
            let primary = if self.sort.is_empty() {
                compare_title(a_title, a, b_title, b)
            } else {
                self.sort.iter().fold(Ordering::Equal, |acc, key| {
                    acc.then_with(|| {
                        let ord = match key.field {
                            SortField::Title => compare_title(a_title, a, b_title, b),
                            SortField::Id => a.id.cmp(&b.id),
                        };
                        match key.order {
                            SortOrder::Forward => ord,
                            SortOrder::Reverse => ord.reverse(),
                        }
                    })
                })
            };
            primary.then_with(|| match tie_break {
                SortOrder::Forward => a.id.cmp(&b.id),
                SortOrder::Reverse => b.id.cmp(&a.id),
            })
        });

        Ok(keyed.into_iter().map(|(_, m)| m.clone()).collect())
    }
}

fn compare_title(a_folded: &str, a: &Movie, b_folded: &str, b: &Movie) -> Ordering {
    a_folded.cmp(b_folded).then_with(|| a.title.cmp(&b.title))
}

/// Case- and diacritic-insensitive folding: canonical decomposition with
/// combining marks removed, then lowercase.
pub fn fold(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}
