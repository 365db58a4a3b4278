//! Soft deletion
//!
//! Entities are never removed from the database by the ingest path; they get a
//! `deleted_at` timestamp instead. Repositories filter with [`ALIVE`] and in-memory
//! collections with [`alive`].

use chrono::{DateTime, Utc};

/// SQL predicate selecting rows that have not been soft-deleted.
pub const ALIVE: &str = "deleted_at IS NULL";

pub trait SoftDeletable {
    fn deleted_at(&self) -> Option<DateTime<Utc>>;

    fn set_deleted_at(&mut self, at: Option<DateTime<Utc>>);

    fn is_deleted(&self) -> bool {
        self.deleted_at().is_some()
    }

    /// Mark as deleted. Returns false when it already was.
    fn mark_deleted(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_deleted() {
            return false;
        }
        self.set_deleted_at(Some(at));
        true
    }
}

/// Iterate over the entities that have not been soft-deleted.
pub fn alive<'a, T, I>(items: I) -> impl Iterator<Item = &'a T>
where
    T: SoftDeletable + 'a,
    I: IntoIterator<Item = &'a T>,
{
    items.into_iter().filter(|item| !item.is_deleted())
}

/// Implements [`SoftDeletable`] for a struct with a `deleted_at` field.
#[macro_export]
macro_rules! impl_soft_deletable {
    ($ty:ty) => {
        impl $crate::soft_delete::SoftDeletable for $ty {
            fn deleted_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
                self.deleted_at
            }

            fn set_deleted_at(&mut self, at: Option<chrono::DateTime<chrono::Utc>>) {
                self.deleted_at = at;
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Row {
        deleted_at: Option<DateTime<Utc>>,
    }

    impl_soft_deletable!(Row);

    #[test]
    fn mark_deleted_is_one_shot() {
        let mut row = Row { deleted_at: None };
        assert!(!row.is_deleted());
        assert!(row.mark_deleted(Utc::now()));
        assert!(row.is_deleted());
        assert!(!row.mark_deleted(Utc::now()));
    }

    #[test]
    fn alive_filters_deleted_rows() {
        let rows = vec![
            Row { deleted_at: None },
            Row {
                deleted_at: Some(Utc::now()),
            },
            Row { deleted_at: None },
        ];
        assert_eq!(alive(&rows).count(), 2);
    }
}
