//! Rebuild groups: tags naming which downstream observers should react to a
//! state transition.
//!
//! A group set is a small deduplicated collection of string tags. The
//! wildcard sentinel [`WILDCARD_GROUP`] means "every observer" and must be
//! the only element of any set it appears in.

use std::borrow::Cow;
use std::fmt;

use smallvec::SmallVec;

use crate::error::GroupRuleViolation;

/// The wildcard sentinel: addresses every observer.
pub const WILDCARD_GROUP: &str = "*";

/// A small deduplicated set of rebuild-group tags.
///
/// Most emits carry zero or one tag, so the set is inline-allocated for up
/// to four entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RebuildGroups {
    tags: SmallVec<[Cow<'static, str>; 4]>,
}

impl RebuildGroups {
    /// An empty group set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A set containing only the wildcard sentinel.
    #[must_use]
    pub fn wildcard() -> Self {
        let mut groups = Self::new();
        groups.insert(WILDCARD_GROUP);
        groups
    }

    /// Build a set from an iterator of tags, deduplicating.
    pub fn of<I, T>(tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Cow<'static, str>>,
    {
        let mut groups = Self::new();
        for tag in tags {
            groups.insert(tag);
        }
        groups
    }

    /// Insert a tag. Returns `true` if the tag was not already present.
    pub fn insert<T>(&mut self, tag: T) -> bool
    where
        T: Into<Cow<'static, str>>,
    {
        let tag = tag.into();
        if self.contains(&tag) {
            return false;
        }
        self.tags.push(tag);
        true
    }

    /// Whether the set contains the given tag.
    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Whether the set contains the wildcard sentinel.
    #[must_use]
    pub fn has_wildcard(&self) -> bool {
        self.contains(WILDCARD_GROUP)
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Number of tags in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Iterate over the tags in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(Cow::as_ref)
    }

    /// Merge another set into this one (union, deduplicating).
    pub fn union(&mut self, other: &Self) {
        for tag in &other.tags {
            self.insert(tag.clone());
        }
    }

    /// Check the wildcard-exclusivity rule: if the wildcard sentinel is
    /// present it must be the only element.
    ///
    /// # Errors
    ///
    /// Returns [`GroupRuleViolation`] if the wildcard is combined with any
    /// named tag.
    pub fn validate(&self) -> Result<(), GroupRuleViolation> {
        if self.has_wildcard() && self.len() > 1 {
            return Err(GroupRuleViolation);
        }
        Ok(())
    }
}

impl fmt::Display for RebuildGroups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, tag) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{tag}")?;
        }
        write!(f, "}}")
    }
}

impl<T> FromIterator<T> for RebuildGroups
where
    T: Into<Cow<'static, str>>,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::of(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_tags_validate() {
        let groups = RebuildGroups::of(["header", "footer"]);
        assert!(groups.validate().is_ok());
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn wildcard_alone_validates() {
        assert!(RebuildGroups::wildcard().validate().is_ok());
    }

    #[test]
    fn wildcard_plus_named_is_rejected() {
        let groups = RebuildGroups::of([WILDCARD_GROUP, "header"]);
        assert_eq!(groups.validate(), Err(GroupRuleViolation));
    }

    #[test]
    fn insert_deduplicates() {
        let mut groups = RebuildGroups::new();
        assert!(groups.insert("list"));
        assert!(!groups.insert("list"));
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn union_merges_without_duplicates() {
        let mut left = RebuildGroups::of(["a", "b"]);
        let right = RebuildGroups::of(["b", "c"]);

        left.union(&right);

        assert_eq!(left.len(), 3);
        assert!(left.contains("a"));
        assert!(left.contains("b"));
        assert!(left.contains("c"));
    }

    #[test]
    fn union_can_create_a_violation() {
        // An event carrying named tags merged with a wildcard emit must
        // fail validation downstream.
        let mut merged = RebuildGroups::of(["header"]);
        merged.union(&RebuildGroups::wildcard());

        assert_eq!(merged.validate(), Err(GroupRuleViolation));
    }

    #[test]
    fn empty_set_validates() {
        assert!(RebuildGroups::new().validate().is_ok());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn union_is_idempotent(tags in proptest::collection::vec("[a-z]{1,8}", 0..8)) {
                let mut groups = RebuildGroups::of(tags.clone());
                let snapshot = groups.clone();

                groups.union(&snapshot);

                prop_assert_eq!(groups, snapshot);
            }

            #[test]
            fn len_never_exceeds_distinct_inputs(tags in proptest::collection::vec("[a-z]{1,4}", 0..16)) {
                let distinct = tags.iter().collect::<std::collections::HashSet<_>>().len();
                let groups = RebuildGroups::of(tags.clone());

                prop_assert_eq!(groups.len(), distinct);
                for tag in &tags {
                    prop_assert!(groups.contains(tag));
                }
            }
        }
    }
}
