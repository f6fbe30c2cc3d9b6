//! Partitioning flat batch results into aligned per-key groups.
//!
//! A batch fetch returns one flat row list covering every requested key,
//! each row tagged with the key that owns it. The grouper reshapes that
//! list into one group per requested key, in request order, in a single
//! hashed bucketing pass.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::error::GroupingFault;
use crate::key::Key;

/// An immutable, shareable group of rows belonging to one key.
///
/// Groups are handed out by shared handle: the same allocation backs the
/// cache entry and every caller's result, which is what enforces the rule
/// that a loaded outcome is never mutated in place.
pub type Group<R> = Arc<[R]>;

/// Partition `rows` into one group per entry of `keys`.
///
/// The output is aligned 1:1 with `keys`: element `i` holds exactly the rows
/// whose extracted key equals `keys[i]`, preserving the relative order rows
/// were returned in. Keys with no matching rows get an empty group, never an
/// absence. Duplicate entries in `keys` each receive a handle to the same
/// group.
///
/// Rows whose key is not in `keys` at all are ignored: a fetch function may
/// defensively return more than was asked for. A row whose key cannot be
/// extracted is a [`GroupingFault`] — the fetch function broke its
/// foreign-key contract, and partial groupings are never returned.
pub fn group_rows<R, F>(
    keys: &[Key],
    rows: Vec<R>,
    key_of: F,
) -> Result<Vec<Group<R>>, GroupingFault>
where
    F: Fn(&R) -> Option<Key>,
{
    let mut buckets: HashMap<&Key, Vec<R>> = keys.iter().map(|key| (key, Vec::new())).collect();

    for (index, row) in rows.into_iter().enumerate() {
        let key = key_of(&row).ok_or(GroupingFault { index })?;
        match buckets.get_mut(&key) {
            Some(bucket) => bucket.push(row),
            None => trace!(%key, index, "ignoring row for key outside the requested set"),
        }
    }

    let groups: HashMap<&Key, Group<R>> = buckets
        .into_iter()
        .map(|(key, bucket)| (key, Group::from(bucket)))
        .collect();

    Ok(keys
        .iter()
        .map(|key| {
            groups
                .get(key)
                .cloned()
                .expect("every requested key has a bucket")
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed(id: i64, value: &str) -> (i64, String) {
        (id, value.to_owned())
    }

    fn owner(row: &(i64, String)) -> Option<Key> {
        Some(Key::Id(row.0))
    }

    #[test]
    fn groups_align_with_keys_and_preserve_row_order() {
        let keys = vec![Key::Id(1), Key::Id(2), Key::Id(3)];
        let rows = vec![keyed(3, "c"), keyed(1, "a"), keyed(1, "b")];

        let groups = group_rows(&keys, rows, owner).unwrap();

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[0][0].1, "a");
        assert_eq!(groups[0][1].1, "b");
        assert!(groups[1].is_empty());
        assert_eq!(groups[2][0].1, "c");
    }

    #[test]
    fn rows_for_unrequested_keys_are_ignored() {
        let keys = vec![Key::Id(1)];
        let rows = vec![keyed(1, "a"), keyed(99, "stray")];

        let groups = group_rows(&keys, rows, owner).unwrap();

        assert_eq!(groups[0].len(), 1);
        assert_eq!(groups[0][0].1, "a");
    }

    #[test]
    fn unattributable_row_is_a_fault() {
        let keys = vec![Key::Id(1)];
        let rows = vec![keyed(1, "a"), keyed(2, "untagged")];

        let fault = group_rows(&keys, rows, |row| {
            if row.1 == "untagged" {
                None
            } else {
                owner(row)
            }
        })
        .unwrap_err();

        assert_eq!(fault, GroupingFault { index: 1 });
    }

    #[test]
    fn duplicate_keys_share_one_group() {
        let keys = vec![Key::Id(7), Key::Id(7)];
        let rows = vec![keyed(7, "a")];

        let groups = group_rows(&keys, rows, owner).unwrap();

        assert!(Arc::ptr_eq(&groups[0], &groups[1]));
    }

    #[test]
    fn empty_inputs() {
        let groups = group_rows::<(i64, String), _>(&[], Vec::new(), owner).unwrap();
        assert!(groups.is_empty());

        let keys = vec![Key::Id(1)];
        let groups = group_rows::<(i64, String), _>(&keys, Vec::new(), owner).unwrap();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].is_empty());
    }
}
