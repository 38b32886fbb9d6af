//! Property tests for change compaction.
//!
//!  - Updating a TTL entry keeps the largest `live_until_ledger_seq` seen.
//!  - Any run of updates collapses to the first `pre` and the last `post`.
//!  - Creating then removing an entry leaves nothing behind.
//!  - A rejected change leaves the cache as it was.

use henyey_ingest::test_utils::{account_entry, live_until, ttl_entry};
use henyey_ingest::{Change, ChangeCompactor, ChangeCompactorConfig, ChangeKind};
use proptest::prelude::*;

fn compactor() -> ChangeCompactor {
    ChangeCompactor::new(ChangeCompactorConfig::default())
}

fn ttl_values() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::vec(1u32..1_000_000, 2..20)
}

proptest! {
    #[test]
    fn ttl_updates_keep_the_maximum(values in ttl_values()) {
        let mut c = compactor();
        c.add_change(Change::created(ttl_entry(1, values[0]))).unwrap();
        for pair in values.windows(2) {
            c.add_change(Change::updated(ttl_entry(1, pair[0]), ttl_entry(1, pair[1]))).unwrap();
        }

        let changes = c.get_changes();
        prop_assert_eq!(changes.len(), 1);
        prop_assert_eq!(changes[0].kind().unwrap(), ChangeKind::Created);
        let max = *values.iter().max().unwrap();
        prop_assert_eq!(live_until(changes[0].post.as_ref().unwrap()), max);
    }

    #[test]
    fn updates_collapse_to_first_pre_and_last_post(balances in prop::collection::vec(0i64..1_000, 2..30)) {
        let mut c = compactor();
        for pair in balances.windows(2) {
            c.add_change(Change::updated(account_entry(1, pair[0]), account_entry(1, pair[1]))).unwrap();
        }

        let changes = c.get_changes();
        prop_assert_eq!(changes.len(), 1);
        prop_assert_eq!(changes[0].kind().unwrap(), ChangeKind::Updated);
        prop_assert_eq!(changes[0].pre.clone(), Some(account_entry(1, balances[0])));
        prop_assert_eq!(changes[0].post.clone(), Some(account_entry(1, *balances.last().unwrap())));
    }

    #[test]
    fn create_then_remove_is_silent(balances in prop::collection::vec(0i64..1_000, 1..10)) {
        let mut c = compactor();
        c.add_change(Change::created(account_entry(1, balances[0]))).unwrap();
        for pair in balances.windows(2) {
            c.add_change(Change::updated(account_entry(1, pair[0]), account_entry(1, pair[1]))).unwrap();
        }
        let last = *balances.last().unwrap();
        c.add_change(Change::removed(account_entry(1, last))).unwrap();

        prop_assert_eq!(c.size(), 0);
        prop_assert!(c.get_changes().is_empty());
    }

    #[test]
    fn double_remove_is_rejected_without_side_effects(id in any::<u8>(), balance in 0i64..1_000) {
        let mut c = compactor();
        let first = Change::removed(account_entry(id, balance));
        c.add_change(first.clone()).unwrap();

        let err = c.add_change(Change::removed(account_entry(id, balance + 1))).unwrap_err();
        prop_assert!(err.is_state_error());
        prop_assert_eq!(c.size(), 1);
        prop_assert_eq!(c.get_changes(), vec![first]);
    }

    #[test]
    fn distinct_entries_do_not_interact(ids in prop::collection::btree_set(any::<u8>(), 1..40)) {
        let mut c = compactor();
        for id in &ids {
            c.add_change(Change::created(account_entry(*id, 1))).unwrap();
        }
        prop_assert_eq!(c.size(), ids.len());
        prop_assert_eq!(c.get_changes().len(), ids.len());
    }
}
