//! Transaction discipline: reader/writer coexistence, exclusion rules,
//! abort semantics, reset/renew, append mode, space recovery.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use common::*;
use opal_engine::{BackendOptions, Error, ReadContext, StorageKey, Store};

#[test]
fn test_readers_run_alongside_one_writer() {
    let store = store_with_points();
    put_points(&store, &[(1, 1)]);

    let mut wtxn = store.begin_write().unwrap();
    let mut p = point(2, 2);
    wtxn.put_object(&mut p).unwrap();

    let completed = AtomicUsize::new(0);
    std::thread::scope(|scope| {
        let store = &store;
        let completed = &completed;
        for _ in 0..2 {
            scope.spawn(move || {
                let rtxn = store.begin_read().unwrap();
                // Snapshot isolation: the writer's staged object is not
                // visible.
                assert_eq!(rtxn.load_object::<Point>(1).unwrap().unwrap().x, 1);
                assert_eq!(rtxn.load_object::<Point>(2).unwrap(), None);
                completed.fetch_add(1, Ordering::SeqCst);
            });
        }
        scope.spawn(move || {
            // An exclusive read is rejected while the writer is active.
            assert!(matches!(
                store.begin_exclusive_read().map(|_| ()),
                Err(Error::ReadBlocked)
            ));
            completed.fetch_add(1, Ordering::SeqCst);
        });
    });
    assert_eq!(completed.load(Ordering::SeqCst), 3);

    wtxn.commit().unwrap();

    // With the writer gone, exclusive reads are admitted again.
    let xtxn = store.begin_exclusive_read().unwrap();
    assert_eq!(xtxn.load_object::<Point>(2).unwrap().unwrap().x, 2);
}

#[test]
fn test_exclusive_read_blocks_writer() {
    let store = store_with_points();
    let xtxn = store.begin_exclusive_read().unwrap();
    assert!(matches!(
        store.begin_write().map(|_| ()),
        Err(Error::WriteBlocked)
    ));
    drop(xtxn);
    let wtxn = store.begin_write().unwrap();
    wtxn.commit().unwrap();
}

#[test]
fn test_second_writer_waits_for_first() {
    let store = store_with_points();
    let wtxn = store.begin_write().unwrap();

    std::thread::scope(|scope| {
        let store = &store;
        let waiter = scope.spawn(move || {
            // Blocks on the writer lock until the first transaction ends.
            let mut txn = store.begin_write().unwrap();
            let mut p = point(50, 50);
            txn.put_object(&mut p).unwrap();
            txn.commit().unwrap();
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(wtxn);
        waiter.join().unwrap();
    });

    let rtxn = store.begin_read().unwrap();
    assert_eq!(rtxn.load_object::<Point>(1).unwrap().unwrap().x, 50);
}

#[test]
fn test_abort_leaves_store_unchanged() {
    let store = store_with_points();
    let ids = put_points(&store, &[(1, 2)]);

    let before = {
        let rtxn = store.begin_read().unwrap();
        rtxn.get_data(StorageKey::new(10, ids[0], 0)).unwrap().unwrap()
    };

    {
        let mut wtxn = store.begin_write().unwrap();
        let mut changed = point(77, 88);
        wtxn.update_object(ids[0], &mut changed).unwrap();
        let mut fresh = point(9, 9);
        wtxn.put_object(&mut fresh).unwrap();
        // Dropped without commit.
    }

    let rtxn = store.begin_read().unwrap();
    let after = rtxn.get_data(StorageKey::new(10, ids[0], 0)).unwrap().unwrap();
    assert_eq!(after, before);
    assert_eq!(rtxn.load_object::<Point>(ids[0] + 1).unwrap(), None);
}

#[test]
fn test_read_reset_and_renew() {
    let store = store_with_points();
    let ids = put_points(&store, &[(4, 4)]);

    let mut rtxn = store.begin_read().unwrap();
    assert!(rtxn.load_object::<Point>(ids[0]).unwrap().is_some());

    rtxn.reset();
    let err = rtxn.load_object::<Point>(ids[0]).unwrap_err();
    assert!(matches!(err, Error::TransactionMisuse { .. }));
    // Renewing twice is a misuse as well.
    rtxn.renew().unwrap();
    assert!(rtxn.renew().is_err());

    assert_eq!(rtxn.load_object::<Point>(ids[0]).unwrap().unwrap().x, 4);
}

#[test]
fn test_write_reset_discards_and_renew_restarts() {
    let store = store_with_points();

    let mut wtxn = store.begin_write().unwrap();
    let mut p = point(1, 1);
    wtxn.put_object(&mut p).unwrap();
    wtxn.reset();

    let mut q = point(2, 2);
    assert!(wtxn.put_object(&mut q).is_err());

    wtxn.renew().unwrap();
    let mut r = point(3, 3);
    wtxn.put_object(&mut r).unwrap();
    wtxn.commit().unwrap();

    let rtxn = store.begin_read().unwrap();
    // The pre-reset write never reached the store.
    assert_eq!(rtxn.load_object::<Point>(1).unwrap(), None);
    assert_eq!(rtxn.load_object::<Point>(r.id).unwrap().unwrap().x, 3);
}

#[test]
fn test_append_mode() {
    let mut store = store_with_points();
    store.register(line_spec()).unwrap();

    let mut wtxn = store.begin_append_write().unwrap();
    let mut a = point(1, 1);
    let mut b = point(2, 2);
    wtxn.put_object(&mut a).unwrap();
    wtxn.put_object(&mut b).unwrap();

    // Complex objects reference other mapped objects and are rejected.
    let mut line = Line {
        id: 0,
        a: point(0, 0),
        b: point(0, 0),
    };
    assert!(matches!(
        wtxn.put_object(&mut line),
        Err(Error::InvalidAppend { .. })
    ));

    // Rewriting an earlier key violates the strict ordering.
    let err = wtxn.update_object(a.id, &mut a).unwrap_err();
    assert!(matches!(err, Error::InvalidAppend { .. }));
    drop(wtxn);

    // The same writes succeed in a regular transaction.
    let mut wtxn = store.begin_write().unwrap();
    wtxn.put_object(&mut line).unwrap();
    wtxn.commit().unwrap();
}

#[test]
fn test_out_of_space_recovers_by_growing() {
    let mut options = BackendOptions::default();
    options.initial_map_size_mb = 0;
    options.min_transaction_space_kb = 0;
    options.increase_map_size_kb = 4;
    // Registration already needs the resize-retry path: the map starts
    // with zero bytes of room.
    let mut store = Store::open_in_memory(options).unwrap();
    store.register(point_spec()).unwrap();

    let mut wtxn = store.begin_write().unwrap();
    let mut p = point(1, 2);
    let oid = wtxn.put_object(&mut p).unwrap();
    // One string bigger than the remaining space: the transaction grows
    // the backend once and retries transparently.
    let id = wtxn
        .put_value_collection::<String>(&["y".repeat(5000)])
        .unwrap();
    wtxn.commit().unwrap();

    let rtxn = store.begin_read().unwrap();
    assert_eq!(rtxn.load_object::<Point>(oid).unwrap().unwrap().y, 2);
    assert_eq!(rtxn.get_value_collection::<String>(id).unwrap()[0].len(), 5000);
    drop(rtxn);

    // A value far beyond one growth increment still fails after the
    // single retry.
    let mut wtxn = store.begin_write().unwrap();
    let err = wtxn
        .put_value_collection::<String>(&["z".repeat(100 * 1024)])
        .unwrap_err();
    assert!(matches!(err, Error::OutOfSpace));
}

#[test]
fn test_commit_after_reset_is_misuse() {
    let store = store_with_points();
    let mut wtxn = store.begin_write().unwrap();
    wtxn.reset();
    assert!(matches!(
        wtxn.commit(),
        Err(Error::TransactionMisuse { .. })
    ));
}
