//! Chunked collection behavior: byte layout, chunk rollover, slack
//! reuse, cursors, raw-data views, polymorphism under schema drift.

mod common;

use std::sync::Arc;

use common::*;
use opal_engine::{
    AnyHandle, BackendOptions, Error, MemoryBackend, ReadContext, StorageKey, Store,
    COLLECTION_CLSID,
};

#[test]
fn test_value_collection_chunk_bytes() {
    let store = store_with_points();
    let mut txn = store.begin_write().unwrap();
    let id = txn.put_value_collection::<u32>(&[10, 20, 30]).unwrap();
    txn.commit().unwrap();

    let txn = store.begin_read().unwrap();
    let chunk = txn
        .get_data(StorageKey::new(COLLECTION_CLSID, id, 1))
        .unwrap()
        .unwrap();
    // The chunk was allocated at the default size; only the filled region
    // counts as data.
    assert_eq!(chunk.len(), 2048);
    assert_eq!(
        &chunk[..12],
        &[
            0x18, 0, 0, 0, // data_size = 12 header + 12 payload
            0x00, 0, 0, 0, // start_index
            0x03, 0, 0, 0, // element_count
        ]
    );
    assert_eq!(
        &chunk[12..24],
        &[0x0A, 0, 0, 0, 0x14, 0, 0, 0, 0x1E, 0, 0, 0]
    );
    assert!(chunk[24..].iter().all(|b| *b == 0));

    assert_eq!(txn.get_value_collection::<u32>(id).unwrap(), vec![10, 20, 30]);
}

#[test]
fn test_empty_collection() {
    let store = store_with_points();
    let mut txn = store.begin_write().unwrap();
    let id = txn.put_value_collection::<u32>(&[]).unwrap();
    txn.commit().unwrap();

    let txn = store.begin_read().unwrap();
    let info = txn.collection_info(id).unwrap();
    assert!(info.chunk_infos.is_empty());
    assert_eq!(info.len(), 0);
    assert_eq!(txn.get_value_collection::<u32>(id).unwrap(), Vec::<u32>::new());
}

#[test]
fn test_large_object_collection_spans_chunks() {
    let store = store_with_points();
    let mut points: Vec<Point> = (0..1000).map(|i| point(i, -i)).collect();

    let mut txn = store.begin_write().unwrap();
    let id = txn.put_collection_of::<Point>(&mut points).unwrap();
    txn.commit().unwrap();

    let txn = store.begin_read().unwrap();
    let info = txn.collection_info(id).unwrap();
    assert!(info.chunk_infos.len() >= 2);
    assert_eq!(info.len(), 1000);

    // start_index is the prefix sum of the element counts.
    let mut expected_start = 0;
    for chunk in &info.chunk_infos {
        assert_eq!(chunk.start_index, expected_start);
        expected_start += chunk.element_count;
    }

    // Iterate across chunk boundaries; the in-chunk element counter
    // restarts at every boundary.
    let mut cursor = txn.collection_cursor::<Point>(id).unwrap();
    let mut count = 0u64;
    let mut chunks_seen = Vec::new();
    let mut last_chunk = None;
    while let Some(handle) = cursor.next().unwrap() {
        let current = cursor.current_chunk_id().unwrap();
        if last_chunk != Some(current) {
            assert_eq!(cursor.element_in_chunk(), 1);
            chunks_seen.push(current);
            last_chunk = Some(current);
        }
        assert_eq!(handle_xy(&handle).0 as u64, count);
        count += 1;
    }
    assert_eq!(count, 1000);
    assert_eq!(chunks_seen.len(), info.chunk_infos.len());
}

#[test]
fn test_object_collection_roundtrip_order() {
    let store = store_with_points();
    let mut items = vec![
        AnyHandle::new(point(1, 10)),
        AnyHandle::new(point(2, 20)),
        AnyHandle::new(point(3, 30)),
    ];
    let mut txn = store.begin_write().unwrap();
    let id = txn.put_collection(&mut items).unwrap();
    txn.commit().unwrap();

    let txn = store.begin_read().unwrap();
    let loaded = txn.get_collection::<Point>(id).unwrap();
    let pairs: Vec<(i32, i32)> = loaded.iter().map(handle_xy).collect();
    assert_eq!(pairs, vec![(1, 10), (2, 20), (3, 30)]);
    drop(txn);

    // Bulk append continues the same sequence.
    let mut txn = store.begin_write().unwrap();
    let mut more = vec![AnyHandle::new(point(4, 40))];
    txn.append_collection(id, &mut more).unwrap();
    txn.commit().unwrap();

    let txn = store.begin_read().unwrap();
    let loaded = txn.get_collection::<Point>(id).unwrap();
    assert_eq!(loaded.len(), 4);
    assert_eq!(handle_xy(&loaded[3]), (4, 40));
}

#[test]
fn test_slack_reuse_and_rollover() {
    let store = store_with_points();
    let mut txn = store.begin_write().unwrap();
    let id = txn.put_value_collection::<u32>(&[10, 20, 30]).unwrap();
    txn.commit().unwrap();

    // data = 12 header + 12 payload; slack = 2048 - 24 = 2024 = 506 values.
    let fill: Vec<u32> = (0..506).collect();
    let mut txn = store.begin_write().unwrap();
    txn.append_value_collection(id, &fill).unwrap();
    txn.commit().unwrap();

    let txn = store.begin_read().unwrap();
    let info = txn.collection_info(id).unwrap();
    assert_eq!(info.chunk_infos.len(), 1);
    assert_eq!(info.chunk_infos[0].data_size, 2048);
    assert_eq!(info.len(), 509);
    drop(txn);

    // The chunk is exactly full now; one more value rolls over.
    let mut txn = store.begin_write().unwrap();
    txn.append_value_collection(id, &[7]).unwrap();
    txn.commit().unwrap();

    let txn = store.begin_read().unwrap();
    let info = txn.collection_info(id).unwrap();
    assert_eq!(info.chunk_infos.len(), 2);
    assert_eq!(info.chunk_infos[1].start_index, 509);
    assert_eq!(info.chunk_infos[1].element_count, 1);
    assert_eq!(info.len(), 510);

    let all = txn.get_value_collection::<u32>(id).unwrap();
    assert_eq!(all.len(), 510);
    assert_eq!(all[0..3], [10, 20, 30]);
    assert_eq!(all[509], 7);
}

#[test]
fn test_object_appender() {
    let store = store_with_points();
    let mut txn = store.begin_write().unwrap();
    let mut seed: Vec<Point> = Vec::new();
    let id = txn.put_collection_of::<Point>(&mut seed).unwrap();

    let mut appender = txn.collection_appender(id, 256).unwrap();
    for i in 0..50 {
        let mut p = point(i, i);
        appender.put_object(&mut p).unwrap();
    }
    let mut handle = AnyHandle::new(point(99, 99));
    appender.put(&mut handle).unwrap();
    assert_ne!(handle.oid(), 0);
    appender.close().unwrap();
    txn.commit().unwrap();

    let txn = store.begin_read().unwrap();
    let loaded = txn.get_collection::<Point>(id).unwrap();
    assert_eq!(loaded.len(), 51);
    assert_eq!(handle_xy(&loaded[50]), (99, 99));
    let info = txn.collection_info(id).unwrap();
    assert!(info.chunk_infos.len() > 1);
}

#[test]
fn test_value_cursor_matches_bulk_read() {
    let store = store_with_points();
    let values: Vec<i64> = (0..800).map(|i| i * 3 - 1000).collect();
    let mut txn = store.begin_write().unwrap();
    let id = txn.put_value_collection(&values).unwrap();
    txn.commit().unwrap();

    let txn = store.begin_read().unwrap();
    let mut cursor = txn.value_collection_cursor::<i64>(id).unwrap();
    let mut streamed = Vec::new();
    while let Some(v) = cursor.next().unwrap() {
        streamed.push(v);
    }
    assert!(cursor.at_end());
    assert_eq!(streamed, values);
    assert_eq!(txn.get_value_collection::<i64>(id).unwrap(), values);
}

#[test]
fn test_raw_data_collection_views() {
    let store = store_with_points();
    let values: Vec<u32> = (0..700).collect();
    let mut txn = store.begin_write().unwrap();
    let id = txn.put_data_collection(&values).unwrap();
    txn.commit().unwrap();

    let txn = store.begin_exclusive_read().unwrap();

    // Chunk capacity is (2048 - 12) / 4 = 509 elements.
    let info = txn.collection_info(id).unwrap();
    assert_eq!(info.chunk_infos.len(), 2);
    assert_eq!(info.chunk_infos[0].element_count, 509);

    // A single element within one chunk borrows store memory.
    let one = txn.get_data_collection::<u32>(id, 0, 1).unwrap().unwrap();
    assert!(one.is_borrowed());
    assert_eq!(one.as_slice(), &[0]);

    let range = txn.get_data_collection::<u32>(id, 100, 50).unwrap().unwrap();
    assert!(range.is_borrowed());
    assert_eq!(range.as_slice(), &values[100..150]);

    // A range crossing the chunk boundary is stitched into a copy.
    let spanning = txn.get_data_collection::<u32>(id, 500, 50).unwrap().unwrap();
    assert!(!spanning.is_borrowed());
    assert_eq!(spanning.as_slice(), &values[500..550]);

    // Out-of-range and unknown collections yield no view.
    assert!(txn.get_data_collection::<u32>(id, 0, 701).unwrap().is_none());
    assert!(txn.get_data_collection::<u32>(999, 0, 1).unwrap().is_none());
    drop(txn);

    // Raw appends extend the tail.
    let mut txn = store.begin_write().unwrap();
    txn.append_data_collection::<u32>(id, &[700, 701]).unwrap();
    txn.commit().unwrap();
    let txn = store.begin_exclusive_read().unwrap();
    let tail = txn.get_data_collection::<u32>(id, 700, 2).unwrap().unwrap();
    assert_eq!(tail.as_slice(), &[700, 701]);
}

#[test]
fn test_data_appender_keeps_elements_whole() {
    let store = store_with_points();
    let mut txn = store.begin_write().unwrap();
    let id = txn.put_data_collection::<u64>(&[]).unwrap();
    let mut appender = txn.data_appender::<u64>(id, 64).unwrap();
    // 64-byte chunks hold (64 - 12) / 8 = 6 elements each.
    appender.put_slice(&(0..20u64).collect::<Vec<_>>()).unwrap();
    appender.close().unwrap();
    txn.commit().unwrap();

    let txn = store.begin_read().unwrap();
    let info = txn.collection_info(id).unwrap();
    assert_eq!(info.len(), 20);
    for chunk in &info.chunk_infos {
        // Header plus whole elements only.
        assert_eq!((chunk.data_size - 12) % 8, 0);
    }
    let values = txn.get_value_collection::<u64>(id).unwrap();
    assert_eq!(values, (0..20).collect::<Vec<u64>>());
}

#[test]
fn test_collection_visibility_is_transactional() {
    let store = store_with_points();

    let mut wtxn = store.begin_write().unwrap();
    let id = wtxn.put_value_collection::<u32>(&[1, 2, 3]).unwrap();

    // A reader opened before commit sees neither metadata nor chunks.
    let rtxn = store.begin_read().unwrap();
    assert!(rtxn.collection_info(id).unwrap_err().is_not_found());
    drop(rtxn);

    wtxn.commit().unwrap();

    let rtxn = store.begin_read().unwrap();
    assert_eq!(rtxn.get_value_collection::<u32>(id).unwrap(), vec![1, 2, 3]);
}

fn store_with_shapes(backend: Arc<MemoryBackend>) -> Store {
    let mut store = Store::open(backend).unwrap();
    store.register(shape_spec()).unwrap();
    store.register(circle_spec()).unwrap();
    store
}

#[test]
fn test_unknown_class_substitution_in_collections() {
    let backend = Arc::new(MemoryBackend::new(BackendOptions::default()));

    let (id, circle_cid) = {
        let store = store_with_shapes(backend.clone());
        let circle_cid = store.registry().class_by_name("Circle").unwrap().class_id();
        let mut items = vec![
            AnyHandle::new(Shape { id: 0, kind: 1 }),
            AnyHandle::new(Circle {
                id: 0,
                kind: 2,
                radius: 4.5,
            }),
        ];
        let mut txn = store.begin_write().unwrap();
        let id = txn.put_collection(&mut items).unwrap();
        txn.commit().unwrap();
        (id, circle_cid)
    };

    // Reopen knowing only the base class: the circle's class is missing.
    {
        let mut store = Store::open(backend.clone()).unwrap();
        store.register(shape_spec()).unwrap();

        // Without a substitute the unknown element is skipped...
        let txn = store.begin_read().unwrap();
        let loaded = txn.get_collection::<Shape>(id).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].downcast_ref::<Shape>().unwrap().kind, 1);

        // ...and strict traversal reports it instead.
        let mut strict = txn.collection_cursor::<Shape>(id).unwrap().strict();
        strict.next().unwrap();
        let err = strict.next().unwrap_err();
        assert!(matches!(err, Error::UnknownClass(cid) if cid == circle_cid));
    }

    // With a substitute the base prefix of the element is recovered.
    {
        let mut store = Store::open(backend).unwrap();
        store.register(shape_spec()).unwrap();
        store
            .register_substitute::<Shape, ShapeStub>(shape_stub_spec())
            .unwrap();

        let txn = store.begin_read().unwrap();
        let loaded = txn.get_collection::<Shape>(id).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].downcast_ref::<Shape>().unwrap().kind, 1);
        let stub = loaded[1].downcast_ref::<ShapeStub>().unwrap();
        assert_eq!(stub.kind, 2);
        assert_eq!(loaded[1].class_id(), circle_cid);
    }
}
