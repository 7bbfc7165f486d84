//! Schema persistence and compatibility across store reopens.

mod common;

use std::sync::Arc;

use common::*;
use opal_engine::{BackendOptions, ClassSpec, Error, MemoryBackend, Store};

fn shared_backend() -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new(BackendOptions::default()))
}

#[test]
fn test_reopen_keeps_class_and_property_ids() {
    let backend = shared_backend();

    let oid = {
        let mut store = Store::open(backend.clone()).unwrap();
        assert_eq!(store.register(point_spec()).unwrap(), 10);
        let mut txn = store.begin_write().unwrap();
        let mut p = point(4, 5);
        let oid = txn.put_object(&mut p).unwrap();
        txn.commit().unwrap();
        oid
    };

    let mut store = Store::open(backend).unwrap();
    assert_eq!(store.register(point_spec()).unwrap(), 10);

    let info = store.registry().class_by_name("Point").unwrap();
    let ids: Vec<u16> = info.properties().iter().map(|p| p.id()).collect();
    assert_eq!(ids, vec![2, 3, 4]);

    // Stored data is readable, and new ids continue after the old ones.
    let txn = store.begin_read().unwrap();
    assert_eq!(txn.load_object::<Point>(oid).unwrap().unwrap().x, 4);
    drop(txn);

    let new_ids = put_points(&store, &[(9, 9)]);
    assert_eq!(new_ids, vec![oid + 1]);
}

#[derive(Debug, Clone, Default, PartialEq)]
struct WidePoint {
    id: u64,
    x: i64,
    y: i32,
}

#[test]
fn test_changed_property_type_is_incompatible() {
    let backend = shared_backend();
    {
        let mut store = Store::open(backend.clone()).unwrap();
        store.register(point_spec()).unwrap();
    }

    let mut store = Store::open(backend).unwrap();
    let err = store
        .register(
            ClassSpec::<WidePoint>::new("Point")
                .object_id(|p| p.id, |p, id| p.id = id)
                .scalar("x", |p: &WidePoint| p.x, |p, v| p.x = v)
                .scalar("y", |p: &WidePoint| p.y, |p, v| p.y = v),
        )
        .unwrap_err();
    match err {
        Error::IncompatibleSchema {
            class_name,
            property,
        } => {
            assert_eq!(class_name, "Point");
            assert_eq!(property, "x");
        }
        other => panic!("expected IncompatibleSchema, got {other:?}"),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct PointWithZ {
    id: u64,
    x: i32,
    y: i32,
    z: i32,
}

#[test]
fn test_new_live_property_is_disabled() {
    let backend = shared_backend();
    let oid = {
        let mut store = Store::open(backend.clone()).unwrap();
        store.register(point_spec()).unwrap();
        put_points(&store, &[(1, 2)])[0]
    };

    let mut store = Store::open(backend).unwrap();
    store
        .register(
            ClassSpec::<PointWithZ>::new("Point")
                .object_id(|p| p.id, |p, id| p.id = id)
                .scalar("x", |p: &PointWithZ| p.x, |p, v| p.x = v)
                .scalar("y", |p: &PointWithZ| p.y, |p, v| p.y = v)
                .scalar("z", |p: &PointWithZ| p.z, |p, v| p.z = v),
        )
        .unwrap();

    let info = store.registry().class_by_name("Point").unwrap();
    let z = info.properties().get("z").unwrap();
    assert!(!z.enabled());
    assert!(info.properties().get("x").unwrap().enabled());

    // Old records load; z stays at its default on both load and save.
    let txn = store.begin_read().unwrap();
    let loaded = txn.load_object::<PointWithZ>(oid).unwrap().unwrap();
    assert_eq!((loaded.x, loaded.y, loaded.z), (1, 2, 0));
    drop(txn);

    let mut txn = store.begin_write().unwrap();
    let mut p = PointWithZ {
        id: 0,
        x: 7,
        y: 8,
        z: 99,
    };
    let new_oid = txn.put_object(&mut p).unwrap();
    txn.commit().unwrap();

    let txn = store.begin_read().unwrap();
    let back = txn.load_object::<PointWithZ>(new_oid).unwrap().unwrap();
    assert_eq!((back.x, back.y, back.z), (7, 8, 0));
}

#[derive(Debug, Clone, Default, PartialEq)]
struct NarrowPoint {
    id: u64,
    x: i32,
}

#[test]
fn test_persisted_only_property_is_tolerated() {
    let backend = shared_backend();
    let oid = {
        let mut store = Store::open(backend.clone()).unwrap();
        store.register(point_spec()).unwrap();
        put_points(&store, &[(11, 22)])[0]
    };

    let mut store = Store::open(backend).unwrap();
    store
        .register(
            ClassSpec::<NarrowPoint>::new("Point")
                .object_id(|p| p.id, |p, id| p.id = id)
                .scalar("x", |p: &NarrowPoint| p.x, |p, v| p.x = v),
        )
        .unwrap();

    let txn = store.begin_read().unwrap();
    let loaded = txn.load_object::<NarrowPoint>(oid).unwrap().unwrap();
    assert_eq!(loaded.x, 11);
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Gamma {
    id: u64,
    v: i32,
}

#[test]
fn test_class_ids_are_never_reused() {
    let backend = shared_backend();
    {
        let mut store = Store::open(backend.clone()).unwrap();
        assert_eq!(store.register(point_spec()).unwrap(), 10);
        assert_eq!(store.register(shape_spec()).unwrap(), 11);
    }

    // A later session that registers only a new class still allocates
    // past every id ever issued.
    let mut store = Store::open(backend).unwrap();
    let gamma_id = store
        .register(
            ClassSpec::<Gamma>::new("Gamma")
                .object_id(|g| g.id, |g, id| g.id = id)
                .scalar("v", |g: &Gamma| g.v, |g, v| g.v = v),
        )
        .unwrap();
    assert_eq!(gamma_id, 12);
}
