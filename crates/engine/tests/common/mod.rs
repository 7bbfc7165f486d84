#![allow(dead_code)]

use opal_engine::{AnyHandle, BackendOptions, ClassSpec, ObjectId, Store};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Point {
    pub id: u64,
    pub x: i32,
    pub y: i32,
}

pub fn point_spec() -> ClassSpec<Point> {
    ClassSpec::<Point>::new("Point")
        .object_id(|p| p.id, |p, id| p.id = id)
        .scalar("x", |p: &Point| p.x, |p, v| p.x = v)
        .scalar("y", |p: &Point| p.y, |p, v| p.y = v)
}

pub fn point(x: i32, y: i32) -> Point {
    Point { id: 0, x, y }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Line {
    pub id: u64,
    pub a: Point,
    pub b: Point,
}

pub fn line_spec() -> ClassSpec<Line> {
    ClassSpec::<Line>::new("Line")
        .object_id(|l| l.id, |l, id| l.id = id)
        .embedded_object("a", "Point", |l: &Line| &l.a, |l, v| l.a = v)
        .embedded_object("b", "Point", |l: &Line| &l.b, |l, v| l.b = v)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Shape {
    pub id: u64,
    pub kind: i32,
}

pub fn shape_spec() -> ClassSpec<Shape> {
    ClassSpec::<Shape>::new("Shape")
        .object_id(|s| s.id, |s, id| s.id = id)
        .scalar("kind", |s: &Shape| s.kind, |s, v| s.kind = v)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Circle {
    pub id: u64,
    pub kind: i32,
    pub radius: f64,
}

/// Circle re-declares Shape's property prefix, then its own extras.
pub fn circle_spec() -> ClassSpec<Circle> {
    ClassSpec::<Circle>::new("Circle")
        .extends::<Shape>()
        .object_id(|c| c.id, |c, id| c.id = id)
        .scalar("kind", |c: &Circle| c.kind, |c, v| c.kind = v)
        .scalar("radius", |c: &Circle| c.radius, |c, v| c.radius = v)
}

/// Non-mapped stand-in for unknown Shape subclasses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShapeStub {
    pub id: u64,
    pub kind: i32,
}

pub fn shape_stub_spec() -> ClassSpec<ShapeStub> {
    ClassSpec::<ShapeStub>::new("ShapeStub")
        .object_id(|s| s.id, |s, id| s.id = id)
        .scalar("kind", |s: &ShapeStub| s.kind, |s, v| s.kind = v)
}

pub fn open_store() -> Store {
    Store::open_in_memory(BackendOptions::default()).expect("open in-memory store")
}

pub fn store_with_points() -> Store {
    let mut store = open_store();
    store.register(point_spec()).expect("register Point");
    store
}

pub fn handle_xy(handle: &AnyHandle) -> (i32, i32) {
    let p = handle
        .downcast_ref::<Point>()
        .expect("element should be a Point");
    (p.x, p.y)
}

pub fn put_points(store: &Store, points: &[(i32, i32)]) -> Vec<ObjectId> {
    let mut txn = store.begin_write().expect("begin write");
    let mut ids = Vec::new();
    for (x, y) in points {
        let mut p = point(*x, *y);
        ids.push(txn.put_object(&mut p).expect("put point"));
    }
    txn.commit().expect("commit");
    ids
}
