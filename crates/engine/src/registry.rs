//! Class registry: type identity, property metadata, inheritance graph.
//!
//! Every mapped type is described by a [`ClassSpec`] listing its property
//! mappings and superclasses. Registration resolves the spec against the
//! persisted schema (adopting the stored ClassId and property ids, or
//! assigning fresh ones), publishes the class into the inheritance DAG and
//! produces an immutable [`ClassInfo`].
//!
//! The registry is populated before any transaction opens and never
//! changes afterwards; concurrent readers use it without locking. The only
//! mutable cell is each class's max-ObjectId counter, advanced by the
//! single write transaction.
//!
//! # Persisted schema records
//!
//! One record per class, under `(CLASS_META, class_id, 0)`:
//!
//! ```text
//! ┌───────────────┬──────────────┬────────────────┬───────────────────┐
//! │ name cstring  │ class_id u32 │ prop_count u32 │ prop_count × prop │
//! └───────────────┴──────────────┴────────────────┴───────────────────┘
//! prop:
//! ┌───────────────┬────────┬─────────────┬──────────────┬───────────────┬─────────────────────┐
//! │ name cstring  │ id u16 │ type_id u32 │ is_vector u8 │ byte_size u16 │ class_name cstring  │
//! └───────────────┴────────┴─────────────┴──────────────┴───────────────┴─────────────────────┘
//! ```
//!
//! An empty `class_name` means "not an object type".

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use opal_core::{
    ClassId, Error, ObjectId, PropertyId, PropertyType, ReadCursor, Result, Scalar, StoreLayout,
    WriteBuffer, MIN_USER_CLSID,
};
use tracing::debug;

use crate::handle::AnyHandle;
use crate::property::{
    CollectionRefStorage, EmbeddedObjectStorage, EmbeddedVecStorage, HandleVecStorage,
    ObjectIdStorage, ObjectRefStorage, ObjectVecStorage, PolyEmbeddedVecStorage, PropertyStorage,
    ScalarStorage, ValueSetStorage, ValueVecStorage,
};

/// Factory producing a default instance of a mapped (or substitute) class.
pub type Factory = Box<dyn Fn() -> Box<dyn Any + Send + Sync> + Send + Sync>;

/// Clones a type-erased value of a registered class.
pub(crate) type CloneFn =
    Box<dyn Fn(&(dyn Any + Send + Sync)) -> Option<Box<dyn Any + Send + Sync>> + Send + Sync>;

/// One mapped property: name, assigned ids, persisted type and the storage
/// strategy driving its serialization.
pub struct Property {
    pub(crate) name: &'static str,
    pub(crate) id: PropertyId,
    pub(crate) class_id: ClassId,
    pub(crate) enabled: bool,
    pub(crate) is_key: bool,
    pub(crate) ptype: PropertyType,
    pub(crate) storage: Box<dyn PropertyStorage>,
}

impl Property {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Assigned property id; consecutive from 2 within the class.
    pub fn id(&self) -> PropertyId {
        self.id
    }

    /// ClassId of the class this property belongs to.
    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    /// Disabled properties exist in the live mapping but not in the
    /// persisted schema; they are skipped on both save and load.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn layout(&self) -> StoreLayout {
        self.storage.layout()
    }

    pub fn property_type(&self) -> &PropertyType {
        &self.ptype
    }

    pub(crate) fn storage(&self) -> &dyn PropertyStorage {
        self.storage.as_ref()
    }
}

impl std::fmt::Debug for Property {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("enabled", &self.enabled)
            .field("type", &self.ptype)
            .finish()
    }
}

/// The ordered property table of a class.
pub struct Properties {
    props: Vec<Property>,
    fixed_size: Option<usize>,
    key_index: Option<usize>,
}

impl Properties {
    pub(crate) fn new(mut props: Vec<Property>) -> Self {
        props.sort_by_key(|p| p.id);
        let key_index = props.iter().position(|p| p.is_key);
        let fixed_size = Self::compute_fixed_size(&props);
        Properties {
            props,
            fixed_size,
            key_index,
        }
    }

    fn compute_fixed_size(props: &[Property]) -> Option<usize> {
        let mut total = 0;
        for p in props.iter().filter(|p| p.enabled) {
            total += p.storage.fixed_size()?;
        }
        Some(total)
    }

    /// All properties in id order.
    pub fn iter(&self) -> std::slice::Iter<'_, Property> {
        self.props.iter()
    }

    /// Enabled properties in id order: the record serialization order.
    pub fn enabled(&self) -> impl Iterator<Item = &Property> {
        self.props.iter().filter(|p| p.enabled)
    }

    pub fn get(&self, name: &str) -> Option<&Property> {
        self.props.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Constant shallow record size, when every enabled property has a
    /// constant embedded width.
    pub fn fixed_size(&self) -> Option<usize> {
        self.fixed_size
    }

    /// Read the host object's id through the object-id mapping.
    pub fn object_id_of(&self, obj: &dyn Any) -> Option<ObjectId> {
        let p = &self.props[self.key_index?];
        p.storage.object_id_of(obj)
    }

    /// Store an assigned id through the object-id mapping.
    pub fn assign_object_id(&self, obj: &mut dyn Any, oid: ObjectId) -> bool {
        match self.key_index {
            Some(i) => self.props[i].storage.assign_object_id(obj, oid),
            None => false,
        }
    }
}

/// Immutable description of one registered class.
pub struct ClassInfo {
    name: &'static str,
    type_token: TypeId,
    class_id: ClassId,
    max_object_id: AtomicU64,
    subs: Vec<ClassId>,
    supers: Vec<ClassId>,
    factory: Factory,
    clone_fn: CloneFn,
    substitute: Option<usize>,
    properties: Properties,
}

impl ClassInfo {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Direct subclasses.
    pub fn subs(&self) -> &[ClassId] {
        &self.subs
    }

    /// Direct superclasses.
    pub fn supers(&self) -> &[ClassId] {
        &self.supers
    }

    pub fn is_poly(&self) -> bool {
        !self.subs.is_empty()
    }

    /// Whether instances reference other mapped objects. Complex classes
    /// are rejected in append-mode transactions.
    pub fn is_complex(&self) -> bool {
        self.properties
            .iter()
            .any(|p| p.enabled && p.ptype.class_name.is_some())
    }

    pub fn max_object_id(&self) -> ObjectId {
        self.max_object_id.load(Ordering::SeqCst)
    }

    pub(crate) fn next_object_id(&self) -> ObjectId {
        self.max_object_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn factory(&self) -> &Factory {
        &self.factory
    }

    pub(crate) fn clone_value(
        &self,
        value: &(dyn Any + Send + Sync),
    ) -> Option<Box<dyn Any + Send + Sync>> {
        (self.clone_fn)(value)
    }
}

impl std::fmt::Debug for ClassInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassInfo")
            .field("name", &self.name)
            .field("class_id", &self.class_id)
            .field("subs", &self.subs)
            .field("properties", &self.properties.len())
            .finish()
    }
}

/// Persisted description of one property, used for compatibility checks at
/// registration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyMetaInfo {
    pub name: String,
    pub id: PropertyId,
    pub type_id: u32,
    pub is_vector: bool,
    pub byte_size: u16,
    pub class_name: Option<String>,
}

impl PropertyMetaInfo {
    pub(crate) fn from_property(p: &Property) -> Self {
        PropertyMetaInfo {
            name: p.name.to_string(),
            id: p.id,
            type_id: p.ptype.base_type_id,
            is_vector: p.ptype.is_vector,
            byte_size: p.ptype.byte_size,
            class_name: p.ptype.class_name.clone(),
        }
    }

    /// Whether the persisted type matches a live property type.
    pub(crate) fn matches(&self, ptype: &PropertyType) -> bool {
        self.type_id == ptype.base_type_id
            && self.is_vector == ptype.is_vector
            && self.byte_size == ptype.byte_size
            && self.class_name == ptype.class_name
    }
}

/// A persisted class schema, as scanned from the store at open time.
#[derive(Debug, Clone)]
pub(crate) struct PersistedClass {
    pub(crate) class_id: ClassId,
    pub(crate) properties: Vec<PropertyMetaInfo>,
}

pub(crate) fn encode_class_meta(
    name: &str,
    class_id: ClassId,
    props: &[PropertyMetaInfo],
) -> Result<Vec<u8>> {
    let mut size = name.len() + 1 + 4 + 4;
    for p in props {
        size += p.name.len() + 1 + 2 + 4 + 1 + 2;
        size += p.class_name.as_deref().unwrap_or("").len() + 1;
    }
    let mut buf = WriteBuffer::new();
    buf.start(size);
    buf.write_cstring(name)?;
    buf.write_u32(class_id)?;
    buf.write_u32(props.len() as u32)?;
    for p in props {
        buf.write_cstring(&p.name)?;
        buf.write_u16(p.id)?;
        buf.write_u32(p.type_id)?;
        buf.write_u8(p.is_vector as u8)?;
        buf.write_u16(p.byte_size)?;
        buf.write_cstring(p.class_name.as_deref().unwrap_or(""))?;
    }
    Ok(buf.as_written().to_vec())
}

pub(crate) fn decode_class_meta(bytes: &[u8]) -> Result<(String, PersistedClass)> {
    let mut cur = ReadCursor::new(bytes);
    let name = cur.read_cstring()?;
    let class_id = cur.read_u32()?;
    let count = cur.read_u32()?;
    let mut properties = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let prop_name = cur.read_cstring()?;
        let id = cur.read_u16()?;
        let type_id = cur.read_u32()?;
        let is_vector = cur.read_bool()?;
        let byte_size = cur.read_u16()?;
        let class_name = cur.read_cstring()?;
        properties.push(PropertyMetaInfo {
            name: prop_name,
            id,
            type_id,
            is_vector,
            byte_size,
            class_name: if class_name.is_empty() {
                None
            } else {
                Some(class_name)
            },
        });
    }
    Ok((
        name,
        PersistedClass {
            class_id,
            properties,
        },
    ))
}

/// Mapping specification for one class, consumed by `Store::register`.
pub struct ClassSpec<T> {
    pub(crate) name: &'static str,
    pub(crate) props: Vec<Property>,
    pub(crate) extends: Vec<(TypeId, &'static str)>,
    pub(crate) factory: Factory,
    pub(crate) clone_fn: CloneFn,
    pub(crate) _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync + Clone + Default> ClassSpec<T> {
    /// Spec for a default-constructible class.
    pub fn new(name: &'static str) -> Self {
        Self::with_factory(name, T::default)
    }
}

impl<T: Any + Send + Sync + Clone> ClassSpec<T> {
    /// Spec with an explicit instance factory.
    pub fn with_factory(name: &'static str, make: impl Fn() -> T + Send + Sync + 'static) -> Self {
        ClassSpec {
            name,
            props: Vec::new(),
            extends: Vec::new(),
            factory: Box::new(move || Box::new(make()) as Box<dyn Any + Send + Sync>),
            clone_fn: Box::new(|v| {
                v.downcast_ref::<T>()
                    .map(|t| Box::new(t.clone()) as Box<dyn Any + Send + Sync>)
            }),
            _marker: std::marker::PhantomData,
        }
    }

    fn push(
        mut self,
        name: &'static str,
        is_key: bool,
        ptype: PropertyType,
        storage: Box<dyn PropertyStorage>,
    ) -> Self {
        self.props.push(Property {
            name,
            id: 0,
            class_id: 0,
            enabled: true,
            is_key,
            ptype,
            storage,
        });
        self
    }

    /// Declare this class as a subclass of an already-registered `S`.
    pub fn extends<S: Any>(mut self) -> Self {
        self.extends
            .push((TypeId::of::<S>(), std::any::type_name::<S>()));
        self
    }

    /// Scalar property (int/float/bool/string), stored inline.
    pub fn scalar<V: Scalar>(self, name: &'static str, get: fn(&T) -> V, set: fn(&mut T, V)) -> Self {
        self.push(
            name,
            false,
            PropertyType::base(V::TYPE_ID, V::BYTE_SIZE),
            Box::new(ScalarStorage { get, set }),
        )
    }

    /// Map the store-assigned ObjectId into a field. Occupies no bytes.
    pub fn object_id(self, get: fn(&T) -> ObjectId, set: fn(&mut T, ObjectId)) -> Self {
        self.push(
            "objectId",
            true,
            PropertyType::base(0, 0),
            Box::new(ObjectIdStorage { get, set }),
        )
    }

    /// Vector of scalars under the property's own key.
    pub fn value_vec<V: Scalar>(
        self,
        name: &'static str,
        get: fn(&T) -> &Vec<V>,
        set: fn(&mut T, Vec<V>),
    ) -> Self {
        self.push(
            name,
            false,
            PropertyType::base_vector(V::TYPE_ID, V::BYTE_SIZE),
            Box::new(ValueVecStorage { get, set }),
        )
    }

    /// Ordered set of scalars under the property's own key.
    pub fn value_set<V: Scalar + Ord>(
        self,
        name: &'static str,
        get: fn(&T) -> &std::collections::BTreeSet<V>,
        set: fn(&mut T, std::collections::BTreeSet<V>),
    ) -> Self {
        self.push(
            name,
            false,
            PropertyType::base_vector(V::TYPE_ID, V::BYTE_SIZE),
            Box::new(ValueSetStorage { get, set }),
        )
    }

    /// Owned value object saved under its own key; the parent embeds the
    /// cross-reference. `target` is the mapped class name of `V`.
    pub fn embedded_object<V: Any + Send + Sync + Clone>(
        self,
        name: &'static str,
        target: &'static str,
        get: fn(&T) -> &V,
        set: fn(&mut T, V),
    ) -> Self {
        self.push(
            name,
            false,
            PropertyType::object(target),
            Box::new(EmbeddedObjectStorage::<T, V> { get, set }),
        )
    }

    /// Polymorphic owned reference. With `lazy`, whole-object loads record
    /// the target's identity without dereferencing it.
    pub fn object_ref(
        self,
        name: &'static str,
        target: &'static str,
        lazy: bool,
        get: fn(&T) -> Option<&AnyHandle>,
        set: fn(&mut T, AnyHandle),
    ) -> Self {
        self.push(
            name,
            false,
            PropertyType::object(target),
            Box::new(ObjectRefStorage { lazy, get, set }),
        )
    }

    /// Vector of value objects, each under its own key. Non-polymorphic.
    pub fn object_vec<V: Any + Send + Sync + Clone>(
        self,
        name: &'static str,
        target: &'static str,
        lazy: bool,
        get: fn(&T) -> &Vec<V>,
        set: fn(&mut T, Vec<V>),
    ) -> Self {
        self.push(
            name,
            false,
            PropertyType::object_vector(target),
            Box::new(ObjectVecStorage::<T, V> { lazy, get, set }),
        )
    }

    /// Vector of value objects inlined into the parent record.
    pub fn embedded_vec<V: Any + Send + Sync + Clone>(
        self,
        name: &'static str,
        target: &'static str,
        get: fn(&T) -> &Vec<V>,
        set: fn(&mut T, Vec<V>),
    ) -> Self {
        self.push(
            name,
            false,
            PropertyType::object_vector(target),
            Box::new(EmbeddedVecStorage::<T, V> { get, set }),
        )
    }

    /// Polymorphic vector inlined into the parent record, elements tagged
    /// with their ClassId.
    pub fn poly_embedded_vec(
        self,
        name: &'static str,
        target: &'static str,
        get: fn(&T) -> &Vec<AnyHandle>,
        set: fn(&mut T, Vec<AnyHandle>),
    ) -> Self {
        self.push(
            name,
            false,
            PropertyType::object_vector(target),
            Box::new(PolyEmbeddedVecStorage { target, get, set }),
        )
    }

    /// Vector of polymorphic handles, elements saved individually.
    pub fn handle_vec(
        self,
        name: &'static str,
        target: &'static str,
        lazy: bool,
        get: fn(&T) -> &Vec<AnyHandle>,
        set: fn(&mut T, Vec<AnyHandle>),
    ) -> Self {
        self.push(
            name,
            false,
            PropertyType::object_vector(target),
            Box::new(HandleVecStorage { target, lazy, get, set }),
        )
    }

    /// Reference to a top-level chunked collection; only the collection id
    /// is embedded.
    pub fn collection_ref(
        self,
        name: &'static str,
        target: &'static str,
        get: fn(&T) -> ObjectId,
        set: fn(&mut T, ObjectId),
    ) -> Self {
        self.push(
            name,
            false,
            PropertyType::object_vector(target),
            Box::new(CollectionRefStorage { get, set }),
        )
    }
}

/// The class registry. Immutable once the store starts serving
/// transactions.
pub struct Registry {
    classes: Vec<ClassInfo>,
    /// Substitute descriptions, reachable only through a class's
    /// `substitute` link; never part of the id or name maps.
    substitutes: Vec<ClassInfo>,
    by_class_id: HashMap<ClassId, usize>,
    by_token: HashMap<TypeId, usize>,
    by_name: HashMap<String, usize>,
    persisted: HashMap<String, PersistedClass>,
    max_class_id: ClassId,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry {
            classes: Vec::new(),
            substitutes: Vec::new(),
            by_class_id: HashMap::new(),
            by_token: HashMap::new(),
            by_name: HashMap::new(),
            persisted: HashMap::new(),
            max_class_id: MIN_USER_CLSID - 1,
        }
    }

    pub(crate) fn add_persisted(&mut self, name: String, persisted: PersistedClass) {
        self.max_class_id = self.max_class_id.max(persisted.class_id);
        self.persisted.insert(name, persisted);
    }

    pub(crate) fn persisted(&self, name: &str) -> Option<&PersistedClass> {
        self.persisted.get(name)
    }

    /// Allocate a fresh ClassId. Once issued, an id is never reused for a
    /// different class, even across reopens.
    pub(crate) fn allocate_class_id(&mut self) -> ClassId {
        self.max_class_id += 1;
        self.max_class_id
    }

    pub(crate) fn insert(&mut self, info: ClassInfo) -> &ClassInfo {
        let index = self.classes.len();
        self.by_class_id.insert(info.class_id, index);
        self.by_token.insert(info.type_token, index);
        self.by_name.insert(info.name.to_string(), index);
        self.classes.push(info);
        &self.classes[index]
    }

    pub(crate) fn link_subclass(
        &mut self,
        super_token: TypeId,
        super_name: &str,
        sub_index: usize,
    ) -> Result<ClassId> {
        let sub_cid = self.classes[sub_index].class_id;
        let super_index = *self.by_token.get(&super_token).ok_or_else(|| {
            Error::ClassNotRegistered {
                type_name: super_name.to_string(),
            }
        })?;
        let super_cid = self.classes[super_index].class_id;
        self.classes[super_index].subs.push(sub_cid);
        self.classes[sub_index].supers.push(super_cid);
        Ok(super_cid)
    }

    pub(crate) fn set_substitute(&mut self, base: ClassId, info: ClassInfo) -> Result<()> {
        let index = *self
            .by_class_id
            .get(&base)
            .ok_or(Error::UnknownClass(base))?;
        let substitute_index = self.substitutes.len();
        self.substitutes.push(info);
        self.classes[index].substitute = Some(substitute_index);
        Ok(())
    }

    /// Look up a class by its assigned id.
    pub fn class_by_id(&self, class_id: ClassId) -> Result<&ClassInfo> {
        self.by_class_id
            .get(&class_id)
            .map(|i| &self.classes[*i])
            .ok_or(Error::UnknownClass(class_id))
    }

    /// Look up a class by runtime type identity.
    pub fn class_by_token(&self, token: TypeId) -> Option<&ClassInfo> {
        self.by_token.get(&token).map(|i| &self.classes[*i])
    }

    pub(crate) fn require_by_token(&self, token: TypeId, type_name: &str) -> Result<&ClassInfo> {
        self.class_by_token(token)
            .ok_or_else(|| Error::ClassNotRegistered {
                type_name: type_name.to_string(),
            })
    }

    pub fn class_by_name(&self, name: &str) -> Option<&ClassInfo> {
        self.by_name.get(name).map(|i| &self.classes[*i])
    }

    pub(crate) fn require_by_name(&self, name: &str) -> Result<&ClassInfo> {
        self.class_by_name(name)
            .ok_or_else(|| Error::ClassNotRegistered {
                type_name: name.to_string(),
            })
    }

    /// Whether `class_id` is `root` or one of its transitive subclasses.
    ///
    /// The DAG is walked iteratively; inheritance graphs can be deep.
    pub fn is_instance(&self, root: ClassId, class_id: ClassId) -> bool {
        let mut stack = vec![root];
        while let Some(cid) = stack.pop() {
            if cid == class_id {
                return true;
            }
            if let Some(i) = self.by_class_id.get(&cid) {
                stack.extend_from_slice(&self.classes[*i].subs);
            }
        }
        false
    }

    /// `root` plus all transitively reachable subclasses, in preorder.
    /// Used to build polymorphic cursors.
    pub fn all_class_ids(&self, root: ClassId) -> Vec<ClassId> {
        let mut ids = Vec::new();
        let mut stack = vec![root];
        while let Some(cid) = stack.pop() {
            if ids.contains(&cid) {
                continue;
            }
            ids.push(cid);
            if let Some(i) = self.by_class_id.get(&cid) {
                // Reverse keeps preorder under the LIFO stack.
                stack.extend(self.classes[*i].subs.iter().rev().copied());
            }
        }
        ids
    }

    /// Resolve `class_id` within the subtree rooted at `root`.
    pub fn resolve_within(&self, root: ClassId, class_id: ClassId) -> Result<&ClassInfo> {
        if !self.is_instance(root, class_id) {
            return Err(Error::UnknownClass(class_id));
        }
        self.class_by_id(class_id)
    }

    /// Instantiate the substitute registered closest to `root`, walking
    /// the subtree when `root` itself has none. Returns the substitute's
    /// property table alongside the fresh instance; records of missing
    /// classes are read through that table.
    pub(crate) fn make_substitute(
        &self,
        root: ClassId,
    ) -> Option<(&ClassInfo, Box<dyn Any + Send + Sync>)> {
        let mut stack = vec![root];
        while let Some(cid) = stack.pop() {
            if let Some(i) = self.by_class_id.get(&cid) {
                let info = &self.classes[*i];
                if let Some(substitute_index) = info.substitute {
                    let sub = &self.substitutes[substitute_index];
                    debug!(class = info.name, "instantiating substitute");
                    return Some((sub, (sub.factory)()));
                }
                stack.extend_from_slice(&info.subs);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub(crate) fn build_class_info<T>(
        spec_name: &'static str,
        class_id: ClassId,
        max_object_id: ObjectId,
        factory: Factory,
        clone_fn: CloneFn,
        props: Vec<Property>,
    ) -> ClassInfo
    where
        T: Any,
    {
        ClassInfo {
            name: spec_name,
            type_token: TypeId::of::<T>(),
            class_id,
            max_object_id: AtomicU64::new(max_object_id),
            subs: Vec::new(),
            supers: Vec::new(),
            factory,
            clone_fn,
            substitute: None,
            properties: Properties::new(props),
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("classes", &self.classes.len())
            .field("max_class_id", &self.max_class_id)
            .finish()
    }
}
