//! Node slots of an entity.
//!
//! Every [`NodeDefinition`](crate::schema::NodeDefinition) of an entity type
//! has exactly one [`Node`] on each entity of that type:
//!
//! - [`ValueNode`] holds a scalar and remembers the originally loaded value,
//!   which doubles as the optimistic-lock comparison value.
//! - [`RefNode`] holds a to-one relation: the foreign key plus, once resolved,
//!   a live handle to the target. A changed reference remembers its previous
//!   target so owned orphans can be deleted. Back-references hold their
//!   target weakly; the key stays behind when it is collected.
//! - [`ToManyNode`] holds a to-many relation with a tri-state fetched flag.
//!   Additions and removals cancel each other out.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::entity::{Entity, EntityRef, WeakEntityRef};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Value nodes
// ---------------------------------------------------------------------------

/// Contents of a value node. `NotLoaded` is distinct from a loaded `Null`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeValue {
    NotLoaded,
    Loaded(Value),
}

impl NodeValue {
    pub fn is_loaded(&self) -> bool {
        matches!(self, NodeValue::Loaded(_))
    }

    /// The loaded value, if any.
    pub fn get(&self) -> Option<&Value> {
        match self {
            NodeValue::Loaded(v) => Some(v),
            NodeValue::NotLoaded => None,
        }
    }
}

/// A scalar slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueNode {
    value: NodeValue,
    original: Option<Value>,
    changed: bool,
}

impl ValueNode {
    pub fn unloaded() -> Self {
        ValueNode {
            value: NodeValue::NotLoaded,
            original: None,
            changed: false,
        }
    }

    /// A node holding `value` as its clean, originally loaded state.
    pub fn loaded(value: Value) -> Self {
        ValueNode {
            original: Some(value.clone()),
            value: NodeValue::Loaded(value),
            changed: false,
        }
    }

    pub fn value(&self) -> &NodeValue {
        &self.value
    }

    pub fn get(&self) -> Option<&Value> {
        self.value.get()
    }

    /// Sets a new value. Setting the original value back clears dirtiness.
    pub fn set(&mut self, value: Value) {
        self.changed = self.original.as_ref() != Some(&value);
        self.value = NodeValue::Loaded(value);
    }

    /// Loads a value from the store. The node becomes clean.
    pub fn load(&mut self, value: Value) {
        self.original = Some(value.clone());
        self.value = NodeValue::Loaded(value);
        self.changed = false;
    }

    pub fn unload(&mut self) {
        *self = ValueNode::unloaded();
    }

    pub fn is_dirty(&self) -> bool {
        self.changed
    }

    /// Value the store is expected to hold, for optimistic-lock checks.
    pub fn lock_value(&self) -> Option<&Value> {
        self.original.as_ref()
    }

    /// Makes the current value the new original.
    pub fn accept_changes(&mut self) {
        if let NodeValue::Loaded(v) = &self.value {
            self.original = Some(v.clone());
        }
        self.changed = false;
    }
}

// ---------------------------------------------------------------------------
// Reference nodes
// ---------------------------------------------------------------------------

/// A live handle held by a ref node. Back-references (the ref a to-many
/// collection points through) are weak so owner and child never form an
/// `Rc` cycle.
#[derive(Clone)]
enum Link {
    Strong(EntityRef),
    Weak(WeakEntityRef),
}

impl Link {
    fn new(target: EntityRef, weak: bool) -> Self {
        if weak {
            Link::Weak(Rc::downgrade(&target))
        } else {
            Link::Strong(target)
        }
    }

    fn get(&self) -> Option<EntityRef> {
        match self {
            Link::Strong(target) => Some(Rc::clone(target)),
            Link::Weak(target) => target.upgrade(),
        }
    }

    fn as_ptr(&self) -> *const RefCell<Entity> {
        match self {
            Link::Strong(target) => Rc::as_ptr(target),
            Link::Weak(target) => target.as_ptr(),
        }
    }

    fn is(&self, entity: &EntityRef) -> bool {
        std::ptr::eq(self.as_ptr(), Rc::as_ptr(entity))
    }

    fn same(&self, other: &Link) -> bool {
        std::ptr::eq(self.as_ptr(), other.as_ptr())
    }
}

/// A to-one relation slot.
#[derive(Clone)]
pub struct RefNode {
    key: Value,
    loaded: bool,
    weak: bool,
    reference: Option<Link>,
    previous: Option<Link>,
    previous_key: Option<Value>,
    changed: bool,
}

impl RefNode {
    pub fn unloaded() -> Self {
        RefNode {
            key: Value::Null,
            loaded: false,
            weak: false,
            reference: None,
            previous: None,
            previous_key: None,
            changed: false,
        }
    }

    /// A loaded null reference, as on a new entity.
    pub fn null() -> Self {
        RefNode {
            loaded: true,
            ..RefNode::unloaded()
        }
    }

    /// Makes this node hold its targets weakly.
    pub fn back_reference(mut self, weak: bool) -> Self {
        self.weak = weak;
        self
    }

    pub fn is_back_reference(&self) -> bool {
        self.weak
    }

    /// The stored foreign key. `Null` if unset, unloaded, or pointing at an
    /// entity that has no key yet.
    pub fn key(&self) -> &Value {
        &self.key
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// The live target, once resolved and while it is alive.
    pub fn reference(&self) -> Option<EntityRef> {
        self.reference.as_ref().and_then(Link::get)
    }

    /// True if the live target is `entity`.
    pub fn points_at(&self, entity: &EntityRef) -> bool {
        self.reference.as_ref().is_some_and(|link| link.is(entity))
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// Key of the target before the first pending change.
    pub fn previous_key(&self) -> Option<&Value> {
        self.previous_key.as_ref()
    }

    /// Points this node at `target`, whose current key is `target_key`.
    ///
    /// The first change remembers the previous target. Pointing back at it
    /// clears the pending change.
    pub fn set_reference(&mut self, target: Option<EntityRef>, target_key: Value) {
        if !self.changed {
            self.previous = self.reference.clone();
            self.previous_key = Some(self.key.clone());
            self.changed = true;
        }
        self.reference = target.map(|t| Link::new(t, self.weak));
        self.key = target_key;
        self.loaded = true;

        if self.points_at_previous() {
            self.clear();
        }
    }

    fn points_at_previous(&self) -> bool {
        match (&self.reference, &self.previous) {
            (Some(current), Some(previous)) => current.same(previous),
            (None, None) => self.previous_key.as_ref() == Some(&self.key),
            _ => {
                !self.key.is_null() && self.previous_key.as_ref() == Some(&self.key)
            }
        }
    }

    /// Loads a foreign key from the store. A live reference to a different
    /// key is dropped and re-resolved lazily.
    pub fn load(&mut self, key: Value) {
        if self.key != key || key.is_null() {
            self.reference = None;
        }
        self.key = key;
        self.loaded = true;
    }

    /// Binds the live target without recording a change.
    pub fn resolve(&mut self, target: EntityRef) {
        self.reference = Some(Link::new(target, self.weak));
    }

    /// Records the key the live target was just given. Not a change.
    pub fn update_target_key(&mut self, key: Value) {
        if self.reference.is_some() {
            self.key = key;
        }
    }

    /// Drops the live target, keeping the key.
    pub fn forget_reference(&mut self) -> Option<EntityRef> {
        self.reference.take().and_then(|link| link.get())
    }

    /// Discards pending change tracking.
    pub fn clear(&mut self) {
        self.previous = None;
        self.previous_key = None;
        self.changed = false;
    }

    pub fn unload(&mut self) {
        *self = RefNode::unloaded().back_reference(self.weak);
    }

    /// The previous target, if the reference changed away from it and it
    /// is still alive.
    pub fn orphan(&self) -> Option<EntityRef> {
        if !self.changed {
            return None;
        }
        match (&self.previous, &self.reference) {
            (Some(previous), Some(current)) if previous.same(current) => None,
            (previous, _) => previous.as_ref().and_then(Link::get),
        }
    }
}

impl fmt::Debug for RefNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefNode")
            .field("key", &self.key)
            .field("loaded", &self.loaded)
            .field("weak", &self.weak)
            .field("resolved", &self.reference().is_some())
            .field("previous_key", &self.previous_key)
            .field("changed", &self.changed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// To-many nodes
// ---------------------------------------------------------------------------

/// A to-many relation slot.
#[derive(Clone)]
pub struct ToManyNode {
    fetched: Option<bool>,
    list: Vec<EntityRef>,
    added: Vec<EntityRef>,
    removed: Vec<EntityRef>,
}

fn position(list: &[EntityRef], entity: &EntityRef) -> Option<usize> {
    list.iter().position(|e| Rc::ptr_eq(e, entity))
}

impl ToManyNode {
    /// A collection whose contents are unknown.
    pub fn unknown() -> Self {
        ToManyNode {
            fetched: None,
            list: Vec::new(),
            added: Vec::new(),
            removed: Vec::new(),
        }
    }

    /// A fetched, empty collection, as on a new entity.
    pub fn empty() -> Self {
        ToManyNode {
            fetched: Some(true),
            ..ToManyNode::unknown()
        }
    }

    /// Tri-state fetched flag: `None` unknown, `Some(false)` known unfetched.
    pub fn fetched(&self) -> Option<bool> {
        self.fetched
    }

    pub fn is_fetched(&self) -> bool {
        self.fetched == Some(true)
    }

    pub fn list(&self) -> &[EntityRef] {
        &self.list
    }

    pub fn added(&self) -> &[EntityRef] {
        &self.added
    }

    pub fn removed(&self) -> &[EntityRef] {
        &self.removed
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        position(&self.list, entity).is_some()
    }

    /// Adds `entity`. Returns false if it is already a member.
    pub fn add(&mut self, entity: EntityRef) -> bool {
        if self.contains(&entity) {
            return false;
        }
        match position(&self.removed, &entity) {
            Some(idx) => {
                self.removed.remove(idx);
            }
            None => self.added.push(entity.clone()),
        }
        self.list.push(entity);
        true
    }

    /// Removes `entity`. Returns false if it is not a member.
    pub fn remove(&mut self, entity: &EntityRef) -> bool {
        let Some(idx) = position(&self.list, entity) else {
            return false;
        };
        let entity = self.list.remove(idx);
        match position(&self.added, &entity) {
            Some(idx) => {
                self.added.remove(idx);
            }
            None => self.removed.push(entity),
        }
        true
    }

    /// Installs the fetched contents, keeping pending additions and removals.
    pub fn set_fetched(&mut self, loaded: Vec<EntityRef>) {
        let mut list: Vec<EntityRef> = loaded
            .into_iter()
            .filter(|e| position(&self.removed, e).is_none())
            .collect();
        for added in &self.added {
            if position(&list, added).is_none() {
                list.push(added.clone());
            }
        }
        self.list = list;
        self.fetched = Some(true);
    }

    /// Marks the contents as known to be unfetched.
    pub fn mark_unfetched(&mut self) {
        self.fetched = Some(false);
    }

    /// Discards pending additions and removals.
    pub fn clear(&mut self) {
        self.added.clear();
        self.removed.clear();
    }

    pub fn unload(&mut self) {
        *self = ToManyNode::unknown();
    }

    pub fn is_changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

impl fmt::Debug for ToManyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToManyNode")
            .field("fetched", &self.fetched)
            .field("len", &self.list.len())
            .field("added", &self.added.len())
            .field("removed", &self.removed.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// One slot of an entity.
#[derive(Debug, Clone)]
pub enum Node {
    Value(ValueNode),
    Ref(RefNode),
    ToMany(ToManyNode),
}

impl Node {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Value(_) => "value",
            Node::Ref(_) => "ref",
            Node::ToMany(_) => "to-many",
        }
    }

    pub fn as_value(&self) -> Option<&ValueNode> {
        match self {
            Node::Value(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_value_mut(&mut self) -> Option<&mut ValueNode> {
        match self {
            Node::Value(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&RefNode> {
        match self {
            Node::Ref(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_reference_mut(&mut self) -> Option<&mut RefNode> {
        match self {
            Node::Ref(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_to_many(&self) -> Option<&ToManyNode> {
        match self {
            Node::ToMany(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_to_many_mut(&mut self) -> Option<&mut ToManyNode> {
        match self {
            Node::ToMany(n) => Some(n),
            _ => None,
        }
    }

    pub fn is_dirty(&self) -> bool {
        match self {
            Node::Value(n) => n.is_dirty(),
            Node::Ref(n) => n.is_changed(),
            Node::ToMany(n) => n.is_changed(),
        }
    }
}
