//! Runtime entities and the mark-sweep heap.
//!
//! Every runtime entity (thunks, arrays, strings, closures, the three object
//! shapes) lives in a slot arena and is addressed by an [`EntityRef`] index.
//! Index-based addressing keeps the unavoidable cycles between closures,
//! thunks and objects out of Rust's ownership graph and gives the collector
//! stable handles: a rooted entity keeps its index across any number of
//! sweeps.
//!
//! Collection is stop-the-world mark and sweep with a single alternating
//! mark bit. The caller decides when to collect (see [`Heap::should_collect`])
//! and supplies the roots: the evaluation stack and the scratch register.
//! Marking walks an explicit worklist, never the native stack.

use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::{Expr, Hide, Ident};
use crate::builtinops::Builtin;
use crate::internal_error;

/// Bindings in scope for a thunk, closure or object: identifier to thunk.
pub(crate) type Bindings = HashMap<Ident, EntityRef>;

/// Index of an entity in the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EntityRef(u32);

/// A runtime value. Compound values point into the heap.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Value {
    Null,
    Bool(bool),
    Double(f64),
    Str(EntityRef),
    Array(EntityRef),
    Object(EntityRef),
    Function(EntityRef),
}

impl Value {
    /// The language-level type name, as used in error messages and by the
    /// `type` builtin.
    pub fn type_str(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Double(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
        }
    }

    pub fn heap_ref(&self) -> Option<EntityRef> {
        match self {
            Value::Str(r) | Value::Array(r) | Value::Object(r) | Value::Function(r) => Some(*r),
            _ => None,
        }
    }
}

/// A memoising cell: an unevaluated body plus the environment to run it in.
/// Once forced, the environment is released and only the value remains.
#[derive(Debug)]
pub(crate) struct Thunk {
    /// Identifier the thunk was bound to, used to name trace entries.
    pub name: Ident,
    pub self_obj: Option<EntityRef>,
    pub offset: usize,
    pub body: Option<Rc<Expr>>,
    pub up_values: Bindings,
    pub filled: bool,
    pub content: Value,
}

impl Thunk {
    pub fn new(
        name: Ident,
        self_obj: Option<EntityRef>,
        offset: usize,
        body: Option<Rc<Expr>>,
        up_values: Bindings,
    ) -> Self {
        Thunk {
            name,
            self_obj,
            offset,
            body,
            up_values,
            filled: false,
            content: Value::Null,
        }
    }

    /// Cache the computed value. The environment is dropped so the captured
    /// bindings become collectable.
    pub fn fill(&mut self, v: Value) {
        debug_assert!(!self.filled, "thunk filled twice");
        self.content = v;
        self.filled = true;
        self.self_obj = None;
        self.up_values.clear();
    }
}

/// An ordered sequence of lazy elements.
#[derive(Debug)]
pub(crate) struct Array {
    pub elements: Vec<EntityRef>,
}

/// An immutable sequence of Unicode scalar values.
#[derive(Debug)]
pub(crate) struct Str {
    pub value: String,
}

impl Str {
    /// Length in codepoints, which is what the language counts.
    pub fn len(&self) -> usize {
        self.value.chars().count()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum ClosureKind {
    User(Rc<Expr>),
    Builtin(Builtin),
}

/// A callable value: captured environment, lexical `self`, parameters and
/// either a user body or a builtin selector.
#[derive(Debug, Clone)]
pub(crate) struct Closure {
    pub up_values: Bindings,
    pub self_obj: Option<EntityRef>,
    pub offset: usize,
    pub params: Vec<Ident>,
    pub kind: ClosureKind,
}

#[derive(Debug, Clone)]
pub(crate) struct ObjField {
    pub hide: Hide,
    pub body: Rc<Expr>,
}

/// An object literal's runtime form: field bodies shared over one captured
/// environment, plus the assertion bodies declared on the literal.
#[derive(Debug)]
pub(crate) struct SimpleObject {
    pub up_values: Bindings,
    pub fields: HashMap<Ident, ObjField>,
    pub asserts: Vec<Rc<Expr>>,
}

/// An object comprehension's runtime form: one thunk per computed field
/// name, all sharing the field-value expression with the loop variable
/// rebound per field.
#[derive(Debug)]
pub(crate) struct ComprehensionObject {
    pub up_values: Bindings,
    pub value: Rc<Expr>,
    pub var: Ident,
    pub comp_values: HashMap<Ident, EntityRef>,
}

/// `left + right`. Kept as a binary node, never flattened: `super` counts
/// prototype leaves, not chain links.
#[derive(Debug)]
pub(crate) struct ExtendedObject {
    pub left: EntityRef,
    pub right: EntityRef,
}

#[derive(Debug)]
pub(crate) enum Entity {
    Thunk(Thunk),
    Array(Array),
    Str(Str),
    Closure(Closure),
    Simple(SimpleObject),
    Comprehension(ComprehensionObject),
    Extended(ExtendedObject),
}

impl Entity {
    fn kind_str(&self) -> &'static str {
        match self {
            Entity::Thunk(_) => "thunk",
            Entity::Array(_) => "array",
            Entity::Str(_) => "string",
            Entity::Closure(_) => "closure",
            Entity::Simple(_) => "simple object",
            Entity::Comprehension(_) => "comprehension object",
            Entity::Extended(_) => "extended object",
        }
    }

    /// True for the object shapes, i.e. entities a `Value::Object` may hold.
    pub fn is_object(&self) -> bool {
        matches!(
            self,
            Entity::Simple(_) | Entity::Comprehension(_) | Entity::Extended(_)
        )
    }
}

#[derive(Debug)]
struct Slot {
    mark: bool,
    entity: Entity,
}

/// The arena. Growth is tracked against the live count at the end of the
/// previous collection; the caller polls [`Heap::should_collect`] after each
/// allocation site that is allowed to collect.
#[derive(Debug)]
pub(crate) struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    live: usize,
    last_live: usize,
    /// Mark value meaning "reached in the upcoming collection".
    parity: bool,
    gc_min_objects: usize,
    gc_growth_trigger: f64,
}

impl Heap {
    pub fn new(gc_min_objects: usize, gc_growth_trigger: f64) -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            last_live: 0,
            parity: true,
            gc_min_objects,
            gc_growth_trigger,
        }
    }

    pub fn alloc(&mut self, entity: Entity) -> EntityRef {
        self.live += 1;
        let slot = Slot {
            mark: !self.parity,
            entity,
        };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                EntityRef(idx)
            }
            None => {
                self.slots.push(Some(slot));
                EntityRef((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn live(&self) -> usize {
        self.live
    }

    /// Whether the heap has grown enough since the last collection.
    pub fn should_collect(&self) -> bool {
        let threshold = (self.last_live as f64 * self.gc_growth_trigger) as usize;
        self.live > self.gc_min_objects.max(threshold)
    }

    /// Mark from `roots`, then sweep everything unreached.
    pub fn collect(&mut self, roots: &[EntityRef]) {
        let before = self.live;
        let mut worklist: Vec<EntityRef> = Vec::with_capacity(roots.len());
        for &r in roots {
            self.mark_push(r, &mut worklist);
        }
        while let Some(r) = worklist.pop() {
            self.trace_children(r, &mut worklist);
        }

        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if let Some(s) = slot {
                if s.mark != self.parity {
                    *slot = None;
                    self.free.push(idx as u32);
                    self.live -= 1;
                }
            }
        }
        self.parity = !self.parity;
        self.last_live = self.live;
        log::debug!("gc: {} entities -> {}", before, self.live);
    }

    fn mark_push(&mut self, r: EntityRef, worklist: &mut Vec<EntityRef>) {
        let slot = match &mut self.slots[r.0 as usize] {
            Some(s) => s,
            None => internal_error!("INTERNAL ERROR: marked a vacant heap slot"),
        };
        if slot.mark != self.parity {
            slot.mark = self.parity;
            worklist.push(r);
        }
    }

    fn trace_children(&mut self, r: EntityRef, worklist: &mut Vec<EntityRef>) {
        let mut children: Vec<EntityRef> = Vec::new();
        match self.get(r) {
            Entity::Thunk(t) => {
                children.extend(t.content.heap_ref());
                children.extend(t.self_obj);
                children.extend(t.up_values.values().copied());
            }
            Entity::Array(a) => children.extend(a.elements.iter().copied()),
            Entity::Str(_) => {}
            Entity::Closure(c) => {
                children.extend(c.self_obj);
                children.extend(c.up_values.values().copied());
            }
            Entity::Simple(s) => children.extend(s.up_values.values().copied()),
            Entity::Comprehension(c) => {
                children.extend(c.up_values.values().copied());
                children.extend(c.comp_values.values().copied());
            }
            Entity::Extended(e) => {
                children.push(e.left);
                children.push(e.right);
            }
        }
        for child in children {
            self.mark_push(child, worklist);
        }
    }

    pub fn get(&self, r: EntityRef) -> &Entity {
        match &self.slots[r.0 as usize] {
            Some(s) => &s.entity,
            None => internal_error!("INTERNAL ERROR: access to a swept heap entity"),
        }
    }

    pub fn get_mut(&mut self, r: EntityRef) -> &mut Entity {
        match &mut self.slots[r.0 as usize] {
            Some(s) => &mut s.entity,
            None => internal_error!("INTERNAL ERROR: access to a swept heap entity"),
        }
    }

    pub fn thunk(&self, r: EntityRef) -> &Thunk {
        match self.get(r) {
            Entity::Thunk(t) => t,
            other => internal_error!("INTERNAL ERROR: expected thunk, got {}", other.kind_str()),
        }
    }

    pub fn thunk_mut(&mut self, r: EntityRef) -> &mut Thunk {
        match self.get_mut(r) {
            Entity::Thunk(t) => t,
            other => internal_error!("INTERNAL ERROR: expected thunk, got {}", other.kind_str()),
        }
    }

    pub fn array(&self, r: EntityRef) -> &Array {
        match self.get(r) {
            Entity::Array(a) => a,
            other => internal_error!("INTERNAL ERROR: expected array, got {}", other.kind_str()),
        }
    }

    pub fn array_mut(&mut self, r: EntityRef) -> &mut Array {
        match self.get_mut(r) {
            Entity::Array(a) => a,
            other => internal_error!("INTERNAL ERROR: expected array, got {}", other.kind_str()),
        }
    }

    pub fn string(&self, r: EntityRef) -> &Str {
        match self.get(r) {
            Entity::Str(s) => s,
            other => internal_error!("INTERNAL ERROR: expected string, got {}", other.kind_str()),
        }
    }

    pub fn closure(&self, r: EntityRef) -> &Closure {
        match self.get(r) {
            Entity::Closure(c) => c,
            other => internal_error!("INTERNAL ERROR: expected closure, got {}", other.kind_str()),
        }
    }
}
