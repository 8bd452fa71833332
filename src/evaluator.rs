//! The evaluation machine: frame stack, dispatch driver, object indexing,
//! invariants and JSON manifestation.
//!
//! Rather than recursing natively over the AST, [`Interpreter::evaluate`]
//! keeps a stack of [`Frame`]s, each describing how to resume once the
//! current subterm has produced a value in the scratch register. Dispatch on
//! an AST node either writes the scratch directly (literals, filled thunks)
//! or pushes a frame and restarts on a subterm. Unwinding inspects the top
//! frame and either pops it, mutates it in place to await a further subterm,
//! or redirects dispatch.
//!
//! Only [`FrameKind::Call`] frames count against the configured stack limit
//! and delimit lexical scope: variable lookup stops at the first call frame,
//! which carries its environment explicitly. Call frames also carry the
//! `self` binding and super-offset for everything above them.

use std::collections::HashMap;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::ast::{BinaryOp, Expr, ExprKind, Hide, Ident, Interner, Location, UnaryOp};
use crate::heap::{
    Array, Bindings, Closure, ClosureKind, ComprehensionObject, Entity, EntityRef, ExtendedObject,
    Heap, ObjField, SimpleObject, Str, Thunk, Value,
};
use crate::vm::{ImportCacheEntry, ImportCallback, Vm};
use crate::{RuntimeError, TraceFrame, internal_error};

/// Short sequences of thunks (call arguments, pending invariants).
pub(crate) type ThunkList = SmallVec<[EntityRef; 4]>;

/// Per-variant resumption state. Each kind names the subterm currently being
/// evaluated, or the operation to resume once the scratch holds its value.
#[derive(Debug)]
pub(crate) enum FrameKind {
    /// `e` in `e(...)`; collects argument thunks before the call opens.
    ApplyTarget { arg_thunks: ThunkList },
    /// `a` in `a + b`.
    BinaryLeft,
    /// `b` in `a + b`.
    BinaryRight { left: Value },
    /// Iteration state of the `filter` builtin.
    BuiltinFilter {
        func: Value,
        array: Value,
        kept: ThunkList,
        cursor: usize,
    },
    /// Forcing builtin arguments in order, then dispatching the native op.
    BuiltinForceThunks {
        func: Value,
        thunks: ThunkList,
        cursor: usize,
    },
    /// A switch of location in user code: function call, thunk force,
    /// field evaluation, import. Counts against the stack limit.
    Call { args: ThunkList, cursor: usize },
    /// `e` in `error e`.
    Error,
    /// `e` in `if e then a else b`.
    If,
    /// `e` in `x[e]`; the target is already evaluated.
    IndexIndex { target: Value },
    /// `e` in `e[x]`.
    IndexTarget,
    /// Pending assertion thunks for one object, forced one at a time.
    Invariants { thunks: ThunkList, cursor: usize },
    /// Holds thunk bindings while `e` in `local ...; e` runs.
    Local,
    /// Field-name evaluation state of an object literal.
    Object {
        fields: HashMap<Ident, ObjField>,
        cursor: usize,
    },
    /// `e` in `{ [f]: v for x in e }`.
    ObjectCompArray,
    /// Field-name evaluation state of an object comprehension.
    ObjectCompElement {
        array: Value,
        elements: HashMap<Ident, EntityRef>,
        cursor: usize,
    },
    /// String coercion of either side of `+`.
    StringConcat { left: Value, right: Value },
    /// `e` in `super[e]`.
    SuperIndex,
    /// `e` in `-e`.
    Unary,
}

/// One reified continuation.
#[derive(Debug)]
pub(crate) struct Frame {
    pub kind: FrameKind,
    /// The expression being resumed; `None` for frames opened from native
    /// code (calls, manifestation).
    pub ast: Option<Rc<Expr>>,
    pub location: Location,
    /// Candidate for tail-call trimming once its pending thunks are forced.
    pub tail_call: bool,
    /// Extra GC root; the manifester stashes the enclosing value here while
    /// it forces members.
    pub stash: Value,
    /// Entity whose name seeds this frame's trace entry (call frames only).
    pub context: Option<EntityRef>,
    /// Lexical `self` for everything above this frame (call frames), or the
    /// object whose invariants are running (invariants frames).
    pub self_obj: Option<EntityRef>,
    pub offset: usize,
    /// Variables introduced at this point.
    pub bindings: Bindings,
}

impl Frame {
    fn new(kind: FrameKind, ast: &Rc<Expr>) -> Self {
        Frame {
            kind,
            location: ast.location.clone(),
            ast: Some(ast.clone()),
            tail_call: false,
            stash: Value::Null,
            context: None,
            self_obj: None,
            offset: 0,
            bindings: Bindings::new(),
        }
    }

    fn with_location(kind: FrameKind, location: Location) -> Self {
        Frame {
            kind,
            ast: None,
            location,
            tail_call: false,
            stash: Value::Null,
            context: None,
            self_obj: None,
            offset: 0,
            bindings: Bindings::new(),
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self.kind, FrameKind::Call { .. })
    }

    fn gather_roots(&self, roots: &mut Vec<EntityRef>) {
        roots.extend(self.stash.heap_ref());
        roots.extend(self.context);
        roots.extend(self.self_obj);
        roots.extend(self.bindings.values().copied());
        match &self.kind {
            FrameKind::ApplyTarget { arg_thunks } => roots.extend(arg_thunks.iter().copied()),
            FrameKind::BinaryRight { left } => roots.extend(left.heap_ref()),
            FrameKind::StringConcat { left, right } => {
                roots.extend(left.heap_ref());
                roots.extend(right.heap_ref());
            }
            FrameKind::BuiltinFilter {
                func,
                array,
                kept,
                ..
            } => {
                roots.extend(func.heap_ref());
                roots.extend(array.heap_ref());
                roots.extend(kept.iter().copied());
            }
            FrameKind::BuiltinForceThunks { func, thunks, .. } => {
                roots.extend(func.heap_ref());
                roots.extend(thunks.iter().copied());
            }
            FrameKind::Call { args, .. } => roots.extend(args.iter().copied()),
            FrameKind::Invariants { thunks, .. } => roots.extend(thunks.iter().copied()),
            FrameKind::IndexIndex { target } => roots.extend(target.heap_ref()),
            FrameKind::ObjectCompElement {
                array, elements, ..
            } => {
                roots.extend(array.heap_ref());
                roots.extend(elements.values().copied());
            }
            // Object-literal field bodies are AST, not heap entities.
            _ => {}
        }
    }
}

/// Grow-only vector of frames plus the call-frame accounting.
#[derive(Debug)]
pub(crate) struct Stack {
    frames: Vec<Frame>,
    calls: usize,
    limit: usize,
}

impl Stack {
    fn new(limit: usize) -> Self {
        Stack {
            frames: Vec::new(),
            calls: 0,
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn calls(&self) -> usize {
        self.calls
    }

    fn push(&mut self, frame: Frame) {
        if frame.is_call() {
            self.calls += 1;
        }
        self.frames.push(frame);
    }

    pub fn pop(&mut self) {
        if self.top().is_call() {
            self.calls -= 1;
        }
        self.frames.pop();
    }

    pub fn top(&self) -> &Frame {
        match self.frames.last() {
            Some(f) => f,
            None => internal_error!("INTERNAL ERROR: inspected an empty evaluation stack"),
        }
    }

    pub fn top_mut(&mut self) -> &mut Frame {
        match self.frames.last_mut() {
            Some(f) => f,
            None => internal_error!("INTERNAL ERROR: inspected an empty evaluation stack"),
        }
    }

    /// Closest binding in scope. Call frames delimit lexical scope: each
    /// call carries its whole environment, so the walk stops there.
    pub fn look_up_var(&self, id: Ident) -> Option<EntityRef> {
        for frame in self.frames.iter().rev() {
            if let Some(&th) = frame.bindings.get(&id) {
                return Some(th);
            }
            if frame.is_call() {
                break;
            }
        }
        None
    }

    /// The `self` and super-offset of the nearest call frame.
    pub fn get_self_binding(&self) -> (Option<EntityRef>, usize) {
        for frame in self.frames.iter().rev() {
            if frame.is_call() {
                return (frame.self_obj, frame.offset);
            }
        }
        (None, 0)
    }

    /// Re-entry guard for invariant execution.
    pub fn already_executing_invariants(&self, obj: EntityRef) -> bool {
        self.frames.iter().rev().any(|f| {
            matches!(f.kind, FrameKind::Invariants { .. }) && f.self_obj == Some(obj)
        })
    }

    /// If the top of the stack is a finished tail call (possibly under local
    /// binding frames holding only values the tail call consumed), remove
    /// it before opening the next call. Any other frame kind holds a pending
    /// continuation and aborts the trim.
    fn tail_call_trim(&mut self) {
        for i in (0..self.frames.len()).rev() {
            match &self.frames[i].kind {
                FrameKind::Call { args, .. } => {
                    if !self.frames[i].tail_call || !args.is_empty() {
                        return;
                    }
                    self.frames.truncate(i);
                    self.calls -= 1;
                    return;
                }
                FrameKind::Local => {}
                _ => return,
            }
        }
    }

    /// Snapshot the call frames into an error, outermost call first,
    /// annotating each with a best-effort name for its context entity.
    pub fn make_error(
        &self,
        heap: &Heap,
        interner: &Interner,
        loc: &Location,
        message: String,
    ) -> RuntimeError {
        let mut trace = vec![TraceFrame::new(loc.clone())];
        for i in (0..self.frames.len()).rev() {
            let frame = &self.frames[i];
            if frame.is_call() {
                if let Some(ctx) = frame.context {
                    if let Some(last) = trace.last_mut() {
                        last.name = self.entity_name(i, ctx, heap, interner);
                    }
                }
                trace.push(TraceFrame::new(frame.location.clone()));
            }
        }
        trace.reverse();
        RuntimeError::new(message, trace)
    }

    /// Find a reasonable name for an entity: any binding in the nearest
    /// scope whose filled thunk points at it, otherwise a type-tagged
    /// "anonymous".
    fn entity_name(
        &self,
        from: usize,
        entity: EntityRef,
        heap: &Heap,
        interner: &Interner,
    ) -> String {
        let mut name = String::new();
        for i in (0..from).rev() {
            let frame = &self.frames[i];
            for (id, &th) in &frame.bindings {
                let thunk = match heap.get(th) {
                    Entity::Thunk(t) => t,
                    _ => continue,
                };
                if !thunk.filled {
                    continue;
                }
                if thunk.content.heap_ref() == Some(entity) {
                    name = interner.resolve(*id).to_owned();
                }
            }
            // Do not cross into the next call frame, keep local reasoning.
            if frame.is_call() {
                break;
            }
        }
        if name.is_empty() {
            name = "anonymous".to_owned();
        }
        match heap.get(entity) {
            Entity::Simple(_) | Entity::Comprehension(_) | Entity::Extended(_) => {
                format!("object <{name}>")
            }
            Entity::Thunk(t) => format!("thunk <{}>", interner.resolve(t.name)),
            Entity::Closure(c) => match &c.kind {
                ClosureKind::Builtin(b) => format!("builtin function <{}>", b.name()),
                ClosureKind::User(_) => format!("function <{name}>"),
            },
            _ => name,
        }
    }

    fn gather_roots(&self, roots: &mut Vec<EntityRef>) {
        for frame in &self.frames {
            frame.gather_roots(roots);
        }
    }
}

/// What to do after processing the top frame.
enum Unwind {
    /// Restart dispatch on this expression; the frame arranged its own fate.
    Recurse(Rc<Expr>),
    /// The frame is done; its result is in the scratch register.
    Pop,
    /// The frame was mutated in place; process it again.
    Keep,
}

/// One evaluation: heap, stack and scratch are owned here; the interner,
/// external variables, import cache and frontend are borrowed from the
/// [`Vm`] so they outlive individual evaluations.
pub(crate) struct Interpreter<'vm> {
    pub(crate) vm: &'vm mut Vm,
    pub(crate) heap: Heap,
    pub(crate) stack: Stack,
    pub(crate) scratch: Value,
    /// Names thunks created for array elements.
    pub(crate) id_array_element: Ident,
    /// Names thunks created to execute invariants.
    pub(crate) id_invariant: Ident,
}

impl<'vm> Interpreter<'vm> {
    pub fn new(vm: &'vm mut Vm) -> Self {
        let heap = Heap::new(vm.gc_min_objects, vm.gc_growth_trigger);
        let stack = Stack::new(vm.max_stack);
        let id_array_element = vm.interner.intern("array_element");
        let id_invariant = vm.interner.intern("object_assert");
        Interpreter {
            vm,
            heap,
            stack,
            scratch: Value::Null,
            id_array_element,
            id_invariant,
        }
    }

    pub fn error(&self, loc: &Location, message: impl Into<String>) -> RuntimeError {
        self.stack
            .make_error(&self.heap, &self.vm.interner, loc, message.into())
    }

    /// Allocate, then collect if the heap has grown enough. The fresh
    /// entity, the scratch register and everything reachable from the stack
    /// are the roots; any other entity that must survive has to be stashed
    /// into a frame slot before this is called.
    pub(crate) fn alloc(&mut self, entity: Entity) -> EntityRef {
        let r = self.heap.alloc(entity);
        if self.heap.should_collect() {
            let mut roots = Vec::with_capacity(64);
            roots.push(r);
            roots.extend(self.scratch.heap_ref());
            self.stack.gather_roots(&mut roots);
            self.heap.collect(&roots);
        }
        r
    }

    pub(crate) fn double_check(&self, loc: &Location, v: f64) -> Result<Value, RuntimeError> {
        if v.is_nan() {
            Err(self.error(loc, "Not a number"))
        } else if v.is_infinite() {
            Err(self.error(loc, "Overflow"))
        } else {
            Ok(Value::Double(v))
        }
    }

    pub(crate) fn make_string(&mut self, value: String) -> Value {
        Value::Str(self.alloc(Entity::Str(Str { value })))
    }

    pub(crate) fn make_array(&mut self, elements: Vec<EntityRef>) -> Value {
        Value::Array(self.alloc(Entity::Array(Array { elements })))
    }

    /// Capture the bindings for the given free variables from the stack.
    fn capture(&self, free_vars: &[Ident]) -> Bindings {
        let mut env = Bindings::new();
        for &fv in free_vars {
            if let Some(th) = self.stack.look_up_var(fv) {
                env.insert(fv, th);
            }
        }
        env
    }

    /// Open a call frame, trimming a finished tail call first and enforcing
    /// the stack limit.
    pub(crate) fn new_call(
        &mut self,
        loc: &Location,
        context: Option<EntityRef>,
        self_obj: Option<EntityRef>,
        offset: usize,
        bindings: Bindings,
    ) -> Result<(), RuntimeError> {
        self.stack.tail_call_trim();
        if self.stack.calls() >= self.stack.limit {
            return Err(self.error(loc, "Max stack frames exceeded."));
        }
        let mut frame = Frame::with_location(
            FrameKind::Call {
                args: ThunkList::new(),
                cursor: 0,
            },
            loc.clone(),
        );
        frame.context = context;
        frame.self_obj = self_obj;
        frame.offset = offset;
        frame.bindings = bindings;
        self.stack.push(frame);
        Ok(())
    }

    fn top_ast(&self) -> Rc<Expr> {
        match &self.stack.top().ast {
            Some(a) => a.clone(),
            None => internal_error!("INTERNAL ERROR: frame has no originating expression"),
        }
    }

    //
    // Object model.
    //

    /// Number of prototype leaves under `obj`.
    fn count_leaves(&self, obj: EntityRef) -> usize {
        match self.heap.get(obj) {
            Entity::Extended(e) => self.count_leaves(e.left) + self.count_leaves(e.right),
            _ => 1,
        }
    }

    /// Traverse the prototype tree right to left, skipping the first
    /// `start_from` leaves, and return the first leaf containing `f`.
    /// `counter` ends up holding the number of leaves skipped in total.
    fn find_object(
        &self,
        f: Ident,
        curr: EntityRef,
        start_from: usize,
        counter: &mut usize,
    ) -> Option<EntityRef> {
        match self.heap.get(curr) {
            Entity::Extended(e) => {
                let (left, right) = (e.left, e.right);
                self.find_object(f, right, start_from, counter)
                    .or_else(|| self.find_object(f, left, start_from, counter))
            }
            Entity::Simple(s) => {
                if *counter >= start_from && s.fields.contains_key(&f) {
                    return Some(curr);
                }
                *counter += 1;
                None
            }
            Entity::Comprehension(c) => {
                if *counter >= start_from && c.comp_values.contains_key(&f) {
                    return Some(curr);
                }
                *counter += 1;
                None
            }
            other => internal_error!(
                "INTERNAL ERROR: object tree contains a non-object entity: {:?}",
                other
            ),
        }
    }

    /// Merge the field visibilities of a composite object, right leaf
    /// winning except that `Inherit` defers to the left.
    fn object_fields_map(&self, obj: EntityRef, manifesting: bool) -> HashMap<Ident, Hide> {
        match self.heap.get(obj) {
            Entity::Simple(s) => s
                .fields
                .iter()
                .map(|(&id, f)| (id, if manifesting { f.hide } else { Hide::Visible }))
                .collect(),
            Entity::Comprehension(c) => c
                .comp_values
                .keys()
                .map(|&id| (id, Hide::Visible))
                .collect(),
            Entity::Extended(e) => {
                let (left, right) = (e.left, e.right);
                let mut merged = self.object_fields_map(right, manifesting);
                for (id, hide) in self.object_fields_map(left, manifesting) {
                    match merged.get(&id) {
                        None => {
                            merged.insert(id, hide);
                        }
                        Some(Hide::Inherit) => {
                            // Seen before with inherited visibility, so the
                            // earlier object decides.
                            merged.insert(id, hide);
                        }
                        Some(_) => {}
                    }
                }
                merged
            }
            other => internal_error!(
                "INTERNAL ERROR: object tree contains a non-object entity: {:?}",
                other
            ),
        }
    }

    /// The addressable fields of an object. With `manifesting` set, hidden
    /// fields are dropped.
    pub(crate) fn object_fields(&self, obj: EntityRef, manifesting: bool) -> Vec<Ident> {
        self.object_fields_map(obj, manifesting)
            .into_iter()
            .filter(|(_, hide)| *hide != Hide::Hidden)
            .map(|(id, _)| id)
            .collect()
    }

    /// Index a field: find its leaf, open a call frame whose `self` is the
    /// original root and whose super-offset records how many leaves were
    /// skipped, and return the field body to evaluate.
    pub(crate) fn object_index(
        &mut self,
        loc: &Location,
        obj: EntityRef,
        f: Ident,
        offset: usize,
    ) -> Result<Rc<Expr>, RuntimeError> {
        let mut found_at = 0;
        let Some(leaf) = self.find_object(f, obj, offset, &mut found_at) else {
            return Err(self.error(
                loc,
                format!("Field does not exist: {}", self.vm.interner.resolve(f)),
            ));
        };
        match self.heap.get(leaf) {
            Entity::Simple(s) => {
                let body = match s.fields.get(&f) {
                    Some(field) => field.body.clone(),
                    None => internal_error!("INTERNAL ERROR: found leaf lost its field"),
                };
                let up_values = s.up_values.clone();
                self.new_call(loc, Some(leaf), Some(obj), found_at, up_values)?;
                Ok(body)
            }
            Entity::Comprehension(c) => {
                let th = match c.comp_values.get(&f) {
                    Some(&th) => th,
                    None => internal_error!("INTERNAL ERROR: found leaf lost its field"),
                };
                let mut bindings = c.up_values.clone();
                bindings.insert(c.var, th);
                let value = c.value.clone();
                self.new_call(loc, Some(leaf), Some(obj), found_at, bindings)?;
                Ok(value)
            }
            other => internal_error!(
                "INTERNAL ERROR: findObject returned a non-leaf entity: {:?}",
                other
            ),
        }
    }

    /// Collect `(assertion body, leaf super-offset, leaf environment)` for
    /// every leaf of the composite, right to left.
    fn invariant_specs(&self, root: EntityRef) -> Vec<(Rc<Expr>, usize, Bindings)> {
        let mut out = Vec::new();
        let mut counter = 0;
        self.invariant_specs_rec(root, &mut counter, &mut out);
        out
    }

    fn invariant_specs_rec(
        &self,
        curr: EntityRef,
        counter: &mut usize,
        out: &mut Vec<(Rc<Expr>, usize, Bindings)>,
    ) {
        match self.heap.get(curr) {
            Entity::Extended(e) => {
                let (left, right) = (e.left, e.right);
                self.invariant_specs_rec(right, counter, out);
                self.invariant_specs_rec(left, counter, out);
            }
            Entity::Simple(s) => {
                for assert in &s.asserts {
                    out.push((assert.clone(), *counter, s.up_values.clone()));
                }
                *counter += 1;
            }
            Entity::Comprehension(_) => {
                *counter += 1;
            }
            other => internal_error!(
                "INTERNAL ERROR: object tree contains a non-object entity: {:?}",
                other
            ),
        }
    }

    /// Materialise the invariant thunks into the invariants frame on top of
    /// the stack, one allocation at a time so each stays rooted.
    fn fill_invariants(&mut self, root: EntityRef, specs: Vec<(Rc<Expr>, usize, Bindings)>) {
        for (assert, offset, up_values) in specs {
            let th = self.alloc(Entity::Thunk(Thunk::new(
                self.id_invariant,
                Some(root),
                offset,
                Some(assert),
                up_values,
            )));
            match &mut self.stack.top_mut().kind {
                FrameKind::Invariants { thunks, .. } => thunks.push(th),
                _ => internal_error!("INTERNAL ERROR: invariants frame expected on top"),
            }
        }
    }

    /// Run every assertion of `obj` unless a run is already in progress.
    /// Used by the manifester; field indexing arranges the same frame
    /// inline.
    pub(crate) fn run_invariants(
        &mut self,
        loc: &Location,
        obj: EntityRef,
    ) -> Result<(), RuntimeError> {
        if self.stack.already_executing_invariants(obj) {
            return Ok(());
        }
        let specs = self.invariant_specs(obj);
        if specs.is_empty() {
            return Ok(());
        }
        let initial_stack_size = self.stack.len();
        let mut frame = Frame::with_location(
            FrameKind::Invariants {
                thunks: ThunkList::new(),
                cursor: 0,
            },
            loc.clone(),
        );
        frame.self_obj = Some(obj);
        self.stack.push(frame);
        self.fill_invariants(obj, specs);

        let first = match &mut self.stack.top_mut().kind {
            FrameKind::Invariants { thunks, cursor } => {
                *cursor = 1;
                thunks[0]
            }
            _ => internal_error!("INTERNAL ERROR: invariants frame expected on top"),
        };
        let (self_obj, offset, up_values, body) = self.thunk_parts(first);
        self.new_call(loc, Some(first), self_obj, offset, up_values)?;
        self.evaluate(&body, initial_stack_size)
    }

    /// The pieces needed to force an unfilled thunk.
    fn thunk_parts(&self, th: EntityRef) -> (Option<EntityRef>, usize, Bindings, Rc<Expr>) {
        let t = self.heap.thunk(th);
        let body = match &t.body {
            Some(b) => b.clone(),
            None => internal_error!("INTERNAL ERROR: forcing a bodiless unfilled thunk"),
        };
        (t.self_obj, t.offset, t.up_values.clone(), body)
    }

    //
    // Imports.
    //

    pub(crate) fn import_string(
        &mut self,
        loc: &Location,
        path: &str,
    ) -> Result<Rc<ImportCacheEntry>, RuntimeError> {
        let dir = dir_name(&loc.file);
        let key = (dir.clone(), path.to_owned());
        if let Some(entry) = self.vm.import_cache.get(&key) {
            return Ok(entry.clone());
        }
        let result = match &mut self.vm.import_callback {
            Some(cb) => cb.import(&dir, path),
            None => self.vm.file_importer.import(&dir, path),
        };
        match result {
            Ok((found_here, content)) => {
                let entry = Rc::new(ImportCacheEntry {
                    found_here,
                    content,
                });
                self.vm.import_cache.insert(key, entry.clone());
                Ok(entry)
            }
            Err(msg) => Err(self.error(loc, format!("Couldn't open import \"{path}\": {msg}"))),
        }
    }

    fn import_ast(&mut self, loc: &Location, path: &str) -> Result<Rc<Expr>, RuntimeError> {
        let entry = self.import_string(loc, path)?;
        self.compile(&entry.found_here, &entry.content, loc)
    }

    /// Compile a source snippet through the configured frontend and annotate
    /// the result.
    pub(crate) fn compile(
        &mut self,
        filename: &str,
        source: &str,
        loc: &Location,
    ) -> Result<Rc<Expr>, RuntimeError> {
        if self.vm.frontend.is_none() {
            return Err(self.error(
                loc,
                format!("No frontend is configured to compile \"{filename}\""),
            ));
        }
        let result = match &mut self.vm.frontend {
            Some(frontend) => frontend.compile(&mut self.vm.interner, filename, source),
            None => unreachable!(),
        };
        match result {
            Ok(expr) => {
                crate::analysis::annotate(&expr);
                Ok(expr)
            }
            Err(msg) => Err(self.error(loc, msg)),
        }
    }

    //
    // The driver.
    //

    /// Evaluate `ast` until the stack is back at `initial_stack_size`,
    /// leaving the result in the scratch register. Frames at or below the
    /// watermark belong to the caller and are left untouched.
    pub(crate) fn evaluate(
        &mut self,
        ast: &Rc<Expr>,
        initial_stack_size: usize,
    ) -> Result<(), RuntimeError> {
        let mut ast = ast.clone();
        'recurse: loop {
            if let Some(next) = self.dispatch(&ast)? {
                ast = next;
                continue 'recurse;
            }
            loop {
                if self.stack.len() <= initial_stack_size {
                    return Ok(());
                }
                match self.unwind_top(initial_stack_size)? {
                    Unwind::Recurse(next) => {
                        ast = next;
                        continue 'recurse;
                    }
                    Unwind::Pop => self.stack.pop(),
                    Unwind::Keep => {}
                }
            }
        }
    }

    /// Handle one AST node: either write the scratch register, or push a
    /// continuation frame and return the subterm to restart on.
    fn dispatch(&mut self, ast: &Rc<Expr>) -> Result<Option<Rc<Expr>>, RuntimeError> {
        match &ast.kind {
            ExprKind::Apply { target, .. } => {
                self.stack.push(Frame::new(
                    FrameKind::ApplyTarget {
                        arg_thunks: ThunkList::new(),
                    },
                    ast,
                ));
                Ok(Some(target.clone()))
            }

            ExprKind::Array(elements) => {
                let (self_obj, offset) = self.stack.get_self_binding();
                let arr = self.alloc(Entity::Array(Array {
                    elements: Vec::new(),
                }));
                self.scratch = Value::Array(arr);
                for el in elements {
                    let up_values = self.capture(el.free_vars());
                    let th = self.alloc(Entity::Thunk(Thunk::new(
                        self.id_array_element,
                        self_obj,
                        offset,
                        Some(el.clone()),
                        up_values,
                    )));
                    self.heap.array_mut(arr).elements.push(th);
                }
                Ok(None)
            }

            ExprKind::Binary { left, .. } => {
                self.stack.push(Frame::new(FrameKind::BinaryLeft, ast));
                Ok(Some(left.clone()))
            }

            ExprKind::Builtin { builtin, params } => {
                let r = self.alloc(Entity::Closure(Closure {
                    up_values: Bindings::new(),
                    self_obj: None,
                    offset: 0,
                    params: params.clone(),
                    kind: ClosureKind::Builtin(*builtin),
                }));
                self.scratch = Value::Function(r);
                Ok(None)
            }

            ExprKind::Conditional { cond, .. } => {
                self.stack.push(Frame::new(FrameKind::If, ast));
                Ok(Some(cond.clone()))
            }

            ExprKind::Error(message) => {
                self.stack.push(Frame::new(FrameKind::Error, ast));
                Ok(Some(message.clone()))
            }

            ExprKind::Function { params, body } => {
                let up_values = self.capture(ast.free_vars());
                let (self_obj, offset) = self.stack.get_self_binding();
                let r = self.alloc(Entity::Closure(Closure {
                    up_values,
                    self_obj,
                    offset,
                    params: params.clone(),
                    kind: ClosureKind::User(body.clone()),
                }));
                self.scratch = Value::Function(r);
                Ok(None)
            }

            ExprKind::Import(path) => {
                let expr = self.import_ast(&ast.location, path)?;
                // Imports are closed expressions: no enclosing bindings, no
                // self.
                self.new_call(&ast.location, None, None, 0, Bindings::new())?;
                Ok(Some(expr))
            }

            ExprKind::ImportStr(path) => {
                let entry = self.import_string(&ast.location, path)?;
                let content = entry.content.clone();
                self.scratch = self.make_string(content);
                Ok(None)
            }

            ExprKind::Index { target, .. } => {
                self.stack.push(Frame::new(FrameKind::IndexTarget, ast));
                Ok(Some(target.clone()))
            }

            ExprKind::Local { binds, body } => {
                self.stack.push(Frame::new(FrameKind::Local, ast));
                let (self_obj, offset) = self.stack.get_self_binding();
                // Build and bind all thunks first so that mutually recursive
                // bindings can see each other, then capture.
                for bind in binds {
                    let th = self.alloc(Entity::Thunk(Thunk::new(
                        bind.var,
                        self_obj,
                        offset,
                        Some(bind.body.clone()),
                        Bindings::new(),
                    )));
                    self.stack.top_mut().bindings.insert(bind.var, th);
                }
                for bind in binds {
                    let th = match self.stack.top().bindings.get(&bind.var) {
                        Some(&t) => t,
                        None => internal_error!("INTERNAL ERROR: local binding vanished"),
                    };
                    let up_values = self.capture(bind.body.free_vars());
                    self.heap.thunk_mut(th).up_values = up_values;
                }
                Ok(Some(body.clone()))
            }

            ExprKind::LiteralBool(b) => {
                self.scratch = Value::Bool(*b);
                Ok(None)
            }

            ExprKind::LiteralNumber(v) => {
                self.scratch = self.double_check(&ast.location, *v)?;
                Ok(None)
            }

            ExprKind::LiteralString(s) => {
                self.scratch = self.make_string(s.clone());
                Ok(None)
            }

            ExprKind::LiteralNull => {
                self.scratch = Value::Null;
                Ok(None)
            }

            ExprKind::Object { asserts, fields } => {
                if fields.is_empty() {
                    let up_values = self.capture(ast.free_vars());
                    let r = self.alloc(Entity::Simple(SimpleObject {
                        up_values,
                        fields: HashMap::new(),
                        asserts: asserts.clone(),
                    }));
                    self.scratch = Value::Object(r);
                    Ok(None)
                } else {
                    let first = fields[0].name.clone();
                    self.stack.push(Frame::new(
                        FrameKind::Object {
                            fields: HashMap::new(),
                            cursor: 0,
                        },
                        ast,
                    ));
                    Ok(Some(first))
                }
            }

            ExprKind::ObjectComp { array, .. } => {
                self.stack.push(Frame::new(FrameKind::ObjectCompArray, ast));
                Ok(Some(array.clone()))
            }

            ExprKind::SelfExpr => {
                let (self_obj, _) = self.stack.get_self_binding();
                match self_obj {
                    Some(r) => {
                        self.scratch = Value::Object(r);
                        Ok(None)
                    }
                    None => internal_error!("INTERNAL ERROR: self used outside of an object"),
                }
            }

            ExprKind::SuperIndex(index) => {
                self.stack.push(Frame::new(FrameKind::SuperIndex, ast));
                Ok(Some(index.clone()))
            }

            ExprKind::Unary { expr, .. } => {
                self.stack.push(Frame::new(FrameKind::Unary, ast));
                Ok(Some(expr.clone()))
            }

            ExprKind::Var(id) => {
                let th = match self.stack.look_up_var(*id) {
                    Some(t) => t,
                    None => internal_error!(
                        "INTERNAL ERROR: could not bind variable: {}",
                        self.vm.interner.resolve(*id)
                    ),
                };
                if self.heap.thunk(th).filled {
                    self.scratch = self.heap.thunk(th).content;
                    Ok(None)
                } else {
                    let (self_obj, offset, up_values, body) = self.thunk_parts(th);
                    self.new_call(&ast.location, Some(th), self_obj, offset, up_values)?;
                    Ok(Some(body))
                }
            }
        }
    }

    /// Process the top frame now that the scratch register holds the value
    /// it was waiting for.
    fn unwind_top(&mut self, initial_stack_size: usize) -> Result<Unwind, RuntimeError> {
        match &self.stack.top().kind {
            FrameKind::ApplyTarget { .. } => self.unwind_apply_target(),
            FrameKind::BinaryLeft => self.unwind_binary_left(),
            FrameKind::BinaryRight { .. } => self.unwind_binary_right(),
            FrameKind::BuiltinFilter { .. } => self.unwind_builtin_filter(),
            FrameKind::BuiltinForceThunks { .. } => self.unwind_builtin_force_thunks(),
            FrameKind::Call { .. } => self.unwind_call(),
            FrameKind::Error => self.unwind_error(),
            FrameKind::If => self.unwind_if(),
            FrameKind::IndexIndex { .. } => self.unwind_index_index(),
            FrameKind::IndexTarget => self.unwind_index_target(),
            FrameKind::Invariants { .. } => self.unwind_invariants(initial_stack_size),
            FrameKind::Local => Ok(Unwind::Pop),
            FrameKind::Object { .. } => self.unwind_object(),
            FrameKind::ObjectCompArray => self.unwind_object_comp_array(),
            FrameKind::ObjectCompElement { .. } => self.unwind_object_comp_element(),
            FrameKind::StringConcat { .. } => self.unwind_string_concat(),
            FrameKind::SuperIndex => self.unwind_super_index(),
            FrameKind::Unary => self.unwind_unary(),
        }
    }

    fn unwind_apply_target(&mut self) -> Result<Unwind, RuntimeError> {
        let ast = self.top_ast();
        let (args_exprs, tailstrict) = match &ast.kind {
            ExprKind::Apply {
                args, tailstrict, ..
            } => (args.clone(), *tailstrict),
            _ => internal_error!("INTERNAL ERROR: apply frame without apply expression"),
        };
        let func_ref = match self.scratch {
            Value::Function(r) => r,
            other => {
                return Err(self.error(
                    &ast.location,
                    format!("Only functions can be called, got {}", other.type_str()),
                ));
            }
        };
        let closure = self.heap.closure(func_ref).clone();
        if args_exprs.len() != closure.params.len() {
            return Err(self.error(
                &ast.location,
                format!(
                    "Expected {} arguments, got {}.",
                    closure.params.len(),
                    args_exprs.len()
                ),
            ));
        }

        // Create the argument thunks, rooting each in this frame before the
        // next allocation.
        let (self_obj, offset) = self.stack.get_self_binding();
        for (i, arg) in args_exprs.iter().enumerate() {
            let up_values = self.capture(arg.free_vars());
            let th = self.alloc(Entity::Thunk(Thunk::new(
                closure.params[i],
                self_obj,
                offset,
                Some(arg.clone()),
                up_values,
            )));
            match &mut self.stack.top_mut().kind {
                FrameKind::ApplyTarget { arg_thunks } => arg_thunks.push(th),
                _ => internal_error!("INTERNAL ERROR: apply frame changed kind"),
            }
        }
        let args = match &mut self.stack.top_mut().kind {
            FrameKind::ApplyTarget { arg_thunks } => std::mem::take(arg_thunks),
            _ => internal_error!("INTERNAL ERROR: apply frame changed kind"),
        };
        self.stack.pop();

        match &closure.kind {
            ClosureKind::Builtin(_) => {
                let mut frame = Frame::new(
                    FrameKind::BuiltinForceThunks {
                        func: self.scratch,
                        thunks: args,
                        cursor: 0,
                    },
                    &ast,
                );
                frame.stash = self.scratch;
                self.stack.push(frame);
                Ok(Unwind::Keep)
            }
            ClosureKind::User(body) => {
                let mut bindings = closure.up_values.clone();
                for (&param, &arg) in closure.params.iter().zip(args.iter()) {
                    bindings.insert(param, arg);
                }
                self.new_call(
                    &ast.location,
                    Some(func_ref),
                    closure.self_obj,
                    closure.offset,
                    bindings,
                )?;
                if tailstrict {
                    self.stack.top_mut().tail_call = true;
                    if args.is_empty() {
                        Ok(Unwind::Recurse(body.clone()))
                    } else {
                        // Force the argument thunks before entering the body.
                        let scratch = self.scratch;
                        let top = self.stack.top_mut();
                        top.kind = FrameKind::Call { args, cursor: 0 };
                        top.stash = scratch;
                        Ok(Unwind::Keep)
                    }
                } else {
                    Ok(Unwind::Recurse(body.clone()))
                }
            }
        }
    }

    fn unwind_binary_left(&mut self) -> Result<Unwind, RuntimeError> {
        let ast = self.top_ast();
        let (op, right) = match &ast.kind {
            ExprKind::Binary { op, right, .. } => (*op, right.clone()),
            _ => internal_error!("INTERNAL ERROR: binary frame without binary expression"),
        };
        if let Value::Bool(b) = self.scratch {
            // Short-cut semantics.
            if op == BinaryOp::And && !b {
                self.scratch = Value::Bool(false);
                return Ok(Unwind::Pop);
            }
            if op == BinaryOp::Or && b {
                self.scratch = Value::Bool(true);
                return Ok(Unwind::Pop);
            }
        }
        self.stack.top_mut().kind = FrameKind::BinaryRight { left: self.scratch };
        Ok(Unwind::Recurse(right))
    }

    fn unwind_binary_right(&mut self) -> Result<Unwind, RuntimeError> {
        let ast = self.top_ast();
        let op = match &ast.kind {
            ExprKind::Binary { op, .. } => *op,
            _ => internal_error!("INTERNAL ERROR: binary frame without binary expression"),
        };
        let left = match &self.stack.top().kind {
            FrameKind::BinaryRight { left } => *left,
            _ => internal_error!("INTERNAL ERROR: binary frame changed kind"),
        };
        let right = self.scratch;
        let loc = &ast.location;

        if (matches!(left, Value::Str(_)) || matches!(right, Value::Str(_)))
            && op == BinaryOp::Plus
        {
            self.stack.top_mut().kind = FrameKind::StringConcat { left, right };
            return Ok(Unwind::Keep);
        }
        if op == BinaryOp::ManifestEqual || op == BinaryOp::ManifestUnequal {
            internal_error!("INTERNAL ERROR: equality operator was not desugared");
        }
        if left.type_str() != right.type_str() {
            return Err(self.error(
                loc,
                format!(
                    "Binary operator {} requires matching types, got {} and {}.",
                    op,
                    left.type_str(),
                    right.type_str()
                ),
            ));
        }

        self.scratch = match (left, right) {
            (Value::Array(l), Value::Array(r)) => {
                if op != BinaryOp::Plus {
                    return Err(self.error(
                        loc,
                        format!("Binary operator {op} does not operate on arrays."),
                    ));
                }
                // Thunks are copied, not forced.
                let mut elements = self.heap.array(l).elements.clone();
                elements.extend(self.heap.array(r).elements.iter().copied());
                self.make_array(elements)
            }

            (Value::Bool(l), Value::Bool(r)) => match op {
                BinaryOp::And => Value::Bool(l && r),
                BinaryOp::Or => Value::Bool(l || r),
                _ => {
                    return Err(self.error(
                        loc,
                        format!("Binary operator {op} does not operate on booleans."),
                    ));
                }
            },

            (Value::Double(l), Value::Double(r)) => match op {
                BinaryOp::Plus => self.double_check(loc, l + r)?,
                BinaryOp::Minus => self.double_check(loc, l - r)?,
                BinaryOp::Mult => self.double_check(loc, l * r)?,
                BinaryOp::Div => {
                    if r == 0.0 {
                        return Err(self.error(loc, "Division by zero."));
                    }
                    self.double_check(loc, l / r)?
                }
                // Bitwise operations truncate through a signed 64-bit
                // integer; no NaN/Inf can come out of them.
                BinaryOp::ShiftL => Value::Double((l as i64).wrapping_shl(r as i64 as u32) as f64),
                BinaryOp::ShiftR => Value::Double((l as i64).wrapping_shr(r as i64 as u32) as f64),
                BinaryOp::BitwiseAnd => Value::Double(((l as i64) & (r as i64)) as f64),
                BinaryOp::BitwiseXor => Value::Double(((l as i64) ^ (r as i64)) as f64),
                BinaryOp::BitwiseOr => Value::Double(((l as i64) | (r as i64)) as f64),
                BinaryOp::Less => Value::Bool(l < r),
                BinaryOp::LessEq => Value::Bool(l <= r),
                BinaryOp::Greater => Value::Bool(l > r),
                BinaryOp::GreaterEq => Value::Bool(l >= r),
                _ => {
                    return Err(self.error(
                        loc,
                        format!("Binary operator {op} does not operate on numbers."),
                    ));
                }
            },

            (Value::Function(_), Value::Function(_)) => {
                return Err(self.error(
                    loc,
                    format!("Binary operator {op} does not operate on functions."),
                ));
            }

            (Value::Null, Value::Null) => {
                return Err(self.error(
                    loc,
                    format!("Binary operator {op} does not operate on null."),
                ));
            }

            (Value::Object(l), Value::Object(r)) => {
                if op != BinaryOp::Plus {
                    return Err(self.error(
                        loc,
                        format!("Binary operator {op} does not operate on objects."),
                    ));
                }
                // The right operand shadows; the tree stays binary so super
                // can count leaves.
                Value::Object(self.alloc(Entity::Extended(ExtendedObject { left: l, right: r })))
            }

            (Value::Str(l), Value::Str(r)) => {
                let ls = self.heap.string(l).value.clone();
                let rs = self.heap.string(r).value.clone();
                match op {
                    BinaryOp::Plus => {
                        let joined = format!("{ls}{rs}");
                        self.make_string(joined)
                    }
                    BinaryOp::Less => Value::Bool(ls < rs),
                    BinaryOp::LessEq => Value::Bool(ls <= rs),
                    BinaryOp::Greater => Value::Bool(ls > rs),
                    BinaryOp::GreaterEq => Value::Bool(ls >= rs),
                    _ => {
                        return Err(self.error(
                            loc,
                            format!("Binary operator {op} does not operate on strings."),
                        ));
                    }
                }
            }

            _ => internal_error!("INTERNAL ERROR: matching types fell through binary dispatch"),
        };
        Ok(Unwind::Pop)
    }

    fn unwind_string_concat(&mut self) -> Result<Unwind, RuntimeError> {
        let ast = self.top_ast();
        let (left_loc, right_loc) = match &ast.kind {
            ExprKind::Binary { left, right, .. } => {
                (left.location.clone(), right.location.clone())
            }
            _ => internal_error!("INTERNAL ERROR: concat frame without binary expression"),
        };
        let (left, right) = match &self.stack.top().kind {
            FrameKind::StringConcat { left, right } => (*left, *right),
            _ => internal_error!("INTERNAL ERROR: concat frame changed kind"),
        };
        let mut output = String::new();
        match left {
            Value::Str(r) => output.push_str(&self.heap.string(r).value),
            other => {
                self.scratch = other;
                output.push_str(&self.manifest_json(&left_loc, false, "")?);
            }
        }
        match right {
            Value::Str(r) => output.push_str(&self.heap.string(r).value),
            other => {
                self.scratch = other;
                output.push_str(&self.manifest_json(&right_loc, false, "")?);
            }
        }
        self.scratch = self.make_string(output);
        Ok(Unwind::Pop)
    }

    fn unwind_builtin_filter(&mut self) -> Result<Unwind, RuntimeError> {
        let ast = self.top_ast();
        let (func, array) = match &self.stack.top().kind {
            FrameKind::BuiltinFilter { func, array, .. } => (*func, *array),
            _ => internal_error!("INTERNAL ERROR: filter frame changed kind"),
        };
        let keep = match self.scratch {
            Value::Bool(b) => b,
            other => {
                return Err(self.error(
                    &ast.location,
                    format!(
                        "filter function must return boolean, got: {}",
                        other.type_str()
                    ),
                ));
            }
        };
        let arr_ref = match array {
            Value::Array(r) => r,
            _ => internal_error!("INTERNAL ERROR: filter frame lost its array"),
        };
        let elements = self.heap.array(arr_ref).elements.clone();

        let cursor = match &mut self.stack.top_mut().kind {
            FrameKind::BuiltinFilter { kept, cursor, .. } => {
                if keep {
                    kept.push(elements[*cursor]);
                }
                *cursor += 1;
                *cursor
            }
            _ => internal_error!("INTERNAL ERROR: filter frame changed kind"),
        };

        if cursor == elements.len() {
            let kept = match &mut self.stack.top_mut().kind {
                FrameKind::BuiltinFilter { kept, .. } => std::mem::take(kept),
                _ => internal_error!("INTERNAL ERROR: filter frame changed kind"),
            };
            self.scratch = self.make_array(kept.to_vec());
            Ok(Unwind::Pop)
        } else {
            let func_ref = match func {
                Value::Function(r) => r,
                _ => internal_error!("INTERNAL ERROR: filter frame lost its function"),
            };
            let closure = self.heap.closure(func_ref).clone();
            let body = match &closure.kind {
                ClosureKind::User(b) => b.clone(),
                ClosureKind::Builtin(_) => {
                    internal_error!("INTERNAL ERROR: filter iterating a builtin closure")
                }
            };
            let mut bindings = closure.up_values.clone();
            bindings.insert(closure.params[0], elements[cursor]);
            self.new_call(
                &ast.location,
                Some(func_ref),
                closure.self_obj,
                closure.offset,
                bindings,
            )?;
            Ok(Unwind::Recurse(body))
        }
    }

    fn unwind_builtin_force_thunks(&mut self) -> Result<Unwind, RuntimeError> {
        let ast = self.top_ast();
        let (func, cursor, total) = match &self.stack.top().kind {
            FrameKind::BuiltinForceThunks {
                func,
                thunks,
                cursor,
            } => (*func, *cursor, thunks.len()),
            _ => internal_error!("INTERNAL ERROR: builtin frame changed kind"),
        };

        if cursor == total {
            // All thunks forced; now the native operation.
            let thunks = match &self.stack.top().kind {
                FrameKind::BuiltinForceThunks { thunks, .. } => thunks.clone(),
                _ => internal_error!("INTERNAL ERROR: builtin frame changed kind"),
            };
            let args: Vec<Value> = thunks.iter().map(|&t| self.heap.thunk(t).content).collect();
            let func_ref = match func {
                Value::Function(r) => r,
                _ => internal_error!("INTERNAL ERROR: builtin frame lost its function"),
            };
            let builtin = match &self.heap.closure(func_ref).kind {
                ClosureKind::Builtin(b) => *b,
                ClosureKind::User(_) => {
                    internal_error!("INTERNAL ERROR: builtin frame holds a user closure")
                }
            };
            match self.builtin_call(builtin, &args, &ast.location)? {
                Some(next) => Ok(Unwind::Recurse(next)),
                None => Ok(Unwind::Pop),
            }
        } else {
            let th = match &mut self.stack.top_mut().kind {
                FrameKind::BuiltinForceThunks { thunks, cursor, .. } => {
                    let th = thunks[*cursor];
                    *cursor += 1;
                    th
                }
                _ => internal_error!("INTERNAL ERROR: builtin frame changed kind"),
            };
            if self.heap.thunk(th).filled {
                Ok(Unwind::Keep)
            } else {
                let (self_obj, offset, up_values, body) = self.thunk_parts(th);
                self.new_call(&ast.location, Some(th), self_obj, offset, up_values)?;
                Ok(Unwind::Recurse(body))
            }
        }
    }

    fn unwind_call(&mut self) -> Result<Unwind, RuntimeError> {
        let location = self.stack.top().location.clone();
        let Some(context) = self.stack.top().context else {
            // Import frames carry no context; result is in scratch.
            return Ok(Unwind::Pop);
        };

        if matches!(self.heap.get(context), Entity::Thunk(_)) {
            // A forced thunk caches its result.
            let value = self.scratch;
            self.heap.thunk_mut(context).fill(value);
            return Ok(Unwind::Pop);
        }

        let closure_body = match self.heap.get(context) {
            Entity::Closure(c) => match &c.kind {
                ClosureKind::User(b) => Some(b.clone()),
                ClosureKind::Builtin(_) => None,
            },
            _ => return Ok(Unwind::Pop),
        };

        let (len, cursor) = match &self.stack.top().kind {
            FrameKind::Call { args, cursor } => (args.len(), *cursor),
            _ => internal_error!("INTERNAL ERROR: call frame changed kind"),
        };
        if cursor < len {
            // Tailstrict: force argument thunks before the body runs.
            let th = match &mut self.stack.top_mut().kind {
                FrameKind::Call { args, cursor } => {
                    let th = args[*cursor];
                    *cursor += 1;
                    th
                }
                _ => internal_error!("INTERNAL ERROR: call frame changed kind"),
            };
            if self.heap.thunk(th).filled {
                return Ok(Unwind::Keep);
            }
            let (self_obj, offset, up_values, body) = self.thunk_parts(th);
            self.new_call(&location, Some(th), self_obj, offset, up_values)?;
            return Ok(Unwind::Recurse(body));
        }
        if len > 0 {
            // Arguments all forced; release them and run the body.
            match &mut self.stack.top_mut().kind {
                FrameKind::Call { args, cursor } => {
                    args.clear();
                    *cursor = 0;
                }
                _ => internal_error!("INTERNAL ERROR: call frame changed kind"),
            }
            let body = match closure_body {
                Some(b) => b,
                None => internal_error!("INTERNAL ERROR: tailstrict call into a builtin"),
            };
            return Ok(Unwind::Recurse(body));
        }
        // Body has now been executed; result is in scratch.
        Ok(Unwind::Pop)
    }

    fn unwind_error(&mut self) -> Result<Unwind, RuntimeError> {
        let ast = self.top_ast();
        match self.scratch {
            Value::Str(r) => {
                let message = self.heap.string(r).value.clone();
                Err(self.error(&ast.location, message))
            }
            other => Err(self.error(
                &ast.location,
                format!("Error message must be string, got {}.", other.type_str()),
            )),
        }
    }

    fn unwind_if(&mut self) -> Result<Unwind, RuntimeError> {
        let ast = self.top_ast();
        let (then_branch, else_branch) = match &ast.kind {
            ExprKind::Conditional {
                then_branch,
                else_branch,
                ..
            } => (then_branch.clone(), else_branch.clone()),
            _ => internal_error!("INTERNAL ERROR: if frame without conditional expression"),
        };
        match self.scratch {
            Value::Bool(b) => {
                // Pop before recursing so the branch is in tail position.
                self.stack.pop();
                Ok(Unwind::Recurse(if b { then_branch } else { else_branch }))
            }
            other => Err(self.error(
                &ast.location,
                format!("Condition must be boolean, got {}.", other.type_str()),
            )),
        }
    }

    fn unwind_super_index(&mut self) -> Result<Unwind, RuntimeError> {
        let ast = self.top_ast();
        let (self_obj, offset) = self.stack.get_self_binding();
        let offset = offset + 1;
        let Some(self_ref) = self_obj else {
            return Err(self.error(
                &ast.location,
                "Attempt to use super when there is no super class.",
            ));
        };
        if offset >= self.count_leaves(self_ref) {
            return Err(self.error(
                &ast.location,
                "Attempt to use super when there is no super class.",
            ));
        }
        let name = match self.scratch {
            Value::Str(r) => self.heap.string(r).value.clone(),
            other => {
                return Err(self.error(
                    &ast.location,
                    format!("Super index must be string, got {}.", other.type_str()),
                ));
            }
        };
        let fid = self.vm.interner.intern(&name);
        self.stack.pop();
        let body = self.object_index(&ast.location, self_ref, fid, offset)?;
        Ok(Unwind::Recurse(body))
    }

    fn unwind_index_index(&mut self) -> Result<Unwind, RuntimeError> {
        let ast = self.top_ast();
        let target = match &self.stack.top().kind {
            FrameKind::IndexIndex { target } => *target,
            _ => internal_error!("INTERNAL ERROR: index frame changed kind"),
        };
        match target {
            Value::Array(arr) => {
                let d = match self.scratch {
                    Value::Double(d) => d,
                    other => {
                        return Err(self.error(
                            &ast.location,
                            format!("Array index must be number, got {}.", other.type_str()),
                        ));
                    }
                };
                let elements = self.heap.array(arr).elements.clone();
                let i = d as i64;
                let sz = elements.len() as i64;
                if i < 0 || i >= sz {
                    return Err(self.error(
                        &ast.location,
                        format!("Array bounds error: {i} not within [0, {sz})"),
                    ));
                }
                let th = elements[i as usize];
                if self.heap.thunk(th).filled {
                    self.scratch = self.heap.thunk(th).content;
                    Ok(Unwind::Pop)
                } else {
                    let (self_obj, offset, up_values, body) = self.thunk_parts(th);
                    self.stack.pop();
                    self.new_call(&ast.location, Some(th), self_obj, offset, up_values)?;
                    Ok(Unwind::Recurse(body))
                }
            }

            Value::Object(obj) => {
                let name = match self.scratch {
                    Value::Str(r) => self.heap.string(r).value.clone(),
                    other => {
                        return Err(self.error(
                            &ast.location,
                            format!("Object index must be string, got {}.", other.type_str()),
                        ));
                    }
                };
                let fid = self.vm.interner.intern(&name);
                self.stack.pop();
                let body = self.object_index(&ast.location, obj, fid, 0)?;
                Ok(Unwind::Recurse(body))
            }

            Value::Str(sref) => {
                let d = match self.scratch {
                    Value::Double(d) => d,
                    other => {
                        return Err(self.error(
                            &ast.location,
                            format!("String index must be a number, got {}.", other.type_str()),
                        ));
                    }
                };
                let s = self.heap.string(sref).value.clone();
                let i = d as i64;
                let sz = s.chars().count() as i64;
                if i < 0 || i >= sz {
                    return Err(self.error(
                        &ast.location,
                        format!("String bounds error: {i} not within [0, {sz})"),
                    ));
                }
                let c = match s.chars().nth(i as usize) {
                    Some(c) => c,
                    None => internal_error!("INTERNAL ERROR: checked string index out of range"),
                };
                self.scratch = self.make_string(c.to_string());
                Ok(Unwind::Pop)
            }

            _ => internal_error!("INTERNAL ERROR: index target not object / array / string"),
        }
    }

    fn unwind_index_target(&mut self) -> Result<Unwind, RuntimeError> {
        let ast = self.top_ast();
        let target = self.scratch;
        match target {
            Value::Array(_) | Value::Object(_) | Value::Str(_) => {}
            other => {
                return Err(self.error(
                    &ast.location,
                    format!(
                        "Can only index objects, strings, and arrays, got {}.",
                        other.type_str()
                    ),
                ));
            }
        }
        let index_expr = match &ast.kind {
            ExprKind::Index { index, .. } => index.clone(),
            _ => internal_error!("INTERNAL ERROR: index frame without index expression"),
        };
        self.stack.top_mut().kind = FrameKind::IndexIndex { target };

        if let Value::Object(obj) = target {
            // First outermost access runs the object's invariants, guarded
            // against re-entry from within the assertions themselves.
            if !self.stack.already_executing_invariants(obj) {
                let specs = self.invariant_specs(obj);
                if !specs.is_empty() {
                    let mut frame = Frame::with_location(
                        FrameKind::Invariants {
                            thunks: ThunkList::new(),
                            cursor: 0,
                        },
                        ast.location.clone(),
                    );
                    frame.self_obj = Some(obj);
                    self.stack.push(frame);
                    self.fill_invariants(obj, specs);
                    let first = match &mut self.stack.top_mut().kind {
                        FrameKind::Invariants { thunks, cursor } => {
                            *cursor = 1;
                            thunks[0]
                        }
                        _ => internal_error!("INTERNAL ERROR: invariants frame expected on top"),
                    };
                    let (self_obj, offset, up_values, body) = self.thunk_parts(first);
                    self.new_call(&ast.location, Some(first), self_obj, offset, up_values)?;
                    return Ok(Unwind::Recurse(body));
                }
            }
        }
        Ok(Unwind::Recurse(index_expr))
    }

    fn unwind_invariants(&mut self, initial_stack_size: usize) -> Result<Unwind, RuntimeError> {
        let location = self.stack.top().location.clone();
        let (len, cursor) = match &self.stack.top().kind {
            FrameKind::Invariants { thunks, cursor } => (thunks.len(), *cursor),
            _ => internal_error!("INTERNAL ERROR: invariants frame changed kind"),
        };
        if cursor >= len {
            if self.stack.len() == initial_stack_size + 1 {
                // Evaluation was entered by run_invariants; just pop.
                return Ok(Unwind::Pop);
            }
            // Assertions done; resume the index that triggered them.
            self.stack.pop();
            let index_ast = self.top_ast();
            let index_expr = match &index_ast.kind {
                ExprKind::Index { index, .. } => index.clone(),
                _ => internal_error!("INTERNAL ERROR: invariants frame above a non-index frame"),
            };
            return Ok(Unwind::Recurse(index_expr));
        }
        let th = match &mut self.stack.top_mut().kind {
            FrameKind::Invariants { thunks, cursor } => {
                let th = thunks[*cursor];
                *cursor += 1;
                th
            }
            _ => internal_error!("INTERNAL ERROR: invariants frame changed kind"),
        };
        let (self_obj, offset, up_values, body) = self.thunk_parts(th);
        self.new_call(&location, Some(th), self_obj, offset, up_values)?;
        Ok(Unwind::Recurse(body))
    }

    fn unwind_object(&mut self) -> Result<Unwind, RuntimeError> {
        let ast = self.top_ast();
        let (asserts, ast_fields) = match &ast.kind {
            ExprKind::Object { asserts, fields } => (asserts.clone(), fields.clone()),
            _ => internal_error!("INTERNAL ERROR: object frame without object expression"),
        };
        let cursor = match &self.stack.top().kind {
            FrameKind::Object { cursor, .. } => *cursor,
            _ => internal_error!("INTERNAL ERROR: object frame changed kind"),
        };

        match self.scratch {
            // A null field name drops the field.
            Value::Null => {}
            Value::Str(sref) => {
                let name = self.heap.string(sref).value.clone();
                let fid = self.vm.interner.intern(&name);
                let duplicate = match &self.stack.top().kind {
                    FrameKind::Object { fields, .. } => fields.contains_key(&fid),
                    _ => false,
                };
                if duplicate {
                    return Err(
                        self.error(&ast.location, format!("Duplicate field name: \"{name}\""))
                    );
                }
                let decl = &ast_fields[cursor];
                let obj_field = ObjField {
                    hide: decl.hide,
                    body: decl.body.clone(),
                };
                match &mut self.stack.top_mut().kind {
                    FrameKind::Object { fields, .. } => {
                        fields.insert(fid, obj_field);
                    }
                    _ => internal_error!("INTERNAL ERROR: object frame changed kind"),
                }
            }
            _ => return Err(self.error(&ast.location, "Field name was not a string.")),
        }

        let cursor = cursor + 1;
        match &mut self.stack.top_mut().kind {
            FrameKind::Object { cursor: c, .. } => *c = cursor,
            _ => internal_error!("INTERNAL ERROR: object frame changed kind"),
        }
        if cursor < ast_fields.len() {
            Ok(Unwind::Recurse(ast_fields[cursor].name.clone()))
        } else {
            let up_values = self.capture(ast.free_vars());
            let fields = match &mut self.stack.top_mut().kind {
                FrameKind::Object { fields, .. } => std::mem::take(fields),
                _ => internal_error!("INTERNAL ERROR: object frame changed kind"),
            };
            let r = self.alloc(Entity::Simple(SimpleObject {
                up_values,
                fields,
                asserts,
            }));
            self.scratch = Value::Object(r);
            Ok(Unwind::Pop)
        }
    }

    fn unwind_object_comp_array(&mut self) -> Result<Unwind, RuntimeError> {
        let ast = self.top_ast();
        let (field, value, var) = match &ast.kind {
            ExprKind::ObjectComp {
                field, value, var, ..
            } => (field.clone(), value.clone(), *var),
            _ => internal_error!("INTERNAL ERROR: comprehension frame without comprehension"),
        };
        let arr_value = self.scratch;
        let arr = match arr_value {
            Value::Array(r) => r,
            other => {
                return Err(self.error(
                    &ast.location,
                    format!("Object comprehension needs array, got {}", other.type_str()),
                ));
            }
        };
        let elements = self.heap.array(arr).elements.clone();
        if elements.is_empty() {
            let r = self.alloc(Entity::Comprehension(ComprehensionObject {
                up_values: Bindings::new(),
                value,
                var,
                comp_values: HashMap::new(),
            }));
            self.scratch = Value::Object(r);
            Ok(Unwind::Pop)
        } else {
            let top = self.stack.top_mut();
            top.kind = FrameKind::ObjectCompElement {
                array: arr_value,
                elements: HashMap::new(),
                cursor: 0,
            };
            top.bindings.insert(var, elements[0]);
            Ok(Unwind::Recurse(field))
        }
    }

    fn unwind_object_comp_element(&mut self) -> Result<Unwind, RuntimeError> {
        let ast = self.top_ast();
        let (field, value, var) = match &ast.kind {
            ExprKind::ObjectComp {
                field, value, var, ..
            } => (field.clone(), value.clone(), *var),
            _ => internal_error!("INTERNAL ERROR: comprehension frame without comprehension"),
        };
        let (array, cursor) = match &self.stack.top().kind {
            FrameKind::ObjectCompElement { array, cursor, .. } => (*array, *cursor),
            _ => internal_error!("INTERNAL ERROR: comprehension frame changed kind"),
        };
        let arr = match array {
            Value::Array(r) => r,
            _ => internal_error!("INTERNAL ERROR: comprehension frame lost its array"),
        };
        let elements = self.heap.array(arr).elements.clone();

        let name = match self.scratch {
            Value::Str(r) => self.heap.string(r).value.clone(),
            other => {
                return Err(self.error(
                    &ast.location,
                    format!("field must be string, got: {}", other.type_str()),
                ));
            }
        };
        let fid = self.vm.interner.intern(&name);
        let duplicate = match &self.stack.top().kind {
            FrameKind::ObjectCompElement { elements, .. } => elements.contains_key(&fid),
            _ => false,
        };
        if duplicate {
            return Err(self.error(&ast.location, format!("Duplicate field name: \"{name}\"")));
        }
        let cursor = cursor + 1;
        match &mut self.stack.top_mut().kind {
            FrameKind::ObjectCompElement {
                elements: field_map,
                cursor: c,
                ..
            } => {
                field_map.insert(fid, elements[cursor - 1]);
                *c = cursor;
            }
            _ => internal_error!("INTERNAL ERROR: comprehension frame changed kind"),
        }

        if cursor == elements.len() {
            let up_values = self.capture(ast.free_vars());
            let comp_values = match &mut self.stack.top_mut().kind {
                FrameKind::ObjectCompElement { elements, .. } => std::mem::take(elements),
                _ => internal_error!("INTERNAL ERROR: comprehension frame changed kind"),
            };
            let r = self.alloc(Entity::Comprehension(ComprehensionObject {
                up_values,
                value,
                var,
                comp_values,
            }));
            self.scratch = Value::Object(r);
            Ok(Unwind::Pop)
        } else {
            self.stack.top_mut().bindings.insert(var, elements[cursor]);
            Ok(Unwind::Recurse(field))
        }
    }

    fn unwind_unary(&mut self) -> Result<Unwind, RuntimeError> {
        let ast = self.top_ast();
        let op = match &ast.kind {
            ExprKind::Unary { op, .. } => *op,
            _ => internal_error!("INTERNAL ERROR: unary frame without unary expression"),
        };
        match self.scratch {
            Value::Bool(b) => {
                if op == UnaryOp::Not {
                    self.scratch = Value::Bool(!b);
                } else {
                    return Err(self.error(
                        &ast.location,
                        format!("Unary operator {op} does not operate on booleans."),
                    ));
                }
            }
            Value::Double(d) => match op {
                UnaryOp::Plus => {}
                UnaryOp::Minus => self.scratch = Value::Double(-d),
                UnaryOp::BitwiseNot => self.scratch = Value::Double(!(d as i64) as f64),
                UnaryOp::Not => {
                    return Err(self.error(
                        &ast.location,
                        format!("Unary operator {op} does not operate on numbers."),
                    ));
                }
            },
            other => {
                return Err(self.error(
                    &ast.location,
                    format!(
                        "Unary operator {} does not operate on type {}",
                        op,
                        other.type_str()
                    ),
                ));
            }
        }
        Ok(Unwind::Pop)
    }

    //
    // Manifestation.
    //

    /// Force the scratch value to JSON text, running object invariants and
    /// forcing thunks as it goes. The enclosing value is stashed in the
    /// forcing frame so a collection in a member cannot sweep it.
    pub(crate) fn manifest_json(
        &mut self,
        loc: &Location,
        multiline: bool,
        indent: &str,
    ) -> Result<String, RuntimeError> {
        let mut out = String::new();
        match self.scratch {
            Value::Array(arr) => {
                let elements = self.heap.array(arr).elements.clone();
                if elements.is_empty() {
                    out.push_str("[ ]");
                } else {
                    let indent2 = if multiline {
                        format!("{indent}   ")
                    } else {
                        indent.to_owned()
                    };
                    let mut prefix = if multiline { "[\n" } else { "[" };
                    for th in elements {
                        let tloc = match &self.heap.thunk(th).body {
                            Some(b) => b.location.clone(),
                            None => loc.clone(),
                        };
                        self.force_for_manifest(loc, th)?;
                        let element = self.manifest_json(&tloc, multiline, &indent2)?;
                        self.scratch = self.stack.top().stash;
                        self.stack.pop();
                        out.push_str(prefix);
                        out.push_str(&indent2);
                        out.push_str(&element);
                        prefix = if multiline { ",\n" } else { ", " };
                    }
                    if multiline {
                        out.push('\n');
                    }
                    out.push_str(indent);
                    out.push(']');
                }
            }

            Value::Bool(b) => out.push_str(if b { "true" } else { "false" }),

            Value::Double(d) => out.push_str(&unparse_number(d)),

            Value::Function(_) => {
                return Err(self.error(loc, "Couldn't manifest function in JSON output."));
            }

            Value::Null => out.push_str("null"),

            Value::Object(obj) => {
                self.run_invariants(loc, obj)?;
                let mut fields: Vec<(String, Ident)> = self
                    .object_fields(obj, true)
                    .into_iter()
                    .map(|id| (self.vm.interner.resolve(id).to_owned(), id))
                    .collect();
                fields.sort_by(|a, b| a.0.cmp(&b.0));
                if fields.is_empty() {
                    out.push_str("{ }");
                } else {
                    let indent2 = if multiline {
                        format!("{indent}   ")
                    } else {
                        indent.to_owned()
                    };
                    let mut prefix = if multiline { "{\n" } else { "{" };
                    for (name, fid) in fields {
                        let body = self.object_index(loc, obj, fid, 0)?;
                        self.stack.top_mut().stash = self.scratch;
                        let watermark = self.stack.len();
                        self.evaluate(&body, watermark)?;
                        let vstr = self.manifest_json(&body.location, multiline, &indent2)?;
                        self.scratch = self.stack.top().stash;
                        self.stack.pop();
                        out.push_str(prefix);
                        out.push_str(&indent2);
                        out.push_str(&unparse_string(&name));
                        out.push_str(": ");
                        out.push_str(&vstr);
                        prefix = if multiline { ",\n" } else { ", " };
                    }
                    if multiline {
                        out.push('\n');
                    }
                    out.push_str(indent);
                    out.push('}');
                }
            }

            Value::Str(s) => out.push_str(&unparse_string(&self.heap.string(s).value.clone())),
        }
        Ok(out)
    }

    /// Open a call frame for an element thunk, stash the enclosing value in
    /// it, and leave the element's value in the scratch register.
    fn force_for_manifest(&mut self, loc: &Location, th: EntityRef) -> Result<(), RuntimeError> {
        if self.heap.thunk(th).filled {
            let content = self.heap.thunk(th).content;
            self.new_call(loc, Some(th), None, 0, Bindings::new())?;
            self.stack.top_mut().stash = self.scratch;
            self.scratch = content;
        } else {
            let (self_obj, offset, up_values, body) = self.thunk_parts(th);
            self.new_call(loc, Some(th), self_obj, offset, up_values)?;
            self.stack.top_mut().stash = self.scratch;
            let watermark = self.stack.len();
            self.evaluate(&body, watermark)?;
        }
        Ok(())
    }

    /// Top-level raw-string output mode.
    pub(crate) fn manifest_string(&mut self, loc: &Location) -> Result<String, RuntimeError> {
        match self.scratch {
            Value::Str(s) => Ok(self.heap.string(s).value.clone()),
            other => Err(self.error(
                loc,
                format!("Expected string result, got: {}", other.type_str()),
            )),
        }
    }

    /// Multi mode: the top-level object maps filenames to documents.
    pub(crate) fn manifest_multi(
        &mut self,
        string_output: bool,
    ) -> Result<Vec<(String, String)>, RuntimeError> {
        let loc = Location::synthetic("During manifestation");
        let obj = match self.scratch {
            Value::Object(o) => o,
            other => {
                return Err(self.error(
                    &loc,
                    format!(
                        "Multi mode: Top-level object was a {}, should be an object whose keys \
                         are filenames and values hold the JSON for that file.",
                        other.type_str()
                    ),
                ));
            }
        };
        self.run_invariants(&loc, obj)?;
        let mut fields: Vec<(String, Ident)> = self
            .object_fields(obj, true)
            .into_iter()
            .map(|id| (self.vm.interner.resolve(id).to_owned(), id))
            .collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        let mut out = Vec::with_capacity(fields.len());
        for (name, fid) in fields {
            let body = self.object_index(&loc, obj, fid, 0)?;
            self.stack.top_mut().stash = self.scratch;
            let watermark = self.stack.len();
            self.evaluate(&body, watermark)?;
            let document = if string_output {
                self.manifest_string(&body.location)?
            } else {
                self.manifest_json(&body.location, true, "")?
            };
            self.scratch = self.stack.top().stash;
            self.stack.pop();
            out.push((name, document));
        }
        Ok(out)
    }

    /// Stream mode: the top-level array holds one document per element.
    pub(crate) fn manifest_stream(&mut self) -> Result<Vec<String>, RuntimeError> {
        let loc = Location::synthetic("During manifestation");
        let arr = match self.scratch {
            Value::Array(a) => a,
            other => {
                return Err(self.error(
                    &loc,
                    format!(
                        "Stream mode: Top-level object was a {}, should be an array whose \
                         elements hold the JSON for each document in the stream.",
                        other.type_str()
                    ),
                ));
            }
        };
        let elements = self.heap.array(arr).elements.clone();
        let mut out = Vec::with_capacity(elements.len());
        for th in elements {
            let tloc = match &self.heap.thunk(th).body {
                Some(b) => b.location.clone(),
                None => loc.clone(),
            };
            self.force_for_manifest(&loc, th)?;
            let document = self.manifest_json(&tloc, true, "")?;
            self.scratch = self.stack.top().stash;
            self.stack.pop();
            out.push(document);
        }
        Ok(out)
    }
}

/// Shortest decimal that round-trips back to the same double. The standard
/// formatter already guarantees this, and renders integral doubles without
/// a fractional part.
pub(crate) fn unparse_number(d: f64) -> String {
    format!("{d}")
}

/// JSON-escaped, double-quoted string.
pub(crate) fn unparse_string(s: &str) -> String {
    serde_json::Value::from(s).to_string()
}

/// Directory of `path` including the trailing slash, or empty when `path`
/// has no directory component. Relative imports resolve against this.
pub(crate) fn dir_name(path: &str) -> String {
    match path.rfind('/') {
        Some(i) => path[..=i].to_owned(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{self, BinaryOp, Hide, UnaryOp};
    use crate::builtinops::Builtin;
    use crate::vm::Vm;

    enum Expected {
        Json(&'static str),
        ErrorContains(&'static str),
    }
    use Expected::*;

    type Build = fn(&mut Vm) -> Rc<Expr>;

    /// Run one case under the default configuration and under a
    /// collect-on-every-allocation configuration; both must agree, and each
    /// must be deterministic across two evaluations.
    fn run(build: Build, expected: &Expected) {
        run_with(|_| {}, build, expected);
        run_with(
            |vm| {
                vm.gc_min_objects(0);
                vm.gc_growth_trigger(1.0);
            },
            build,
            expected,
        );
    }

    fn run_with(configure: fn(&mut Vm), build: Build, expected: &Expected) {
        let mut vm = Vm::new();
        configure(&mut vm);
        let program = build(&mut vm);
        let first = vm.evaluate_ast(&program);
        let second = vm.evaluate_ast(&program);
        match (&first, &second) {
            (Ok(a), Ok(b)) => assert_eq!(a, b, "non-deterministic output"),
            (Err(a), Err(b)) => assert_eq!(a.message, b.message, "non-deterministic error"),
            _ => panic!("evaluation flipped between value and error"),
        }
        match (first, expected) {
            (Ok(got), Json(want)) => assert_eq!(got, *want),
            (Err(err), ErrorContains(want)) => {
                let msg = err.to_string();
                assert!(
                    msg.contains(want),
                    "expected error containing '{want}', got: {msg}"
                );
            }
            (Ok(got), ErrorContains(want)) => {
                panic!("expected error containing '{want}', got value {got}")
            }
            (Err(err), Json(want)) => panic!("expected {want}, got error {err}"),
        }
    }

    fn run_all(cases: Vec<(Build, Expected)>) {
        for (build, expected) in cases {
            run(build, &expected);
        }
    }

    #[test]
    fn literals() {
        run_all(vec![
            (|_: &mut Vm| ast::number(42.0), Json("42")),
            (|_: &mut Vm| ast::number(2.5), Json("2.5")),
            (|_: &mut Vm| ast::number(-0.25), Json("-0.25")),
            (|_: &mut Vm| ast::boolean(true), Json("true")),
            (|_: &mut Vm| ast::boolean(false), Json("false")),
            (|_: &mut Vm| ast::null(), Json("null")),
            (|_: &mut Vm| ast::string("hi"), Json("\"hi\"")),
            (
                |_: &mut Vm| ast::string("he\"llo\n"),
                Json("\"he\\\"llo\\n\""),
            ),
            (|_: &mut Vm| ast::number(f64::NAN), ErrorContains("Not a number")),
            (
                |_: &mut Vm| ast::number(f64::INFINITY),
                ErrorContains("Overflow"),
            ),
        ]);
    }

    #[test]
    fn arithmetic_and_comparisons() {
        run_all(vec![
            (
                |_: &mut Vm| ast::binary(BinaryOp::Plus, ast::number(1.0), ast::number(2.0)),
                Json("3"),
            ),
            (
                |_: &mut Vm| ast::binary(BinaryOp::Div, ast::number(10.0), ast::number(4.0)),
                Json("2.5"),
            ),
            (
                |_: &mut Vm| ast::binary(BinaryOp::Div, ast::number(1.0), ast::number(0.0)),
                ErrorContains("Division by zero."),
            ),
            (
                |_: &mut Vm| ast::binary(BinaryOp::Plus, ast::number(1e308), ast::number(1e308)),
                ErrorContains("Overflow"),
            ),
            (
                |_: &mut Vm| ast::binary(BinaryOp::ShiftL, ast::number(5.0), ast::number(2.0)),
                Json("20"),
            ),
            (
                |_: &mut Vm| ast::binary(BinaryOp::ShiftR, ast::number(20.0), ast::number(2.0)),
                Json("5"),
            ),
            (
                |_: &mut Vm| ast::binary(BinaryOp::BitwiseAnd, ast::number(6.0), ast::number(3.0)),
                Json("2"),
            ),
            (
                |_: &mut Vm| ast::binary(BinaryOp::BitwiseOr, ast::number(6.0), ast::number(3.0)),
                Json("7"),
            ),
            (
                |_: &mut Vm| ast::binary(BinaryOp::BitwiseXor, ast::number(6.0), ast::number(3.0)),
                Json("5"),
            ),
            (
                |_: &mut Vm| ast::binary(BinaryOp::Less, ast::number(1.0), ast::number(2.0)),
                Json("true"),
            ),
            (
                |_: &mut Vm| ast::binary(BinaryOp::GreaterEq, ast::number(1.0), ast::number(2.0)),
                Json("false"),
            ),
            (
                |_: &mut Vm| ast::unary(UnaryOp::Minus, ast::number(3.0)),
                Json("-3"),
            ),
            (
                |_: &mut Vm| ast::unary(UnaryOp::BitwiseNot, ast::number(5.0)),
                Json("-6"),
            ),
            (
                |_: &mut Vm| ast::unary(UnaryOp::Not, ast::boolean(true)),
                Json("false"),
            ),
            (
                |_: &mut Vm| ast::unary(UnaryOp::Not, ast::number(3.0)),
                ErrorContains("Unary operator ! does not operate on numbers."),
            ),
            (
                |_: &mut Vm| ast::unary(UnaryOp::Minus, ast::string("a")),
                ErrorContains("Unary operator - does not operate on type string"),
            ),
            (
                |_: &mut Vm| ast::binary(BinaryOp::Plus, ast::number(1.0), ast::boolean(true)),
                ErrorContains("Binary operator + requires matching types, got number and boolean."),
            ),
            (
                |_: &mut Vm| ast::binary(BinaryOp::Plus, ast::boolean(true), ast::boolean(true)),
                ErrorContains("Binary operator + does not operate on booleans."),
            ),
            (
                |_: &mut Vm| ast::binary(BinaryOp::Plus, ast::null(), ast::null()),
                ErrorContains("Binary operator + does not operate on null."),
            ),
        ]);
    }

    #[test]
    fn boolean_short_circuit() {
        run_all(vec![
            (
                |_: &mut Vm| ast::binary(BinaryOp::And, ast::boolean(true), ast::boolean(false)),
                Json("false"),
            ),
            // The right operand is never evaluated.
            (
                |_: &mut Vm| {
                    ast::binary(
                        BinaryOp::And,
                        ast::boolean(false),
                        ast::error(ast::string("unreached")),
                    )
                },
                Json("false"),
            ),
            (
                |_: &mut Vm| {
                    ast::binary(
                        BinaryOp::Or,
                        ast::boolean(true),
                        ast::error(ast::string("unreached")),
                    )
                },
                Json("true"),
            ),
        ]);
    }

    #[test]
    fn strings_and_coercion() {
        run_all(vec![
            (
                |_: &mut Vm| ast::binary(BinaryOp::Plus, ast::string("a"), ast::string("b")),
                Json("\"ab\""),
            ),
            (
                |_: &mut Vm| ast::binary(BinaryOp::Plus, ast::string("n="), ast::number(1.0)),
                Json("\"n=1\""),
            ),
            (
                |_: &mut Vm| ast::binary(BinaryOp::Plus, ast::number(1.0), ast::string("s")),
                Json("\"1s\""),
            ),
            // Coercing an object renders it as single-line JSON.
            (
                |_: &mut Vm| {
                    ast::binary(
                        BinaryOp::Plus,
                        ast::object(vec![(Hide::Inherit, ast::string("a"), ast::number(1.0))]),
                        ast::string("!"),
                    )
                },
                Json("\"{\\\"a\\\": 1}!\""),
            ),
            (
                |_: &mut Vm| ast::binary(BinaryOp::Less, ast::string("a"), ast::string("b")),
                Json("true"),
            ),
            (
                |_: &mut Vm| ast::binary(BinaryOp::Minus, ast::string("a"), ast::string("b")),
                ErrorContains("Binary operator - does not operate on strings."),
            ),
            (
                |_: &mut Vm| ast::index(ast::string("abc"), ast::number(1.0)),
                Json("\"b\""),
            ),
            (
                |_: &mut Vm| ast::index(ast::string("abc"), ast::number(9.0)),
                ErrorContains("String bounds error: 9 not within [0, 3)"),
            ),
            (
                |_: &mut Vm| ast::index(ast::string("abc"), ast::string("x")),
                ErrorContains("String index must be a number, got string."),
            ),
        ]);
    }

    #[test]
    fn arrays() {
        run_all(vec![
            (|_: &mut Vm| ast::array(vec![]), Json("[ ]")),
            (
                |_: &mut Vm| {
                    ast::binary(
                        BinaryOp::Plus,
                        ast::array(vec![ast::number(1.0)]),
                        ast::array(vec![ast::number(2.0), ast::number(3.0)]),
                    )
                },
                Json("[\n   1,\n   2,\n   3\n]"),
            ),
            (
                |_: &mut Vm| {
                    ast::index(
                        ast::array(vec![ast::number(10.0), ast::number(20.0)]),
                        ast::number(1.0),
                    )
                },
                Json("20"),
            ),
            (
                |_: &mut Vm| ast::index(ast::array(vec![ast::number(1.0)]), ast::number(5.0)),
                ErrorContains("Array bounds error: 5 not within [0, 1)"),
            ),
            (
                |_: &mut Vm| ast::index(ast::array(vec![ast::number(1.0)]), ast::string("a")),
                ErrorContains("Array index must be number, got string."),
            ),
            (
                |_: &mut Vm| ast::index(ast::number(3.0), ast::number(0.0)),
                ErrorContains("Can only index objects, strings, and arrays, got number."),
            ),
            (
                |_: &mut Vm| ast::binary(BinaryOp::Minus, ast::array(vec![]), ast::array(vec![])),
                ErrorContains("Binary operator - does not operate on arrays."),
            ),
            // Elements stay lazy: indexing never touches the poisoned one.
            (
                |vm: &mut Vm| {
                    let xs = vm.interner().intern("xs");
                    ast::local(
                        vec![(
                            xs,
                            ast::array(vec![
                                ast::number(1.0),
                                ast::error(ast::string("boom")),
                            ]),
                        )],
                        ast::index(ast::var(xs), ast::number(0.0)),
                    )
                },
                Json("1"),
            ),
        ]);
    }

    #[test]
    fn conditionals() {
        run_all(vec![
            (
                |_: &mut Vm| ast::conditional(ast::boolean(true), ast::number(1.0), ast::number(2.0)),
                Json("1"),
            ),
            (
                |_: &mut Vm| {
                    ast::conditional(ast::boolean(false), ast::number(1.0), ast::number(2.0))
                },
                Json("2"),
            ),
            (
                |_: &mut Vm| ast::conditional(ast::number(1.0), ast::number(1.0), ast::number(2.0)),
                ErrorContains("Condition must be boolean, got number."),
            ),
        ]);
    }

    #[test]
    fn locals_and_functions() {
        run_all(vec![
            // local a = 1; local f = function(x) x + a; f(2)
            (
                |vm: &mut Vm| {
                    let a = vm.interner().intern("a");
                    let f = vm.interner().intern("f");
                    let x = vm.interner().intern("x");
                    ast::local(
                        vec![(a, ast::number(1.0))],
                        ast::local(
                            vec![(
                                f,
                                ast::function(
                                    vec![x],
                                    ast::binary(BinaryOp::Plus, ast::var(x), ast::var(a)),
                                ),
                            )],
                            ast::apply(ast::var(f), vec![ast::number(2.0)]),
                        ),
                    )
                },
                Json("3"),
            ),
            // Mutually recursive locals see each other.
            (
                |vm: &mut Vm| {
                    let even = vm.interner().intern("even");
                    let odd = vm.interner().intern("odd");
                    let n = vm.interner().intern("n");
                    let le_zero = |n| ast::binary(BinaryOp::LessEq, ast::var(n), ast::number(0.0));
                    let minus_one =
                        |n| ast::binary(BinaryOp::Minus, ast::var(n), ast::number(1.0));
                    ast::local(
                        vec![
                            (
                                even,
                                ast::function(
                                    vec![n],
                                    ast::conditional(
                                        le_zero(n),
                                        ast::boolean(true),
                                        ast::apply(ast::var(odd), vec![minus_one(n)]),
                                    ),
                                ),
                            ),
                            (
                                odd,
                                ast::function(
                                    vec![n],
                                    ast::conditional(
                                        le_zero(n),
                                        ast::boolean(false),
                                        ast::apply(ast::var(even), vec![minus_one(n)]),
                                    ),
                                ),
                            ),
                        ],
                        ast::apply(ast::var(even), vec![ast::number(10.0)]),
                    )
                },
                Json("true"),
            ),
            (
                |vm: &mut Vm| {
                    let f = vm.interner().intern("f");
                    let x = vm.interner().intern("x");
                    ast::local(
                        vec![(f, ast::function(vec![x], ast::var(x)))],
                        ast::apply(ast::var(f), vec![ast::number(1.0), ast::number(2.0)]),
                    )
                },
                ErrorContains("Expected 1 arguments, got 2."),
            ),
            (
                |_: &mut Vm| ast::apply(ast::number(1.0), vec![]),
                ErrorContains("Only functions can be called, got number"),
            ),
            (
                |_: &mut Vm| ast::error(ast::number(3.0)),
                ErrorContains("Error message must be string, got number."),
            ),
        ]);
    }

    #[test]
    fn objects_self_and_super() {
        run_all(vec![
            // local x = 1; local y = x + 2; { a: x, b: y }
            (
                |vm: &mut Vm| {
                    let x = vm.interner().intern("x");
                    let y = vm.interner().intern("y");
                    ast::local(
                        vec![(x, ast::number(1.0))],
                        ast::local(
                            vec![(y, ast::binary(BinaryOp::Plus, ast::var(x), ast::number(2.0)))],
                            ast::object(vec![
                                (Hide::Inherit, ast::string("a"), ast::var(x)),
                                (Hide::Inherit, ast::string("b"), ast::var(y)),
                            ]),
                        ),
                    )
                },
                Json("{\n   \"a\": 1,\n   \"b\": 3\n}"),
            ),
            // { a: 1, b: self.a + 1 }
            (
                |_: &mut Vm| {
                    ast::object(vec![
                        (Hide::Inherit, ast::string("a"), ast::number(1.0)),
                        (
                            Hide::Inherit,
                            ast::string("b"),
                            ast::binary(
                                BinaryOp::Plus,
                                ast::field(ast::self_ref(), "a"),
                                ast::number(1.0),
                            ),
                        ),
                    ])
                },
                Json("{\n   \"a\": 1,\n   \"b\": 2\n}"),
            ),
            // { a: 1 } + { a: super.a + 10, b: super.a }
            (
                |_: &mut Vm| {
                    ast::binary(
                        BinaryOp::Plus,
                        ast::object(vec![(Hide::Inherit, ast::string("a"), ast::number(1.0))]),
                        ast::object(vec![
                            (
                                Hide::Inherit,
                                ast::string("a"),
                                ast::binary(
                                    BinaryOp::Plus,
                                    ast::super_field("a"),
                                    ast::number(10.0),
                                ),
                            ),
                            (Hide::Inherit, ast::string("b"), ast::super_field("a")),
                        ]),
                    )
                },
                Json("{\n   \"a\": 11,\n   \"b\": 1\n}"),
            ),
            // ({ a: 1 } + { a: super.a + 1 } + { a: super.a + 1 }).a
            (
                |_: &mut Vm| {
                    let bump = || {
                        ast::object(vec![(
                            Hide::Inherit,
                            ast::string("a"),
                            ast::binary(BinaryOp::Plus, ast::super_field("a"), ast::number(1.0)),
                        )])
                    };
                    ast::field(
                        ast::binary(
                            BinaryOp::Plus,
                            ast::binary(
                                BinaryOp::Plus,
                                ast::object(vec![(
                                    Hide::Inherit,
                                    ast::string("a"),
                                    ast::number(1.0),
                                )]),
                                bump(),
                            ),
                            bump(),
                        ),
                        "a",
                    )
                },
                Json("3"),
            ),
            // ({ a: function() self.b, b: 1 } + { b: 2 }).a() -- self is
            // late-bound to the composite.
            (
                |_: &mut Vm| {
                    ast::apply(
                        ast::field(
                            ast::binary(
                                BinaryOp::Plus,
                                ast::object(vec![
                                    (
                                        Hide::Inherit,
                                        ast::string("a"),
                                        ast::function(vec![], ast::field(ast::self_ref(), "b")),
                                    ),
                                    (Hide::Inherit, ast::string("b"), ast::number(1.0)),
                                ]),
                                ast::object(vec![(
                                    Hide::Inherit,
                                    ast::string("b"),
                                    ast::number(2.0),
                                )]),
                            ),
                            "a",
                        ),
                        vec![],
                    )
                },
                Json("2"),
            ),
            (
                |_: &mut Vm| {
                    ast::field(
                        ast::object(vec![(
                            Hide::Inherit,
                            ast::string("a"),
                            ast::super_field("b"),
                        )]),
                        "a",
                    )
                },
                ErrorContains("Attempt to use super when there is no super class."),
            ),
            (
                |_: &mut Vm| {
                    ast::field(
                        ast::object(vec![(Hide::Inherit, ast::string("a"), ast::number(1.0))]),
                        "b",
                    )
                },
                ErrorContains("Field does not exist: b"),
            ),
            (
                |_: &mut Vm| {
                    ast::index(
                        ast::object(vec![(Hide::Inherit, ast::string("a"), ast::number(1.0))]),
                        ast::number(2.0),
                    )
                },
                ErrorContains("Object index must be string, got number."),
            ),
            (
                |_: &mut Vm| {
                    ast::field(
                        ast::binary(
                            BinaryOp::Plus,
                            ast::object(vec![(Hide::Inherit, ast::string("x"), ast::number(1.0))]),
                            ast::object(vec![(
                                Hide::Inherit,
                                ast::string("a"),
                                ast::super_index(ast::number(1.0)),
                            )]),
                        ),
                        "a",
                    )
                },
                ErrorContains("Super index must be string, got number."),
            ),
            (
                |_: &mut Vm| {
                    ast::binary(
                        BinaryOp::Minus,
                        ast::object(vec![]),
                        ast::object(vec![]),
                    )
                },
                ErrorContains("Binary operator - does not operate on objects."),
            ),
        ]);
    }

    #[test]
    fn object_field_visibility() {
        run_all(vec![
            // Hidden fields are omitted from output but stay addressable.
            (
                |_: &mut Vm| {
                    ast::object(vec![
                        (Hide::Hidden, ast::string("a"), ast::number(1.0)),
                        (Hide::Inherit, ast::string("b"), ast::number(2.0)),
                    ])
                },
                Json("{\n   \"b\": 2\n}"),
            ),
            (
                |_: &mut Vm| {
                    ast::field(
                        ast::object(vec![(Hide::Hidden, ast::string("a"), ast::number(1.0))]),
                        "a",
                    )
                },
                Json("1"),
            ),
            // Inherit on the right defers to the hidden left field.
            (
                |_: &mut Vm| {
                    ast::binary(
                        BinaryOp::Plus,
                        ast::object(vec![(Hide::Hidden, ast::string("a"), ast::number(1.0))]),
                        ast::object(vec![(Hide::Inherit, ast::string("a"), ast::number(2.0))]),
                    )
                },
                Json("{ }"),
            ),
            // An explicit visibility on the right overrides.
            (
                |_: &mut Vm| {
                    ast::binary(
                        BinaryOp::Plus,
                        ast::object(vec![(Hide::Hidden, ast::string("a"), ast::number(1.0))]),
                        ast::object(vec![(Hide::Visible, ast::string("a"), ast::number(2.0))]),
                    )
                },
                Json("{\n   \"a\": 2\n}"),
            ),
            (|_: &mut Vm| ast::object(vec![]), Json("{ }")),
            // Keys come out in Unicode lexicographic order.
            (
                |_: &mut Vm| {
                    ast::object(vec![
                        (Hide::Inherit, ast::string("b"), ast::number(1.0)),
                        (Hide::Inherit, ast::string("0"), ast::number(2.0)),
                        (Hide::Inherit, ast::string("a"), ast::number(3.0)),
                    ])
                },
                Json("{\n   \"0\": 2,\n   \"a\": 3,\n   \"b\": 1\n}"),
            ),
            // Computed and dropped field names.
            (
                |_: &mut Vm| {
                    ast::object(vec![
                        (Hide::Inherit, ast::null(), ast::number(1.0)),
                        (Hide::Inherit, ast::string("b"), ast::number(2.0)),
                    ])
                },
                Json("{\n   \"b\": 2\n}"),
            ),
            (
                |_: &mut Vm| {
                    ast::object(vec![(Hide::Inherit, ast::number(3.0), ast::number(1.0))])
                },
                ErrorContains("Field name was not a string."),
            ),
            (
                |_: &mut Vm| {
                    ast::object(vec![
                        (Hide::Inherit, ast::string("a"), ast::number(1.0)),
                        (Hide::Inherit, ast::string("a"), ast::number(2.0)),
                    ])
                },
                ErrorContains("Duplicate field name: \"a\""),
            ),
            // Nested values indent three spaces per level.
            (
                |_: &mut Vm| {
                    ast::object(vec![(
                        Hide::Inherit,
                        ast::string("a"),
                        ast::object(vec![(
                            Hide::Inherit,
                            ast::string("b"),
                            ast::array(vec![ast::number(1.0)]),
                        )]),
                    )])
                },
                Json("{\n   \"a\": {\n      \"b\": [\n         1\n      ]\n   }\n}"),
            ),
        ]);
    }

    #[test]
    fn object_comprehensions() {
        run_all(vec![
            // { [k]: k for k in ["c", "a", "b"] }
            (
                |vm: &mut Vm| {
                    let k = vm.interner().intern("k");
                    ast::object_comp(
                        ast::var(k),
                        ast::var(k),
                        k,
                        ast::array(vec![ast::string("c"), ast::string("a"), ast::string("b")]),
                    )
                },
                Json("{\n   \"a\": \"a\",\n   \"b\": \"b\",\n   \"c\": \"c\"\n}"),
            ),
            // The loop variable stays visible in the field value at
            // manifestation time.
            (
                |vm: &mut Vm| {
                    let k = vm.interner().intern("k");
                    ast::object_comp(
                        ast::var(k),
                        ast::binary(BinaryOp::Plus, ast::var(k), ast::string("!")),
                        k,
                        ast::array(vec![ast::string("x")]),
                    )
                },
                Json("{\n   \"x\": \"x!\"\n}"),
            ),
            (
                |vm: &mut Vm| {
                    let k = vm.interner().intern("k");
                    ast::object_comp(ast::var(k), ast::var(k), k, ast::array(vec![]))
                },
                Json("{ }"),
            ),
            (
                |vm: &mut Vm| {
                    let k = vm.interner().intern("k");
                    ast::object_comp(
                        ast::var(k),
                        ast::var(k),
                        k,
                        ast::array(vec![ast::string("a"), ast::string("a")]),
                    )
                },
                ErrorContains("Duplicate field name: \"a\""),
            ),
            (
                |vm: &mut Vm| {
                    let k = vm.interner().intern("k");
                    ast::object_comp(ast::var(k), ast::var(k), k, ast::number(3.0))
                },
                ErrorContains("Object comprehension needs array, got number"),
            ),
            (
                |vm: &mut Vm| {
                    let k = vm.interner().intern("k");
                    ast::object_comp(
                        ast::number(1.0),
                        ast::var(k),
                        k,
                        ast::array(vec![ast::string("a")]),
                    )
                },
                ErrorContains("field must be string, got: number"),
            ),
        ]);
    }

    fn assert_field_positive(name: &str, message: &str) -> Rc<Expr> {
        ast::conditional(
            ast::binary(
                BinaryOp::Greater,
                ast::field(ast::self_ref(), name),
                ast::number(0.0),
            ),
            ast::boolean(true),
            ast::error(ast::string(message)),
        )
    }

    #[test]
    fn assertions() {
        run_all(vec![
            // { assert self.x > 0, x: -1 }.x
            (
                |_: &mut Vm| {
                    ast::field(
                        ast::object_with_asserts(
                            vec![(Hide::Inherit, ast::string("x"), ast::number(-1.0))],
                            vec![assert_field_positive("x", "Assertion failed")],
                        ),
                        "x",
                    )
                },
                ErrorContains("Assertion failed"),
            ),
            // A passing assertion that reads self must not re-trigger
            // itself.
            (
                |_: &mut Vm| {
                    ast::field(
                        ast::object_with_asserts(
                            vec![(Hide::Inherit, ast::string("x"), ast::number(1.0))],
                            vec![assert_field_positive("x", "Assertion failed")],
                        ),
                        "x",
                    )
                },
                Json("1"),
            ),
            // Manifestation also runs the assertions.
            (
                |_: &mut Vm| {
                    ast::object_with_asserts(
                        vec![(Hide::Inherit, ast::string("x"), ast::number(-1.0))],
                        vec![assert_field_positive("x", "Assertion failed")],
                    )
                },
                ErrorContains("Assertion failed"),
            ),
        ]);
    }

    #[test]
    fn manifestation_runs_assertions_of_every_leaf() {
        // The right leaf's assertion passes; the left leaf's must still run
        // and fail against the composite self.
        let mut vm = Vm::new();
        let left = ast::object_with_asserts(
            vec![],
            vec![assert_field_positive("deficit", "left leaf assertion failed")],
        );
        let right = ast::object_with_asserts(
            vec![(
                Hide::Inherit,
                ast::string("deficit"),
                ast::number(-5.0),
            )],
            vec![ast::boolean(true)],
        );
        let program = ast::binary(BinaryOp::Plus, left, right);
        let err = vm.evaluate_ast(&program).unwrap_err();
        assert!(
            err.message.contains("left leaf assertion failed"),
            "got: {}",
            err.message
        );
    }

    #[test]
    fn tail_calls_are_trimmed() {
        fn chain(tailstrict: bool, n: f64) -> Result<String, RuntimeError> {
            let mut vm = Vm::new();
            vm.max_stack(10);
            let f = vm.interner().intern("f");
            let n_id = vm.interner().intern("n");
            let peq = ast::builtin(vm.interner(), Builtin::PrimitiveEquals);
            let next = vec![ast::binary(BinaryOp::Minus, ast::var(n_id), ast::number(1.0))];
            let recurse = if tailstrict {
                ast::apply_tailstrict(ast::var(f), next)
            } else {
                ast::apply(ast::var(f), next)
            };
            let body = ast::conditional(
                ast::apply(peq, vec![ast::var(n_id), ast::number(0.0)]),
                ast::number(0.0),
                recurse,
            );
            let program = ast::local(
                vec![(f, ast::function(vec![n_id], body))],
                ast::apply(ast::var(f), vec![ast::number(n)]),
            );
            vm.evaluate_ast(&program)
        }

        // A tailstrict self-call chain of any length fits in a tiny stack.
        assert_eq!(chain(true, 50_000.0).unwrap(), "0");
        // Without the annotation every level keeps its frame.
        let err = chain(false, 50_000.0).unwrap_err();
        assert_eq!(err.message, "Max stack frames exceeded.");
    }

    #[test]
    fn builtin_math() {
        run_all(vec![
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Pow);
                    ast::apply(b, vec![ast::number(2.0), ast::number(10.0)])
                },
                Json("1024"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Floor);
                    ast::apply(b, vec![ast::number(2.7)])
                },
                Json("2"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Ceil);
                    ast::apply(b, vec![ast::number(2.1)])
                },
                Json("3"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Sqrt);
                    ast::apply(b, vec![ast::number(-1.0)])
                },
                ErrorContains("Not a number"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Log);
                    ast::apply(b, vec![ast::number(0.0)])
                },
                ErrorContains("Overflow"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Mantissa);
                    ast::apply(b, vec![ast::number(8.0)])
                },
                Json("0.5"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Exponent);
                    ast::apply(b, vec![ast::number(8.0)])
                },
                Json("4"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Modulo);
                    ast::apply(b, vec![ast::number(5.0), ast::number(3.0)])
                },
                Json("2"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Modulo);
                    ast::apply(b, vec![ast::number(5.0), ast::number(0.0)])
                },
                ErrorContains("Division by zero."),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Pow);
                    ast::apply(b, vec![ast::string("a"), ast::number(1.0)])
                },
                ErrorContains(
                    "Builtin function pow expected (number, number) but got (string, number)",
                ),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Pow);
                    ast::apply(b, vec![ast::number(1.0)])
                },
                ErrorContains("Expected 2 arguments, got 1."),
            ),
        ]);
    }

    #[test]
    fn builtin_arrays_and_objects() {
        run_all(vec![
            // makeArray(3, function(i) i * 2)
            (
                |vm: &mut Vm| {
                    let i = vm.interner().intern("i");
                    let b = ast::builtin(vm.interner(), Builtin::MakeArray);
                    ast::apply(
                        b,
                        vec![
                            ast::number(3.0),
                            ast::function(
                                vec![i],
                                ast::binary(BinaryOp::Mult, ast::var(i), ast::number(2.0)),
                            ),
                        ],
                    )
                },
                Json("[\n   0,\n   2,\n   4\n]"),
            ),
            (
                |vm: &mut Vm| {
                    let i = vm.interner().intern("i");
                    let b = ast::builtin(vm.interner(), Builtin::MakeArray);
                    ast::apply(
                        b,
                        vec![ast::number(-3.0), ast::function(vec![i], ast::var(i))],
                    )
                },
                ErrorContains("makeArray requires size >= 0, got -3"),
            ),
            // filter(function(x) x > 1, [1, 2, 3])
            (
                |vm: &mut Vm| {
                    let x = vm.interner().intern("x");
                    let b = ast::builtin(vm.interner(), Builtin::Filter);
                    ast::apply(
                        b,
                        vec![
                            ast::function(
                                vec![x],
                                ast::binary(BinaryOp::Greater, ast::var(x), ast::number(1.0)),
                            ),
                            ast::array(vec![
                                ast::number(1.0),
                                ast::number(2.0),
                                ast::number(3.0),
                            ]),
                        ],
                    )
                },
                Json("[\n   2,\n   3\n]"),
            ),
            (
                |vm: &mut Vm| {
                    let x = vm.interner().intern("x");
                    let b = ast::builtin(vm.interner(), Builtin::Filter);
                    ast::apply(
                        b,
                        vec![
                            ast::function(vec![x], ast::number(7.0)),
                            ast::array(vec![ast::number(1.0)]),
                        ],
                    )
                },
                ErrorContains("filter function must return boolean, got: number"),
            ),
            (
                |vm: &mut Vm| {
                    let x = vm.interner().intern("x");
                    let y = vm.interner().intern("y");
                    let b = ast::builtin(vm.interner(), Builtin::Filter);
                    ast::apply(
                        b,
                        vec![
                            ast::function(vec![x, y], ast::boolean(true)),
                            ast::array(vec![ast::number(1.0)]),
                        ],
                    )
                },
                ErrorContains("filter function takes 1 parameter."),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Type);
                    ast::apply(b, vec![ast::number(3.0)])
                },
                Json("\"number\""),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Type);
                    ast::apply(b, vec![ast::array(vec![])])
                },
                Json("\"array\""),
            ),
            // Hidden fields count towards an object's length.
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Length);
                    ast::apply(
                        b,
                        vec![ast::object(vec![
                            (Hide::Hidden, ast::string("a"), ast::number(1.0)),
                            (Hide::Inherit, ast::string("b"), ast::number(2.0)),
                        ])],
                    )
                },
                Json("2"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Length);
                    ast::apply(b, vec![ast::string("héllo")])
                },
                Json("5"),
            ),
            (
                |vm: &mut Vm| {
                    let x = vm.interner().intern("x");
                    let y = vm.interner().intern("y");
                    let b = ast::builtin(vm.interner(), Builtin::Length);
                    ast::apply(b, vec![ast::function(vec![x, y], ast::var(x))])
                },
                Json("2"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Length);
                    ast::apply(b, vec![ast::boolean(true)])
                },
                ErrorContains("length operates on strings, objects, and arrays, got boolean"),
            ),
            // objectHasEx / objectFieldsEx respect the hidden flag.
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::ObjectHasEx);
                    ast::apply(
                        b,
                        vec![
                            ast::object(vec![(Hide::Hidden, ast::string("a"), ast::number(1.0))]),
                            ast::string("a"),
                            ast::boolean(false),
                        ],
                    )
                },
                Json("false"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::ObjectHasEx);
                    ast::apply(
                        b,
                        vec![
                            ast::object(vec![(Hide::Hidden, ast::string("a"), ast::number(1.0))]),
                            ast::string("a"),
                            ast::boolean(true),
                        ],
                    )
                },
                Json("true"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::ObjectFieldsEx);
                    ast::apply(
                        b,
                        vec![
                            ast::object(vec![
                                (Hide::Inherit, ast::string("b"), ast::number(1.0)),
                                (Hide::Hidden, ast::string("a"), ast::number(2.0)),
                            ]),
                            ast::boolean(true),
                        ],
                    )
                },
                Json("[\n   \"a\",\n   \"b\"\n]"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::ObjectFieldsEx);
                    ast::apply(
                        b,
                        vec![
                            ast::object(vec![
                                (Hide::Inherit, ast::string("b"), ast::number(1.0)),
                                (Hide::Hidden, ast::string("a"), ast::number(2.0)),
                            ]),
                            ast::boolean(false),
                        ],
                    )
                },
                Json("[\n   \"b\"\n]"),
            ),
        ]);
    }

    #[test]
    fn builtin_strings_and_equality() {
        run_all(vec![
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Codepoint);
                    ast::apply(b, vec![ast::string("A")])
                },
                Json("65"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Codepoint);
                    ast::apply(b, vec![ast::string("ab")])
                },
                ErrorContains("codepoint takes a string of length 1, got length 2"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Char);
                    ast::apply(b, vec![ast::number(65.0)])
                },
                Json("\"A\""),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Char);
                    ast::apply(b, vec![ast::number(-1.0)])
                },
                ErrorContains("Codepoints must be >= 0, got -1"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Char);
                    ast::apply(b, vec![ast::number(1114112.0)])
                },
                ErrorContains("Invalid unicode codepoint, got 1114112"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::Char);
                    ast::apply(b, vec![ast::number(55296.0)])
                },
                ErrorContains("Invalid unicode codepoint, got 55296"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::PrimitiveEquals);
                    ast::apply(b, vec![ast::number(1.0), ast::number(1.0)])
                },
                Json("true"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::PrimitiveEquals);
                    ast::apply(b, vec![ast::string("a"), ast::string("b")])
                },
                Json("false"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::PrimitiveEquals);
                    ast::apply(b, vec![ast::number(1.0), ast::string("1")])
                },
                Json("false"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::PrimitiveEquals);
                    ast::apply(b, vec![ast::null(), ast::null()])
                },
                Json("true"),
            ),
            (
                |vm: &mut Vm| {
                    let x = vm.interner().intern("x");
                    let b = ast::builtin(vm.interner(), Builtin::PrimitiveEquals);
                    ast::apply(
                        b,
                        vec![
                            ast::function(vec![x], ast::var(x)),
                            ast::function(vec![x], ast::var(x)),
                        ],
                    )
                },
                ErrorContains("Cannot test equality of functions"),
            ),
            (
                |vm: &mut Vm| {
                    let b = ast::builtin(vm.interner(), Builtin::PrimitiveEquals);
                    ast::apply(b, vec![ast::array(vec![]), ast::array(vec![])])
                },
                ErrorContains("primitiveEquals operates on primitive types, got array"),
            ),
        ]);
    }

    #[test]
    fn manifestation() {
        run_all(vec![
            (
                |vm: &mut Vm| {
                    let x = vm.interner().intern("x");
                    ast::function(vec![x], ast::var(x))
                },
                ErrorContains("Couldn't manifest function in JSON output."),
            ),
            // A function inside an array fails too.
            (
                |vm: &mut Vm| {
                    let x = vm.interner().intern("x");
                    ast::array(vec![ast::function(vec![x], ast::var(x))])
                },
                ErrorContains("Couldn't manifest function in JSON output."),
            ),
        ]);
    }

    #[test]
    fn number_unparsing_round_trips() {
        for &x in &[1.0, 0.1, 2.5, -0.25, 0.1 + 0.2, 1e21, 123456789.123456] {
            let text = unparse_number(x);
            let back: f64 = text.parse().unwrap();
            assert_eq!(back, x, "{text} did not round-trip");
        }
        assert_eq!(unparse_number(1.0), "1");
        assert_eq!(unparse_number(0.1), "0.1");
    }

    #[test]
    fn string_unparsing_escapes_json() {
        assert_eq!(unparse_string("plain"), "\"plain\"");
        assert_eq!(unparse_string("a\"b\\c\n"), "\"a\\\"b\\\\c\\n\"");
    }

    #[test]
    fn dir_name_splits_like_a_path() {
        assert_eq!(dir_name("/a/b/c.cfx"), "/a/b/");
        assert_eq!(dir_name("c.cfx"), "");
        assert_eq!(dir_name("rel/c.cfx"), "rel/");
    }

    #[test]
    fn errors_carry_named_call_frames() {
        let mut vm = Vm::new();
        let f = vm.interner().intern("f");
        let boom_loc = Location::new("prog.cfx", 7, 9);
        let body = ast::expr_at(ExprKind::Error(ast::string("kaboom")), boom_loc.clone());
        let program = ast::local(
            vec![(f, ast::function(vec![], body))],
            ast::apply(ast::var(f), vec![]),
        );
        let err = vm.evaluate_ast(&program).unwrap_err();
        assert_eq!(err.message, "kaboom");
        assert_eq!(err.location(), Some(&boom_loc));
        assert!(
            err.trace.iter().any(|t| t.name == "function <f>"),
            "trace: {:?}",
            err.trace
        );
        let rendered = err.to_string();
        assert!(rendered.starts_with("RUNTIME ERROR: kaboom"));
        assert!(rendered.contains("prog.cfx:7:9"));
    }
}
