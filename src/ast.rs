//! Core abstract syntax tree consumed by the evaluator.
//!
//! Trees arriving here are already desugared: no object-level locals, no
//! `if` without `else`, no `==`/`!=` (rewritten to standard-library calls),
//! no string interpolation. Each node carries a source [`Location`] and a
//! free-variable annotation filled by [`crate::analysis::annotate`] before
//! evaluation. Identifiers are interned symbols so that equality and map
//! lookups cost an index comparison.
//!
//! Ergonomic constructor helpers such as [`number`], [`var`] and [`object`]
//! are provided for frontends and tests assembling trees directly; they
//! stamp nodes with a synthetic location, which real frontends should
//! replace via [`expr_at`].

use std::cell::OnceCell;
use std::fmt;
use std::rc::Rc;

use string_interner::{DefaultBackend, DefaultSymbol, StringInterner};

use crate::builtinops::Builtin;
use crate::internal_error;

/// Interned identifier. Equality is index equality.
pub type Ident = DefaultSymbol;

/// Identifier intern pool, owned by a [`crate::vm::Vm`] for its lifetime.
#[derive(Debug, Default)]
pub struct Interner {
    inner: StringInterner<DefaultBackend>,
}

impl Interner {
    pub fn new() -> Self {
        Interner {
            inner: StringInterner::default(),
        }
    }

    pub fn intern(&mut self, name: &str) -> Ident {
        self.inner.get_or_intern(name)
    }

    /// Resolve a symbol back to its name. Symbols always come from this
    /// pool, so a miss can only mean a foreign symbol leaked in.
    pub fn resolve(&self, id: Ident) -> &str {
        self.inner.resolve(id).unwrap_or("<unresolved>")
    }
}

/// A point in some source file. Synthetic locations (manifestation,
/// external variables) have a zero line and render as the bare tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: Rc<str>,
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(file: &str, line: u32, column: u32) -> Self {
        Location {
            file: file.into(),
            line,
            column,
        }
    }

    /// A location that is not a point in any file, e.g. "During manifestation".
    pub fn synthetic(tag: &str) -> Self {
        Location {
            file: tag.into(),
            line: 0,
            column: 0,
        }
    }
}

impl Default for Location {
    fn default() -> Self {
        Location::synthetic("<synthetic>")
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            write!(f, "{}", self.file)
        } else {
            write!(f, "{}:{}:{}", self.file, self.line, self.column)
        }
    }
}

/// Binary operators of the core language. `==`/`!=` survive in the enum so
/// that an undesugared tree is detectable, but the evaluator refuses them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Mult,
    Div,
    Plus,
    Minus,
    ShiftL,
    ShiftR,
    Greater,
    GreaterEq,
    Less,
    LessEq,
    ManifestEqual,
    ManifestUnequal,
    BitwiseAnd,
    BitwiseXor,
    BitwiseOr,
    And,
    Or,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Mult => "*",
            BinaryOp::Div => "/",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::ShiftL => "<<",
            BinaryOp::ShiftR => ">>",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEq => ">=",
            BinaryOp::Less => "<",
            BinaryOp::LessEq => "<=",
            BinaryOp::ManifestEqual => "==",
            BinaryOp::ManifestUnequal => "!=",
            BinaryOp::BitwiseAnd => "&",
            BinaryOp::BitwiseXor => "^",
            BinaryOp::BitwiseOr => "|",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    BitwiseNot,
    Plus,
    Minus,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnaryOp::Not => "!",
            UnaryOp::BitwiseNot => "~",
            UnaryOp::Plus => "+",
            UnaryOp::Minus => "-",
        };
        write!(f, "{s}")
    }
}

/// Field visibility, from the `:` / `::` / `:::` forms. `Inherit` defers to
/// whatever an earlier object in the prototype chain declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hide {
    Hidden,
    Inherit,
    Visible,
}

/// One field of a desugared object literal. The name is an expression;
/// a name evaluating to `null` drops the field.
#[derive(Debug, Clone)]
pub struct ObjectField {
    pub hide: Hide,
    pub name: Rc<Expr>,
    pub body: Rc<Expr>,
}

/// One binding of a `local`.
#[derive(Debug, Clone)]
pub struct LocalBind {
    pub var: Ident,
    pub body: Rc<Expr>,
}

/// A core-language expression.
#[derive(Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub location: Location,
    free_vars: OnceCell<Vec<Ident>>,
}

#[derive(Debug)]
pub enum ExprKind {
    /// `target(args...)`, optionally `tailstrict`.
    Apply {
        target: Rc<Expr>,
        args: Vec<Rc<Expr>>,
        tailstrict: bool,
    },
    Array(Vec<Rc<Expr>>),
    Binary {
        op: BinaryOp,
        left: Rc<Expr>,
        right: Rc<Expr>,
    },
    /// A native builtin as a function value; injected by the desugarer.
    Builtin { builtin: Builtin, params: Vec<Ident> },
    Conditional {
        cond: Rc<Expr>,
        then_branch: Rc<Expr>,
        else_branch: Rc<Expr>,
    },
    Error(Rc<Expr>),
    Function { params: Vec<Ident>, body: Rc<Expr> },
    Import(String),
    ImportStr(String),
    Index { target: Rc<Expr>, index: Rc<Expr> },
    Local { binds: Vec<LocalBind>, body: Rc<Expr> },
    LiteralBool(bool),
    LiteralNumber(f64),
    LiteralString(String),
    LiteralNull,
    /// Desugared object literal: computed field names, assertion bodies.
    Object {
        asserts: Vec<Rc<Expr>>,
        fields: Vec<ObjectField>,
    },
    /// `{ [field]: value for var in array }`
    ObjectComp {
        field: Rc<Expr>,
        value: Rc<Expr>,
        var: Ident,
        array: Rc<Expr>,
    },
    SelfExpr,
    SuperIndex(Rc<Expr>),
    Unary { op: UnaryOp, expr: Rc<Expr> },
    Var(Ident),
}

impl Expr {
    pub fn new(kind: ExprKind, location: Location) -> Self {
        Expr {
            kind,
            location,
            free_vars: OnceCell::new(),
        }
    }

    /// The node's free variables. The tree must have been annotated.
    pub(crate) fn free_vars(&self) -> &[Ident] {
        match self.free_vars.get() {
            Some(v) => v,
            None => internal_error!(
                "INTERNAL ERROR: expression at {} was not annotated before evaluation",
                self.location
            ),
        }
    }

    pub(crate) fn free_vars_cached(&self) -> Option<&Vec<Ident>> {
        self.free_vars.get()
    }

    pub(crate) fn set_free_vars(&self, vars: Vec<Ident>) {
        // A second annotation pass over a shared subtree is a no-op.
        let _ = self.free_vars.set(vars);
    }
}

//
// Builder helpers.
//
// Frontends and tests assemble desugared trees with these. All of them use a
// synthetic location; `expr_at` attaches a real one.
//

pub fn expr(kind: ExprKind) -> Rc<Expr> {
    Rc::new(Expr::new(kind, Location::default()))
}

pub fn expr_at(kind: ExprKind, location: Location) -> Rc<Expr> {
    Rc::new(Expr::new(kind, location))
}

pub fn null() -> Rc<Expr> {
    expr(ExprKind::LiteralNull)
}

pub fn boolean(b: bool) -> Rc<Expr> {
    expr(ExprKind::LiteralBool(b))
}

pub fn number(v: f64) -> Rc<Expr> {
    expr(ExprKind::LiteralNumber(v))
}

pub fn string(s: &str) -> Rc<Expr> {
    expr(ExprKind::LiteralString(s.to_owned()))
}

pub fn var(id: Ident) -> Rc<Expr> {
    expr(ExprKind::Var(id))
}

pub fn array(elements: Vec<Rc<Expr>>) -> Rc<Expr> {
    expr(ExprKind::Array(elements))
}

pub fn binary(op: BinaryOp, left: Rc<Expr>, right: Rc<Expr>) -> Rc<Expr> {
    expr(ExprKind::Binary { op, left, right })
}

pub fn unary(op: UnaryOp, e: Rc<Expr>) -> Rc<Expr> {
    expr(ExprKind::Unary { op, expr: e })
}

pub fn local(binds: Vec<(Ident, Rc<Expr>)>, body: Rc<Expr>) -> Rc<Expr> {
    let binds = binds
        .into_iter()
        .map(|(var, body)| LocalBind { var, body })
        .collect();
    expr(ExprKind::Local { binds, body })
}

pub fn conditional(cond: Rc<Expr>, then_branch: Rc<Expr>, else_branch: Rc<Expr>) -> Rc<Expr> {
    expr(ExprKind::Conditional {
        cond,
        then_branch,
        else_branch,
    })
}

pub fn function(params: Vec<Ident>, body: Rc<Expr>) -> Rc<Expr> {
    expr(ExprKind::Function { params, body })
}

pub fn apply(target: Rc<Expr>, args: Vec<Rc<Expr>>) -> Rc<Expr> {
    expr(ExprKind::Apply {
        target,
        args,
        tailstrict: false,
    })
}

pub fn apply_tailstrict(target: Rc<Expr>, args: Vec<Rc<Expr>>) -> Rc<Expr> {
    expr(ExprKind::Apply {
        target,
        args,
        tailstrict: true,
    })
}

pub fn index(target: Rc<Expr>, idx: Rc<Expr>) -> Rc<Expr> {
    expr(ExprKind::Index { target, index: idx })
}

/// `target.name` with a literal field name.
pub fn field(target: Rc<Expr>, name: &str) -> Rc<Expr> {
    index(target, string(name))
}

pub fn self_ref() -> Rc<Expr> {
    expr(ExprKind::SelfExpr)
}

pub fn super_index(idx: Rc<Expr>) -> Rc<Expr> {
    expr(ExprKind::SuperIndex(idx))
}

/// `super.name` with a literal field name.
pub fn super_field(name: &str) -> Rc<Expr> {
    super_index(string(name))
}

pub fn error(message: Rc<Expr>) -> Rc<Expr> {
    expr(ExprKind::Error(message))
}

pub fn import(path: &str) -> Rc<Expr> {
    expr(ExprKind::Import(path.to_owned()))
}

pub fn importstr(path: &str) -> Rc<Expr> {
    expr(ExprKind::ImportStr(path.to_owned()))
}

/// An object literal from `(hide, name-expr, body)` triples, no assertions.
pub fn object(fields: Vec<(Hide, Rc<Expr>, Rc<Expr>)>) -> Rc<Expr> {
    object_with_asserts(fields, Vec::new())
}

pub fn object_with_asserts(
    fields: Vec<(Hide, Rc<Expr>, Rc<Expr>)>,
    asserts: Vec<Rc<Expr>>,
) -> Rc<Expr> {
    let fields = fields
        .into_iter()
        .map(|(hide, name, body)| ObjectField { hide, name, body })
        .collect();
    expr(ExprKind::Object { asserts, fields })
}

pub fn object_comp(field: Rc<Expr>, value: Rc<Expr>, var: Ident, array: Rc<Expr>) -> Rc<Expr> {
    expr(ExprKind::ObjectComp {
        field,
        value,
        var,
        array,
    })
}

/// A builtin function value; the parameter identifiers are interned from the
/// builtin's declaration.
pub fn builtin(interner: &mut Interner, b: Builtin) -> Rc<Expr> {
    let params = b
        .param_names()
        .iter()
        .map(|name| interner.intern(name))
        .collect();
    expr(ExprKind::Builtin { builtin: b, params })
}
