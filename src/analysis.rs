//! Free-variable annotation.
//!
//! Thunks and closures capture only the bindings their body actually
//! mentions, so every node must know its free variables before evaluation.
//! [`annotate`] computes the set bottom-up and caches it on each node; a
//! shared subtree (for example an imported file evaluated from two sites)
//! is analysed once and skipped thereafter.
//!
//! `self` and `super` are not variables: they resolve through the call
//! frames, not through bindings, and contribute nothing here.

use std::collections::HashSet;

use crate::ast::{Expr, ExprKind, Ident};

/// Annotate `expr` and every reachable subexpression with its free
/// variables. Idempotent.
pub fn annotate(expr: &Expr) {
    analyze(expr);
}

fn analyze(expr: &Expr) -> Vec<Ident> {
    if let Some(cached) = expr.free_vars_cached() {
        return cached.clone();
    }

    let mut vars: HashSet<Ident> = HashSet::new();
    match &expr.kind {
        ExprKind::Apply { target, args, .. } => {
            vars.extend(analyze(target));
            for arg in args {
                vars.extend(analyze(arg));
            }
        }
        ExprKind::Array(elements) => {
            for el in elements {
                vars.extend(analyze(el));
            }
        }
        ExprKind::Binary { left, right, .. } => {
            vars.extend(analyze(left));
            vars.extend(analyze(right));
        }
        // The body is native; the parameters name argument slots only.
        ExprKind::Builtin { .. } => {}
        ExprKind::Conditional {
            cond,
            then_branch,
            else_branch,
        } => {
            vars.extend(analyze(cond));
            vars.extend(analyze(then_branch));
            vars.extend(analyze(else_branch));
        }
        ExprKind::Error(e) => vars.extend(analyze(e)),
        ExprKind::Function { params, body } => {
            vars.extend(analyze(body));
            for p in params {
                vars.remove(p);
            }
        }
        ExprKind::Import(_) | ExprKind::ImportStr(_) => {}
        ExprKind::Index { target, index } => {
            vars.extend(analyze(target));
            vars.extend(analyze(index));
        }
        ExprKind::Local { binds, body } => {
            vars.extend(analyze(body));
            for bind in binds {
                vars.extend(analyze(&bind.body));
            }
            for bind in binds {
                vars.remove(&bind.var);
            }
        }
        ExprKind::LiteralBool(_)
        | ExprKind::LiteralNumber(_)
        | ExprKind::LiteralString(_)
        | ExprKind::LiteralNull => {}
        ExprKind::Object { asserts, fields } => {
            for a in asserts {
                vars.extend(analyze(a));
            }
            for f in fields {
                vars.extend(analyze(&f.name));
                vars.extend(analyze(&f.body));
            }
        }
        ExprKind::ObjectComp {
            field,
            value,
            var,
            array,
        } => {
            let mut inner: HashSet<Ident> = HashSet::new();
            inner.extend(analyze(field));
            inner.extend(analyze(value));
            inner.remove(var);
            vars.extend(inner);
            vars.extend(analyze(array));
        }
        ExprKind::SelfExpr => {}
        ExprKind::SuperIndex(idx) => vars.extend(analyze(idx)),
        ExprKind::Unary { expr: e, .. } => vars.extend(analyze(e)),
        ExprKind::Var(id) => {
            vars.insert(*id);
        }
    }

    let vars: Vec<Ident> = vars.into_iter().collect();
    expr.set_free_vars(vars.clone());
    vars
}
