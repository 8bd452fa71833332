//! The fixed table of native builtin functions.
//!
//! Builtins surface in the language as ordinary function values (the
//! desugarer injects [`crate::ast::ExprKind::Builtin`] nodes for them), so
//! they can be passed around, partially compared against, and called through
//! any expression in target position. What distinguishes them is dispatch:
//! instead of a body, applying one opens a frame that forces every argument
//! thunk in order and then runs the native operation on the concrete values.
//!
//! Argument types are validated against each entry's declaration; a mismatch
//! reports the whole signature, e.g.
//! `Builtin function pow expected (number, number) but got (number, string)`.
//!
//! The numbered order of the table is fixed; new entries go at the end.

use std::rc::Rc;

use crate::RuntimeError;
use crate::ast::{Expr, Location};
use crate::evaluator::{FrameKind, Interpreter, ThunkList};
use crate::heap::{Bindings, ClosureKind, Entity, Thunk, Value};
use crate::internal_error;

/// Highest Unicode codepoint accepted by `char`, exclusive.
pub const CODEPOINT_MAX: i64 = 0x11_0000;

/// Selector for a native operation. The discriminants are the table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    MakeArray,
    Pow,
    Floor,
    Ceil,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Type,
    Filter,
    ObjectHasEx,
    Length,
    ObjectFieldsEx,
    Codepoint,
    Char,
    Log,
    Exp,
    Mantissa,
    Exponent,
    Modulo,
    ExtVar,
    PrimitiveEquals,
}

impl Builtin {
    pub fn name(&self) -> &'static str {
        match self {
            Builtin::MakeArray => "makeArray",
            Builtin::Pow => "pow",
            Builtin::Floor => "floor",
            Builtin::Ceil => "ceil",
            Builtin::Sqrt => "sqrt",
            Builtin::Sin => "sin",
            Builtin::Cos => "cos",
            Builtin::Tan => "tan",
            Builtin::Asin => "asin",
            Builtin::Acos => "acos",
            Builtin::Atan => "atan",
            Builtin::Type => "type",
            Builtin::Filter => "filter",
            Builtin::ObjectHasEx => "objectHasEx",
            Builtin::Length => "length",
            Builtin::ObjectFieldsEx => "objectFieldsEx",
            Builtin::Codepoint => "codepoint",
            Builtin::Char => "char",
            Builtin::Log => "log",
            Builtin::Exp => "exp",
            Builtin::Mantissa => "mantissa",
            Builtin::Exponent => "exponent",
            Builtin::Modulo => "modulo",
            Builtin::ExtVar => "extVar",
            Builtin::PrimitiveEquals => "primitiveEquals",
        }
    }

    /// Parameter identifiers, as they appear in arity errors and closures.
    pub fn param_names(&self) -> &'static [&'static str] {
        match self {
            Builtin::MakeArray => &["sz", "func"],
            Builtin::Pow => &["x", "n"],
            Builtin::Floor
            | Builtin::Ceil
            | Builtin::Sqrt
            | Builtin::Sin
            | Builtin::Cos
            | Builtin::Tan
            | Builtin::Asin
            | Builtin::Acos
            | Builtin::Atan => &["x"],
            Builtin::Type => &["x"],
            Builtin::Filter => &["func", "arr"],
            Builtin::ObjectHasEx => &["obj", "f", "inc_hidden"],
            Builtin::Length => &["x"],
            Builtin::ObjectFieldsEx => &["obj", "inc_hidden"],
            Builtin::Codepoint => &["str"],
            Builtin::Char => &["n"],
            Builtin::Log | Builtin::Exp | Builtin::Mantissa | Builtin::Exponent => &["n"],
            Builtin::Modulo => &["a", "b"],
            Builtin::ExtVar => &["x"],
            Builtin::PrimitiveEquals => &["a", "b"],
        }
    }
}

/// Split an `f64` into mantissa in `[0.5, 1)` and power-of-two exponent,
/// so that `m * 2^e` reconstructs the input exactly.
fn frexp(x: f64) -> (f64, i32) {
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let exp_bits = ((bits >> 52) & 0x7ff) as i32;
    if exp_bits == 0 {
        // Subnormal: scale into the normal range first.
        let (m, e) = frexp(x * f64::powi(2.0, 64));
        return (m, e - 64);
    }
    let e = exp_bits - 1022;
    let m = f64::from_bits((bits & !(0x7ffu64 << 52)) | (1022u64 << 52));
    (m, e)
}

impl Interpreter<'_> {
    fn validate_builtin_args(
        &self,
        loc: &Location,
        builtin: Builtin,
        args: &[Value],
        params: &[&'static str],
    ) -> Result<(), RuntimeError> {
        let ok = args.len() == params.len()
            && args.iter().zip(params).all(|(a, p)| a.type_str() == *p);
        if ok {
            return Ok(());
        }
        let got: Vec<&str> = args.iter().map(|a| a.type_str()).collect();
        Err(self.error(
            loc,
            format!(
                "Builtin function {} expected ({}) but got ({})",
                builtin.name(),
                params.join(", "),
                got.join(", ")
            ),
        ))
    }

    fn as_double(&self, v: Value) -> f64 {
        match v {
            Value::Double(d) => d,
            other => internal_error!(
                "INTERNAL ERROR: validated builtin argument was {}, not number",
                other.type_str()
            ),
        }
    }

    fn heap_str(&self, v: Value) -> String {
        match v {
            Value::Str(r) => self.heap.string(r).value.clone(),
            other => internal_error!(
                "INTERNAL ERROR: validated builtin argument was {}, not string",
                other.type_str()
            ),
        }
    }

    /// Dispatch a builtin once every argument thunk has been forced.
    ///
    /// Returns `Some(ast)` when the builtin redirected control (`filter`
    /// stepping into its predicate, code-mode `extVar` replacing the current
    /// frame); the driver then recurses into that expression. `None` means
    /// the result is in the scratch register and the frame should pop.
    pub(crate) fn builtin_call(
        &mut self,
        builtin: Builtin,
        args: &[Value],
        loc: &Location,
    ) -> Result<Option<Rc<Expr>>, RuntimeError> {
        match builtin {
            Builtin::MakeArray => {
                self.validate_builtin_args(loc, builtin, args, &["number", "function"])?;
                let sz = self.as_double(args[0]) as i64;
                if sz < 0 {
                    return Err(self.error(loc, format!("makeArray requires size >= 0, got {sz}")));
                }
                let func_ref = match args[1] {
                    Value::Function(r) => r,
                    _ => unreachable!(),
                };
                let func = self.heap.closure(func_ref).clone();
                if func.params.len() != 1 {
                    return Err(self.error(
                        loc,
                        format!("makeArray function must take 1 param, got: {}", func.params.len()),
                    ));
                }
                let body = match &func.kind {
                    ClosureKind::User(body) => Some(body.clone()),
                    ClosureKind::Builtin(_) => None,
                };
                let param = func.params[0];
                let mut elements = Vec::with_capacity(sz as usize);
                for i in 0..sz {
                    let th = self.alloc(Entity::Thunk(Thunk::new(
                        self.id_array_element,
                        func.self_obj,
                        func.offset,
                        body.clone(),
                        func.up_values.clone(),
                    )));
                    // Keep the new thunk reachable across the next allocation.
                    if let FrameKind::BuiltinForceThunks { thunks, .. } =
                        &mut self.stack.top_mut().kind
                    {
                        thunks.push(th);
                    }
                    let el = self.alloc(Entity::Thunk(Thunk::new(
                        param,
                        None,
                        0,
                        None,
                        Bindings::new(),
                    )));
                    // The index is a small integer, never NaN or infinite.
                    self.heap.thunk_mut(el).fill(Value::Double(i as f64));
                    self.heap.thunk_mut(th).up_values.insert(param, el);
                    elements.push(th);
                }
                self.scratch = self.make_array(elements);
            }

            Builtin::Pow => {
                self.validate_builtin_args(loc, builtin, args, &["number", "number"])?;
                let (x, n) = (self.as_double(args[0]), self.as_double(args[1]));
                self.scratch = self.double_check(loc, x.powf(n))?;
            }
            Builtin::Floor => {
                self.validate_builtin_args(loc, builtin, args, &["number"])?;
                let x = self.as_double(args[0]);
                self.scratch = self.double_check(loc, x.floor())?;
            }
            Builtin::Ceil => {
                self.validate_builtin_args(loc, builtin, args, &["number"])?;
                let x = self.as_double(args[0]);
                self.scratch = self.double_check(loc, x.ceil())?;
            }
            Builtin::Sqrt => {
                self.validate_builtin_args(loc, builtin, args, &["number"])?;
                let x = self.as_double(args[0]);
                self.scratch = self.double_check(loc, x.sqrt())?;
            }
            Builtin::Sin => {
                self.validate_builtin_args(loc, builtin, args, &["number"])?;
                let x = self.as_double(args[0]);
                self.scratch = self.double_check(loc, x.sin())?;
            }
            Builtin::Cos => {
                self.validate_builtin_args(loc, builtin, args, &["number"])?;
                let x = self.as_double(args[0]);
                self.scratch = self.double_check(loc, x.cos())?;
            }
            Builtin::Tan => {
                self.validate_builtin_args(loc, builtin, args, &["number"])?;
                let x = self.as_double(args[0]);
                self.scratch = self.double_check(loc, x.tan())?;
            }
            Builtin::Asin => {
                self.validate_builtin_args(loc, builtin, args, &["number"])?;
                let x = self.as_double(args[0]);
                self.scratch = self.double_check(loc, x.asin())?;
            }
            Builtin::Acos => {
                self.validate_builtin_args(loc, builtin, args, &["number"])?;
                let x = self.as_double(args[0]);
                self.scratch = self.double_check(loc, x.acos())?;
            }
            Builtin::Atan => {
                self.validate_builtin_args(loc, builtin, args, &["number"])?;
                let x = self.as_double(args[0]);
                self.scratch = self.double_check(loc, x.atan())?;
            }

            Builtin::Type => {
                if args.len() != 1 {
                    return Err(self.error(loc, "type takes 1 parameter.".to_owned()));
                }
                self.scratch = self.make_string(args[0].type_str().to_owned());
            }

            Builtin::Filter => {
                self.validate_builtin_args(loc, builtin, args, &["function", "array"])?;
                let func_ref = match args[0] {
                    Value::Function(r) => r,
                    _ => unreachable!(),
                };
                let arr_ref = match args[1] {
                    Value::Array(r) => r,
                    _ => unreachable!(),
                };
                let func = self.heap.closure(func_ref).clone();
                if func.params.len() != 1 {
                    return Err(self.error(loc, "filter function takes 1 parameter.".to_owned()));
                }
                let body = match &func.kind {
                    ClosureKind::User(body) => body.clone(),
                    ClosureKind::Builtin(_) => {
                        return Err(self.error(loc, "filter function takes 1 parameter.".to_owned()));
                    }
                };
                let elements = self.heap.array(arr_ref).elements.clone();
                if elements.is_empty() {
                    self.scratch = self.make_array(Vec::new());
                } else {
                    let first = elements[0];
                    {
                        let top = self.stack.top_mut();
                        top.kind = FrameKind::BuiltinFilter {
                            func: args[0],
                            array: args[1],
                            kept: ThunkList::new(),
                            cursor: 0,
                        };
                    }
                    let mut bindings = func.up_values.clone();
                    bindings.insert(func.params[0], first);
                    self.new_call(loc, Some(func_ref), func.self_obj, func.offset, bindings)?;
                    return Ok(Some(body));
                }
            }

            Builtin::ObjectHasEx => {
                self.validate_builtin_args(loc, builtin, args, &["object", "string", "boolean"])?;
                let obj = match args[0] {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                let wanted = self.heap_str(args[1]);
                let include_hidden = matches!(args[2], Value::Bool(true));
                let found = self
                    .object_fields(obj, !include_hidden)
                    .iter()
                    .any(|&id| self.vm.interner.resolve(id) == wanted);
                self.scratch = Value::Bool(found);
            }

            Builtin::Length => {
                if args.len() != 1 {
                    return Err(self.error(loc, "length takes 1 parameter.".to_owned()));
                }
                self.scratch = match args[0] {
                    Value::Object(obj) => {
                        // Hidden fields count towards an object's length.
                        Value::Double(self.object_fields(obj, false).len() as f64)
                    }
                    Value::Array(arr) => Value::Double(self.heap.array(arr).elements.len() as f64),
                    Value::Str(s) => Value::Double(self.heap.string(s).len() as f64),
                    Value::Function(f) => Value::Double(self.heap.closure(f).params.len() as f64),
                    other => {
                        return Err(self.error(
                            loc,
                            format!(
                                "length operates on strings, objects, and arrays, got {}",
                                other.type_str()
                            ),
                        ));
                    }
                };
            }

            Builtin::ObjectFieldsEx => {
                self.validate_builtin_args(loc, builtin, args, &["object", "boolean"])?;
                let obj = match args[0] {
                    Value::Object(r) => r,
                    _ => unreachable!(),
                };
                let include_hidden = matches!(args[1], Value::Bool(true));
                let mut names: Vec<String> = self
                    .object_fields(obj, !include_hidden)
                    .iter()
                    .map(|&id| self.vm.interner.resolve(id).to_owned())
                    .collect();
                names.sort();
                let arr = self.alloc(Entity::Array(crate::heap::Array {
                    elements: Vec::new(),
                }));
                self.scratch = Value::Array(arr);
                for name in names {
                    let th = self.alloc(Entity::Thunk(Thunk::new(
                        self.id_array_element,
                        None,
                        0,
                        None,
                        Bindings::new(),
                    )));
                    self.heap.array_mut(arr).elements.push(th);
                    let s = self.make_string(name);
                    self.heap.thunk_mut(th).fill(s);
                }
            }

            Builtin::Codepoint => {
                self.validate_builtin_args(loc, builtin, args, &["string"])?;
                let s = self.heap_str(args[0]);
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => self.scratch = Value::Double(c as u32 as f64),
                    _ => {
                        return Err(self.error(
                            loc,
                            format!(
                                "codepoint takes a string of length 1, got length {}",
                                s.chars().count()
                            ),
                        ));
                    }
                }
            }

            Builtin::Char => {
                self.validate_builtin_args(loc, builtin, args, &["number"])?;
                let l = self.as_double(args[0]) as i64;
                if l < 0 {
                    return Err(self.error(loc, format!("Codepoints must be >= 0, got {l}")));
                }
                if l >= CODEPOINT_MAX {
                    return Err(self.error(loc, format!("Invalid unicode codepoint, got {l}")));
                }
                match char::from_u32(l as u32) {
                    Some(c) => self.scratch = self.make_string(c.to_string()),
                    None => {
                        return Err(self.error(loc, format!("Invalid unicode codepoint, got {l}")));
                    }
                }
            }

            Builtin::Log => {
                self.validate_builtin_args(loc, builtin, args, &["number"])?;
                let x = self.as_double(args[0]);
                self.scratch = self.double_check(loc, x.ln())?;
            }
            Builtin::Exp => {
                self.validate_builtin_args(loc, builtin, args, &["number"])?;
                let x = self.as_double(args[0]);
                self.scratch = self.double_check(loc, x.exp())?;
            }
            Builtin::Mantissa => {
                self.validate_builtin_args(loc, builtin, args, &["number"])?;
                let (m, _) = frexp(self.as_double(args[0]));
                self.scratch = self.double_check(loc, m)?;
            }
            Builtin::Exponent => {
                self.validate_builtin_args(loc, builtin, args, &["number"])?;
                let (_, e) = frexp(self.as_double(args[0]));
                self.scratch = self.double_check(loc, e as f64)?;
            }

            Builtin::Modulo => {
                self.validate_builtin_args(loc, builtin, args, &["number", "number"])?;
                let (a, b) = (self.as_double(args[0]), self.as_double(args[1]));
                if b == 0.0 {
                    return Err(self.error(loc, "Division by zero.".to_owned()));
                }
                self.scratch = self.double_check(loc, a % b)?;
            }

            Builtin::ExtVar => {
                self.validate_builtin_args(loc, builtin, args, &["string"])?;
                let name = self.heap_str(args[0]);
                let ext = match self.vm.ext_vars.get(&name) {
                    Some(ext) => ext.clone(),
                    None => {
                        return Err(
                            self.error(loc, format!("Undefined external variable: {name}"))
                        );
                    }
                };
                if ext.is_code {
                    let filename = format!("<extvar:{name}>");
                    let expr = self.compile(&filename, &ext.data, loc)?;
                    // Replace this frame with the external code, evaluated
                    // in place.
                    self.stack.pop();
                    return Ok(Some(expr));
                }
                self.scratch = self.make_string(ext.data);
            }

            Builtin::PrimitiveEquals => {
                if args.len() != 2 {
                    return Err(self.error(loc, "primitiveEquals takes 2 parameters.".to_owned()));
                }
                if args[0].type_str() != args[1].type_str() {
                    self.scratch = Value::Bool(false);
                    return Ok(None);
                }
                let r = match (args[0], args[1]) {
                    (Value::Bool(a), Value::Bool(b)) => a == b,
                    (Value::Double(a), Value::Double(b)) => a == b,
                    (Value::Str(a), Value::Str(b)) => {
                        self.heap.string(a).value == self.heap.string(b).value
                    }
                    (Value::Null, Value::Null) => true,
                    (Value::Function(_), Value::Function(_)) => {
                        return Err(self.error(loc, "Cannot test equality of functions".to_owned()));
                    }
                    (other, _) => {
                        return Err(self.error(
                            loc,
                            format!(
                                "primitiveEquals operates on primitive types, got {}",
                                other.type_str()
                            ),
                        ));
                    }
                };
                self.scratch = Value::Bool(r);
            }
        }
        Ok(None)
    }
}
