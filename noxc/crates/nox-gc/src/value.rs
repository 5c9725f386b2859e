//! The tagged value union every stack slot, constant, and field holds.

use std::fmt;

use crate::object::{ObjKind, ObjRef};

#[derive(Clone, Copy)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Obj(ObjRef),
}

impl Value {
    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn obj_kind(&self) -> Option<ObjKind> {
        match self {
            Value::Obj(o) => Some(o.kind()),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Obj(o) => match o.kind() {
                ObjKind::String => "string",
                ObjKind::Function | ObjKind::Closure | ObjKind::Native => "function",
                ObjKind::Upvalue => "upvalue",
                ObjKind::Class => "class",
                ObjKind::Instance => "instance",
                ObjKind::BoundMethod => "method",
                ObjKind::List => "list",
            },
        }
    }
}

/// Mirrors `valuesEqual`: compare by tag first, objects by pointer
/// identity (strings are interned, so this also gives string equality).
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Obj(o) => write!(f, "{}", crate::object::display_obj(*o)),
        }
    }
}

/// clox prints numbers with `%g`: shortest round-tripping form, no
/// trailing `.0` for integral values.
fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if n == n.trunc() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}
