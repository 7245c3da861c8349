//! This module defines the value algebra shared by the reader, the evaluator and
//! the builtin library. The main enum, [`Value`], is a closed set of variants:
//! atoms (`nil`, booleans, integers, strings, symbols, keywords), sequences
//! (lists and vectors), hashmaps, mutable [`Value::Atom`] cells and callables.
//!
//! Values are cheap to clone: containers, atoms and callables are reference
//! counted, so "mutating" a sequence always builds a new one that shares the
//! untouched elements. Equality and hashing are structural (see the
//! [`PartialEq`] impl for the exact per-variant rules) which lets any value be
//! used as a hashmap key. Ergonomic helpers such as [`val`], [`sym`], [`kw`]
//! and [`nil`] are provided for building values in code and tests.

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use indexmap::IndexMap;

use crate::Error;
use crate::evaluator::{Environment, Step};

/// Type alias for integer values in the interpreter
pub type IntType = i64;

/// Canonical erased signature of a native function.
///
/// Builtins receive the evaluated arguments and the environment of the call
/// site; re-entrant builtins (`eval`, `apply`, `map`, `swap!`) use it to get
/// back into the evaluator.
pub type BuiltinFn = dyn Fn(&[Value], &Environment) -> Result<Value, Error>;

/// Core value type of the interpreter
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(IntType),
    String(String),
    Symbol(String),
    /// Keyword name without the leading `:`
    Keyword(String),
    List(Rc<Vec<Value>>),
    Vector(Rc<Vec<Value>>),
    /// Entries keep insertion order; equality ignores it
    Hashmap(Rc<IndexMap<Value, Value>>),
    /// Mutable single-slot reference, compared by identity
    Atom(Rc<RefCell<Value>>),
    Callable(Rc<Callable>),
}

/// A function value: either native or a user lambda.
///
/// `is_macro` marks callables registered through `defmacro!`; it only changes
/// whether the evaluator expands a call before evaluating it.
pub struct Callable {
    pub kind: CallableKind,
    pub is_macro: bool,
}

pub enum CallableKind {
    Builtin {
        name: String,
        func: Rc<BuiltinFn>,
    },
    /// User-defined function (parameter spec, body, defining environment)
    Lambda {
        params: Value,
        body: Value,
        env: Environment,
    },
}

impl Callable {
    pub fn builtin(name: impl Into<String>, func: Rc<BuiltinFn>) -> Self {
        Callable {
            kind: CallableKind::Builtin {
                name: name.into(),
                func,
            },
            is_macro: false,
        }
    }

    /// Build a lambda; the parameter spec must be a list or vector.
    pub fn lambda(params: Value, body: Value, env: Environment) -> Result<Self, Error> {
        if params.as_sequence().is_none() {
            return Err(Error::NotList(params.pr_str(true)));
        }
        Ok(Callable {
            kind: CallableKind::Lambda { params, body, env },
            is_macro: false,
        })
    }

    /// Copy of this callable flagged as a macro
    pub fn to_macro(&self) -> Self {
        let kind = match &self.kind {
            CallableKind::Builtin { name, func } => CallableKind::Builtin {
                name: name.clone(),
                func: Rc::clone(func),
            },
            CallableKind::Lambda { params, body, env } => CallableKind::Lambda {
                params: params.clone(),
                body: body.clone(),
                env: env.clone(),
            },
        };
        Callable {
            kind,
            is_macro: true,
        }
    }

    /// Invoke with evaluated arguments.
    ///
    /// Builtins produce their result immediately. Lambdas bind a fresh call
    /// environment and hand the body back to the caller's trampoline.
    pub fn call(&self, args: Vec<Value>, env: &Environment) -> Result<Step, Error> {
        match &self.kind {
            CallableKind::Builtin { name, func } => {
                tracing::trace!(builtin = %name, argc = args.len(), "calling builtin");
                Ok(Step::Return(func(&args, env)?))
            }
            CallableKind::Lambda {
                params,
                body,
                env: closure_env,
            } => {
                let call_env = Environment::bind(params, args, closure_env)?;
                Ok(Step::Eval(body.clone(), call_env))
            }
        }
    }
}

impl PartialEq for Callable {
    fn eq(&self, other: &Self) -> bool {
        match (&self.kind, &other.kind) {
            (CallableKind::Builtin { func: f1, .. }, CallableKind::Builtin { func: f2, .. }) => {
                std::ptr::addr_eq(Rc::as_ptr(f1), Rc::as_ptr(f2))
            }
            // The captured environment is deliberately not compared
            (
                CallableKind::Lambda {
                    params: p1,
                    body: b1,
                    ..
                },
                CallableKind::Lambda {
                    params: p2,
                    body: b2,
                    ..
                },
            ) => p1 == p2 && b1 == b2,
            _ => false,
        }
    }
}

impl Hash for Callable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.kind {
            CallableKind::Builtin { func, .. } => {
                (Rc::as_ptr(func) as *const ()).hash(state);
            }
            CallableKind::Lambda { params, body, .. } => {
                params.hash(state);
                body.hash(state);
            }
        }
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.is_macro { "Macro" } else { "" };
        match &self.kind {
            CallableKind::Builtin { name, .. } => write!(f, "{prefix}Builtin({name})"),
            CallableKind::Lambda { params, body, .. } => {
                write!(f, "{prefix}Lambda(params={params:?}, body={body:?})")
            }
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(n) => write!(f, "Int({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Symbol(s) => write!(f, "Symbol({s})"),
            Value::Keyword(s) => write!(f, "Keyword({s})"),
            Value::List(items) => f.debug_tuple("List").field(&items.as_slice()).finish(),
            Value::Vector(items) => f.debug_tuple("Vector").field(&items.as_slice()).finish(),
            Value::Hashmap(map) => f.debug_tuple("Hashmap").field(&**map).finish(),
            Value::Atom(_) => write!(f, "Atom({})", self.pr_str(true)),
            Value::Callable(c) => write!(f, "{c:?}"),
        }
    }
}

// From trait implementations for Value - enables .into() conversion
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! impl_from_integer {
    ($int_type:ty) => {
        impl From<$int_type> for Value {
            fn from(n: $int_type) -> Self {
                Value::Int(n as IntType)
            }
        }
    };
}

impl_from_integer!(i8);
impl_from_integer!(i16);
impl_from_integer!(i32);
impl_from_integer!(IntType);
impl_from_integer!(u8);
impl_from_integer!(u16);
impl_from_integer!(u32);

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::list(v.into_iter().map(|x| x.into()).collect())
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(arr: [T; N]) -> Self {
        Value::list(arr.into_iter().map(|x| x.into()).collect())
    }
}

/// Helper function for creating symbols
pub fn sym<S: AsRef<str>>(name: S) -> Value {
    Value::Symbol(name.as_ref().to_owned())
}

/// Helper function for creating keywords (name given without the `:`)
pub fn kw<S: AsRef<str>>(name: S) -> Value {
    Value::Keyword(name.as_ref().to_owned())
}

/// Helper function for creating Values from anything convertible.
/// Rust vectors and arrays become lists.
pub fn val<T: Into<Value>>(value: T) -> Value {
    value.into()
}

pub fn nil() -> Value {
    Value::Nil
}

impl Value {
    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(items))
    }

    pub fn vector(items: Vec<Value>) -> Self {
        Value::Vector(Rc::new(items))
    }

    pub fn hashmap(map: IndexMap<Value, Value>) -> Self {
        Value::Hashmap(Rc::new(map))
    }

    /// Fold a flat `k v k v ...` sequence into a hashmap. A repeated key keeps
    /// its first position and takes the later value.
    pub fn hashmap_from_pairs(items: &[Value]) -> Result<Self, Error> {
        if items.len() % 2 != 0 {
            return Err(Error::InvalidArgument(format!(
                "odd number of entries for hashmap: {}",
                Value::list(items.to_vec())
            )));
        }
        let map = items
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        Ok(Value::hashmap(map))
    }

    pub fn atom(value: Value) -> Self {
        Value::Atom(Rc::new(RefCell::new(value)))
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    /// Elements of a list or vector
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) | Value::Vector(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Elements of a non-empty list or vector
    pub fn as_pair(&self) -> Option<&[Value]> {
        self.as_sequence().filter(|items| !items.is_empty())
    }

    pub fn as_int(&self) -> Result<IntType, Error> {
        match self {
            Value::Int(n) => Ok(*n),
            other => Err(Error::NotInt(other.pr_str(true))),
        }
    }

    pub fn as_str(&self) -> Result<&str, Error> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(Error::NotString(other.pr_str(true))),
        }
    }

    pub fn as_symbol(&self) -> Result<&str, Error> {
        match self {
            Value::Symbol(s) => Ok(s),
            other => Err(Error::NotSymbol(other.pr_str(true))),
        }
    }

    pub fn as_list(&self) -> Result<&[Value], Error> {
        self.as_sequence()
            .ok_or_else(|| Error::NotList(self.pr_str(true)))
    }

    pub fn as_hashmap(&self) -> Result<&IndexMap<Value, Value>, Error> {
        match self {
            Value::Hashmap(map) => Ok(map),
            other => Err(Error::NotHashmap(other.pr_str(true))),
        }
    }

    pub fn as_atom(&self) -> Result<&Rc<RefCell<Value>>, Error> {
        match self {
            Value::Atom(cell) => Ok(cell),
            other => Err(Error::NotAtom(other.pr_str(true))),
        }
    }

    /// The callable behind a symbol head, if it is flagged as a macro
    pub fn as_macro(&self) -> Option<&Rc<Callable>> {
        match self {
            Value::Callable(c) if c.is_macro => Some(c),
            _ => None,
        }
    }

    /// Apply this value to evaluated arguments.
    ///
    /// Exactly one outcome is produced: an immediate value ([`Step::Return`])
    /// for builtins and hashmap lookups, or a continuation ([`Step::Eval`])
    /// for lambdas so the caller's trampoline can run the body without
    /// growing the native stack.
    pub fn call(&self, args: Vec<Value>, env: &Environment) -> Result<Step, Error> {
        match self {
            Value::Callable(c) => c.call(args, env),
            Value::Hashmap(map) => match args.as_slice() {
                [key] => Ok(Step::Return(map.get(key).cloned().unwrap_or(Value::Nil))),
                _ => Err(Error::InvalidArgument(format!(
                    "hashmap lookup takes one key, got {}",
                    args.len()
                ))),
            },
            other => Err(Error::NotCallable(other.pr_str(true))),
        }
    }

    /// Canonical printer. `readable` escapes strings (`pr-str`, REPL echo);
    /// otherwise string contents are printed raw (`str`, `println`).
    pub fn pr_str(&self, readable: bool) -> String {
        let open_atoms = RefCell::new(Vec::new());
        Printed {
            value: self,
            readable,
            open_atoms: &open_atoms,
        }
        .to_string()
    }

    /// Deterministic 32-bit hash consistent with equality
    pub fn hash_code(&self) -> u32 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        let h = hasher.finish();
        (h ^ (h >> 32)) as u32
    }

    /// Short type name used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::String(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::Keyword(_) => "keyword",
            Value::List(_) => "list",
            Value::Vector(_) => "vector",
            Value::Hashmap(_) => "hashmap",
            Value::Atom(_) => "atom",
            Value::Callable(c) if c.is_macro => "macro",
            Value::Callable(_) => "function",
        }
    }
}

/// Display adapter carrying the readable/raw printing mode.
///
/// `open_atoms` holds the atoms whose contents are being printed further up;
/// meeting one of them again prints `(atom ...)` instead of looping.
struct Printed<'v, 's> {
    value: &'v Value,
    readable: bool,
    open_atoms: &'s RefCell<Vec<*const RefCell<Value>>>,
}

impl<'s> Printed<'_, 's> {
    fn write_seq(
        &self,
        f: &mut fmt::Formatter<'_>,
        open: &str,
        items: &[Value],
        close: &str,
    ) -> fmt::Result {
        write!(f, "{open}")?;
        for (i, elem) in items.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", self.nested(elem))?;
        }
        write!(f, "{close}")
    }

    fn nested<'b>(&self, value: &'b Value) -> Printed<'b, 's> {
        Printed {
            value,
            readable: self.readable,
            open_atoms: self.open_atoms,
        }
    }

    fn write_atom(&self, f: &mut fmt::Formatter<'_>, cell: &Rc<RefCell<Value>>) -> fmt::Result {
        let ptr = Rc::as_ptr(cell);
        if self.open_atoms.borrow().contains(&ptr) {
            return write!(f, "(atom ...)");
        }
        self.open_atoms.borrow_mut().push(ptr);
        let result = write!(f, "(atom {})", self.nested(&cell.borrow()));
        self.open_atoms.borrow_mut().pop();
        result
    }
}

impl fmt::Display for Printed<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::String(s) if self.readable => {
                write!(f, "\"")?;
                for ch in s.chars() {
                    match ch {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        '\n' => write!(f, "\\n")?,
                        c => write!(f, "{c}")?,
                    }
                }
                write!(f, "\"")
            }
            Value::String(s) => write!(f, "{s}"),
            Value::Symbol(s) => write!(f, "{s}"),
            Value::Keyword(s) => write!(f, ":{s}"),
            Value::List(items) => self.write_seq(f, "(", items, ")"),
            Value::Vector(items) => self.write_seq(f, "[", items, "]"),
            Value::Hashmap(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{} {}", self.nested(k), self.nested(v))?;
                }
                write!(f, "}}")
            }
            Value::Atom(cell) => self.write_atom(f, cell),
            Value::Callable(c) => match &c.kind {
                CallableKind::Builtin { name, .. } => write!(f, "#<builtin-function:{name}>"),
                CallableKind::Lambda { .. } if c.is_macro => write!(f, "#<macro>"),
                CallableKind::Lambda { .. } => write!(f, "#<function>"),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open_atoms = RefCell::new(Vec::new());
        write!(
            f,
            "{}",
            Printed {
                value: self,
                readable: true,
                open_atoms: &open_atoms,
            }
        )
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Keyword(a), Value::Keyword(b)) => a == b,
            // List and Vector never compare equal to each other
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Vector(a), Value::Vector(b)) => a == b,
            (Value::Hashmap(a), Value::Hashmap(b)) => a == b,
            (Value::Atom(a), Value::Atom(b)) => Rc::ptr_eq(a, b),
            (Value::Callable(a), Value::Callable(b)) => Rc::ptr_eq(a, b) || a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Nil => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(n) => n.hash(state),
            Value::String(s) | Value::Symbol(s) | Value::Keyword(s) => s.hash(state),
            Value::List(items) | Value::Vector(items) => items.as_slice().hash(state),
            Value::Hashmap(map) => {
                // Equal maps may differ in entry order, so combine entry hashes commutatively
                let combined = map
                    .iter()
                    .map(|(k, v)| {
                        let mut entry_hasher = DefaultHasher::new();
                        k.hash(&mut entry_hasher);
                        v.hash(&mut entry_hasher);
                        entry_hasher.finish()
                    })
                    .fold(0u64, u64::wrapping_add);
                map.len().hash(state);
                combined.hash(state);
            }
            Value::Atom(cell) => Rc::as_ptr(cell).hash(state),
            Value::Callable(c) => c.hash(state),
        }
    }
}
