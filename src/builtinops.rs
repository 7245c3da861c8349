//! Built-in function registry and the Lisp-level prelude.
//!
//! Every builtin is an ordinary function of the evaluated arguments and the
//! calling environment, registered with its [`Arity`]. The arity is checked
//! before the function runs, so implementations can destructure their
//! arguments directly.
//!
//! ```lisp
//! (+ 1 2 3)              ; arithmetic with overflow detection
//! (assoc {:a 1} :b 2)    ; persistent hashmap update
//! (swap! counter + 1)    ; atoms
//! (apply str "a" ["b"])  ; re-entrant calls back into the evaluator
//! ```
//!
//! ## Adding New Operations
//!
//! 1. Implement a function `fn(&[Value], &Environment) -> Result<Value, Error>`
//! 2. Add it to `BUILTIN_OPS` with its name and arity
//! 3. Add cases to the data-driven tests below
//!
//! Operations that are easier to express in the language itself belong in
//! [`PRELUDE`] instead.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::LazyLock;

use crate::Error;
use crate::ast::{IntType, Value};
use crate::evaluator::{self, Environment};
use crate::reader::read_str;

/// Canonical native function signature
pub type NativeFn = fn(&[Value], &Environment) -> Result<Value, Error>;

/// Expected number of arguments for a builtin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    Any,
}

impl Arity {
    pub fn validate(&self, name: &str, got: usize) -> Result<(), Error> {
        let ok = match *self {
            Arity::Exact(n) => got == n,
            Arity::AtLeast(n) => got >= n,
            Arity::Any => true,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "{name}: expected {self} arguments, got {got}"
            )))
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
            Arity::Any => write!(f, "any number of"),
        }
    }
}

/// Definition of a built-in operation
#[derive(Debug, Clone)]
pub struct BuiltinOp {
    pub name: &'static str,
    pub func: NativeFn,
    pub arity: Arity,
}

impl PartialEq for BuiltinOp {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

/// Forms evaluated in the global environment after the builtins are
/// installed, in order.
pub const PRELUDE: &[&str] = &[
    "(def! not (fn* (a) (if a false true)))",
    "(def! load-file (fn* (f) (eval (read-string (str \"(do \" (slurp f) \"\\nnil)\")))))",
    "(defmacro! cond (fn* (& xs) (if (> (count xs) 0) (list 'if (first xs) (if (> (count xs) 1) (nth xs 1) (throw \"odd number of forms to cond\")) (cons 'cond (rest (rest xs)))))))",
    "(def! *host-language* \"rust\")",
    "(def! *gensym-counter* (atom 0))",
    "(def! gensym (fn* [] (symbol (str \"G__\" (swap! *gensym-counter* (fn* [x] (+ 1 x)))))))",
    "(defmacro! or (fn* (& xs) (if (empty? xs) nil (if (= 1 (count xs)) (first xs) (let* (condvar (gensym)) `(let* (~condvar ~(first xs)) (if ~condvar ~condvar (or ~@(rest xs)))))))))",
];

//
// Argument helpers
//

/// View `args` as a fixed-size array
fn exact<'a, const N: usize>(name: &str, args: &'a [Value]) -> Result<&'a [Value; N], Error> {
    args.try_into().map_err(|_| {
        Error::InvalidArgument(format!("{name}: expected {N} arguments, got {}", args.len()))
    })
}

/// Elements of a sequence argument, treating `nil` as empty
fn seq_or_nil(value: &Value) -> Result<&[Value], Error> {
    match value {
        Value::Nil => Ok(&[]),
        other => other.as_list(),
    }
}

fn ints(args: &[Value]) -> impl Iterator<Item = Result<IntType, Error>> + '_ {
    args.iter().map(Value::as_int)
}

//
// Arithmetic and comparison
//

macro_rules! checked_arithmetic {
    ($name:ident, $checked:ident, $identity:expr, $what:literal) => {
        fn $name(args: &[Value], _env: &Environment) -> Result<Value, Error> {
            let mut iter = ints(args);
            let mut acc = match iter.next() {
                Some(first) => first?,
                None => return Ok(Value::Int($identity)),
            };
            for n in iter {
                acc = acc.$checked(n?).ok_or_else(|| {
                    Error::InvalidArgument(concat!("integer overflow in ", $what).to_owned())
                })?;
            }
            Ok(Value::Int(acc))
        }
    };
}

checked_arithmetic!(builtin_add, checked_add, 0, "addition");
checked_arithmetic!(builtin_mul, checked_mul, 1, "multiplication");

fn builtin_sub(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let overflow = || Error::InvalidArgument("integer overflow in subtraction".to_owned());
    let mut iter = ints(args);
    let first = match iter.next() {
        Some(first) => first?,
        None => return Err(Error::invalid_form("-", args)),
    };
    if args.len() == 1 {
        return first.checked_neg().map(Value::Int).ok_or_else(overflow);
    }
    let mut acc = first;
    for n in iter {
        acc = acc.checked_sub(n?).ok_or_else(overflow)?;
    }
    Ok(Value::Int(acc))
}

fn builtin_div(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let mut iter = ints(args);
    let mut acc = match iter.next() {
        Some(first) => first?,
        None => return Err(Error::invalid_form("/", args)),
    };
    for n in iter {
        let divisor = n?;
        if divisor == 0 {
            return Err(Error::InvalidArgument("division by zero".to_owned()));
        }
        acc = acc
            .checked_div(divisor)
            .ok_or_else(|| Error::InvalidArgument("integer overflow in division".to_owned()))?;
    }
    Ok(Value::Int(acc))
}

// Chained comparison: all adjacent pairs must satisfy the operator
macro_rules! int_comparison {
    ($name:ident, $op:tt) => {
        fn $name(args: &[Value], _env: &Environment) -> Result<Value, Error> {
            let values = ints(args).collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Bool(values.windows(2).all(|w| w[0] $op w[1])))
        }
    };
}

int_comparison!(builtin_lt, <);
int_comparison!(builtin_le, <=);
int_comparison!(builtin_gt, >);
int_comparison!(builtin_ge, >=);

fn builtin_equal(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    Ok(Value::Bool(args.windows(2).all(|w| w[0] == w[1])))
}

//
// Printing, reading, files
//

fn join_printed(args: &[Value], readable: bool, separator: &str) -> String {
    args.iter()
        .map(|v| v.pr_str(readable))
        .collect::<Vec<_>>()
        .join(separator)
}

fn builtin_pr_str(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    Ok(Value::String(join_printed(args, true, " ")))
}

fn builtin_str(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    Ok(Value::String(join_printed(args, false, "")))
}

fn builtin_prn(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    println!("{}", join_printed(args, true, " "));
    Ok(Value::Nil)
}

fn builtin_println(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    println!("{}", join_printed(args, false, " "));
    Ok(Value::Nil)
}

fn builtin_read_string(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [source] = exact::<1>("read-string", args)?;
    Ok(read_str(source.as_str()?)?.unwrap_or(Value::Nil))
}

fn builtin_slurp(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [path] = exact::<1>("slurp", args)?;
    let path = path.as_str()?;
    std::fs::read_to_string(path)
        .map(Value::String)
        .map_err(|err| Error::InvalidArgument(format!("slurp: cannot read '{path}': {err}")))
}

//
// Sequences
//

fn builtin_list(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    Ok(Value::list(args.to_vec()))
}

fn builtin_is_list(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [value] = exact::<1>("list?", args)?;
    Ok(Value::Bool(matches!(value, Value::List(_))))
}

fn builtin_vector(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    Ok(Value::vector(args.to_vec()))
}

fn builtin_is_vector(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [value] = exact::<1>("vector?", args)?;
    Ok(Value::Bool(matches!(value, Value::Vector(_))))
}

fn builtin_vec(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [value] = exact::<1>("vec", args)?;
    match value {
        Value::Vector(_) => Ok(value.clone()),
        other => Ok(Value::vector(seq_or_nil(other)?.to_vec())),
    }
}

fn builtin_is_sequential(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [value] = exact::<1>("sequential?", args)?;
    Ok(Value::Bool(value.as_sequence().is_some()))
}

fn builtin_is_empty(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [value] = exact::<1>("empty?", args)?;
    match value {
        Value::Hashmap(map) => Ok(Value::Bool(map.is_empty())),
        other => Ok(Value::Bool(seq_or_nil(other)?.is_empty())),
    }
}

fn builtin_count(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [value] = exact::<1>("count", args)?;
    let len = match value {
        Value::Hashmap(map) => map.len(),
        Value::String(s) => s.chars().count(),
        other => seq_or_nil(other)?.len(),
    };
    IntType::try_from(len)
        .map(Value::Int)
        .map_err(|_| Error::InvalidArgument("count: length out of range".to_owned()))
}

fn builtin_cons(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [head, tail] = exact::<2>("cons", args)?;
    let tail = seq_or_nil(tail)?;
    let mut items = Vec::with_capacity(tail.len() + 1);
    items.push(head.clone());
    items.extend_from_slice(tail);
    Ok(Value::list(items))
}

fn builtin_concat(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let mut items = Vec::new();
    for arg in args {
        items.extend_from_slice(seq_or_nil(arg)?);
    }
    Ok(Value::list(items))
}

fn builtin_nth(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [seq, index] = exact::<2>("nth", args)?;
    let items = seq.as_list()?;
    let index = index.as_int()?;
    usize::try_from(index)
        .ok()
        .and_then(|i| items.get(i))
        .cloned()
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "nth: index {index} out of range for {} elements",
                items.len()
            ))
        })
}

fn builtin_first(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [seq] = exact::<1>("first", args)?;
    Ok(seq_or_nil(seq)?.first().cloned().unwrap_or(Value::Nil))
}

fn builtin_rest(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [seq] = exact::<1>("rest", args)?;
    let items = seq_or_nil(seq)?;
    Ok(Value::list(items.get(1..).unwrap_or_default().to_vec()))
}

//
// Hashmaps
//

fn builtin_hash_map(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    Value::hashmap_from_pairs(args)
}

fn builtin_is_map(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [value] = exact::<1>("map?", args)?;
    Ok(Value::Bool(matches!(value, Value::Hashmap(_))))
}

fn builtin_assoc(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let Some((map, pairs)) = args.split_first() else {
        return Err(Error::invalid_form("assoc", args));
    };
    let mut updated = map.as_hashmap()?.clone();
    let Value::Hashmap(additions) = Value::hashmap_from_pairs(pairs)? else {
        return Err(Error::invalid_form("assoc", args));
    };
    updated.extend(additions.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(Value::hashmap(updated))
}

fn builtin_dissoc(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let Some((map, keys)) = args.split_first() else {
        return Err(Error::invalid_form("dissoc", args));
    };
    let mut updated = map.as_hashmap()?.clone();
    for key in keys {
        updated.shift_remove(key);
    }
    Ok(Value::hashmap(updated))
}

fn builtin_get(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [map, key] = exact::<2>("get", args)?;
    match map {
        Value::Nil => Ok(Value::Nil),
        other => Ok(other.as_hashmap()?.get(key).cloned().unwrap_or(Value::Nil)),
    }
}

fn builtin_contains(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [map, key] = exact::<2>("contains?", args)?;
    Ok(Value::Bool(map.as_hashmap()?.contains_key(key)))
}

fn builtin_keys(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [map] = exact::<1>("keys", args)?;
    Ok(Value::list(map.as_hashmap()?.keys().cloned().collect()))
}

fn builtin_vals(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [map] = exact::<1>("vals", args)?;
    Ok(Value::list(map.as_hashmap()?.values().cloned().collect()))
}

//
// Atoms
//

fn builtin_atom(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [value] = exact::<1>("atom", args)?;
    Ok(Value::atom(value.clone()))
}

fn builtin_is_atom(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [value] = exact::<1>("atom?", args)?;
    Ok(Value::Bool(matches!(value, Value::Atom(_))))
}

fn builtin_deref(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [atom] = exact::<1>("deref", args)?;
    Ok(atom.as_atom()?.borrow().clone())
}

fn builtin_reset(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [atom, value] = exact::<2>("reset!", args)?;
    *atom.as_atom()?.borrow_mut() = value.clone();
    Ok(value.clone())
}

fn builtin_swap(args: &[Value], env: &Environment) -> Result<Value, Error> {
    let [atom, func, extra @ ..] = args else {
        return Err(Error::invalid_form("swap!", args));
    };
    let cell = Rc::clone(atom.as_atom()?);
    // The cell is not borrowed while the function runs, so it may touch the atom
    let current = cell.borrow().clone();
    let mut call_args = Vec::with_capacity(extra.len() + 1);
    call_args.push(current);
    call_args.extend_from_slice(extra);
    let updated = evaluator::apply(func, call_args, env)?;
    *cell.borrow_mut() = updated.clone();
    Ok(updated)
}

//
// Predicates and constructors
//

macro_rules! type_predicate {
    ($name:ident, $id:literal, $pattern:pat) => {
        fn $name(args: &[Value], _env: &Environment) -> Result<Value, Error> {
            let [value] = exact::<1>($id, args)?;
            Ok(Value::Bool(matches!(value, $pattern)))
        }
    };
}

type_predicate!(builtin_is_nil, "nil?", Value::Nil);
type_predicate!(builtin_is_true, "true?", Value::Bool(true));
type_predicate!(builtin_is_false, "false?", Value::Bool(false));
type_predicate!(builtin_is_symbol, "symbol?", Value::Symbol(_));
type_predicate!(builtin_is_keyword, "keyword?", Value::Keyword(_));
type_predicate!(builtin_is_string, "string?", Value::String(_));
type_predicate!(builtin_is_number, "number?", Value::Int(_));

fn builtin_is_fn(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [value] = exact::<1>("fn?", args)?;
    Ok(Value::Bool(
        matches!(value, Value::Callable(c) if !c.is_macro),
    ))
}

fn builtin_is_macro(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [value] = exact::<1>("macro?", args)?;
    Ok(Value::Bool(value.as_macro().is_some()))
}

fn builtin_symbol(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [name] = exact::<1>("symbol", args)?;
    Ok(Value::Symbol(name.as_str()?.to_owned()))
}

fn builtin_keyword(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [name] = exact::<1>("keyword", args)?;
    match name {
        Value::Keyword(_) => Ok(name.clone()),
        other => Ok(Value::Keyword(other.as_str()?.to_owned())),
    }
}

//
// Control
//

fn builtin_throw(args: &[Value], _env: &Environment) -> Result<Value, Error> {
    let [value] = exact::<1>("throw", args)?;
    Err(Error::Thrown(value.clone()))
}

fn builtin_apply(args: &[Value], env: &Environment) -> Result<Value, Error> {
    let [func, middle @ .., last] = args else {
        return Err(Error::invalid_form("apply", args));
    };
    let tail = seq_or_nil(last)?;
    let mut call_args = Vec::with_capacity(middle.len() + tail.len());
    call_args.extend_from_slice(middle);
    call_args.extend_from_slice(tail);
    evaluator::apply(func, call_args, env)
}

fn builtin_map(args: &[Value], env: &Environment) -> Result<Value, Error> {
    let [func, seq] = exact::<2>("map", args)?;
    let results = seq_or_nil(seq)?
        .iter()
        .map(|item| evaluator::apply(func, vec![item.clone()], env))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::list(results))
}

fn builtin_eval(args: &[Value], env: &Environment) -> Result<Value, Error> {
    let [form] = exact::<1>("eval", args)?;
    evaluator::eval(form, &env.root())
}

/// Global registry of all built-in operations.
static BUILTIN_OPS: LazyLock<Vec<BuiltinOp>> = LazyLock::new(|| {
    use Arity::{Any, AtLeast, Exact};

    fn op(name: &'static str, arity: Arity, func: NativeFn) -> BuiltinOp {
        BuiltinOp { name, func, arity }
    }

    vec![
        // Arithmetic and comparison
        op("+", Any, builtin_add),
        op("-", AtLeast(1), builtin_sub),
        op("*", Any, builtin_mul),
        op("/", AtLeast(2), builtin_div),
        op("<", AtLeast(2), builtin_lt),
        op("<=", AtLeast(2), builtin_le),
        op(">", AtLeast(2), builtin_gt),
        op(">=", AtLeast(2), builtin_ge),
        op("=", AtLeast(2), builtin_equal),
        // Printing, reading, files
        op("pr-str", Any, builtin_pr_str),
        op("str", Any, builtin_str),
        op("prn", Any, builtin_prn),
        op("println", Any, builtin_println),
        op("read-string", Exact(1), builtin_read_string),
        op("slurp", Exact(1), builtin_slurp),
        // Sequences
        op("list", Any, builtin_list),
        op("list?", Exact(1), builtin_is_list),
        op("vector", Any, builtin_vector),
        op("vector?", Exact(1), builtin_is_vector),
        op("vec", Exact(1), builtin_vec),
        op("sequential?", Exact(1), builtin_is_sequential),
        op("empty?", Exact(1), builtin_is_empty),
        op("count", Exact(1), builtin_count),
        op("cons", Exact(2), builtin_cons),
        op("concat", Any, builtin_concat),
        op("nth", Exact(2), builtin_nth),
        op("first", Exact(1), builtin_first),
        op("rest", Exact(1), builtin_rest),
        // Hashmaps
        op("hash-map", Any, builtin_hash_map),
        op("map?", Exact(1), builtin_is_map),
        op("assoc", AtLeast(1), builtin_assoc),
        op("dissoc", AtLeast(1), builtin_dissoc),
        op("get", Exact(2), builtin_get),
        op("contains?", Exact(2), builtin_contains),
        op("keys", Exact(1), builtin_keys),
        op("vals", Exact(1), builtin_vals),
        // Atoms
        op("atom", Exact(1), builtin_atom),
        op("atom?", Exact(1), builtin_is_atom),
        op("deref", Exact(1), builtin_deref),
        op("reset!", Exact(2), builtin_reset),
        op("swap!", AtLeast(2), builtin_swap),
        // Predicates and constructors
        op("nil?", Exact(1), builtin_is_nil),
        op("true?", Exact(1), builtin_is_true),
        op("false?", Exact(1), builtin_is_false),
        op("symbol?", Exact(1), builtin_is_symbol),
        op("symbol", Exact(1), builtin_symbol),
        op("keyword", Exact(1), builtin_keyword),
        op("keyword?", Exact(1), builtin_is_keyword),
        op("string?", Exact(1), builtin_is_string),
        op("number?", Exact(1), builtin_is_number),
        op("fn?", Exact(1), builtin_is_fn),
        op("macro?", Exact(1), builtin_is_macro),
        // Control
        op("throw", Exact(1), builtin_throw),
        op("apply", AtLeast(2), builtin_apply),
        op("map", Exact(2), builtin_map),
        op("eval", Exact(1), builtin_eval),
    ]
});

/// Lazy static map from name to BuiltinOp (private - use find_builtin_op)
static BUILTIN_BY_NAME: LazyLock<HashMap<&'static str, &'static BuiltinOp>> =
    LazyLock::new(|| {
        let ops: &'static [BuiltinOp] = BUILTIN_OPS.as_slice();
        ops.iter().map(|op| (op.name, op)).collect()
    });

/// Get all builtin operations (for internal use by evaluator)
pub(crate) fn get_builtin_ops() -> &'static [BuiltinOp] {
    BUILTIN_OPS.as_slice()
}

/// Find a builtin operation by name
pub fn find_builtin_op(name: &str) -> Option<&'static BuiltinOp> {
    BUILTIN_BY_NAME.get(name).copied()
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::ast::{kw, nil, sym, val};
    use crate::evaluator::create_global_env;

    /// Micro-helper for success cases in comprehensive tests
    fn success<T: Into<Value>>(value: T) -> Option<Value> {
        Some(val(value))
    }

    /// Invoke a builtin through the registry, validating arity first the
    /// same way environment registration does.
    fn call_builtin(name: &str, args: &[Value], env: &Environment) -> Result<Value, Error> {
        let op = find_builtin_op(name).unwrap();
        op.arity.validate(op.name, args.len())?;
        (op.func)(args, env)
    }

    fn map_of(pairs: &[Value]) -> Value {
        Value::hashmap_from_pairs(pairs).unwrap()
    }

    #[test]
    fn test_builtin_ops_registry() {
        let add_op = find_builtin_op("+").unwrap();
        assert_eq!(add_op.arity, Arity::Any);
        assert_eq!(find_builtin_op("nth").unwrap().arity, Arity::Exact(2));
        assert!(find_builtin_op("unknown").is_none());
        // Special forms are not builtins
        assert!(find_builtin_op("if").is_none());

        let all_ops = get_builtin_ops();
        let mut names: Vec<_> = all_ops.iter().map(|op| op.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), all_ops.len(), "builtin names must be unique");
        for op in all_ops {
            assert!(
                !crate::evaluator::is_special_form(op.name),
                "{} shadows a special form",
                op.name
            );
        }
    }

    #[test]
    fn test_registered_arities_are_enforced() {
        let env = create_global_env();
        for op in get_builtin_ops() {
            let func = env.lookup(op.name).unwrap();
            let wrong_count = match op.arity {
                Arity::Exact(n) => n + 1,
                Arity::AtLeast(0) | Arity::Any => continue,
                Arity::AtLeast(n) => n - 1,
            };
            let args = vec![nil(); wrong_count];
            match crate::evaluator::apply(&func, args, &env) {
                Err(Error::InvalidArgument(msg)) => {
                    assert!(
                        msg.starts_with(&format!("{}: expected {} arguments", op.name, op.arity)),
                        "{}: unexpected message {msg:?}",
                        op.name
                    );
                }
                other => panic!("{}: expected arity error, got {other:?}", op.name),
            }
        }
    }

    #[test]
    fn test_hashmap_builtins_keep_insertion_order() {
        let env = create_global_env();
        let map = call_builtin("hash-map", &[kw("b"), val(2), kw("a"), val(1)], &env).unwrap();
        assert_eq!(map.pr_str(true), "{:b 2 :a 1}");

        let grown = call_builtin("assoc", &[map.clone(), kw("c"), val(3), kw("b"), val(20)], &env)
            .unwrap();
        assert_eq!(grown.pr_str(true), "{:b 20 :a 1 :c 3}");
        assert_eq!(
            call_builtin("keys", &[grown.clone()], &env).unwrap(),
            val([kw("b"), kw("a"), kw("c")])
        );
        assert_eq!(
            call_builtin("vals", &[grown.clone()], &env).unwrap(),
            val([20, 1, 3])
        );

        let shrunk = call_builtin("dissoc", &[grown, kw("b")], &env).unwrap();
        assert_eq!(shrunk.pr_str(true), "{:a 1 :c 3}");
        // The source map is untouched
        assert_eq!(map.pr_str(true), "{:b 2 :a 1}");
    }

    #[test]
    #[expect(clippy::too_many_lines)] // Comprehensive test coverage is intentionally thorough
    fn test_builtin_function_implementations() {
        type TestCase = (&'static str, Result<Value, Error>, Option<Value>);

        let env = create_global_env();
        macro_rules! test {
            ($name:expr, $args:expr, $expected:expr) => {
                ($name, call_builtin($name, $args, &env), $expected)
            };
        }

        let int_list = val([1, 2, 3]);
        let int_vec = Value::vector(vec![val(1), val(2), val(3)]);
        let empty = val(Vec::<Value>::new());
        let small_map = map_of(&[kw("a"), val(1)]);
        let many_ones: Vec<Value> = (0..100).map(|_| val(1)).collect();
        let square =
            crate::evaluator::eval(&read_str("(fn* (x) (* x x))").unwrap().unwrap(), &env)
                .unwrap();
        let plus = env.lookup("+").unwrap();

        let test_cases: Vec<TestCase> = vec![
            // =================================================================
            // ARITHMETIC
            // =================================================================
            test!("+", &[], success(0)),
            test!("+", &[val(5)], success(5)),
            test!("+", &[val(1), val(2), val(3)], success(6)),
            test!("+", &many_ones, success(100)),
            test!("+", &[val(IntType::MAX), val(1)], None),
            test!("+", &[val(1), val("x")], None),
            test!("-", &[val(5)], success(-5)),
            test!("-", &[val(10), val(3), val(2)], success(5)),
            test!("-", &[val(IntType::MIN)], None),
            test!("-", &[], None),
            test!("*", &[], success(1)),
            test!("*", &[val(2), val(3), val(4)], success(24)),
            test!("*", &[val(IntType::MAX), val(2)], None),
            test!("/", &[val(20), val(2), val(5)], success(2)),
            test!("/", &[val(7), val(2)], success(3)),
            test!("/", &[val(-7), val(2)], success(-3)),
            test!("/", &[val(1), val(0)], None),
            test!("/", &[val(IntType::MIN), val(-1)], None),
            test!("/", &[val(1)], None),
            // =================================================================
            // COMPARISON AND EQUALITY
            // =================================================================
            test!("<", &[val(1), val(2), val(3)], success(true)),
            test!("<", &[val(1), val(3), val(2)], success(false)),
            test!("<=", &[val(3), val(3)], success(true)),
            test!(">", &[val(9), val(6), val(2)], success(true)),
            test!(">=", &[val(2), val(6)], success(false)),
            test!("<", &[val(1)], None),
            test!("<", &[val("a"), val(1)], None),
            test!("=", &[val(1), val(1)], success(true)),
            test!("=", &[int_list.clone(), val([1, 2, 3])], success(true)),
            test!("=", &[int_list.clone(), int_vec.clone()], success(false)),
            test!("=", &[nil(), val(false)], success(false)),
            test!("=", &[val("a"), sym("a")], success(false)),
            test!("=", &[small_map.clone(), map_of(&[kw("a"), val(1)])], success(true)),
            test!("=", &[val(1)], None),
            // =================================================================
            // PRINTING AND READING
            // =================================================================
            test!("pr-str", &[], success("")),
            test!("pr-str", &[val("a\"b"), val(1)], success("\"a\\\"b\" 1")),
            test!("str", &[val("a"), val(1), nil(), kw("k")], success("a1nil:k")),
            test!("str", &[val([val("x")])], success("(x)")),
            test!("prn", &[val(1)], Some(nil())),
            test!("println", &[val("text")], Some(nil())),
            test!("read-string", &[val("(+ 1 2)")], Some(val(vec![sym("+"), val(1), val(2)]))),
            test!("read-string", &[val(";; nothing")], Some(nil())),
            test!("read-string", &[val("(")], None),
            test!("read-string", &[val(1)], None),
            test!("slurp", &[val("/definitely/not/here.lisp")], None),
            // =================================================================
            // SEQUENCES
            // =================================================================
            test!("list", &[], Some(empty.clone())),
            test!("list", &[val(1), val(2), val(3)], Some(int_list.clone())),
            test!("list?", &[int_list.clone()], success(true)),
            test!("list?", &[int_vec.clone()], success(false)),
            test!("vector", &[val(1), val(2), val(3)], Some(int_vec.clone())),
            test!("vector?", &[int_vec.clone()], success(true)),
            test!("vec", &[int_list.clone()], Some(int_vec.clone())),
            test!("vec", &[nil()], Some(Value::vector(vec![]))),
            test!("sequential?", &[int_vec.clone()], success(true)),
            test!("sequential?", &[small_map.clone()], success(false)),
            test!("empty?", &[empty.clone()], success(true)),
            test!("empty?", &[nil()], success(true)),
            test!("empty?", &[int_vec.clone()], success(false)),
            test!("empty?", &[val(1)], None),
            test!("count", &[int_list.clone()], success(3)),
            test!("count", &[nil()], success(0)),
            test!("count", &[small_map.clone()], success(1)),
            test!("count", &[val(true)], None),
            test!("cons", &[val(0), int_vec.clone()], Some(val([0, 1, 2, 3]))),
            test!("cons", &[val(0), nil()], Some(val([0]))),
            test!("cons", &[val(0), val(1)], None),
            test!("concat", &[], Some(empty.clone())),
            test!("concat", &[int_list.clone(), nil(), int_vec.clone()], Some(val([1, 2, 3, 1, 2, 3]))),
            test!("nth", &[int_list.clone(), val(0)], success(1)),
            test!("nth", &[int_vec.clone(), val(2)], success(3)),
            test!("nth", &[int_list.clone(), val(3)], None),
            test!("nth", &[int_list.clone(), val(-1)], None),
            test!("first", &[int_vec.clone()], success(1)),
            test!("first", &[empty.clone()], Some(nil())),
            test!("first", &[nil()], Some(nil())),
            test!("rest", &[int_vec.clone()], Some(val([2, 3]))),
            test!("rest", &[empty.clone()], Some(empty.clone())),
            test!("rest", &[nil()], Some(empty.clone())),
            // =================================================================
            // HASHMAPS
            // =================================================================
            test!("hash-map", &[kw("a"), val(1)], Some(small_map.clone())),
            test!("hash-map", &[kw("a")], None),
            test!("map?", &[small_map.clone()], success(true)),
            test!("map?", &[int_list.clone()], success(false)),
            test!(
                "assoc",
                &[small_map.clone(), kw("b"), val(2)],
                Some(map_of(&[kw("a"), val(1), kw("b"), val(2)]))
            ),
            test!("assoc", &[small_map.clone(), kw("a"), val(9)], Some(map_of(&[kw("a"), val(9)]))),
            test!("assoc", &[small_map.clone(), kw("b")], None),
            test!("assoc", &[int_list.clone(), kw("b"), val(2)], None),
            test!("dissoc", &[small_map.clone(), kw("a"), kw("zz")], Some(map_of(&[]))),
            test!("get", &[small_map.clone(), kw("a")], success(1)),
            test!("get", &[small_map.clone(), kw("b")], Some(nil())),
            test!("get", &[nil(), kw("a")], Some(nil())),
            test!("get", &[val(1), kw("a")], None),
            test!("contains?", &[small_map.clone(), kw("a")], success(true)),
            test!("contains?", &[small_map.clone(), val("a")], success(false)),
            test!("keys", &[small_map.clone()], Some(val([kw("a")]))),
            test!("vals", &[small_map.clone()], Some(val([1]))),
            // =================================================================
            // PREDICATES AND CONSTRUCTORS
            // =================================================================
            test!("nil?", &[nil()], success(true)),
            test!("nil?", &[val(false)], success(false)),
            test!("true?", &[val(true)], success(true)),
            test!("true?", &[val(1)], success(false)),
            test!("false?", &[val(false)], success(true)),
            test!("false?", &[nil()], success(false)),
            test!("symbol?", &[sym("a")], success(true)),
            test!("symbol?", &[val("a")], success(false)),
            test!("symbol", &[val("abc")], Some(sym("abc"))),
            test!("symbol", &[val(1)], None),
            test!("keyword", &[val("k")], Some(kw("k"))),
            test!("keyword", &[kw("k")], Some(kw("k"))),
            test!("keyword?", &[kw("k")], success(true)),
            test!("keyword?", &[sym("k")], success(false)),
            test!("string?", &[val("s")], success(true)),
            test!("string?", &[kw("s")], success(false)),
            test!("number?", &[val(1)], success(true)),
            test!("number?", &[val("1")], success(false)),
            test!("fn?", &[plus.clone()], success(true)),
            test!("fn?", &[square.clone()], success(true)),
            test!("fn?", &[val(1)], success(false)),
            test!("macro?", &[square.clone()], success(false)),
            // =================================================================
            // CONTROL
            // =================================================================
            test!("throw", &[val(1)], None),
            test!("apply", &[plus.clone(), int_list.clone()], success(6)),
            test!("apply", &[plus.clone(), val(10), int_vec.clone()], success(16)),
            test!("apply", &[square.clone(), val([4])], success(16)),
            test!("apply", &[plus.clone(), val(1)], None),
            test!("apply", &[val(1), empty.clone()], None),
            test!("map", &[square.clone(), int_vec.clone()], Some(val([1, 4, 9]))),
            test!("map", &[square.clone(), nil()], Some(empty.clone())),
            test!("map", &[small_map.clone(), val([kw("a"), kw("b")])], Some(val([val(1), nil()]))),
            test!("eval", &[val(vec![sym("+"), val(1), val(2)])], success(3)),
            test!("eval", &[sym("undefined-symbol")], None),
            // Arity violations never reach the implementation
            test!("count", &[], None),
            test!("nth", &[int_list.clone()], None),
            test!("atom", &[val(1), val(2)], None),
        ];

        for (test_expr, result, expected) in test_cases {
            match (result, expected) {
                (Ok(actual), Some(expected_val)) => {
                    assert_eq!(actual, expected_val, "Failed for test case: {test_expr}");
                }
                (Err(_), None) => {} // Expected error
                (actual, expected) => panic!(
                    "Unexpected result for test case: {test_expr}\nGot: {actual:?}, Expected: {expected:?}"
                ),
            }
        }
    }

    #[test]
    fn test_atom_operations() {
        let env = create_global_env();
        let atom = call_builtin("atom", &[val(1)], &env).unwrap();
        assert_eq!(call_builtin("atom?", &[atom.clone()], &env).unwrap(), val(true));
        assert_eq!(call_builtin("deref", &[atom.clone()], &env).unwrap(), val(1));
        assert_eq!(call_builtin("reset!", &[atom.clone(), val(5)], &env).unwrap(), val(5));

        let plus = env.lookup("+").unwrap();
        assert_eq!(
            call_builtin("swap!", &[atom.clone(), plus, val(2), val(3)], &env).unwrap(),
            val(10)
        );
        assert_eq!(call_builtin("deref", &[atom.clone()], &env).unwrap(), val(10));

        assert!(matches!(
            call_builtin("deref", &[val(1)], &env),
            Err(Error::NotAtom(_))
        ));
        assert!(matches!(
            call_builtin("swap!", &[atom, val(1)], &env),
            Err(Error::NotCallable(_))
        ));
    }

    #[test]
    fn test_throw_carries_value() {
        let env = create_global_env();
        let payload = map_of(&[kw("code"), val(7)]);
        match call_builtin("throw", &[payload.clone()], &env) {
            Err(Error::Thrown(value)) => assert_eq!(value, payload),
            other => panic!("expected thrown value, got {other:?}"),
        }
    }

    #[test]
    fn test_typed_errors() {
        let env = create_global_env();
        let any = String::new;
        let test_cases: Vec<(&str, Vec<Value>, Error)> = vec![
            ("+", vec![val("x")], Error::NotInt(any())),
            ("nth", vec![val(1), val(0)], Error::NotList(any())),
            ("nth", vec![val([1]), val(5)], Error::InvalidArgument(any())),
            ("get", vec![val(1), val(1)], Error::NotHashmap(any())),
            ("symbol", vec![val(1)], Error::NotString(any())),
            ("/", vec![val(1), val(0)], Error::InvalidArgument(any())),
            ("count", vec![], Error::InvalidArgument(any())),
            ("read-string", vec![val(")")], Error::Parse(crate::ParseError::from_message(crate::ParseErrorKind::Unbalanced, ""))),
        ];
        for (name, args, expected) in test_cases {
            let err = call_builtin(name, &args, &env).unwrap_err();
            assert_eq!(
                std::mem::discriminant(&err),
                std::mem::discriminant(&expected),
                "{name}: unexpected error {err:?}"
            );
        }
    }

    #[test]
    fn test_slurp_reads_file() {
        let path = std::env::temp_dir().join(format!("treelisp-slurp-{}.txt", std::process::id()));
        std::fs::write(&path, "(+ 1 2)\n").unwrap();
        let env = create_global_env();
        let contents =
            call_builtin("slurp", &[val(path.to_string_lossy().into_owned())], &env).unwrap();
        assert_eq!(contents, val("(+ 1 2)\n"));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_arity_validation() {
        use Arity::*;

        Exact(2).validate("f", 2).unwrap();
        Exact(2).validate("f", 1).unwrap_err();
        Exact(2).validate("f", 3).unwrap_err();

        AtLeast(1).validate("f", 1).unwrap();
        AtLeast(1).validate("f", 2).unwrap();
        AtLeast(1).validate("f", 0).unwrap_err();

        Any.validate("f", 0).unwrap();
        Any.validate("f", 100).unwrap();

        match Exact(2).validate("nth", 1).unwrap_err() {
            Error::InvalidArgument(msg) => {
                assert_eq!(msg, "nth: expected 2 arguments, got 1");
            }
            other => panic!("Expected InvalidArgument, got {other:?}"),
        }
        match AtLeast(2).validate("apply", 0).unwrap_err() {
            Error::InvalidArgument(msg) => {
                assert_eq!(msg, "apply: expected at least 2 arguments, got 0");
            }
            other => panic!("Expected InvalidArgument, got {other:?}"),
        }
    }
}
