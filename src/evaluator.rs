//! The trampolined evaluator.
//!
//! [`eval`] reduces a `(form, environment)` pair in a loop. Special forms and
//! lambda calls in tail position hand back a new pair ([`Step::Eval`]) instead
//! of recursing, so tail recursion runs in constant native stack. Operands,
//! container elements, non-tail quasiquote parts and macro expansion results
//! recurse natively and are bounded by [`MAX_EVAL_DEPTH`]. The bound also
//! holds across builtins that call back into the evaluator (`apply`, `map`,
//! `swap!`, `eval`): they continue from the depth of the form that called
//! them.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::LazyLock;

use indexmap::IndexMap;

use crate::ast::{Callable, Value};
use crate::builtinops::{PRELUDE, get_builtin_ops};
use crate::{Error, MAX_EVAL_DEPTH};

mod environment;

pub use environment::Environment;

/// Outcome of one reduction step: a final value, or a continuation to run
/// in the caller's loop.
#[derive(Debug, Clone)]
pub enum Step {
    Eval(Value, Environment),
    Return(Value),
}

/// Special form handler: receives the unevaluated operands, the current
/// environment and the current non-tail nesting depth.
type SpecialForm = fn(&[Value], &Environment, usize) -> Result<Step, Error>;

static SPECIAL_FORMS: LazyLock<HashMap<&'static str, SpecialForm>> = LazyLock::new(|| {
    let forms: [(&'static str, SpecialForm); 10] = [
        ("def!", eval_def),
        ("let*", eval_let),
        ("do", eval_do),
        ("if", eval_if),
        ("fn*", eval_fn),
        ("quote", eval_quote),
        ("quasiquote", eval_quasiquote),
        ("defmacro!", eval_defmacro),
        ("macroexpand", eval_macroexpand),
        ("try*", eval_try),
    ];
    forms.into_iter().collect()
});

/// True if `name` is handled by the evaluator rather than looked up
pub fn is_special_form(name: &str) -> bool {
    SPECIAL_FORMS.contains_key(name)
}

/// Free stack below which a nested evaluation switches to a fresh segment
const STACK_RED_ZONE: usize = 128 * 1024;
/// Size of each stack segment allocated on demand
const STACK_SEGMENT: usize = 2 * 1024 * 1024;

thread_local! {
    /// Depth a nested evaluation started from a builtin continues at
    static NESTED_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Publishes the depth of the running evaluation for the duration of one
/// trampoline call and restores the previous value afterwards.
struct DepthScope {
    previous: usize,
}

impl DepthScope {
    fn enter(depth: usize) -> Self {
        DepthScope {
            previous: NESTED_DEPTH.replace(depth + 1),
        }
    }
}

impl Drop for DepthScope {
    fn drop(&mut self) {
        NESTED_DEPTH.set(self.previous);
    }
}

/// Evaluate a form.
///
/// At top level this starts at depth 0; called from inside a builtin it
/// continues below the form that invoked the builtin.
pub fn eval(expr: &Value, env: &Environment) -> Result<Value, Error> {
    eval_with_depth_tracking(expr.clone(), env.clone(), NESTED_DEPTH.get())
}

/// Apply a callable (or hashmap) to already evaluated arguments, running any
/// lambda body to completion. Used by builtins that call back into the
/// language (`apply`, `map`, `swap!`).
pub fn apply(func: &Value, args: Vec<Value>, env: &Environment) -> Result<Value, Error> {
    match func.call(args, env)? {
        Step::Return(value) => Ok(value),
        Step::Eval(body, call_env) => {
            eval_with_depth_tracking(body, call_env, NESTED_DEPTH.get())
        }
    }
}

/// The trampoline. `depth` counts enclosing non-tail evaluations only.
fn eval_with_depth_tracking(expr: Value, env: Environment, depth: usize) -> Result<Value, Error> {
    if depth >= MAX_EVAL_DEPTH {
        return Err(Error::DepthLimit(MAX_EVAL_DEPTH));
    }
    stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT, || {
        let _scope = DepthScope::enter(depth);
        trampoline(expr, env, depth)
    })
}

fn trampoline(mut expr: Value, mut env: Environment, depth: usize) -> Result<Value, Error> {
    loop {
        if !matches!(expr, Value::List(_)) {
            return eval_ast(&expr, &env, depth);
        }

        expr = macroexpand(expr, &env, depth)?;
        let items = match &expr {
            Value::List(items) => Rc::clone(items),
            _ => return eval_ast(&expr, &env, depth),
        };

        let Some(head) = items.first() else {
            return Ok(expr);
        };

        let special_form = match head {
            Value::Symbol(name) => SPECIAL_FORMS.get(name.as_str()).copied(),
            _ => None,
        };
        let step = match special_form {
            Some(form) => form(&items[1..], &env, depth)?,
            None => {
                let func = eval_with_depth_tracking(head.clone(), env.clone(), depth + 1)?;
                let args = eval_items(&items[1..], &env, depth)?;
                func.call(args, &env)?
            }
        };

        match step {
            Step::Return(value) => return Ok(value),
            Step::Eval(next_expr, next_env) => {
                tracing::trace!(depth, expr = %next_expr, "tail continuation");
                expr = next_expr;
                env = next_env;
            }
        }
    }
}

/// Evaluate a non-list form: symbol lookup, or element-wise evaluation of a
/// container into a new container of the same kind.
fn eval_ast(expr: &Value, env: &Environment, depth: usize) -> Result<Value, Error> {
    match expr {
        Value::Symbol(name) => env.lookup_or_fail(name),
        Value::List(items) => Ok(Value::list(eval_items(items, env, depth)?)),
        Value::Vector(items) => Ok(Value::vector(eval_items(items, env, depth)?)),
        Value::Hashmap(map) => {
            let evaluated = map
                .iter()
                .map(|(k, v)| {
                    Ok((
                        eval_with_depth_tracking(k.clone(), env.clone(), depth + 1)?,
                        eval_with_depth_tracking(v.clone(), env.clone(), depth + 1)?,
                    ))
                })
                .collect::<Result<IndexMap<_, _>, Error>>()?;
            Ok(Value::hashmap(evaluated))
        }
        _ => Ok(expr.clone()),
    }
}

fn eval_items(items: &[Value], env: &Environment, depth: usize) -> Result<Vec<Value>, Error> {
    items
        .iter()
        .map(|item| eval_with_depth_tracking(item.clone(), env.clone(), depth + 1))
        .collect()
}

/// The macro bound to the head symbol of `form`, if any
fn macro_call(form: &Value, env: &Environment) -> Option<Rc<Callable>> {
    let Value::List(items) = form else {
        return None;
    };
    let Some(Value::Symbol(name)) = items.first() else {
        return None;
    };
    env.lookup(name)?.as_macro().cloned()
}

/// Expand `form` until its head no longer names a macro
fn macroexpand(mut form: Value, env: &Environment, depth: usize) -> Result<Value, Error> {
    while let Some(mac) = macro_call(&form, env) {
        let args = match &form {
            Value::List(items) => items[1..].to_vec(),
            _ => break,
        };
        tracing::debug!(form = %form, "expanding macro");
        form = match mac.call(args, env)? {
            Step::Return(value) => value,
            Step::Eval(body, call_env) => eval_with_depth_tracking(body, call_env, depth + 1)?,
        };
    }
    Ok(form)
}

fn eval_def(args: &[Value], env: &Environment, depth: usize) -> Result<Step, Error> {
    let [name, value_expr] = args else {
        return Err(Error::invalid_form("def!", args));
    };
    let name = name.as_symbol()?;
    let value = eval_with_depth_tracking(value_expr.clone(), env.clone(), depth + 1)?;
    env.define(name, value.clone());
    Ok(Step::Return(value))
}

fn eval_let(args: &[Value], env: &Environment, depth: usize) -> Result<Step, Error> {
    let [bindings, body] = args else {
        return Err(Error::invalid_form("let*", args));
    };
    let Some(bindings) = bindings.as_sequence() else {
        return Err(Error::invalid_form("let*", args));
    };
    if bindings.len() % 2 != 0 {
        return Err(Error::invalid_form("let*", args));
    }

    let let_env = env.child();
    for pair in bindings.chunks_exact(2) {
        let name = pair[0].as_symbol()?;
        let value = eval_with_depth_tracking(pair[1].clone(), let_env.clone(), depth + 1)?;
        let_env.define(name, value);
    }
    Ok(Step::Eval(body.clone(), let_env))
}

fn eval_do(args: &[Value], env: &Environment, depth: usize) -> Result<Step, Error> {
    let Some((last, init)) = args.split_last() else {
        return Err(Error::invalid_form("do", args));
    };
    for expr in init {
        eval_with_depth_tracking(expr.clone(), env.clone(), depth + 1)?;
    }
    Ok(Step::Eval(last.clone(), env.clone()))
}

fn eval_if(args: &[Value], env: &Environment, depth: usize) -> Result<Step, Error> {
    let (condition, then_expr, else_expr) = match args {
        [c, t] => (c, t, None),
        [c, t, e] => (c, t, Some(e)),
        _ => return Err(Error::invalid_form("if", args)),
    };
    let condition = eval_with_depth_tracking(condition.clone(), env.clone(), depth + 1)?;
    match (condition.is_truthy(), else_expr) {
        (true, _) => Ok(Step::Eval(then_expr.clone(), env.clone())),
        (false, Some(e)) => Ok(Step::Eval(e.clone(), env.clone())),
        (false, None) => Ok(Step::Return(Value::Nil)),
    }
}

fn eval_fn(args: &[Value], env: &Environment, _depth: usize) -> Result<Step, Error> {
    let [params, body] = args else {
        return Err(Error::invalid_form("fn*", args));
    };
    let lambda = Callable::lambda(params.clone(), body.clone(), env.clone())?;
    Ok(Step::Return(Value::Callable(Rc::new(lambda))))
}

fn eval_quote(args: &[Value], _env: &Environment, _depth: usize) -> Result<Step, Error> {
    match args {
        [expr] => Ok(Step::Return(expr.clone())),
        _ => Err(Error::invalid_form("quote", args)),
    }
}

fn eval_quasiquote(args: &[Value], env: &Environment, depth: usize) -> Result<Step, Error> {
    match args {
        [expr] => quasiquote(expr, env, depth),
        _ => Err(Error::invalid_form("quasiquote", args)),
    }
}

/// Operand of `(tag x)` when `form` is exactly that shape, checking arity
fn tagged_operand<'a>(form: &'a [Value], tag: &str) -> Result<Option<&'a Value>, Error> {
    match form {
        [Value::Symbol(head), rest @ ..] if head == tag => match rest {
            [operand] => Ok(Some(operand)),
            _ => Err(Error::invalid_form(tag, rest)),
        },
        _ => Ok(None),
    }
}

/// Quasiquote expansion.
///
/// Anything that is not a non-empty sequence is returned as is. `(unquote y)`
/// becomes a tail continuation evaluating `y` in `env`. Any other sequence is
/// rebuilt as a list: `(splice-unquote y)` elements are evaluated and
/// flattened in place, other elements are expanded recursively and only
/// evaluated when their expansion is a continuation.
fn quasiquote(expr: &Value, env: &Environment, depth: usize) -> Result<Step, Error> {
    let Some(items) = expr.as_pair() else {
        return Ok(Step::Return(expr.clone()));
    };
    if depth >= MAX_EVAL_DEPTH {
        return Err(Error::DepthLimit(MAX_EVAL_DEPTH));
    }
    if let Some(operand) = tagged_operand(items, "unquote")? {
        return Ok(Step::Eval(operand.clone(), env.clone()));
    }

    let mut result = Vec::with_capacity(items.len());
    for item in items {
        if let Some(inner) = item.as_pair()
            && let Some(operand) = tagged_operand(inner, "splice-unquote")?
        {
            let spliced = eval_with_depth_tracking(operand.clone(), env.clone(), depth + 1)?;
            result.extend(spliced.as_list()?.iter().cloned());
            continue;
        }
        let expanded = stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT, || {
            quasiquote(item, env, depth + 1)
        })?;
        let element = match expanded {
            Step::Return(value) => value,
            Step::Eval(next, next_env) => eval_with_depth_tracking(next, next_env, depth + 1)?,
        };
        result.push(element);
    }
    Ok(Step::Return(Value::list(result)))
}

fn eval_defmacro(args: &[Value], env: &Environment, depth: usize) -> Result<Step, Error> {
    let [name, value_expr] = args else {
        return Err(Error::invalid_form("defmacro!", args));
    };
    let name = name.as_symbol()?;
    let value = eval_with_depth_tracking(value_expr.clone(), env.clone(), depth + 1)?;
    let macro_value = match &value {
        Value::Callable(c) if c.is_macro => value.clone(),
        Value::Callable(c) => Value::Callable(Rc::new(c.to_macro())),
        other => return Err(Error::NotCallable(other.pr_str(true))),
    };
    env.define(name, macro_value.clone());
    Ok(Step::Return(macro_value))
}

fn eval_macroexpand(args: &[Value], env: &Environment, depth: usize) -> Result<Step, Error> {
    match args {
        [expr] => Ok(Step::Return(macroexpand(expr.clone(), env, depth)?)),
        _ => Err(Error::invalid_form("macroexpand", args)),
    }
}

fn eval_try(args: &[Value], env: &Environment, depth: usize) -> Result<Step, Error> {
    let (body, handler) = match args {
        [body] => return Ok(Step::Eval(body.clone(), env.clone())),
        [body, Value::List(clause)] => match clause.as_slice() {
            [Value::Symbol(tag), binding, handler] if tag == "catch*" => {
                (body, (binding.as_symbol()?, handler))
            }
            _ => return Err(Error::invalid_form("try*", args)),
        },
        _ => return Err(Error::invalid_form("try*", args)),
    };

    match eval_with_depth_tracking(body.clone(), env.clone(), depth + 1) {
        Ok(value) => Ok(Step::Return(value)),
        Err(err) if err.is_stop() => Err(err),
        Err(err) => {
            let (binding, handler_expr) = handler;
            tracing::debug!(error = %err, "try* caught error");
            let caught = match err {
                Error::Thrown(value) => value,
                other => Value::String(other.to_string()),
            };
            let catch_env = env.child();
            catch_env.define(binding, caught);
            Ok(Step::Eval(handler_expr.clone(), catch_env))
        }
    }
}

/// Create a global environment with the builtin library and the prelude
pub fn create_global_env() -> Environment {
    let env = Environment::new();

    for op in get_builtin_ops() {
        env.register_builtin(op.name, op.arity, op.func);
    }
    env.define("*ARGV*", Value::list(Vec::new()));

    for source in PRELUDE {
        tracing::debug!(source, "loading prelude form");
        if let Err(err) = crate::rep(source, &env) {
            panic!("prelude form {source:?} failed: {err}");
        }
    }

    env
}
