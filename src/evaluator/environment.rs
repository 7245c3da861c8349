//! Lexical environments: a chain of mutable binding frames.
//!
//! Frames are shared through `Rc<RefCell<..>>` so closures, call frames and
//! builtins all observe the same bindings. A `def!` inside a closure body is
//! visible to every holder of that frame.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::Error;
use crate::ast::{Callable, Value};
use crate::builtinops::Arity;

/// Handle to one frame of the environment chain
#[derive(Clone)]
pub struct Environment {
    inner: Rc<RefCell<Frame>>,
}

struct Frame {
    bindings: HashMap<String, Value>,
    outer: Option<Environment>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment {
    /// Create an empty root environment
    pub fn new() -> Self {
        Environment {
            inner: Rc::new(RefCell::new(Frame {
                bindings: HashMap::new(),
                outer: None,
            })),
        }
    }

    /// Create an empty frame whose outer scope is `self`
    #[must_use]
    pub fn child(&self) -> Self {
        Environment {
            inner: Rc::new(RefCell::new(Frame {
                bindings: HashMap::new(),
                outer: Some(self.clone()),
            })),
        }
    }

    /// Bind `name` in this frame, replacing any previous binding here.
    /// Outer frames are never touched.
    pub fn define(&self, name: impl Into<String>, value: Value) {
        self.inner.borrow_mut().bindings.insert(name.into(), value);
    }

    /// Innermost binding of `name`, walking outward iteratively
    pub fn lookup(&self, name: &str) -> Option<Value> {
        let mut current = self.clone();
        loop {
            let outer = {
                let frame = current.inner.borrow();
                if let Some(value) = frame.bindings.get(name) {
                    return Some(value.clone());
                }
                frame.outer.clone()
            };
            current = outer?;
        }
    }

    pub fn lookup_or_fail(&self, name: &str) -> Result<Value, Error> {
        self.lookup(name)
            .ok_or_else(|| Error::NoSymbol(name.to_owned()))
    }

    /// The outermost frame of this chain (the global environment)
    pub fn root(&self) -> Environment {
        let mut current = self.clone();
        loop {
            let outer = current.inner.borrow().outer.clone();
            match outer {
                Some(env) => current = env,
                None => return current,
            }
        }
    }

    /// Build a call frame under `outer` binding `params` to `args`.
    ///
    /// A `&` in the parameter list binds the following symbol to a list of the
    /// remaining arguments (possibly empty). Without `&` the counts must match.
    pub fn bind(params: &Value, args: Vec<Value>, outer: &Environment) -> Result<Self, Error> {
        let param_list = params.as_list()?;
        let env = outer.child();
        let mut args = args.into_iter();
        let mut fixed = 0usize;

        let mut iter = param_list.iter();
        while let Some(param) = iter.next() {
            let name = param.as_symbol()?;
            if name == "&" {
                let rest_param = match (iter.next(), iter.next()) {
                    (Some(rest), None) => rest.as_symbol()?,
                    _ => {
                        return Err(Error::InvalidArgument(format!(
                            "'&' must be followed by exactly one parameter in {params}"
                        )));
                    }
                };
                env.define(rest_param, Value::list(args.collect()));
                return Ok(env);
            }
            match args.next() {
                Some(arg) => env.define(name, arg),
                None => {
                    return Err(Error::InvalidArgument(format!(
                        "expected {} arguments for {params}, got {fixed}",
                        param_list.len()
                    )));
                }
            }
            fixed += 1;
        }

        let extra = args.count();
        if extra > 0 {
            return Err(Error::InvalidArgument(format!(
                "expected {} arguments for {params}, got {}",
                param_list.len(),
                fixed + extra
            )));
        }
        Ok(env)
    }

    /// Register a native function under `name` with arity checking
    pub fn register_builtin<F>(&self, name: &str, arity: Arity, func: F)
    where
        F: Fn(&[Value], &Environment) -> Result<Value, Error> + 'static,
    {
        let id = name.to_owned();
        let checked = move |args: &[Value], env: &Environment| -> Result<Value, Error> {
            arity.validate(&id, args.len())?;
            func(args, env)
        };
        self.define(
            name,
            Value::Callable(Rc::new(Callable::builtin(name, Rc::new(checked)))),
        );
    }

    /// All visible bindings, inner frames shadowing outer ones, sorted by name
    pub fn get_all_bindings(&self) -> Vec<(String, Value)> {
        let mut frames = Vec::new();
        let mut current = Some(self.clone());
        while let Some(env) = current {
            current = env.inner.borrow().outer.clone();
            frames.push(env);
        }

        let mut bindings = HashMap::new();
        // Outermost first so inner definitions win
        for env in frames.iter().rev() {
            for (name, value) in &env.inner.borrow().bindings {
                bindings.insert(name.clone(), value.clone());
            }
        }

        let mut result: Vec<_> = bindings.into_iter().collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frame = self.inner.borrow();
        let mut names: Vec<_> = frame.bindings.keys().collect();
        names.sort();
        f.debug_struct("Environment")
            .field("bindings", &names)
            .field("has_outer", &frame.outer.is_some())
            .finish()
    }
}
