//! Shared helpers for treelisp integration tests.

#![allow(dead_code, unused_imports)]

pub use treelisp::Error;
pub use treelisp::ast::{Value, kw, nil, sym, val};
pub use treelisp::evaluator::{Environment, create_global_env, eval};
pub use treelisp::reader::read_str;

/// Read and evaluate one form in a fresh global environment
pub fn eval_str(input: &str) -> Result<Value, Error> {
    eval_str_with_env(input, &create_global_env())
}

/// Read and evaluate one form in `env`
pub fn eval_str_with_env(input: &str, env: &Environment) -> Result<Value, Error> {
    let form = read_str(input)?.ok_or_else(|| Error::InvalidArgument("empty input".into()))?;
    eval(&form, env)
}

/// Run each line through `rep`, returning the printed result of the last one
pub fn rep_all(lines: &[&str], env: &Environment) -> Result<Option<String>, Error> {
    let mut last = None;
    for line in lines {
        last = treelisp::rep(line, env)?;
    }
    Ok(last)
}

/// Assert that `input` prints as `expected` in a fresh environment
#[macro_export]
macro_rules! assert_prints {
    ($input:expr, $expected:expr) => {{
        let env = $crate::common::create_global_env();
        let printed = treelisp::rep($input, &env)
            .unwrap_or_else(|e| panic!("{} failed: {e}", $input));
        assert_eq!(printed.as_deref(), Some($expected), "input: {}", $input);
    }};
}
