//! treelisp - a tree-walking interpreter for a small Lisp dialect
//!
//! The interpreter turns source text into a [`Value`](ast::Value), evaluates it
//! against a lexically scoped [`Environment`](evaluator::Environment), and prints
//! the result back to text:
//!
//! ```lisp
//! (def! fact (fn* (n) (if (= n 0) 1 (* n (fact (- n 1))))))
//! (let* (x 5) (+ x 1))                 ; sequential bindings
//! `(1 ~(+ 1 1) ~@(list 3 4))           ; quasiquote => (1 2 3 4)
//! (defmacro! unless (fn* (p a b) `(if ~p ~b ~a)))
//! (try* (throw {:code 7}) (catch* e (get e :code)))
//! ```
//!
//! ## Evaluation model
//!
//! - Tail positions (`let*` body, last form of `do`, `if` branches, lambda
//!   bodies, `try*` handlers) are run by a trampoline loop, so deep tail
//!   recursion does not grow the native stack.
//! - Everything else (operands, container elements, non-tail quasiquote
//!   parts, macro expansion results) recurses natively and is bounded by
//!   [`MAX_EVAL_DEPTH`].
//! - `throw` and interpreter errors unwind as `Err` values; `try*`/`catch*`
//!   is the only in-language recovery point.
//!
//! ## Modules
//!
//! - `ast`: the value algebra, printer, structural equality and hashing
//! - `reader`: text to value, a character-at-a-time state machine
//! - `evaluator`: the trampolined evaluator and the environment chain
//! - `builtinops`: the native function library and the Lisp prelude

use std::fmt;

use thiserror::Error;

use crate::ast::Value;

/// Maximum nesting of containers accepted by the reader
pub const MAX_PARSE_DEPTH: usize = 512;

/// Maximum nesting of non-tail evaluations.
/// Tail calls run inside the trampoline and never count toward this limit.
pub const MAX_EVAL_DEPTH: usize = 1000;

/// Categorizes the different kinds of reader failures.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ParseErrorKind {
    /// Invalid or unexpected syntax (bad escape sequence, misplaced reader macro)
    InvalidSyntax,
    /// Input ended before the form was complete (unterminated string, unclosed container)
    Incomplete,
    /// A closing delimiter with no matching opener, or of the wrong kind
    Unbalanced,
    /// A `{...}` literal with an odd number of entries
    OddMapEntries,
    /// More than one complete top-level form
    TrailingContent,
    /// Nesting exceeded the configured maximum depth
    TooDeeplyNested,
}

/// A structured error describing where and why reading failed.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Context snippet from the input around the failure (max 60 chars)
    pub context: Option<String>,
}

impl ParseError {
    /// Create a ParseError with a kind and message but no context
    pub fn from_message(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        ParseError {
            kind,
            message: message.into(),
            context: None,
        }
    }

    /// Create a ParseError with context extracted from input at a given char offset
    pub fn with_context(
        kind: ParseErrorKind,
        message: impl Into<String>,
        input: &str,
        error_offset: usize,
    ) -> Self {
        const MAX_CONTEXT: usize = 60;

        let context_start = error_offset.saturating_sub(20);
        let total_chars = input.chars().count();

        let context_str: String = input
            .chars()
            .skip(context_start)
            .take(MAX_CONTEXT)
            .collect();

        let mut display_context = String::new();
        if context_start > 0 {
            display_context.push_str("[...]");
        }
        display_context.push_str(&context_str);
        if context_start + context_str.chars().count() < total_chars {
            display_context.push_str("[...]");
        }

        // Keep the diagnostic on one line
        let display_context = display_context.replace('\n', "\\n").replace('\r', "");

        ParseError {
            kind,
            message: message.into(),
            context: Some(display_context),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(context) = &self.context {
            write!(f, " near '{context}'")?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Error taxonomy surfaced to the REPL boundary.
///
/// Every variant except [`Error::Thrown`] and [`Error::Stop`] is an
/// interpreter-raised failure; `catch*` sees those as their message string.
/// `Thrown` carries the value passed to `throw` and reaches `catch*` unchanged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("not callable: {0}")]
    NotCallable(String),
    #[error("expected int, got {0}")]
    NotInt(String),
    #[error("expected list, got {0}")]
    NotList(String),
    #[error("expected symbol, got {0}")]
    NotSymbol(String),
    #[error("expected string, got {0}")]
    NotString(String),
    #[error("expected atom, got {0}")]
    NotAtom(String),
    #[error("expected hashmap, got {0}")]
    NotHashmap(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("'{0}' not found")]
    NoSymbol(String),
    #[error("evaluation depth limit exceeded (max: {0})")]
    DepthLimit(usize),
    #[error("{}", .0.pr_str(true))]
    Thrown(Value),
    #[error("end of input")]
    Stop,
}

impl Error {
    /// Malformed special form or call: print the offending form
    pub(crate) fn invalid_form(form_name: &str, args: &[Value]) -> Self {
        let mut rendered = format!("({form_name}");
        for arg in args {
            rendered.push(' ');
            rendered.push_str(&arg.pr_str(true));
        }
        rendered.push(')');
        Error::InvalidArgument(rendered)
    }

    /// True for the end-of-input signal that must unwind past `try*`
    pub fn is_stop(&self) -> bool {
        matches!(self, Error::Stop)
    }
}

pub mod ast;
pub mod builtinops;
pub mod evaluator;
pub mod reader;

/// Read one line of source, evaluate it in `env` and print the result readably.
///
/// Returns `Ok(None)` when the input holds no form (blank or comment-only).
pub fn rep(input: &str, env: &evaluator::Environment) -> Result<Option<String>, Error> {
    match reader::read_str(input)? {
        Some(form) => {
            let result = evaluator::eval(&form, env)?;
            Ok(Some(result.pr_str(true)))
        }
        None => Ok(None),
    }
}
