use std::cell::RefCell;
use std::panic;
use std::process::ExitCode;
use std::rc::Rc;

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;
use treelisp::Error;
use treelisp::ast::{CallableKind, Value};
use treelisp::builtinops::Arity;
use treelisp::evaluator::{self, Environment};

const PROMPT: &str = "user> ";

type Editor = Rc<RefCell<DefaultEditor>>;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let result = panic::catch_unwind(run);

    match result {
        Ok(code) => code,
        Err(panic_info) => {
            eprintln!("The interpreter encountered an unexpected error and must exit.");

            if let Some(msg) = panic_info.downcast_ref::<&str>() {
                eprintln!("Error: {msg}");
            } else if let Some(msg) = panic_info.downcast_ref::<String>() {
                eprintln!("Error: {msg}");
            } else {
                eprintln!("Error: Unknown panic occurred");
            }

            ExitCode::FAILURE
        }
    }
}

/// `treelisp [FILE [ARGS...]]`
fn run() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let env = evaluator::create_global_env();

    let editor = match DefaultEditor::new() {
        Ok(editor) => Rc::new(RefCell::new(editor)),
        Err(err) => {
            eprintln!("Could not initialize line editor: {err}");
            return ExitCode::FAILURE;
        }
    };
    register_readline(&env, &editor);

    match args.next() {
        Some(file) => {
            let argv = args.map(Value::String).collect();
            env.define("*ARGV*", Value::list(argv));
            run_file(&file, &env)
        }
        None => {
            let banner = "(println (str \"Mal [\" *host-language* \"]\"))";
            if let Err(err) = treelisp::rep(banner, &env) {
                println!("error: {err}");
            }
            println!("Type :help for commands, or Ctrl+D to exit.");
            run_repl(&editor, &env);
            ExitCode::SUCCESS
        }
    }
}

fn run_file(file: &str, env: &Environment) -> ExitCode {
    let path = Value::String(file.to_owned());
    let command = format!("(load-file {})", path.pr_str(true));
    match treelisp::rep(&command, env) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            println!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Next non-blank line; end of input and interrupts become [`Error::Stop`]
fn read_line(editor: &Editor, prompt: &str) -> Result<String, Error> {
    loop {
        let line = editor.borrow_mut().readline(prompt);
        match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => {
                let _ = editor.borrow_mut().add_history_entry(line.as_str());
                return Ok(line);
            }
            Err(ReadlineError::Eof | ReadlineError::Interrupted) => return Err(Error::Stop),
            Err(err) => {
                tracing::warn!(error = %err, "line editor failed");
                return Err(Error::Stop);
            }
        }
    }
}

/// `(readline prompt)`: the next line, or nil at end of input
fn register_readline(env: &Environment, editor: &Editor) {
    let editor = Rc::clone(editor);
    env.register_builtin("readline", Arity::Exact(1), move |args, _env| {
        let prompt = args[0].as_str()?;
        match read_line(&editor, prompt) {
            Ok(line) => Ok(Value::String(line)),
            Err(err) if err.is_stop() => Ok(Value::Nil),
            Err(err) => Err(err),
        }
    });
}

fn run_repl(editor: &Editor, env: &Environment) {
    loop {
        let line = match read_line(editor, PROMPT) {
            Ok(line) => line,
            Err(_) => break,
        };

        match line.trim() {
            ":help" => {
                print_help();
                continue;
            }
            ":env" => {
                print_environment(env);
                continue;
            }
            ":quit" | ":exit" => break,
            _ => {}
        }

        print_result(treelisp::rep(&line, env));
    }
    println!();
}

fn print_result(result: Result<Option<String>, Error>) {
    match result {
        Ok(Some(printed)) => println!("{printed}"),
        Ok(None) => {}
        Err(err) => println!("error: {err}"),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  :help      - Show this help message");
    println!("  :env       - Show current environment bindings");
    println!("  :quit      - Exit the interpreter");
    println!("  :exit      - Exit the interpreter");
    println!("  Ctrl+D     - Exit the interpreter");
    println!();
    println!("Special forms:");
    println!("  def! let* do if fn* quote quasiquote defmacro! macroexpand try*/catch*");
    println!();
    println!("Examples:");
    println!("  (def! fact (fn* (n) (if (= n 0) 1 (* n (fact (- n 1))))))");
    println!("  (let* [x 2 y (* x 3)] (+ x y))");
    println!("  `(1 ~(+ 1 1) ~@(list 3 4))");
    println!("  (try* (throw {{:code 7}}) (catch* e (get e :code)))");
    println!();
}

fn print_environment(env: &Environment) {
    let bindings = env.get_all_bindings();

    if bindings.is_empty() {
        println!("Environment is empty.");
        return;
    }

    println!("Environment bindings ({} total):", bindings.len());
    println!();

    // Separate built-in functions from user-defined values
    let mut builtins = Vec::new();
    let mut user_defined = Vec::new();

    for (name, value) in bindings {
        match &value {
            Value::Callable(c) if matches!(c.kind, CallableKind::Builtin { .. }) => {
                builtins.push(name);
            }
            _ => user_defined.push((name, value)),
        }
    }

    if !builtins.is_empty() {
        println!("Built-in functions ({}):", builtins.len());
        for row in builtins.chunks(4) {
            for name in row {
                print!("  {name:<15}");
            }
            println!();
        }
        println!();
    }

    if !user_defined.is_empty() {
        println!("User-defined values ({}):", user_defined.len());
        for (name, value) in user_defined {
            println!("  {name} = {value}");
        }
    }
}
