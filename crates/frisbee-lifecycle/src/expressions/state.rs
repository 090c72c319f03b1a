//! State expressions
//!
//! A state expression asks a question about the children of a parent:
//!
//! ```text
//! {{.IsSuccessful "svc0"}} == true && {{.NumFailedJobs}} < 2
//! ```
//!
//! Every `{{.Method "arg" ...}}` call is rendered against a read-only view of
//! the [`Classifier`], then the resulting text is evaluated as a boolean
//! expression. Only the query methods listed in [`StateView`] are callable.

use std::sync::{Arc, LazyLock};

use minijinja::value::{Object, Value, ValueKind};
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use regex::Regex;

use frisbee_common::Error;

use crate::classifier::Classifier;

/// Reasons reported by [`fired_state`]
pub mod reasons {
    /// The expression holds (or is empty)
    pub const STATE_OK: &str = "StateOK";
    /// The expression was evaluated and does not hold
    pub const INVALID_TRANSITION: &str = "InvalidTransition";
    /// The expression could not be evaluated
    pub const EXECUTION_ERROR: &str = "ExecutionError";
}

static METHOD_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\{\{\s*\.(?P<method>\w+)(?P<args>(?:\s+"[^"]*")*)\s*\}\}"#)
        .expect("method call syntax is a valid regex")
});

static QUOTED_ARG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"]*)""#).expect("quoted argument syntax is a valid regex"));

/// Result of evaluating a state expression
#[derive(Debug)]
pub struct StateOutcome {
    pub reason: &'static str,
    pub passed: bool,
    /// Set when the expression is malformed or cannot be evaluated.
    /// Such an expression never becomes true and must fail the parent.
    pub error: Option<Error>,
}

impl StateOutcome {
    fn ok() -> Self {
        Self {
            reason: reasons::STATE_OK,
            passed: true,
            error: None,
        }
    }

    fn not_yet() -> Self {
        Self {
            reason: reasons::INVALID_TRANSITION,
            passed: false,
            error: None,
        }
    }

    fn failed(error: Error) -> Self {
        Self {
            reason: reasons::EXECUTION_ERROR,
            passed: false,
            error: Some(error),
        }
    }
}

/// Query surface exposed to state expressions
#[derive(Debug)]
pub struct StateView {
    state: Classifier,
}

fn string_args(method: &str, args: &[Value]) -> Result<Vec<String>, minijinja::Error> {
    args.iter()
        .map(|v| {
            v.as_str().map(str::to_string).ok_or_else(|| {
                minijinja::Error::new(
                    ErrorKind::InvalidOperation,
                    format!("{method} expects job names, got {v}"),
                )
            })
        })
        .collect()
}

fn no_args(method: &str, args: &[Value]) -> Result<(), minijinja::Error> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(minijinja::Error::new(
            ErrorKind::TooManyArguments,
            format!("{method} takes no arguments"),
        ))
    }
}

impl Object for StateView {
    fn call_method(
        self: &Arc<Self>,
        _state: &minijinja::State<'_, '_>,
        method: &str,
        args: &[Value],
    ) -> Result<Value, minijinja::Error> {
        let s = &self.state;
        let value = match method {
            "IsPending" => Value::from(s.is_pending(&string_args(method, args)?)),
            "IsRunning" => Value::from(s.is_running(&string_args(method, args)?)),
            "IsSuccessful" => Value::from(s.is_successful(&string_args(method, args)?)),
            "IsFailed" => Value::from(s.is_failed(&string_args(method, args)?)),
            "IsTerminating" => Value::from(s.is_terminating(&string_args(method, args)?)),
            "NumPendingJobs" => no_args(method, args).map(|_| Value::from(s.num_pending_jobs()))?,
            "NumRunningJobs" => no_args(method, args).map(|_| Value::from(s.num_running_jobs()))?,
            "NumSuccessfulJobs" => {
                no_args(method, args).map(|_| Value::from(s.num_successful_jobs()))?
            }
            "NumFailedJobs" => no_args(method, args).map(|_| Value::from(s.num_failed_jobs()))?,
            "NumTerminatingJobs" => {
                no_args(method, args).map(|_| Value::from(s.num_terminating_jobs()))?
            }
            "Count" => no_args(method, args).map(|_| Value::from(s.count()))?,
            _ => {
                return Err(minijinja::Error::new(
                    ErrorKind::UnknownMethod,
                    format!("'{method}' is not a known query"),
                ))
            }
        };
        Ok(value)
    }
}

/// Rewrite `{{.Method "a" "b"}}` into `{{ state.Method("a", "b") }}`
fn rewrite_calls(expr: &str) -> String {
    METHOD_CALL
        .replace_all(expr, |caps: &regex::Captures<'_>| {
            let args: Vec<String> = QUOTED_ARG
                .captures_iter(&caps["args"])
                .map(|a| format!("{:?}", &a[1]))
                .collect();
            format!("{{{{ state.{}({}) }}}}", &caps["method"], args.join(", "))
        })
        .into_owned()
}

/// Spell the C-style boolean operators the way the expression engine expects
fn rewrite_operators(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('&', Some('&')) => {
                chars.next();
                out.push_str(" and ");
            }
            ('|', Some('|')) => {
                chars.next();
                out.push_str(" or ");
            }
            ('!', Some('=')) => out.push('!'),
            ('!', _) => out.push_str(" not "),
            _ => out.push(c),
        }
    }
    out
}

fn evaluate(expr: &str, state: &Classifier) -> Result<bool, Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);

    let view = Value::from_object(StateView {
        state: state.clone(),
    });

    let rendered = env
        .render_str(&rewrite_calls(expr), minijinja::context! { state => view })
        .map_err(|e| Error::expression(expr, format!("dereference error: {e}")))?;

    let value = env
        .compile_expression(&rewrite_operators(&rendered))
        .and_then(|compiled| compiled.eval(()))
        .map_err(|e| Error::expression(expr, format!("cannot evaluate '{rendered}': {e}")))?;

    if value.kind() != ValueKind::Bool {
        return Err(Error::expression(
            expr,
            format!("'{rendered}' evaluates to {value}, not to a boolean"),
        ));
    }
    Ok(value.is_true())
}

/// Evaluate a state expression against the classified children.
///
/// An empty expression passes.
pub fn fired_state(expr: &str, state: &Classifier) -> StateOutcome {
    if expr.trim().is_empty() {
        return StateOutcome::ok();
    }

    match evaluate(expr, state) {
        Ok(true) => StateOutcome::ok(),
        Ok(false) => StateOutcome::not_yet(),
        Err(e) => StateOutcome::failed(e),
    }
}
