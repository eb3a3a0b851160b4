//! Condition evaluation
//!
//! Pure evaluation of parsed [`Condition`]s against an event context, a bound
//! matrix coordinate and the status of upstream work.

use crate::core::{
    context::EventContext,
    expression::{Condition, Expr, Ident, Predicate, Value},
    state::Outcome,
};
use std::collections::BTreeMap;

/// Upstream status visible to `success()`, `failure()` and `cancelled()`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpstreamStatus {
    pub failed: bool,
    pub cancelled: bool,
}

impl UpstreamStatus {
    pub fn success(&self) -> bool {
        !self.failed && !self.cancelled
    }
}

/// Everything an expression can observe
#[derive(Debug, Clone)]
pub struct EvalContext<'a> {
    pub event: &'a EventContext,
    pub matrix: &'a BTreeMap<String, String>,
    pub runner_os: Option<&'a str>,
    pub status: UpstreamStatus,
    /// Combined outcome of each needed job
    pub needs: &'a BTreeMap<String, Outcome>,
}

/// Evaluate a condition to a boolean
pub fn evaluate(condition: &Condition, ctx: &EvalContext<'_>) -> bool {
    eval(condition.expr(), ctx).truthy()
}

/// Decide whether a job or step should run.
///
/// Without an explicit status function the condition is implicitly guarded by
/// `success()`, so upstream failures skip the work unless it opts in.
pub fn should_run(condition: Option<&Condition>, ctx: &EvalContext<'_>) -> bool {
    match condition {
        None => ctx.status.success(),
        Some(cond) if cond.uses_status() => evaluate(cond, ctx),
        Some(cond) => ctx.status.success() && evaluate(cond, ctx),
    }
}

fn eval(expr: &Expr, ctx: &EvalContext<'_>) -> Value {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Reference(ident) => Value::Str(lookup(ident, ctx)),
        Expr::Predicate { func, args } => Value::Bool(call(*func, args, ctx)),
        Expr::Comparison {
            negated,
            left,
            right,
        } => {
            let equal = eval(left, ctx).as_str() == eval(right, ctx).as_str();
            Value::Bool(equal != *negated)
        }
        Expr::Not(inner) => Value::Bool(!eval(inner, ctx).truthy()),
        // short-circuit
        Expr::And(left, right) => Value::Bool(eval(left, ctx).truthy() && eval(right, ctx).truthy()),
        Expr::Or(left, right) => Value::Bool(eval(left, ctx).truthy() || eval(right, ctx).truthy()),
    }
}

fn lookup(ident: &Ident, ctx: &EvalContext<'_>) -> String {
    match ident {
        Ident::EventName => ctx.event.event_name.clone(),
        Ident::Repository => ctx.event.repository.clone(),
        Ident::Ref => ctx.event.git_ref.clone(),
        Ident::RefName => ctx.event.ref_name().to_string(),
        Ident::Actor => ctx.event.actor.clone(),
        Ident::Pusher => ctx.event.pusher.clone(),
        Ident::RunnerOs => ctx.runner_os.unwrap_or_default().to_string(),
        Ident::Matrix(axis) => ctx.matrix.get(axis).cloned().unwrap_or_default(),
        Ident::NeedResult(job) => ctx
            .needs
            .get(job)
            .map(|o| o.as_str().to_string())
            .unwrap_or_default(),
    }
}

fn call(func: Predicate, args: &[Expr], ctx: &EvalContext<'_>) -> bool {
    match func {
        Predicate::Success => ctx.status.success(),
        Predicate::Failure => ctx.status.failed,
        Predicate::Cancelled => ctx.status.cancelled,
        Predicate::Always => true,
        Predicate::Contains | Predicate::StartsWith | Predicate::EndsWith => {
            let haystack = eval(&args[0], ctx);
            let needle = eval(&args[1], ctx);
            let (haystack, needle) = (haystack.as_str(), needle.as_str());
            match func {
                Predicate::Contains => haystack.contains(needle),
                Predicate::StartsWith => haystack.starts_with(needle),
                _ => haystack.ends_with(needle),
            }
        }
    }
}
