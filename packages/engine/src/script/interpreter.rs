// packages/engine/src/script/interpreter.rs
//! Tree-walking interpreter
//!
//! Runs on a dedicated thread with a large stack. Every statement and every
//! call draws from the execution's [`Budget`], which is also where
//! cancellation is observed, so a timed-out run unwinds at the next tick.

use crate::codec::Value;
use crate::functions::FunctionRef;
use crate::runtime::resource_limiter::ResourceLimits;
use crate::script::ast::*;
use crate::script::builtins;
use crate::script::instrument::{CallContext, Library};
use crate::tracking::{ErrorKind, ExecutionError, ExecutionTracker, StepOutcome};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Stack reserved for every interpreter thread
pub const INTERPRETER_STACK_BYTES: usize = 128 * 1024 * 1024;

/// An error raised by user code (catchable with `try`/`catch`)
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptError {
    pub kind: String,
    pub message: String,
    pub payload: Value,
}

impl ScriptError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            payload: Value::Null,
        }
    }

    /// Build the error for `raise <value>`
    ///
    /// A map with string `kind` and `message` fields (what `catch` binds and
    /// `error()` builds) keeps its kind, so re-raising is lossless.
    pub fn from_value(value: Value) -> Self {
        if let Value::Map(entries) = &value {
            if let (Some(Value::Str(kind)), Some(Value::Str(message))) =
                (entries.get("kind"), entries.get("message"))
            {
                return Self {
                    kind: kind.clone(),
                    message: message.clone(),
                    payload: entries.get("payload").cloned().unwrap_or(Value::Null),
                };
            }
        }

        match value {
            Value::Str(message) => Self::new("Error", message),
            other => Self {
                kind: "Error".to_string(),
                message: other.to_string(),
                payload: other,
            },
        }
    }

    /// The value bound by `catch`
    pub fn to_value(&self) -> Value {
        Value::map([
            ("kind", Value::str(&self.kind)),
            ("message", Value::str(&self.message)),
            ("payload", self.payload.clone()),
        ])
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Why a call did not return a value
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Raised by user code or a builtin; the only catchable fault
    Raised(ScriptError),
    /// A resource limit was hit
    Limit(String),
    /// The run was cancelled (timeout or preemption)
    Aborted(String),
    /// The host failed underneath the run
    Internal(String),
}

impl Fault {
    pub fn raise(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Fault::Raised(ScriptError::new(kind, message))
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::raise("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::raise("ValueError", message)
    }

    pub fn to_execution_error(&self) -> ExecutionError {
        match self {
            Fault::Raised(e) => {
                ExecutionError::new(ErrorKind::Runtime, &e.message).with_type(&e.kind)
            }
            Fault::Limit(msg) => ExecutionError::new(ErrorKind::ResourceLimit, msg),
            Fault::Aborted(msg) => ExecutionError::new(ErrorKind::Timeout, msg),
            Fault::Internal(msg) => ExecutionError::new(ErrorKind::Infrastructure, msg),
        }
    }

    pub fn step_outcome(&self) -> StepOutcome {
        match self {
            Fault::Aborted(reason) => StepOutcome::Aborted(reason.clone()),
            other => StepOutcome::Failed(other.to_execution_error()),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Raised(e) => write!(f, "{}", e),
            Fault::Limit(msg) => write!(f, "resource limit: {}", msg),
            Fault::Aborted(msg) => write!(f, "aborted: {}", msg),
            Fault::Internal(msg) => write!(f, "internal: {}", msg),
        }
    }
}

/// Instruction, memory and depth accounting shared by all threads of one run
#[derive(Debug)]
pub struct Budget {
    max_instructions: Option<u64>,
    used: AtomicU64,
    memory_limit: Option<usize>,
    live: AtomicUsize,
    max_call_depth: u32,
    cancel: CancellationToken,
}

impl Budget {
    pub fn new(limits: &ResourceLimits, cancel: CancellationToken) -> Self {
        Self {
            max_instructions: limits.max_instructions,
            used: AtomicU64::new(0),
            memory_limit: limits
                .memory_limit_mb
                .map(|mb| (mb as usize).saturating_mul(1024 * 1024)),
            live: AtomicUsize::new(0),
            max_call_depth: limits.max_call_depth,
            cancel,
        }
    }

    /// Consume one instruction and observe cancellation
    pub fn tick(&self) -> Result<(), Fault> {
        if self.cancel.is_cancelled() {
            return Err(Fault::Aborted("execution cancelled".to_string()));
        }

        let used = self.used.fetch_add(1, Ordering::Relaxed) + 1;
        match self.max_instructions {
            Some(max) if used > max => Err(Fault::Limit(format!(
                "instruction budget of {} exhausted",
                max
            ))),
            _ => Ok(()),
        }
    }

    pub fn charge(&self, bytes: usize) -> Result<(), Fault> {
        let live = self.live.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if let Some(limit) = self.memory_limit {
            if live > limit {
                self.live.fetch_sub(bytes, Ordering::AcqRel);
                return Err(self.memory_fault());
            }
        }
        Ok(())
    }

    pub fn release(&self, bytes: usize) {
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                Some(live.saturating_sub(bytes))
            });
    }

    /// Check that a temporary of `bytes` would fit next to the live values
    pub fn check_transient(&self, bytes: usize) -> Result<(), Fault> {
        match self.memory_limit {
            Some(limit) if self.live.load(Ordering::Acquire).saturating_add(bytes) > limit => {
                Err(self.memory_fault())
            }
            _ => Ok(()),
        }
    }

    fn memory_fault(&self) -> Fault {
        let mb = self.memory_limit.unwrap_or(0) / (1024 * 1024);
        Fault::Limit(format!("memory limit of {} MB exceeded", mb))
    }

    pub fn max_call_depth(&self) -> u32 {
        self.max_call_depth
    }

    pub fn instructions_used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn live_bytes(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Everything one execution shares across its call tree
pub struct ExecEnv {
    pub execution_id: String,
    pub tracker: Arc<ExecutionTracker>,
    pub library: Library,
    pub budget: Budget,

    /// Scratch directory for the `fs` module
    pub scratch: Option<PathBuf>,
}

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

/// Local variables of one call, charged against the memory budget
struct Frame<'a> {
    budget: &'a Budget,
    vars: HashMap<String, Value>,
    sizes: HashMap<String, usize>,
    charged: usize,
}

impl<'a> Frame<'a> {
    fn new(budget: &'a Budget) -> Self {
        Self {
            budget,
            vars: HashMap::new(),
            sizes: HashMap::new(),
            charged: 0,
        }
    }

    fn bind(&mut self, name: &str, value: Value) -> Result<(), Fault> {
        let size = value.approx_size();
        self.resize(name, size)?;
        self.vars.insert(name.to_string(), value);
        Ok(())
    }

    /// Re-account a variable after in-place mutation
    fn recharge(&mut self, name: &str) -> Result<(), Fault> {
        let size = self.vars.get(name).map(Value::approx_size).unwrap_or(0);
        self.resize(name, size)
    }

    fn resize(&mut self, name: &str, size: usize) -> Result<(), Fault> {
        let old = self.sizes.get(name).copied().unwrap_or(0);
        if size > old {
            self.budget.charge(size - old)?;
            self.charged += size - old;
        } else {
            self.budget.release(old - size);
            self.charged -= old - size;
        }
        self.sizes.insert(name.to_string(), size);
        Ok(())
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        self.budget.release(self.charged);
    }
}

/// Run a function body with already-checked arguments
pub(crate) fn invoke(ctx: &CallContext, def: &FnDef, args: Vec<Value>) -> Result<Value, Fault> {
    let mut interp = Interpreter {
        ctx,
        frame: Frame::new(&ctx.env.budget),
    };

    for (param, arg) in def.params.iter().zip(args) {
        interp.frame.bind(param, arg)?;
    }

    match interp.exec_block(&def.body)? {
        Flow::Return(value) => Ok(value),
        _ => Ok(Value::Null),
    }
}

struct Interpreter<'a> {
    ctx: &'a CallContext,
    frame: Frame<'a>,
}

impl Interpreter<'_> {
    fn exec_block(&mut self, block: &Block) -> Result<Flow, Fault> {
        for stmt in block {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_loop_body(&mut self, body: &Block) -> Result<Option<Flow>, Fault> {
        match self.exec_block(body)? {
            Flow::Break => Ok(Some(Flow::Normal)),
            Flow::Return(value) => Ok(Some(Flow::Return(value))),
            Flow::Normal | Flow::Continue => Ok(None),
        }
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow, Fault> {
        self.ctx.env.budget.tick()?;

        match stmt {
            Stmt::Let { name, value } => {
                let value = self.eval(value)?;
                self.frame.bind(name, value)?;
                Ok(Flow::Normal)
            }
            Stmt::Assign {
                target,
                path,
                value,
            } => {
                let value = self.eval(value)?;
                if !self.frame.vars.contains_key(target) {
                    return Err(undefined(target));
                }

                if path.is_empty() {
                    self.frame.bind(target, value)?;
                } else {
                    let keys = path
                        .iter()
                        .map(|e| self.eval(e))
                        .collect::<Result<Vec<_>, _>>()?;
                    let slot = self
                        .frame
                        .vars
                        .get_mut(target)
                        .ok_or_else(|| undefined(target))?;
                    assign_path(slot, &keys, value)?;
                    self.frame.recharge(target)?;
                }
                Ok(Flow::Normal)
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::Null,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Raise(value) => {
                let value = self.eval(value)?;
                Err(Fault::Raised(ScriptError::from_value(value)))
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond)?.is_truthy() {
                    self.exec_block(then)
                } else if let Some(otherwise) = otherwise {
                    self.exec_block(otherwise)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While { cond, body, .. } => {
                while self.eval(cond)?.is_truthy() {
                    self.ctx.env.budget.tick()?;
                    if let Some(flow) = self.exec_loop_body(body)? {
                        return Ok(flow);
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For { var, iter, body } => {
                let items = iterate(self.eval(iter)?)?;
                for item in items {
                    self.frame.bind(var, item)?;
                    if let Some(flow) = self.exec_loop_body(body)? {
                        return Ok(flow);
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Try {
                body,
                binding,
                handler,
            } => match self.exec_block(body) {
                Ok(flow) => Ok(flow),
                Err(Fault::Raised(error)) => {
                    self.frame.bind(binding, error.to_value())?;
                    self.exec_block(handler)
                }
                Err(other) => Err(other),
            },
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Expr(expr) => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            }
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, Fault> {
        match expr {
            Expr::Const(value) => Ok(value.clone()),
            Expr::Var(name) => self
                .frame
                .vars
                .get(name)
                .cloned()
                .ok_or_else(|| undefined(name)),
            Expr::List(items) => {
                let values = items
                    .iter()
                    .map(|e| self.eval(e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::List(values))
            }
            Expr::Map(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let value = self.eval(value)?;
                    map.insert(key.clone(), value);
                }
                Ok(Value::Map(map))
            }
            Expr::Unary { op, expr } => {
                let value = self.eval(expr)?;
                unary(*op, value)
            }
            Expr::Binary {
                op: BinaryOp::And,
                lhs,
                rhs,
            } => {
                let lhs = self.eval(lhs)?;
                if !lhs.is_truthy() {
                    return Ok(lhs);
                }
                self.eval(rhs)
            }
            Expr::Binary {
                op: BinaryOp::Or,
                lhs,
                rhs,
            } => {
                let lhs = self.eval(lhs)?;
                if lhs.is_truthy() {
                    return Ok(lhs);
                }
                self.eval(rhs)
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                binary(&self.ctx.env.budget, *op, lhs, rhs)
            }
            Expr::Index { target, index } => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                index_value(target, &index)
            }
            Expr::Call(call) => self.call(call),
        }
    }

    fn call(&mut self, call: &Call) -> Result<Value, Fault> {
        let args = call
            .args
            .iter()
            .map(|a| self.eval(a))
            .collect::<Result<Vec<_>, _>>()?;

        match &call.callee {
            Callee::Local(name) => match self.ctx.module.get(name) {
                Some(function) => function.call(self.ctx, args),
                None => builtins::call_builtin(self.ctx, name, args),
            },
            Callee::Module { module, member } => {
                builtins::call_module(self.ctx, module, member, args)
            }
            Callee::Remote { namespace, name } => {
                let target = FunctionRef::new(namespace, name);
                match self.ctx.env.library.get(&target) {
                    Some(function) => function.call_entry(self.ctx, args),
                    None => Err(Fault::raise(
                        "NameError",
                        format!("function '{}' is not available", target),
                    )),
                }
            }
        }
    }
}

fn undefined(name: &str) -> Fault {
    Fault::raise("NameError", format!("name '{}' is not defined", name))
}

/// Items visited by `for`: list items, sorted map keys, or characters
pub(crate) fn iterate(value: Value) -> Result<Vec<Value>, Fault> {
    match value {
        Value::List(items) => Ok(items),
        Value::Map(entries) => Ok(entries.into_keys().map(Value::Str).collect()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        other => Err(Fault::type_error(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

fn unary(op: UnaryOp, value: Value) -> Result<Value, Fault> {
    match (op, value) {
        (UnaryOp::Not, value) => Ok(Value::Bool(!value.is_truthy())),
        (UnaryOp::Neg, Value::Int(i)) => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| Fault::raise("OverflowError", "integer overflow")),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, other) => Err(Fault::type_error(format!(
            "bad operand type for unary -: '{}'",
            other.type_name()
        ))),
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn unsupported(op: BinaryOp, lhs: &Value, rhs: &Value) -> Fault {
    Fault::type_error(format!(
        "unsupported operand types for {}: '{}' and '{}'",
        op.symbol(),
        lhs.type_name(),
        rhs.type_name()
    ))
}

pub(crate) fn binary(budget: &Budget, op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, Fault> {
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(lhs == rhs)),
        BinaryOp::Ne => return Ok(Value::Bool(lhs != rhs)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(op, &lhs, &rhs)?;
            let result = match op {
                BinaryOp::Lt => ordering == CmpOrdering::Less,
                BinaryOp::Le => ordering != CmpOrdering::Greater,
                BinaryOp::Gt => ordering == CmpOrdering::Greater,
                _ => ordering != CmpOrdering::Less,
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    match (op, lhs, rhs) {
        (BinaryOp::Add, Value::Str(a), Value::Str(b)) => {
            budget.check_transient(a.len() + b.len())?;
            Ok(Value::Str(a + &b))
        }
        (BinaryOp::Add, Value::List(mut a), Value::List(b)) => {
            budget.check_transient(b.iter().map(Value::approx_size).sum())?;
            a.extend(b);
            Ok(Value::List(a))
        }
        (BinaryOp::Mul, Value::Str(s), Value::Int(n)) | (BinaryOp::Mul, Value::Int(n), Value::Str(s)) => {
            let count = usize::try_from(n.max(0)).unwrap_or(0);
            budget.check_transient(s.len().saturating_mul(count))?;
            Ok(Value::Str(s.repeat(count)))
        }
        (op, Value::Int(a), Value::Int(b)) => int_op(op, a, b),
        (op, lhs, rhs) => match (as_float(&lhs), as_float(&rhs)) {
            (Some(a), Some(b)) => float_op(op, a, b),
            _ => Err(unsupported(op, &lhs, &rhs)),
        },
    }
}

fn int_op(op: BinaryOp, a: i64, b: i64) -> Result<Value, Fault> {
    let overflow = || Fault::raise("OverflowError", "integer overflow");
    let result = match op {
        BinaryOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinaryOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinaryOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinaryOp::Div | BinaryOp::Rem if b == 0 => {
            return Err(Fault::raise("ZeroDivisionError", "division by zero"))
        }
        BinaryOp::Div => a.checked_div(b).ok_or_else(overflow)?,
        BinaryOp::Rem => a.checked_rem(b).ok_or_else(overflow)?,
        other => return Err(unsupported(other, &Value::Int(a), &Value::Int(b))),
    };
    Ok(Value::Int(result))
}

fn float_op(op: BinaryOp, a: f64, b: f64) -> Result<Value, Fault> {
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => {
            return Err(Fault::raise("ZeroDivisionError", "division by zero"))
        }
        BinaryOp::Div => a / b,
        BinaryOp::Rem => a % b,
        other => return Err(unsupported(other, &Value::Float(a), &Value::Float(b))),
    };
    Ok(Value::Float(result))
}

fn compare(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<CmpOrdering, Fault> {
    let ordering = match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => match (as_float(lhs), as_float(rhs)) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    };

    ordering.ok_or_else(|| {
        Fault::type_error(format!(
            "'{}' not supported between '{}' and '{}'",
            op.symbol(),
            lhs.type_name(),
            rhs.type_name()
        ))
    })
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let index = if index < 0 { index + len } else { index };
    if (0..len).contains(&index) {
        usize::try_from(index).ok()
    } else {
        None
    }
}

pub(crate) fn index_value(target: Value, index: &Value) -> Result<Value, Fault> {
    match (target, index) {
        (Value::List(mut items), Value::Int(i)) => match normalize_index(*i, items.len()) {
            Some(idx) => Ok(items.swap_remove(idx)),
            None => Err(Fault::raise("IndexError", "list index out of range")),
        },
        (Value::Map(mut entries), Value::Str(key)) => entries
            .remove(key)
            .ok_or_else(|| Fault::raise("KeyError", format!("'{}'", key))),
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            match normalize_index(*i, chars.len()) {
                Some(idx) => Ok(Value::Str(chars[idx].to_string())),
                None => Err(Fault::raise("IndexError", "string index out of range")),
            }
        }
        (target @ (Value::List(_) | Value::Str(_)), index) => Err(Fault::type_error(format!(
            "{} indices must be integers, not '{}'",
            target.type_name(),
            index.type_name()
        ))),
        (Value::Map(_), index) => Err(Fault::type_error(format!(
            "map keys must be strings, not '{}'",
            index.type_name()
        ))),
        (other, _) => Err(Fault::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn child_mut<'v>(value: &'v mut Value, key: &Value) -> Result<&'v mut Value, Fault> {
    match (value, key) {
        (Value::List(items), Value::Int(i)) => {
            let len = items.len();
            normalize_index(*i, len)
                .and_then(move |idx| items.get_mut(idx))
                .ok_or_else(|| Fault::raise("IndexError", "list index out of range"))
        }
        (Value::Map(entries), Value::Str(k)) => entries
            .get_mut(k)
            .ok_or_else(|| Fault::raise("KeyError", format!("'{}'", k))),
        (other, _) => Err(Fault::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

fn assign_path(slot: &mut Value, keys: &[Value], value: Value) -> Result<(), Fault> {
    let Some((last, prefix)) = keys.split_last() else {
        *slot = value;
        return Ok(());
    };

    let mut current = slot;
    for key in prefix {
        current = child_mut(current, key)?;
    }

    match (current, last) {
        (Value::List(items), Value::Int(i)) => {
            let idx = normalize_index(*i, items.len())
                .ok_or_else(|| Fault::raise("IndexError", "list assignment index out of range"))?;
            items[idx] = value;
            Ok(())
        }
        (Value::Map(entries), Value::Str(k)) => {
            entries.insert(k.clone(), value);
            Ok(())
        }
        (other, _) => Err(Fault::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::testing::run_source;
    use serde_json::json;

    fn eval_main(body: &str, input: serde_json::Value) -> Result<Value, Fault> {
        run_source(&format!("fn main(input) {{ {} }}", body), input).0
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval_main("return 1 + 2 * 3 - 4;", json!(null)), Ok(Value::Int(3)));
        assert_eq!(eval_main("return 7 / 2;", json!(null)), Ok(Value::Int(3)));
        assert_eq!(eval_main("return 7 % 3;", json!(null)), Ok(Value::Int(1)));
        assert_eq!(eval_main("return 1.5 * 2;", json!(null)), Ok(Value::Float(3.0)));
        assert_eq!(eval_main("return -input;", json!(4)), Ok(Value::Int(-4)));
    }

    #[test]
    fn test_division_by_zero_raises() {
        match eval_main("return 1 / 0;", json!(null)) {
            Err(Fault::Raised(e)) => assert_eq!(e.kind, "ZeroDivisionError"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_integer_overflow_raises() {
        match eval_main("return input * input;", json!(i64::MAX)) {
            Err(Fault::Raised(e)) => assert_eq!(e.kind, "OverflowError"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_string_and_list_operations() {
        assert_eq!(
            eval_main(r#"return "ab" + "cd";"#, json!(null)),
            Ok(Value::str("abcd"))
        );
        assert_eq!(
            eval_main(r#"return "ab" * 3;"#, json!(null)),
            Ok(Value::str("ababab"))
        );
        assert_eq!(
            eval_main("return [1] + [2, 3];", json!(null)),
            Ok(Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]))
        );
    }

    #[test]
    fn test_short_circuit_returns_operand() {
        assert_eq!(eval_main(r#"return null or "d";"#, json!(null)), Ok(Value::str("d")));
        assert_eq!(eval_main("return 0 and missing;", json!(null)), Ok(Value::Int(0)));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval_main("return 1 < 2.5;", json!(null)), Ok(Value::Bool(true)));
        assert_eq!(eval_main(r#"return "b" >= "a";"#, json!(null)), Ok(Value::Bool(true)));
        assert_eq!(eval_main("return 2 == 2.0;", json!(null)), Ok(Value::Bool(true)));
        assert!(matches!(
            eval_main(r#"return 1 < "a";"#, json!(null)),
            Err(Fault::Raised(e)) if e.kind == "TypeError"
        ));
    }

    #[test]
    fn test_indexing() {
        let input = json!({"items": [10, 20, 30], "name": "abc"});
        assert_eq!(eval_main(r#"return input["items"][-1];"#, input.clone()), Ok(Value::Int(30)));
        assert_eq!(eval_main(r#"return input["name"][1];"#, input.clone()), Ok(Value::str("b")));
        assert!(matches!(
            eval_main(r#"return input["missing"];"#, input.clone()),
            Err(Fault::Raised(e)) if e.kind == "KeyError"
        ));
        assert!(matches!(
            eval_main(r#"return input["items"][3];"#, input),
            Err(Fault::Raised(e)) if e.kind == "IndexError"
        ));
    }

    #[test]
    fn test_nested_assignment() {
        let result = eval_main(
            r#"let m = {"a": {"b": [1, 2]}}; m["a"]["b"][0] = 9; m["a"]["c"] = true; return m;"#,
            json!(null),
        );
        assert_eq!(
            result.map(|v| v.to_json()),
            Ok(json!({"a": {"b": [9, 2], "c": true}}))
        );
    }

    #[test]
    fn test_assignment_to_undefined_variable() {
        assert!(matches!(
            eval_main("x = 1; return x;", json!(null)),
            Err(Fault::Raised(e)) if e.kind == "NameError"
        ));
    }

    #[test]
    fn test_loops() {
        let source = r#"
            fn main(input) {
                let total = 0;
                for n in input {
                    if n == 3 { continue; }
                    if n > 4 { break; }
                    total = total + n;
                }
                let i = 0;
                while i < 3 { i = i + 1; }
                return total + i;
            }
        "#;
        let (result, _) = crate::script::testing::run_trusted(source, json!([1, 2, 3, 4, 5, 6]));
        assert_eq!(result, Ok(Value::Int(10)));
    }

    #[test]
    fn test_try_catch_binds_error() {
        let result = eval_main(
            r#"try { raise error("Custom", "bad"); } catch e { return e["kind"] + ":" + e["message"]; }"#,
            json!(null),
        );
        assert_eq!(result, Ok(Value::str("Custom:bad")));
    }

    #[test]
    fn test_reraise_preserves_kind() {
        match eval_main(
            r#"try { let x = 1 / 0; } catch e { raise e; }"#,
            json!(null),
        ) {
            Err(Fault::Raised(e)) => {
                assert_eq!(e.kind, "ZeroDivisionError");
                assert_eq!(e.message, "division by zero");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_raise_plain_value() {
        match eval_main(r#"raise "boom";"#, json!(null)) {
            Err(Fault::Raised(e)) => {
                assert_eq!(e.kind, "Error");
                assert_eq!(e.message, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_budget_instruction_limit() {
        let limits = ResourceLimits {
            max_instructions: Some(3),
            ..ResourceLimits::default()
        };
        let budget = Budget::new(&limits, CancellationToken::new());
        assert!(budget.tick().is_ok());
        assert!(budget.tick().is_ok());
        assert!(budget.tick().is_ok());
        assert!(matches!(budget.tick(), Err(Fault::Limit(_))));
    }

    #[test]
    fn test_budget_memory_accounting() {
        let limits = ResourceLimits {
            memory_limit_mb: Some(1),
            ..ResourceLimits::default()
        };
        let budget = Budget::new(&limits, CancellationToken::new());
        assert!(budget.charge(512 * 1024).is_ok());
        assert!(matches!(budget.charge(600 * 1024), Err(Fault::Limit(_))));
        assert_eq!(budget.live_bytes(), 512 * 1024);
        budget.release(512 * 1024);
        assert_eq!(budget.live_bytes(), 0);
    }

    #[test]
    fn test_budget_observes_cancellation() {
        let cancel = CancellationToken::new();
        let budget = Budget::new(&ResourceLimits::default(), cancel.clone());
        cancel.cancel();
        assert!(matches!(budget.tick(), Err(Fault::Aborted(_))));
    }

    #[test]
    fn test_frame_releases_memory_on_return() {
        let (result, _) = run_source(
            r#"fn build(n) { let s = "x" * n; return len(s); } fn main(input) { return build(input); }"#,
            json!(1000),
        );
        assert_eq!(result, Ok(Value::Int(1000)));
    }

    #[test]
    fn test_script_error_from_value() {
        let e = ScriptError::from_value(Value::Int(3));
        assert_eq!(e.kind, "Error");
        assert_eq!(e.message, "3");
        assert_eq!(e.payload, Value::Int(3));
    }
}
