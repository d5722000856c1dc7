// packages/engine/src/script/builtins.rs
//! Builtin functions and library modules
//!
//! Modules fall into four classes:
//! - **core** (`json`, `math`, `text`, `time`): always importable
//! - **installable** (`regex`, `base64`): must be declared as requirements
//! - **privileged** (`fs`): needs an entitlement and a trusted function
//! - **unavailable** (`net`, `process`): recognised but never provided

use crate::codec::{Blob, Value};
use crate::functions::Entitlement;
use crate::script::instrument::CallContext;
use crate::script::interpreter::{Fault, INTERPRETER_STACK_BYTES};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

/// Functions callable without an import
pub const BUILTINS: &[&str] = &[
    "len", "str", "int", "float", "keys", "values", "push", "range", "sleep", "parallel",
    "type_of", "contains", "error",
];

/// Dynamic evaluation and import primitives that are never callable
pub const DENIED_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "import_module",
    "__import__",
    "open",
    "system",
];

/// Upper bound on branches of one `parallel` call
pub const MAX_PARALLEL_BRANCHES: usize = 32;

const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleClass {
    Core,
    Installable,
    Privileged(Entitlement),
    Unavailable(Entitlement),
}

pub fn classify(module: &str) -> Option<ModuleClass> {
    match module {
        "json" | "math" | "text" | "time" => Some(ModuleClass::Core),
        "regex" | "base64" => Some(ModuleClass::Installable),
        "fs" => Some(ModuleClass::Privileged(Entitlement::Filesystem)),
        "net" => Some(ModuleClass::Unavailable(Entitlement::Network)),
        "process" => Some(ModuleClass::Unavailable(Entitlement::Process)),
        _ => None,
    }
}

/// Members exported by a module
pub fn members(module: &str) -> &'static [&'static str] {
    match module {
        "json" => &["encode", "decode"],
        "math" => &["abs", "min", "max", "floor", "ceil", "round", "sqrt", "pow"],
        "text" => &[
            "upper",
            "lower",
            "trim",
            "split",
            "join",
            "replace",
            "starts_with",
            "ends_with",
        ],
        "time" => &["now", "iso"],
        "regex" => &["is_match", "find_all", "replace"],
        "base64" => &["encode", "decode", "decode_text"],
        "fs" => &["read", "write", "exists", "list", "delete"],
        _ => &[],
    }
}

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

pub fn is_denied(name: &str) -> bool {
    DENIED_CALLS.contains(&name)
}

fn arity_error(name: &str, expected: &str, given: usize) -> Fault {
    Fault::type_error(format!(
        "{}() takes {} but {} {} given",
        name,
        expected,
        given,
        if given == 1 { "was" } else { "were" }
    ))
}

fn take<const N: usize>(name: &str, args: Vec<Value>) -> Result<[Value; N], Fault> {
    let given = args.len();
    <[Value; N]>::try_from(args).map_err(|_| {
        arity_error(
            name,
            &format!("{} argument{}", N, if N == 1 { "" } else { "s" }),
            given,
        )
    })
}

fn expect_str(name: &str, value: Value) -> Result<String, Fault> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(Fault::type_error(format!(
            "{}() expected str, got '{}'",
            name,
            other.type_name()
        ))),
    }
}

fn expect_number(name: &str, value: &Value) -> Result<f64, Fault> {
    match value {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(f) => Ok(*f),
        other => Err(Fault::type_error(format!(
            "{}() expected a number, got '{}'",
            name,
            other.type_name()
        ))),
    }
}

fn expect_list(name: &str, value: Value) -> Result<Vec<Value>, Fault> {
    match value {
        Value::List(items) => Ok(items),
        other => Err(Fault::type_error(format!(
            "{}() expected list, got '{}'",
            name,
            other.type_name()
        ))),
    }
}

/// Call a builtin by name
pub fn call_builtin(ctx: &CallContext, name: &str, args: Vec<Value>) -> Result<Value, Fault> {
    match name {
        "len" => {
            let [value] = take::<1>("len", args)?;
            let len = match &value {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.len(),
                Value::Map(entries) => entries.len(),
                Value::Blob(blob) => blob.data.len(),
                other => {
                    return Err(Fault::type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )))
                }
            };
            Ok(Value::Int(len as i64))
        }
        "str" => {
            let [value] = take::<1>("str", args)?;
            Ok(Value::Str(value.to_string()))
        }
        "int" => {
            let [value] = take::<1>("int", args)?;
            to_int(value)
        }
        "float" => {
            let [value] = take::<1>("float", args)?;
            to_float(value)
        }
        "keys" => match take::<1>("keys", args)? {
            [Value::Map(entries)] => Ok(Value::List(entries.into_keys().map(Value::Str).collect())),
            [other] => Err(Fault::type_error(format!(
                "keys() expected map, got '{}'",
                other.type_name()
            ))),
        },
        "values" => match take::<1>("values", args)? {
            [Value::Map(entries)] => Ok(Value::List(entries.into_values().collect())),
            [other] => Err(Fault::type_error(format!(
                "values() expected map, got '{}'",
                other.type_name()
            ))),
        },
        "push" => {
            let [list, item] = take::<2>("push", args)?;
            let mut items = expect_list("push", list)?;
            ctx.env.budget.check_transient(item.approx_size())?;
            items.push(item);
            Ok(Value::List(items))
        }
        "range" => range(ctx, args),
        "sleep" => {
            let [ms] = take::<1>("sleep", args)?;
            sleep(ctx, expect_number("sleep", &ms)?)
        }
        "parallel" => parallel(ctx, args),
        "type_of" => {
            let [value] = take::<1>("type_of", args)?;
            Ok(Value::str(value.type_name()))
        }
        "contains" => {
            let [container, item] = take::<2>("contains", args)?;
            let found = match (&container, &item) {
                (Value::List(items), item) => items.contains(item),
                (Value::Map(entries), Value::Str(key)) => entries.contains_key(key),
                (Value::Str(s), Value::Str(needle)) => s.contains(needle.as_str()),
                (other, item) => {
                    return Err(Fault::type_error(format!(
                        "contains() not supported for '{}' and '{}'",
                        other.type_name(),
                        item.type_name()
                    )))
                }
            };
            Ok(Value::Bool(found))
        }
        "error" => {
            let given = args.len();
            let mut args = args.into_iter();
            let (kind, message, payload) = match (args.next(), args.next(), args.next(), args.next()) {
                (Some(kind), Some(message), payload, None) => (kind, message, payload),
                _ => return Err(arity_error("error", "2 or 3 arguments", given)),
            };
            Ok(Value::map([
                ("kind", Value::str(expect_str("error", kind)?)),
                ("message", Value::str(expect_str("error", message)?)),
                ("payload", payload.unwrap_or(Value::Null)),
            ]))
        }
        other => Err(Fault::raise(
            "NameError",
            format!("name '{}' is not defined", other),
        )),
    }
}

fn to_int(value: Value) -> Result<Value, Fault> {
    match value {
        Value::Int(i) => Ok(Value::Int(i)),
        Value::Bool(b) => Ok(Value::Int(b as i64)),
        Value::Float(f) if f.is_finite() && f.abs() < 9.2e18 => Ok(Value::Int(f.trunc() as i64)),
        Value::Float(f) => Err(Fault::value_error(format!("cannot convert {} to int", f))),
        Value::Str(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| Fault::value_error(format!("invalid literal for int(): '{}'", s))),
        other => Err(Fault::type_error(format!(
            "int() argument must be a string or a number, not '{}'",
            other.type_name()
        ))),
    }
}

fn to_float(value: Value) -> Result<Value, Fault> {
    match value {
        Value::Int(i) => Ok(Value::Float(i as f64)),
        Value::Float(f) => Ok(Value::Float(f)),
        Value::Bool(b) => Ok(Value::Float(if b { 1.0 } else { 0.0 })),
        Value::Str(s) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| Fault::value_error(format!("could not convert string to float: '{}'", s))),
        other => Err(Fault::type_error(format!(
            "float() argument must be a string or a number, not '{}'",
            other.type_name()
        ))),
    }
}

fn range(ctx: &CallContext, args: Vec<Value>) -> Result<Value, Fault> {
    let given = args.len();
    let ints = args
        .into_iter()
        .map(|v| {
            v.as_int()
                .ok_or_else(|| Fault::type_error("range() arguments must be integers"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(arity_error("range", "1 to 3 arguments", given)),
    };
    if step == 0 {
        return Err(Fault::value_error("range() step must not be zero"));
    }

    let span = if step > 0 {
        (stop as i128 - start as i128).max(0)
    } else {
        (start as i128 - stop as i128).max(0)
    };
    let count = ((span + step.unsigned_abs() as i128 - 1) / step.unsigned_abs() as i128) as usize;
    ctx.env.budget.check_transient(count.saturating_mul(16))?;

    let mut items = Vec::with_capacity(count);
    let mut current = start;
    for _ in 0..count {
        items.push(Value::Int(current));
        current = current.saturating_add(step);
    }
    Ok(Value::List(items))
}

fn sleep(ctx: &CallContext, ms: f64) -> Result<Value, Fault> {
    if !ms.is_finite() || ms < 0.0 {
        return Err(Fault::value_error("sleep() duration must be a non-negative number"));
    }

    let deadline = Instant::now() + Duration::from_secs_f64(ms / 1000.0);
    loop {
        if ctx.env.budget.is_cancelled() {
            return Err(Fault::Aborted("execution cancelled".to_string()));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(Value::Null);
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

/// `parallel(name, [[args], ...])`: run one function per argument list on
/// concurrent threads, as siblings under the calling step
fn parallel(ctx: &CallContext, args: Vec<Value>) -> Result<Value, Fault> {
    let [name, batches] = take::<2>("parallel", args)?;
    let name = expect_str("parallel", name)?;
    let function = ctx
        .module
        .get(&name)
        .cloned()
        .ok_or_else(|| Fault::raise("NameError", format!("name '{}' is not defined", name)))?;

    let batches = expect_list("parallel", batches)?;
    if batches.len() > MAX_PARALLEL_BRANCHES {
        return Err(Fault::value_error(format!(
            "parallel() accepts at most {} branches",
            MAX_PARALLEL_BRANCHES
        )));
    }
    let arg_lists = batches
        .into_iter()
        .map(|batch| expect_list("parallel", batch))
        .collect::<Result<Vec<_>, _>>()?;

    let results: Vec<Result<Value, Fault>> = std::thread::scope(|scope| {
        let handles = arg_lists
            .into_iter()
            .map(|args| {
                let function = function.clone();
                std::thread::Builder::new()
                    .name("fnrt-parallel".to_string())
                    .stack_size(INTERPRETER_STACK_BYTES)
                    .spawn_scoped(scope, move || function.call(ctx, args))
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .map(|handle| match handle {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|_| Err(Fault::Internal("parallel branch panicked".to_string()))),
                Err(e) => Err(Fault::Internal(format!("failed to spawn parallel branch: {}", e))),
            })
            .collect()
    });

    let mut values = Vec::with_capacity(results.len());
    let mut first_raised = None;
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(Fault::Raised(e)) => {
                first_raised.get_or_insert(e);
            }
            Err(other) => return Err(other),
        }
    }

    match first_raised {
        Some(e) => Err(Fault::Raised(e)),
        None => Ok(Value::List(values)),
    }
}

/// Call `module.member(...)`
pub fn call_module(
    ctx: &CallContext,
    module: &str,
    member: &str,
    args: Vec<Value>,
) -> Result<Value, Fault> {
    match module {
        "json" => json_module(member, args),
        "math" => math_module(member, args),
        "text" => text_module(ctx, member, args),
        "time" => time_module(member, args),
        "regex" => regex_module(member, args),
        "base64" => base64_module(member, args),
        "fs" => fs_module(ctx, member, args),
        _ => Err(Fault::raise(
            "NameError",
            format!("module '{}' is not available", module),
        )),
    }
}

fn no_member(module: &str, member: &str) -> Fault {
    Fault::raise(
        "NameError",
        format!("module '{}' has no member '{}'", module, member),
    )
}

fn json_module(member: &str, args: Vec<Value>) -> Result<Value, Fault> {
    match member {
        "encode" => {
            let [value] = take::<1>("json.encode", args)?;
            if !value.is_encodable() {
                return Err(Fault::value_error("non-finite floats are not JSON encodable"));
            }
            serde_json::to_string(&value.to_json())
                .map(Value::Str)
                .map_err(|e| Fault::value_error(e.to_string()))
        }
        "decode" => {
            let [text] = take::<1>("json.decode", args)?;
            let text = expect_str("json.decode", text)?;
            serde_json::from_str::<serde_json::Value>(&text)
                .map(Value::from_json)
                .map_err(|e| Fault::value_error(format!("invalid JSON: {}", e)))
        }
        other => Err(no_member("json", other)),
    }
}

fn math_module(member: &str, args: Vec<Value>) -> Result<Value, Fault> {
    match member {
        "abs" => match take::<1>("math.abs", args)? {
            [Value::Int(i)] => i
                .checked_abs()
                .map(Value::Int)
                .ok_or_else(|| Fault::raise("OverflowError", "integer overflow")),
            [other] => Ok(Value::Float(expect_number("math.abs", &other)?.abs())),
        },
        "min" | "max" => {
            let name = if member == "min" { "math.min" } else { "math.max" };
            let items = match args.len() {
                1 => expect_list(name, args.into_iter().next().unwrap_or(Value::Null))?,
                _ => args,
            };
            let mut best: Option<Value> = None;
            for item in items {
                let number = expect_number(name, &item)?;
                let replace = match &best {
                    None => true,
                    Some(current) => {
                        let current = expect_number(name, current)?;
                        if member == "min" {
                            number < current
                        } else {
                            number > current
                        }
                    }
                };
                if replace {
                    best = Some(item);
                }
            }
            best.ok_or_else(|| Fault::value_error(format!("{}() arg is an empty sequence", name)))
        }
        "floor" | "ceil" | "round" => {
            let [value] = take::<1>(member, args)?;
            if let Value::Int(i) = value {
                return Ok(Value::Int(i));
            }
            let x = expect_number(member, &value)?;
            let rounded = match member {
                "floor" => x.floor(),
                "ceil" => x.ceil(),
                _ => x.round(),
            };
            to_int(Value::Float(rounded))
        }
        "sqrt" => {
            let [value] = take::<1>("math.sqrt", args)?;
            let x = expect_number("math.sqrt", &value)?;
            if x < 0.0 {
                return Err(Fault::value_error("math domain error"));
            }
            Ok(Value::Float(x.sqrt()))
        }
        "pow" => match take::<2>("math.pow", args)? {
            [Value::Int(base), Value::Int(exp)] if exp >= 0 => u32::try_from(exp)
                .ok()
                .and_then(|exp| base.checked_pow(exp))
                .map(Value::Int)
                .ok_or_else(|| Fault::raise("OverflowError", "integer overflow")),
            [base, exp] => Ok(Value::Float(
                expect_number("math.pow", &base)?.powf(expect_number("math.pow", &exp)?),
            )),
        },
        other => Err(no_member("math", other)),
    }
}

fn text_module(ctx: &CallContext, member: &str, args: Vec<Value>) -> Result<Value, Fault> {
    match member {
        "upper" | "lower" | "trim" => {
            let [s] = take::<1>(member, args)?;
            let s = expect_str(member, s)?;
            Ok(Value::Str(match member {
                "upper" => s.to_uppercase(),
                "lower" => s.to_lowercase(),
                _ => s.trim().to_string(),
            }))
        }
        "split" => {
            let [s, sep] = take::<2>("text.split", args)?;
            let s = expect_str("text.split", s)?;
            let sep = expect_str("text.split", sep)?;
            if sep.is_empty() {
                return Err(Fault::value_error("empty separator"));
            }
            Ok(Value::List(s.split(sep.as_str()).map(Value::str).collect()))
        }
        "join" => {
            let [items, sep] = take::<2>("text.join", args)?;
            let sep = expect_str("text.join", sep)?;
            let parts = expect_list("text.join", items)?
                .into_iter()
                .map(|v| expect_str("text.join", v))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Str(parts.join(&sep)))
        }
        "replace" => {
            let [s, from, to] = take::<3>("text.replace", args)?;
            let s = expect_str("text.replace", s)?;
            let from = expect_str("text.replace", from)?;
            let to = expect_str("text.replace", to)?;
            if from.is_empty() {
                return Err(Fault::value_error("empty pattern"));
            }
            let worst = s.len() / from.len() * to.len() + s.len();
            ctx.env.budget.check_transient(worst)?;
            Ok(Value::Str(s.replace(&from, &to)))
        }
        "starts_with" | "ends_with" => {
            let [s, affix] = take::<2>(member, args)?;
            let s = expect_str(member, s)?;
            let affix = expect_str(member, affix)?;
            Ok(Value::Bool(if member == "starts_with" {
                s.starts_with(&affix)
            } else {
                s.ends_with(&affix)
            }))
        }
        other => Err(no_member("text", other)),
    }
}

fn time_module(member: &str, args: Vec<Value>) -> Result<Value, Fault> {
    match member {
        "now" => {
            take::<0>("time.now", args)?;
            Ok(Value::Int(chrono::Utc::now().timestamp_millis()))
        }
        "iso" => {
            take::<0>("time.iso", args)?;
            Ok(Value::Str(chrono::Utc::now().to_rfc3339()))
        }
        other => Err(no_member("time", other)),
    }
}

fn compile_regex(pattern: &str) -> Result<regex::Regex, Fault> {
    regex::RegexBuilder::new(pattern)
        .size_limit(1 << 20)
        .build()
        .map_err(|e| Fault::value_error(format!("invalid pattern: {}", e)))
}

fn regex_module(member: &str, args: Vec<Value>) -> Result<Value, Fault> {
    match member {
        "is_match" => {
            let [pattern, s] = take::<2>("regex.is_match", args)?;
            let re = compile_regex(&expect_str("regex.is_match", pattern)?)?;
            Ok(Value::Bool(re.is_match(&expect_str("regex.is_match", s)?)))
        }
        "find_all" => {
            let [pattern, s] = take::<2>("regex.find_all", args)?;
            let re = compile_regex(&expect_str("regex.find_all", pattern)?)?;
            let s = expect_str("regex.find_all", s)?;
            Ok(Value::List(
                re.find_iter(&s).map(|m| Value::str(m.as_str())).collect(),
            ))
        }
        "replace" => {
            let [pattern, s, replacement] = take::<3>("regex.replace", args)?;
            let re = compile_regex(&expect_str("regex.replace", pattern)?)?;
            let s = expect_str("regex.replace", s)?;
            let replacement = expect_str("regex.replace", replacement)?;
            Ok(Value::Str(re.replace_all(&s, replacement.as_str()).into_owned()))
        }
        other => Err(no_member("regex", other)),
    }
}

fn base64_module(member: &str, args: Vec<Value>) -> Result<Value, Fault> {
    match member {
        "encode" => match take::<1>("base64.encode", args)? {
            [Value::Str(s)] => Ok(Value::Str(STANDARD.encode(s.as_bytes()))),
            [Value::Blob(blob)] => Ok(Value::Str(STANDARD.encode(&blob.data))),
            [other] => Err(Fault::type_error(format!(
                "base64.encode() expected str or blob, got '{}'",
                other.type_name()
            ))),
        },
        "decode" | "decode_text" => {
            let [encoded] = take::<1>(member, args)?;
            let bytes = STANDARD
                .decode(expect_str(member, encoded)?.as_bytes())
                .map_err(|e| Fault::value_error(format!("invalid base64: {}", e)))?;
            if member == "decode" {
                return Ok(Value::Blob(Blob::new("application/octet-stream", bytes)));
            }
            String::from_utf8(bytes)
                .map(Value::Str)
                .map_err(|_| Fault::value_error("decoded bytes are not valid UTF-8"))
        }
        other => Err(no_member("base64", other)),
    }
}

fn scratch_path(ctx: &CallContext, path: &str) -> Result<PathBuf, Fault> {
    let root = ctx
        .env
        .scratch
        .as_ref()
        .ok_or_else(|| Fault::Internal("filesystem scratch area unavailable".to_string()))?;

    let relative = Path::new(path);
    let confined = !path.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !confined {
        return Err(Fault::raise(
            "PermissionError",
            format!("path '{}' is outside the scratch directory", path),
        ));
    }
    Ok(root.join(relative))
}

fn io_fault(e: std::io::Error) -> Fault {
    Fault::raise("IOError", e.to_string())
}

fn fs_module(ctx: &CallContext, member: &str, args: Vec<Value>) -> Result<Value, Fault> {
    match member {
        "read" => {
            let [path] = take::<1>("fs.read", args)?;
            let path = scratch_path(ctx, &expect_str("fs.read", path)?)?;
            let size = std::fs::metadata(&path).map_err(io_fault)?.len();
            ctx.env
                .budget
                .check_transient(usize::try_from(size).unwrap_or(usize::MAX))?;
            std::fs::read_to_string(&path).map(Value::Str).map_err(io_fault)
        }
        "write" => {
            let [path, content] = take::<2>("fs.write", args)?;
            let path = scratch_path(ctx, &expect_str("fs.write", path)?)?;
            let bytes = match content {
                Value::Str(s) => s.into_bytes(),
                Value::Blob(blob) => blob.data,
                other => other.to_string().into_bytes(),
            };
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(io_fault)?;
            }
            std::fs::write(&path, bytes).map_err(io_fault)?;
            Ok(Value::Null)
        }
        "exists" => {
            let [path] = take::<1>("fs.exists", args)?;
            let path = scratch_path(ctx, &expect_str("fs.exists", path)?)?;
            Ok(Value::Bool(path.exists()))
        }
        "delete" => {
            let [path] = take::<1>("fs.delete", args)?;
            let path = scratch_path(ctx, &expect_str("fs.delete", path)?)?;
            std::fs::remove_file(&path).map_err(io_fault)?;
            Ok(Value::Null)
        }
        "list" => {
            take::<0>("fs.list", args)?;
            let root = ctx
                .env
                .scratch
                .as_ref()
                .ok_or_else(|| Fault::Internal("filesystem scratch area unavailable".to_string()))?;
            let mut names = std::fs::read_dir(root)
                .map_err(io_fault)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>();
            names.sort();
            Ok(Value::List(names.into_iter().map(Value::Str).collect()))
        }
        other => Err(no_member("fs", other)),
    }
}
