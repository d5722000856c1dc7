// packages/engine/src/script/validator.rs
//! Static validation of submitted functions
//!
//! Runs before instrumentation and rejects anything outside the allow-list:
//! unknown or unentitled imports, dynamic evaluation primitives, calls that
//! do not resolve statically, and constructs the trust level forbids.

use crate::functions::{has_schema, requirement_name, Entitlement, Function, FunctionRef};
use crate::script::ast::*;
use crate::script::builtins::{self, ModuleClass};
use crate::utils::errors::{SourceLocation, ValidationError};
use jsonschema::JSONSchema;
use std::collections::{BTreeSet, HashMap, HashSet};

type CheckResult<T = ()> = std::result::Result<T, ValidationError>;

/// Deepest bracket nesting accepted before parsing
pub const MAX_EXPRESSION_NESTING: usize = 128;

/// Strictness derived from the function's trust level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationPolicy {
    pub max_source_bytes: usize,
    pub max_nesting: usize,
    pub allow_while: bool,
}

impl ValidationPolicy {
    pub const UNTRUSTED: ValidationPolicy = ValidationPolicy {
        max_source_bytes: 64 * 1024,
        max_nesting: 8,
        allow_while: false,
    };

    pub const TRUSTED: ValidationPolicy = ValidationPolicy {
        max_source_bytes: 1024 * 1024,
        max_nesting: 32,
        allow_while: true,
    };

    pub fn for_function(function: &Function) -> Self {
        if function.trusted {
            Self::TRUSTED
        } else {
            Self::UNTRUSTED
        }
    }
}

/// What validation learned about a program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Analysis {
    pub entry: String,
    pub imports: Vec<String>,
    pub remote_calls: Vec<FunctionRef>,
}

/// Checks that need only the raw source: size and bracket depth
pub fn check_source(source: &str, policy: &ValidationPolicy) -> CheckResult {
    if source.len() > policy.max_source_bytes {
        return Err(ValidationError::new(
            format!(
                "source is {} bytes, limit is {} bytes",
                source.len(),
                policy.max_source_bytes
            ),
            None,
        ));
    }

    let mut depth = 0usize;
    let mut in_string = false;
    let mut in_comment = false;
    let mut escaped = false;
    let (mut line, mut column) = (1usize, 0usize);

    for c in source.chars() {
        if c == '\n' {
            line += 1;
            column = 0;
            in_comment = false;
            continue;
        }
        column += 1;

        if in_comment {
            continue;
        }
        if in_string {
            match (escaped, c) {
                (true, _) => escaped = false,
                (false, '\\') => escaped = true,
                (false, '"') => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '#' => in_comment = true,
            '"' => in_string = true,
            '(' | '[' | '{' => {
                depth += 1;
                if depth > MAX_EXPRESSION_NESTING {
                    return Err(ValidationError::at(
                        format!("nesting deeper than {} levels", MAX_EXPRESSION_NESTING),
                        SourceLocation::new(line, column),
                    ));
                }
            }
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }

    Ok(())
}

/// Validate a parsed program against the function's declarations
pub fn validate(
    function: &Function,
    program: &Program,
    policy: &ValidationPolicy,
) -> CheckResult<Analysis> {
    format!("{}/{}", function.namespace, function.name)
        .parse::<FunctionRef>()
        .map_err(|e| ValidationError::new(e, None))?;

    check_schema("input", &function.input_schema)?;
    check_schema("output", &function.output_schema)?;

    if program.functions.is_empty() {
        return Err(ValidationError::new("no function is defined", None));
    }

    let mut arities = HashMap::new();
    for def in &program.functions {
        check_definition(def)?;
        if arities.insert(def.name.as_str(), def.params.len()).is_some() {
            return Err(ValidationError::at(
                format!("function '{}' is defined more than once", def.name),
                def.location,
            ));
        }
    }

    let imports = check_imports(function, program)?;

    let entry = program
        .function(&function.name)
        .or_else(|| program.functions.first())
        .ok_or_else(|| ValidationError::new("no entry function", None))?;
    if entry.params.len() > 2 {
        return Err(ValidationError::at(
            format!(
                "entry function '{}' takes at most 2 parameters (input, context)",
                entry.name
            ),
            entry.location,
        ));
    }

    let mut checker = Checker {
        function,
        policy,
        arities,
        imports: imports.iter().cloned().collect(),
        remote_calls: BTreeSet::new(),
        location: entry.location,
    };
    for def in &program.functions {
        checker.location = def.location;
        checker.check_block(&def.body, 1, false)?;
    }

    Ok(Analysis {
        entry: entry.name.clone(),
        imports,
        remote_calls: checker.remote_calls.into_iter().collect(),
    })
}

fn check_schema(which: &str, schema: &Option<serde_json::Value>) -> CheckResult {
    if let Some(schema) = schema.as_ref().filter(|_| has_schema(schema)) {
        JSONSchema::compile(schema).map_err(|e| {
            ValidationError::new(format!("invalid {} schema: {}", which, e), None)
        })?;
    }
    Ok(())
}

fn check_definition(def: &FnDef) -> CheckResult {
    if builtins::is_denied(&def.name) {
        return Err(ValidationError::at(
            format!("function name '{}' is reserved", def.name),
            def.location,
        ));
    }
    if builtins::is_builtin(&def.name) {
        return Err(ValidationError::at(
            format!("function '{}' shadows a builtin", def.name),
            def.location,
        ));
    }

    let mut seen = HashSet::new();
    for param in &def.params {
        if !seen.insert(param.as_str()) {
            return Err(ValidationError::at(
                format!("duplicate parameter '{}' in function '{}'", param, def.name),
                def.location,
            ));
        }
    }
    Ok(())
}

fn check_imports(function: &Function, program: &Program) -> CheckResult<Vec<String>> {
    let declared: HashSet<&str> = function
        .requirements
        .iter()
        .map(|r| requirement_name(r))
        .collect();

    let mut imports = Vec::new();
    for import in &program.imports {
        let module = import.module.as_str();
        let reject = |reason: String| ValidationError::at(reason, import.location);

        match builtins::classify(module) {
            None => return Err(reject(format!("unknown module '{}'", module))),
            Some(ModuleClass::Core) => {}
            Some(ModuleClass::Installable) => {
                if !declared.contains(module) {
                    return Err(reject(format!(
                        "module '{}' must be declared in requirements",
                        module
                    )));
                }
            }
            Some(ModuleClass::Privileged(entitlement)) => {
                check_entitlement(function, module, entitlement).map_err(reject)?;
            }
            Some(ModuleClass::Unavailable(entitlement)) => {
                check_entitlement(function, module, entitlement).map_err(reject)?;
                return Err(reject(format!(
                    "module '{}' is not provided by this runtime",
                    module
                )));
            }
        }

        if !imports.iter().any(|m| m == module) {
            imports.push(module.to_string());
        }
    }
    Ok(imports)
}

fn check_entitlement(
    function: &Function,
    module: &str,
    entitlement: Entitlement,
) -> Result<(), String> {
    if !function.trusted {
        return Err(format!("module '{}' requires a trusted function", module));
    }
    if !function.has_entitlement(entitlement) {
        return Err(format!(
            "module '{}' requires the '{}' entitlement",
            module, entitlement
        ));
    }
    Ok(())
}

struct Checker<'a> {
    function: &'a Function,
    policy: &'a ValidationPolicy,
    arities: HashMap<&'a str, usize>,
    imports: HashSet<String>,
    remote_calls: BTreeSet<FunctionRef>,
    location: SourceLocation,
}

impl Checker<'_> {
    fn reject<T>(&self, reason: impl Into<String>) -> CheckResult<T> {
        Err(ValidationError::at(reason, self.location))
    }

    fn check_block(&mut self, block: &[Stmt], depth: usize, in_loop: bool) -> CheckResult {
        if depth > self.policy.max_nesting {
            return self.reject(format!(
                "nesting depth exceeds {}",
                self.policy.max_nesting
            ));
        }
        for stmt in block {
            self.check_stmt(stmt, depth, in_loop)?;
        }
        Ok(())
    }

    fn check_stmt(&mut self, stmt: &Stmt, depth: usize, in_loop: bool) -> CheckResult {
        match stmt {
            Stmt::Let { value, .. } => self.check_expr(value),
            Stmt::Assign { path, value, .. } => {
                for index in path {
                    self.check_expr(index)?;
                }
                self.check_expr(value)
            }
            Stmt::Return(value) => match value {
                Some(value) => self.check_expr(value),
                None => Ok(()),
            },
            Stmt::Raise(value) | Stmt::Expr(value) => self.check_expr(value),
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                self.check_expr(cond)?;
                self.check_block(then, depth + 1, in_loop)?;
                match otherwise.as_deref() {
                    Some([chained @ Stmt::If { .. }]) => self.check_stmt(chained, depth, in_loop),
                    Some(block) => self.check_block(block, depth + 1, in_loop),
                    None => Ok(()),
                }
            }
            Stmt::While {
                cond,
                body,
                location,
            } => {
                self.location = *location;
                if !self.policy.allow_while {
                    return self.reject("'while' loops are not allowed in untrusted functions");
                }
                self.check_expr(cond)?;
                self.check_block(body, depth + 1, true)
            }
            Stmt::For { iter, body, .. } => {
                self.check_expr(iter)?;
                self.check_block(body, depth + 1, true)
            }
            Stmt::Try { body, handler, .. } => {
                self.check_block(body, depth + 1, in_loop)?;
                self.check_block(handler, depth + 1, in_loop)
            }
            Stmt::Break | Stmt::Continue if !in_loop => {
                self.reject("'break' or 'continue' outside of a loop")
            }
            Stmt::Break | Stmt::Continue => Ok(()),
        }
    }

    fn check_expr(&mut self, expr: &Expr) -> CheckResult {
        match expr {
            Expr::Const(_) | Expr::Var(_) => Ok(()),
            Expr::List(items) => items.iter().try_for_each(|e| self.check_expr(e)),
            Expr::Map(entries) => entries.iter().try_for_each(|(_, e)| self.check_expr(e)),
            Expr::Unary { expr, .. } => self.check_expr(expr),
            Expr::Binary { lhs, rhs, .. } => {
                self.check_expr(lhs)?;
                self.check_expr(rhs)
            }
            Expr::Index { target, index } => {
                self.check_expr(target)?;
                self.check_expr(index)
            }
            Expr::Call(call) => {
                self.location = call.location;
                self.check_call(call)?;
                call.args.iter().try_for_each(|e| self.check_expr(e))
            }
        }
    }

    fn check_call(&mut self, call: &Call) -> CheckResult {
        match &call.callee {
            Callee::Local(name) => {
                if builtins::is_denied(name) {
                    return self.reject(format!("call to '{}' is not allowed", name));
                }
                if let Some(&arity) = self.arities.get(name.as_str()) {
                    if arity != call.args.len() {
                        return self.reject(format!(
                            "{}() takes {} arguments but {} given",
                            name,
                            arity,
                            call.args.len()
                        ));
                    }
                    return Ok(());
                }
                if name == "parallel" {
                    return self.check_parallel(call);
                }
                if builtins::is_builtin(name) {
                    return Ok(());
                }
                self.reject(format!("unknown function '{}'", name))
            }
            Callee::Module { module, member } => {
                if !self.imports.contains(module) {
                    return self.reject(format!("module '{}' is not imported", module));
                }
                if !builtins::members(module).contains(&member.as_str()) {
                    return self.reject(format!(
                        "module '{}' has no member '{}'",
                        module, member
                    ));
                }
                Ok(())
            }
            Callee::Remote { namespace, name } => {
                if !self.function.may_call(namespace) {
                    return self.reject(format!(
                        "namespace '{}' is not enabled for this function",
                        namespace
                    ));
                }
                self.remote_calls.insert(FunctionRef::new(namespace, name));
                Ok(())
            }
        }
    }

    fn check_parallel(&self, call: &Call) -> CheckResult {
        match call.args.as_slice() {
            [Expr::Const(crate::codec::Value::Str(target)), _] => {
                if self.arities.contains_key(target.as_str()) {
                    Ok(())
                } else {
                    self.reject(format!(
                        "parallel() target '{}' is not defined in this submission",
                        target
                    ))
                }
            }
            _ => self.reject(
                "parallel() takes a function name as a string literal and a list of argument lists",
            ),
        }
    }
}
