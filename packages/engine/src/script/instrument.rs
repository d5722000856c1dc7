// packages/engine/src/script/instrument.rs
//! Interception layer
//!
//! Every function of a submission is wrapped in an [`Intercepted`] callable.
//! On entry the wrapper opens a step under the caller's [`TrackingContext`]
//! and hands the callee a child context; on exit it closes the step with the
//! return value or the fault. The wrapped function never sees the tracker.

use crate::codec::Value;
use crate::functions::{Function, FunctionRef};
use crate::script::ast::{FnDef, Program};
use crate::script::interpreter::{self, ExecEnv, Fault};
use crate::script::validator::Analysis;
use crate::tracking::{StepOutcome, TrackingContext};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Anything user code can call by name
pub trait Callable: Send + Sync {
    fn name(&self) -> &str;

    fn params(&self) -> &[String];

    fn call(&self, ctx: &CallContext, args: Vec<Value>) -> Result<Value, Fault>;
}

/// Call-scoped context passed explicitly through every call
#[derive(Clone)]
pub struct CallContext {
    pub env: Arc<ExecEnv>,
    pub module: Arc<InstrumentedModule>,
    pub frame: TrackingContext,
}

impl CallContext {
    pub fn root(env: Arc<ExecEnv>, module: Arc<InstrumentedModule>) -> Self {
        let frame = TrackingContext::root(&env.execution_id);
        Self { env, module, frame }
    }

    fn with_frame(&self, frame: TrackingContext) -> Self {
        Self {
            env: self.env.clone(),
            module: self.module.clone(),
            frame,
        }
    }

    fn in_module(&self, module: Arc<InstrumentedModule>) -> Self {
        Self {
            env: self.env.clone(),
            module,
            frame: self.frame.clone(),
        }
    }
}

fn check_arity(name: &str, expected: usize, given: usize) -> Result<(), Fault> {
    if expected == given {
        return Ok(());
    }
    Err(Fault::type_error(format!(
        "{}() takes {} argument{} but {} {} given",
        name,
        expected,
        if expected == 1 { "" } else { "s" },
        given,
        if given == 1 { "was" } else { "were" }
    )))
}

/// A function defined in a submission
pub struct ScriptFn {
    def: Arc<FnDef>,
}

impl ScriptFn {
    pub fn new(def: Arc<FnDef>) -> Self {
        Self { def }
    }
}

impl Callable for ScriptFn {
    fn name(&self) -> &str {
        &self.def.name
    }

    fn params(&self) -> &[String] {
        &self.def.params
    }

    fn call(&self, ctx: &CallContext, args: Vec<Value>) -> Result<Value, Fault> {
        check_arity(self.name(), self.def.params.len(), args.len())?;
        interpreter::invoke(ctx, &self.def, args)
    }
}

/// Tracking wrapper around a callable
pub struct Intercepted<C> {
    step_ref: String,
    inner: C,
}

impl<C: Callable> Intercepted<C> {
    pub fn new(step_ref: impl Into<String>, inner: C) -> Self {
        Self {
            step_ref: step_ref.into(),
            inner,
        }
    }

    /// Reference recorded on the steps this wrapper opens
    pub fn step_ref(&self) -> &str {
        &self.step_ref
    }
}

impl<C: Callable> Callable for Intercepted<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn params(&self) -> &[String] {
        self.inner.params()
    }

    fn call(&self, ctx: &CallContext, args: Vec<Value>) -> Result<Value, Fault> {
        let budget = &ctx.env.budget;
        budget.tick()?;
        check_arity(self.name(), self.params().len(), args.len())?;

        let depth = ctx.frame.child_depth();
        if depth >= budget.max_call_depth() {
            return Err(Fault::Limit(format!(
                "maximum call depth of {} exceeded",
                budget.max_call_depth()
            )));
        }

        // Recorded copies stay in the store for the whole run
        budget.charge(args.iter().map(Value::approx_size).sum())?;
        let handle = ctx
            .env
            .tracker
            .begin_step(&ctx.frame, &self.step_ref, args.clone())
            .map_err(|e| {
                // A closed tree means the run is being torn down
                if budget.is_cancelled() {
                    Fault::Aborted(e.to_string())
                } else {
                    Fault::Internal(e.to_string())
                }
            })?;

        let child = ctx.with_frame(handle.child_context());
        let result = self
            .inner
            .call(&child, args)
            .and_then(|value| budget.charge(value.approx_size()).map(|()| value));

        let outcome = match &result {
            Ok(value) => StepOutcome::Completed(value.clone()),
            Err(fault) => fault.step_outcome(),
        };
        if let Err(e) = ctx.env.tracker.end_step(handle, outcome) {
            warn!(step_ref = %self.step_ref, error = %e, "failed to finalise step");
        }

        result
    }
}

/// The instrumented functions of one submission, by name
pub struct InstrumentedModule {
    function_ref: FunctionRef,
    functions: HashMap<String, Arc<dyn Callable>>,
    order: Vec<String>,
}

impl InstrumentedModule {
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Callable>> {
        self.functions.get(name)
    }

    pub fn function_ref(&self) -> &FunctionRef {
        &self.function_ref
    }

    /// Function names in definition order
    pub fn function_names(&self) -> &[String] {
        &self.order
    }

    /// The program's functions with no step recording around them
    #[cfg(test)]
    pub(crate) fn uninstrumented(function_ref: FunctionRef, program: Program) -> Self {
        let order: Vec<String> = program.functions.iter().map(|def| def.name.clone()).collect();
        let functions = program
            .functions
            .into_iter()
            .map(|def| {
                let callable: Arc<dyn Callable> = Arc::new(ScriptFn::new(Arc::new(def)));
                (callable.name().to_string(), callable)
            })
            .collect();
        Self {
            function_ref,
            functions,
            order,
        }
    }
}

impl fmt::Debug for InstrumentedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentedModule")
            .field("function_ref", &self.function_ref)
            .field("functions", &self.order)
            .finish()
    }
}

/// A validated submission whose every function is intercepted
#[derive(Debug)]
pub struct InstrumentedFunction {
    pub function_ref: FunctionRef,
    pub entry: String,
    pub module: Arc<InstrumentedModule>,
    pub input_schema: Option<serde_json::Value>,
    pub output_schema: Option<serde_json::Value>,
    pub requirements: Vec<String>,
    pub imports: Vec<String>,
    pub remote_calls: Vec<FunctionRef>,
    pub definition: Arc<Function>,
}

impl InstrumentedFunction {
    pub fn version(&self) -> u32 {
        self.definition.version
    }

    pub fn is_active(&self) -> bool {
        self.definition.is_active
    }

    pub fn shared_pool(&self) -> bool {
        self.definition.shared_pool
    }

    pub fn uses_module(&self, module: &str) -> bool {
        self.imports.iter().any(|m| m == module)
    }

    pub fn entry_params(&self) -> usize {
        self.module
            .get(&self.entry)
            .map(|f| f.params().len())
            .unwrap_or(0)
    }

    /// Call the entry function from another submission's code
    pub fn call_entry(&self, ctx: &CallContext, args: Vec<Value>) -> Result<Value, Fault> {
        let entry = self.module.get(&self.entry).ok_or_else(|| {
            Fault::Internal(format!("entry function '{}' missing", self.entry))
        })?;
        entry.call(&ctx.in_module(self.module.clone()), args)
    }

    /// Run as the root of an execution
    ///
    /// Entry functions take `(input)` or `(input, context)`.
    pub fn run(&self, env: Arc<ExecEnv>, input: Value, context: Value) -> Result<Value, Fault> {
        let args = match self.entry_params() {
            0 => Vec::new(),
            1 => vec![input],
            _ => vec![input, context],
        };
        let ctx = CallContext::root(env, self.module.clone());
        self.call_entry(&ctx, args)
    }
}

/// Wrap every function of a validated program
pub(crate) fn instrument(
    program: Program,
    definition: Function,
    analysis: Analysis,
) -> InstrumentedFunction {
    let function_ref = definition.function_ref();
    let mut functions: HashMap<String, Arc<dyn Callable>> = HashMap::new();
    let mut order = Vec::with_capacity(program.functions.len());

    for def in program.functions {
        let step_ref = if def.name == analysis.entry {
            function_ref.to_string()
        } else {
            format!("{}:{}", function_ref, def.name)
        };
        let name = def.name.clone();
        order.push(name.clone());
        functions.insert(
            name,
            Arc::new(Intercepted::new(step_ref, ScriptFn::new(Arc::new(def)))),
        );
    }

    let module = Arc::new(InstrumentedModule {
        function_ref: function_ref.clone(),
        functions,
        order,
    });

    InstrumentedFunction {
        function_ref,
        entry: analysis.entry,
        module,
        input_schema: definition.input_schema.clone(),
        output_schema: definition.output_schema.clone(),
        requirements: definition.requirements.clone(),
        imports: analysis.imports,
        remote_calls: analysis.remote_calls,
        definition: Arc::new(definition),
    }
}

/// Functions reachable through `namespace::name` calls, linked for one run
#[derive(Debug, Clone, Default)]
pub struct Library {
    functions: HashMap<FunctionRef, Arc<InstrumentedFunction>>,
}

impl Library {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, function: Arc<InstrumentedFunction>) {
        self.functions.insert(function.function_ref.clone(), function);
    }

    pub fn get(&self, function_ref: &FunctionRef) -> Option<&Arc<InstrumentedFunction>> {
        self.functions.get(function_ref)
    }

    pub fn contains(&self, function_ref: &FunctionRef) -> bool {
        self.functions.contains_key(function_ref)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<InstrumentedFunction>> {
        self.functions.values()
    }

    /// Requirements declared by any linked function
    pub fn requirements(&self) -> Vec<String> {
        self.functions
            .values()
            .flat_map(|f| f.requirements.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Whether any linked function imports `module`
    pub fn uses_module(&self, module: &str) -> bool {
        self.functions.values().any(|f| f.uses_module(module))
    }

    /// Source definitions, for shipping to another process
    pub fn definitions(&self) -> Vec<Function> {
        let mut definitions: Vec<Function> = self
            .functions
            .values()
            .map(|f| f.definition.as_ref().clone())
            .collect();
        definitions.sort_by(|a, b| a.function_ref().cmp(&b.function_ref()));
        definitions
    }
}
