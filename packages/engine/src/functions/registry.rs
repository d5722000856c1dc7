// packages/engine/src/functions/registry.rs
//! Registered functions, kept only in instrumented form

use crate::functions::{Function, FunctionRef};
use crate::script::{self, InstrumentedFunction, Library};
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
pub struct FunctionRegistry {
    functions: DashMap<FunctionRef, Arc<InstrumentedFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate, instrument and store a function, replacing any previous
    /// version. Invalid code is rejected and the old version stays in place.
    pub fn register(&self, mut function: Function) -> Result<Arc<InstrumentedFunction>> {
        let function_ref = function.function_ref();
        if let Some(existing) = self.functions.get(&function_ref) {
            function.version = existing.version() + 1;
            function.created_at = existing.definition.created_at;
            function.updated_at = Utc::now();
        }

        let instrumented = Arc::new(script::validate_and_instrument(function)?);
        self.functions
            .insert(function_ref.clone(), instrumented.clone());

        info!(
            function = %function_ref,
            version = instrumented.version(),
            "function registered"
        );
        Ok(instrumented)
    }

    /// Replace an existing function; unknown functions are an error
    pub fn update(&self, function: Function) -> Result<Arc<InstrumentedFunction>> {
        let function_ref = function.function_ref();
        if !self.functions.contains_key(&function_ref) {
            return Err(EngineError::NotFound(format!("function {}", function_ref)));
        }
        self.register(function)
    }

    pub fn get(&self, function_ref: &FunctionRef) -> Option<Arc<InstrumentedFunction>> {
        self.functions.get(function_ref).map(|f| f.clone())
    }

    /// The function if it exists and is active
    pub fn get_active(&self, function_ref: &FunctionRef) -> Result<Arc<InstrumentedFunction>> {
        match self.get(function_ref) {
            Some(f) if f.is_active() => Ok(f),
            Some(_) => Err(EngineError::NotFound(format!(
                "function {} is not active",
                function_ref
            ))),
            None => Err(EngineError::NotFound(format!("function {}", function_ref))),
        }
    }

    /// Keep the function but stop it from being invoked or linked
    pub fn deactivate(&self, function_ref: &FunctionRef) -> Result<()> {
        let current = self
            .get(function_ref)
            .ok_or_else(|| EngineError::NotFound(format!("function {}", function_ref)))?;
        if !current.is_active() {
            return Ok(());
        }

        let mut definition = current.definition.as_ref().clone();
        definition.is_active = false;
        definition.updated_at = Utc::now();
        let instrumented = script::validate_and_instrument(definition)?;
        self.functions
            .insert(function_ref.clone(), Arc::new(instrumented));

        info!(function = %function_ref, "function deactivated");
        Ok(())
    }

    /// Definitions sorted by reference
    pub fn list(&self) -> Vec<Function> {
        let mut functions: Vec<Function> = self
            .functions
            .iter()
            .map(|f| f.definition.as_ref().clone())
            .collect();
        functions.sort_by(|a, b| a.function_ref().cmp(&b.function_ref()));
        functions
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Resolve every `namespace::name` callee reachable from `root`
    ///
    /// Inactive and unknown callees are left out; calling them raises at run
    /// time. Cycles (including calls back into `root`) are followed once.
    pub fn link(&self, root: &InstrumentedFunction) -> Library {
        let mut library = Library::new();
        let mut seen: HashSet<FunctionRef> = HashSet::new();

        let mut queue: VecDeque<FunctionRef> = root.remote_calls.iter().cloned().collect();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            let Some(function) = self.get(&next).filter(|f| f.is_active()) else {
                continue;
            };
            queue.extend(function.remote_calls.iter().cloned());
            library.insert(function);
        }

        library
    }
}
