// packages/engine/src/script/mod.rs
//! The function language
//!
//! Submissions go through [`validate_and_instrument`] once, at registration.
//! The result is the only executable form of a function.

pub mod ast;
pub mod builtins;
pub mod instrument;
pub mod interpreter;
pub mod parser;
pub mod validator;

pub use instrument::{CallContext, Callable, InstrumentedFunction, Library};
pub use interpreter::{Budget, ExecEnv, Fault, ScriptError, INTERPRETER_STACK_BYTES};
pub use validator::{Analysis, ValidationPolicy};

use crate::functions::Function;
use crate::utils::errors::ValidationError;
use tracing::debug;

/// Statically check a submission and wrap every function it defines
pub fn validate_and_instrument(function: Function) -> Result<InstrumentedFunction, ValidationError> {
    let policy = ValidationPolicy::for_function(&function);
    validator::check_source(&function.code, &policy)?;

    let program = parser::parse_program(&function.code)?;
    let analysis = validator::validate(&function, &program, &policy)?;

    debug!(
        function = %function.function_ref(),
        entry = %analysis.entry,
        functions = program.functions.len(),
        imports = ?analysis.imports,
        "instrumented submission"
    );

    Ok(instrument::instrument(program, function, analysis))
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::codec::Value;
    use crate::tracking::{validate_tree, ErrorKind, StepStatus};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_identity_is_transparent() {
        for input in [json!(null), json!(42), json!("text"), json!({"a": [1, 2.5, true]})] {
            let (result, steps) = run_source("fn main(input) { return input; }", input.clone());
            assert_eq!(result.map(|v| v.to_json()), Ok(input.clone()));
            assert_eq!(steps.len(), 1);
            assert_eq!(steps[0].function_ref, "test/main");
            assert_eq!(steps[0].args, vec![Value::from_json(input.clone())]);
            assert_eq!(steps[0].result, Some(Value::from_json(input)));
        }
    }

    #[test]
    fn test_arithmetic_through_helpers() {
        let (result, steps) = run_source(
            r#"
            fn add(a, b) { return a + b; }
            fn mul(a, b) { return a * b; }
            fn main(input) { return add(mul(input, 3), 4); }
            "#,
            json!(5),
        );
        assert_eq!(result, Ok(Value::Int(19)));

        let refs: Vec<&str> = steps.iter().map(|s| s.function_ref.as_str()).collect();
        assert_eq!(refs, vec!["test/main", "test/main:mul", "test/main:add"]);
        assert_eq!(steps[1].ordinal, 0);
        assert_eq!(steps[2].ordinal, 1);
        validate_tree(&steps[0].execution_id, &steps).unwrap();
    }

    #[test]
    fn test_recursion_builds_deep_tree() {
        let (result, steps) = run_source(
            r#"
            fn fact(n) { if n <= 1 { return 1; } return n * fact(n - 1); }
            fn main(input) { return fact(input); }
            "#,
            json!(10),
        );
        assert_eq!(result, Ok(Value::Int(3_628_800)));
        assert_eq!(steps.len(), 11);
        assert_eq!(steps.iter().map(|s| s.depth).max(), Some(10));
        assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
        validate_tree(&steps[0].execution_id, &steps).unwrap();
    }

    #[test]
    fn test_recording_matches_direct_call() {
        let cases = [
            ("fn main(input) { return input; }", json!({"a": [1, 2.5, true], "b": null})),
            (
                "fn add(a, b) { return a + b; } fn mul(a, b) { return a * b; } \
                 fn main(input) { return add(mul(input, 3), 4); }",
                json!(5),
            ),
            (
                "fn fact(n) { if n <= 1 { return 1; } return n * fact(n - 1); } \
                 fn main(input) { return fact(input); }",
                json!(10),
            ),
            ("fn main(input) { return input / 0; }", json!(1)),
        ];
        for (source, input) in cases {
            let (recorded, steps) = run_source(source, input.clone());
            let (plain, plain_steps) = run_plain(source, input);
            assert_eq!(recorded, plain, "{}", source);
            assert!(!steps.is_empty());
            assert!(plain_steps.is_empty());
        }
    }

    #[test]
    fn test_caught_child_error_does_not_fail_parent() {
        let (result, steps) = run_source(
            r#"
            fn risky(x) { raise error("KeyError", "missing " + x); }
            fn main(input) {
                try { risky("a"); } catch e { return e["kind"]; }
                return null;
            }
            "#,
            json!(null),
        );
        assert_eq!(result, Ok(Value::str("KeyError")));
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[1].status, StepStatus::Failed);
        let error = steps[1].error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Runtime);
        assert_eq!(error.error_type.as_deref(), Some("KeyError"));
    }

    #[test]
    fn test_recorded_args_are_copies() {
        let (result, steps) = run_source(
            r#"
            fn grow(xs) { push(xs, 9); return len(xs); }
            fn main(input) { let xs = [1]; grow(xs); return xs; }
            "#,
            json!(null),
        );
        assert_eq!(result, Ok(Value::List(vec![Value::Int(1)])));
        assert_eq!(steps[1].args, vec![Value::List(vec![Value::Int(1)])]);
    }

    #[test]
    fn test_depth_limit_is_resource_fault() {
        let (result, steps) = run_source(
            "fn down(n) { return down(n + 1); } fn main(input) { return down(0); }",
            json!(null),
        );
        assert!(matches!(result, Err(Fault::Limit(_))));
        assert!(steps.iter().all(|s| s.status != StepStatus::Running));
    }

    #[test]
    fn test_remote_call_through_library() {
        let helper = validate_and_instrument(Function::new(
            "utils",
            "double",
            "fn double(x) { return x * 2; }",
        ))
        .unwrap();
        let mut library = Library::new();
        library.insert(Arc::new(helper));

        let caller = Function::new("app", "main", "fn main(input) { return utils::double(input); }")
            .enable_namespace("utils");
        let (result, steps) = run_linked(caller, library, json!(21));

        assert_eq!(result, Ok(Value::Int(42)));
        assert_eq!(steps[1].function_ref, "utils/double");
        assert_eq!(steps[1].depth, 1);
    }

    #[test]
    fn test_missing_remote_callee_raises() {
        let caller = Function::new("app", "main", "fn main(input) { return utils::gone(input); }")
            .enable_namespace("utils");
        let (result, _) = run_function(caller, json!(1));
        assert!(matches!(result, Err(Fault::Raised(e)) if e.kind == "NameError"));
    }

    #[test]
    fn test_invalid_submission_rejected() {
        let err = validate_and_instrument(Function::new("app", "main", "fn main( {"))
            .unwrap_err();
        assert!(err.reason.starts_with("syntax error"));
        assert!(err.location.is_some());

        let err = validate_and_instrument(Function::new(
            "app",
            "main",
            r#"fn main(input) { return eval("1"); }"#,
        ))
        .unwrap_err();
        assert!(err.reason.contains("eval"));
    }
}
