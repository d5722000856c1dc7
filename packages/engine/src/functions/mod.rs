// packages/engine/src/functions/mod.rs
//! Submitted functions
//!
//! A [`Function`] is the stored definition. It is never run directly: the
//! registry validates and instruments it into an
//! [`InstrumentedFunction`](crate::script::InstrumentedFunction) first.

pub mod registry;

pub use registry::FunctionRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// `(namespace, name)` identity of a function, rendered as `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FunctionRef {
    pub namespace: String,
    pub name: String,
}

impl FunctionRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl FromStr for FunctionRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid function reference '{}': expected namespace/name", s))?;

        if !valid_segment(namespace) || !valid_segment(name) {
            return Err(format!(
                "invalid function reference '{}': segments may only contain letters, digits, '_' and '-'",
                s
            ));
        }

        Ok(Self::new(namespace, name))
    }
}

impl TryFrom<String> for FunctionRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FunctionRef> for String {
    fn from(value: FunctionRef) -> Self {
        value.to_string()
    }
}

/// Capabilities a trusted function may be granted beyond the core modules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entitlement {
    Filesystem,
    Network,
    Process,
}

impl fmt::Display for Entitlement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entitlement::Filesystem => "filesystem",
            Entitlement::Network => "network",
            Entitlement::Process => "process",
        };
        f.write_str(name)
    }
}

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    1
}

/// Stored function definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub namespace: String,
    pub name: String,
    pub code: String,

    #[serde(default)]
    pub description: String,

    /// JSON Schema the input must satisfy (absent or `{}` = anything)
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,

    /// JSON Schema the return value must satisfy
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,

    #[serde(default = "default_true")]
    pub is_active: bool,

    /// Run on the shared worker pool instead of a per-caller sandbox
    #[serde(default)]
    pub shared_pool: bool,

    /// Trusted code gets relaxed validation and may hold entitlements
    #[serde(default)]
    pub trusted: bool,

    /// Installable packages this function imports
    #[serde(default)]
    pub requirements: Vec<String>,

    #[serde(default)]
    pub entitlements: Vec<Entitlement>,

    /// Namespaces (besides its own) whose functions this one may call
    #[serde(default)]
    pub enabled_namespaces: Vec<String>,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Function {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, code: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            namespace: namespace.into(),
            name: name.into(),
            code: code.into(),
            description: String::new(),
            input_schema: None,
            output_schema: None,
            is_active: true,
            shared_pool: false,
            trusted: false,
            requirements: Vec::new(),
            entitlements: Vec::new(),
            enabled_namespaces: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn function_ref(&self) -> FunctionRef {
        FunctionRef::new(&self.namespace, &self.name)
    }

    pub fn with_input_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn shared(mut self) -> Self {
        self.shared_pool = true;
        self
    }

    pub fn trusted(mut self) -> Self {
        self.trusted = true;
        self
    }

    pub fn requiring<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requirements.extend(packages.into_iter().map(Into::into));
        self
    }

    pub fn entitled(mut self, entitlement: Entitlement) -> Self {
        self.entitlements.push(entitlement);
        self
    }

    pub fn enable_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.enabled_namespaces.push(namespace.into());
        self
    }

    pub fn has_entitlement(&self, entitlement: Entitlement) -> bool {
        self.entitlements.contains(&entitlement)
    }

    /// Whether this function may call into `namespace`
    pub fn may_call(&self, namespace: &str) -> bool {
        self.namespace == namespace || self.enabled_namespaces.iter().any(|n| n == namespace)
    }
}

/// Package name of a requirement such as `regex>=1.0`
pub fn requirement_name(requirement: &str) -> &str {
    requirement
        .split(|c: char| matches!(c, '=' | '<' | '>' | '~' | '!' | ' ' | '['))
        .next()
        .unwrap_or(requirement)
        .trim()
}

/// A schema constrains values unless it is absent, `null` or `{}`
pub fn has_schema(schema: &Option<serde_json::Value>) -> bool {
    match schema {
        None | Some(serde_json::Value::Null) => false,
        Some(serde_json::Value::Object(map)) => !map.is_empty(),
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_function_ref_parsing() {
        let r: FunctionRef = "billing/charge-card".parse().unwrap();
        assert_eq!(r.namespace, "billing");
        assert_eq!(r.name, "charge-card");
        assert_eq!(r.to_string(), "billing/charge-card");

        assert!("billing".parse::<FunctionRef>().is_err());
        assert!("/x".parse::<FunctionRef>().is_err());
        assert!("a/b/c".parse::<FunctionRef>().is_err());
    }

    #[test]
    fn test_function_ref_serializes_as_string() {
        let r = FunctionRef::new("ns", "f");
        assert_eq!(serde_json::to_value(&r).unwrap(), json!("ns/f"));
        let back: FunctionRef = serde_json::from_value(json!("ns/f")).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_function_defaults_from_json() {
        let f: Function = serde_json::from_value(json!({
            "namespace": "ns",
            "name": "f",
            "code": "fn f(x) { return x; }",
            "entitlements": ["filesystem"]
        }))
        .unwrap();

        assert!(f.is_active);
        assert!(!f.shared_pool);
        assert_eq!(f.version, 1);
        assert!(f.has_entitlement(Entitlement::Filesystem));
    }

    #[test]
    fn test_may_call() {
        let f = Function::new("a", "f", "").enable_namespace("b");
        assert!(f.may_call("a"));
        assert!(f.may_call("b"));
        assert!(!f.may_call("c"));
    }

    #[test]
    fn test_requirement_name() {
        assert_eq!(requirement_name("regex"), "regex");
        assert_eq!(requirement_name("regex>=1.0"), "regex");
        assert_eq!(requirement_name("base64 == 0.22"), "base64");
    }

    #[test]
    fn test_has_schema() {
        assert!(!has_schema(&None));
        assert!(!has_schema(&Some(json!({}))));
        assert!(!has_schema(&Some(serde_json::Value::Null)));
        assert!(has_schema(&Some(json!({"type": "object"}))));
    }
}
