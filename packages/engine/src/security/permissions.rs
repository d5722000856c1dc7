// packages/engine/src/security/permissions.rs
//! Wildcard permissions with scopes
//!
//! A permission reads `segment.segment...:scope`. Granted patterns may use
//! `*` for one segment, or as the last segment for any non-empty tail
//! (`fnrt.*:all` covers every `fnrt.` permission). Scopes nest:
//! `all ⊇ group ⊇ own`, and a granted `*` scope covers all three.

use crate::utils::config::PermissionsConfig;
use crate::utils::errors::{EngineError, Result};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Principal key whose grants apply to every caller, anonymous ones included
pub const ANY_PRINCIPAL: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    Own,
    Group,
    All,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Own => "own",
            Scope::Group => "group",
            Scope::All => "all",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Permission {
    segments: Vec<String>,
    /// `None` for a granted `*` scope
    scope: Option<Scope>,
}

impl Permission {
    /// Whether this (granted) pattern covers the `required` permission
    pub fn covers(&self, required: &Permission) -> bool {
        let scope_ok = match (self.scope, required.scope) {
            (None, _) => true,
            (Some(granted), Some(wanted)) => granted >= wanted,
            (Some(_), None) => false,
        };
        scope_ok && segments_match(&self.segments, &required.segments)
    }
}

fn segments_match(pattern: &[String], concrete: &[String]) -> bool {
    match pattern.split_last() {
        Some((last, prefix)) if last == "*" => {
            concrete.len() >= prefix.len()
                && prefix
                    .iter()
                    .zip(concrete)
                    .all(|(p, c)| p == "*" || p == c)
        }
        _ => {
            pattern.len() == concrete.len()
                && pattern.iter().zip(concrete).all(|(p, c)| p == "*" || p == c)
        }
    }
}

impl FromStr for Permission {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let (path, scope) = s
            .rsplit_once(':')
            .ok_or_else(|| EngineError::Config(format!("permission '{}' has no scope", s)))?;

        let scope = match scope {
            "*" => None,
            "all" => Some(Scope::All),
            "group" => Some(Scope::Group),
            "own" => Some(Scope::Own),
            other => {
                return Err(EngineError::Config(format!(
                    "permission '{}' has unknown scope '{}'",
                    s, other
                )))
            }
        };

        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if segments.iter().any(|seg| seg.is_empty()) {
            return Err(EngineError::Config(format!(
                "permission '{}' has an empty segment",
                s
            )));
        }

        Ok(Self { segments, scope })
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.segments.join("."),
            self.scope.map(|s| s.as_str()).unwrap_or("*")
        )
    }
}

/// Decides whether a caller may perform an action
pub trait PermissionGate: Send + Sync {
    fn check(&self, principal: Option<&str>, required: &str) -> bool;

    fn require(&self, principal: Option<&str>, required: &str) -> Result<()> {
        if self.check(principal, required) {
            Ok(())
        } else {
            Err(EngineError::PermissionDenied(format!(
                "{} lacks {}",
                principal.unwrap_or("anonymous"),
                required
            )))
        }
    }
}

/// Grants from configuration, matched as wildcard patterns
#[derive(Debug, Clone, Default)]
pub struct PatternGate {
    grants: HashMap<String, Vec<Permission>>,
}

impl PatternGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &PermissionsConfig) -> Result<Self> {
        let mut gate = Self::new();
        for (principal, patterns) in &config.grants {
            for pattern in patterns {
                gate.grant(principal, pattern)?;
            }
        }
        Ok(gate)
    }

    pub fn grant(&mut self, principal: &str, pattern: &str) -> Result<()> {
        let permission = pattern.parse()?;
        self.grants
            .entry(principal.to_string())
            .or_default()
            .push(permission);
        Ok(())
    }

    fn granted<'a>(&'a self, principal: Option<&str>) -> impl Iterator<Item = &'a Permission> {
        let own = principal.and_then(|p| self.grants.get(p));
        let everyone = self.grants.get(ANY_PRINCIPAL);
        own.into_iter().chain(everyone).flatten()
    }

    /// Requested permissions `principal` does not hold
    pub fn violations(&self, principal: Option<&str>, requested: &[&str]) -> Vec<String> {
        requested
            .iter()
            .filter(|p| !self.check(principal, p))
            .map(|p| p.to_string())
            .collect()
    }
}

impl PermissionGate for PatternGate {
    fn check(&self, principal: Option<&str>, required: &str) -> bool {
        let Ok(required) = required.parse::<Permission>() else {
            return false;
        };
        // Requests always name a concrete scope
        if required.scope.is_none() {
            return false;
        }
        self.granted(principal).any(|g| g.covers(&required))
    }
}

/// Permission required to execute a function through its webhook
pub fn execute_permission(namespace: &str, name: &str) -> String {
    format!("fnrt.functions.{}.{}.execute:own", namespace, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covers(pattern: &str, required: &str) -> bool {
        let pattern: Permission = pattern.parse().unwrap();
        pattern.covers(&required.parse().unwrap())
    }

    #[test]
    fn test_trailing_wildcard() {
        assert!(covers("fnrt.*:all", "fnrt.workers.scale:all"));
        assert!(covers("fnrt.functions.*:own", "fnrt.functions.ns.f.execute:own"));
        assert!(!covers("fnrt.functions.*:own", "other.functions.x:own"));
    }

    #[test]
    fn test_inner_wildcard_is_one_segment() {
        assert!(covers("fnrt.*.read:all", "fnrt.workers.read:all"));
        assert!(!covers("fnrt.*.read:all", "fnrt.workers.scale:all"));
        assert!(!covers("fnrt.*.read:all", "fnrt.a.b.read:all"));
    }

    #[test]
    fn test_scope_hierarchy() {
        assert!(covers("fnrt.executions.read:all", "fnrt.executions.read:group"));
        assert!(covers("fnrt.executions.read:all", "fnrt.executions.read:own"));
        assert!(!covers("fnrt.executions.read:group", "fnrt.executions.read:all"));
        assert!(covers("fnrt.executions.read:*", "fnrt.executions.read:all"));
    }

    #[test]
    fn test_malformed_patterns_rejected() {
        assert!("fnrt.workers.read".parse::<Permission>().is_err());
        assert!("fnrt..read:all".parse::<Permission>().is_err());
        assert!("fnrt.read:root".parse::<Permission>().is_err());
    }

    #[test]
    fn test_gate_per_principal_and_everyone() {
        let mut config = PermissionsConfig::default();
        config
            .grants
            .insert("admin".to_string(), vec!["fnrt.*:all".to_string()]);
        config.grants.insert(
            ANY_PRINCIPAL.to_string(),
            vec!["fnrt.functions.public.*.execute:own".to_string()],
        );
        let gate = PatternGate::from_config(&config).unwrap();

        assert!(gate.check(Some("admin"), "fnrt.workers.scale:all"));
        assert!(!gate.check(Some("bob"), "fnrt.workers.scale:all"));
        assert!(gate.check(Some("bob"), &execute_permission("public", "hello")));
        assert!(gate.check(None, &execute_permission("public", "hello")));
        assert!(!gate.check(None, &execute_permission("private", "hello")));

        let err = gate.require(Some("bob"), "fnrt.workers.scale:all").unwrap_err();
        assert!(matches!(err, EngineError::PermissionDenied(_)));
    }

    #[test]
    fn test_violations() {
        let mut gate = PatternGate::new();
        gate.grant("dev", "fnrt.*.read:own").unwrap();
        assert_eq!(
            gate.violations(Some("dev"), &["fnrt.workers.read:own", "fnrt.workers.read:all"]),
            vec!["fnrt.workers.read:all"]
        );
    }
}
