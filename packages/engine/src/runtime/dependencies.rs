// packages/engine/src/runtime/dependencies.rs
//! Package requirements of functions
//!
//! Installable modules ship with the engine; "installing" one means checking
//! that configuration permits it and the package is on the available list.

use crate::functions::requirement_name;
use crate::utils::config::ExecutionConfig;
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use tracing::info;

#[derive(Debug)]
pub struct DependencyResolver {
    allow_install: bool,
    available: HashSet<String>,
    installed: Mutex<BTreeSet<String>>,
}

impl DependencyResolver {
    pub fn new<I, S>(allow_install: bool, available: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow_install,
            available: available.into_iter().map(Into::into).collect(),
            installed: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new(
            config.allow_package_install,
            config.available_packages.iter().cloned(),
        )
    }

    /// Make every requirement available, returning the package names
    pub fn resolve(&self, requirements: &[String]) -> Result<Vec<String>> {
        if requirements.is_empty() {
            return Ok(Vec::new());
        }
        if !self.allow_install {
            return Err(EngineError::Dependency(format!(
                "package installation is disabled (requested: {})",
                requirements.join(", ")
            )));
        }

        let mut packages = Vec::with_capacity(requirements.len());
        for requirement in requirements {
            let name = requirement_name(requirement);
            if !self.available.contains(name) {
                return Err(EngineError::Dependency(format!(
                    "package '{}' is not available",
                    name
                )));
            }
            packages.push(name.to_string());
        }

        let mut installed = self.installed.lock();
        for package in &packages {
            if installed.insert(package.clone()) {
                info!(package = %package, "package installed");
            }
        }
        Ok(packages)
    }

    pub fn installed(&self) -> Vec<String> {
        self.installed.lock().iter().cloned().collect()
    }
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_requirements_always_resolve() {
        let resolver = DependencyResolver::new(false, Vec::<String>::new());
        assert!(resolver.resolve(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_install_disabled() {
        let resolver = DependencyResolver::new(false, ["regex"]);
        let err = resolver.resolve(&["regex".to_string()]).unwrap_err();
        assert!(matches!(err, EngineError::Dependency(_)));
    }

    #[test]
    fn test_unavailable_package() {
        let resolver = DependencyResolver::new(true, ["regex"]);
        let err = resolver.resolve(&["numpy>=1.0".to_string()]).unwrap_err();
        assert!(err.to_string().contains("'numpy'"));
        assert!(resolver.installed().is_empty());
    }

    #[test]
    fn test_resolves_versioned_requirements() {
        let resolver = DependencyResolver::new(true, ["regex", "base64"]);
        let packages = resolver
            .resolve(&["regex>=1".to_string(), "base64".to_string()])
            .unwrap();
        assert_eq!(packages, vec!["regex", "base64"]);
        assert_eq!(resolver.installed(), vec!["base64", "regex"]);
    }
}
