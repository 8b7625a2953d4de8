//! Repository names

use std::fmt;

use crate::error::{RegistryError, RegistryResult};

/// A `namespace/name` repository, e.g. `library/app`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Repository {
    namespace: String,
    name: String,
}

impl Repository {
    /// Validate and build a repository name.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> RegistryResult<Self> {
        let namespace = namespace.into();
        let name = name.into();

        if !is_path_component(&namespace) || !is_path_component(&name) {
            return Err(RegistryError::InvalidRepository(format!("{namespace}/{name}")));
        }

        Ok(Self { namespace, name })
    }

    /// The namespace, the first path component.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The repository name within its namespace.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// `[a-z0-9]+([._-][a-z0-9]+)*`
fn is_path_component(s: &str) -> bool {
    !s.is_empty()
        && s.split(['.', '_', '-']).all(|part| {
            !part.is_empty()
                && part
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        let repo = Repository::new("library", "app").unwrap();
        assert_eq!(repo.to_string(), "library/app");

        assert!(Repository::new("my-org", "web_server.v2").is_ok());
    }

    #[test]
    fn invalid_names() {
        for (namespace, name) in [
            ("", "app"),
            ("library", ""),
            ("Library", "app"),
            ("library", ".."),
            ("library", "app-"),
            ("lib/rary", "app"),
        ] {
            let err = Repository::new(namespace, name).unwrap_err();
            assert!(matches!(err, RegistryError::InvalidRepository(_)), "{namespace}/{name}");
        }
    }
}
