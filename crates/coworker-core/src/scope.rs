//! Workspace path scoping.
//!
//! Every filesystem path the server touches, whether declared in a job
//! submission or dereferenced by a tool handler, must resolve to a
//! prefix-descendant of an allowlisted workspace root. Resolution follows
//! symlinks fully: a path is judged by where it actually lands, not by how
//! it is spelled.
//!
//! Paths that do not exist yet (move destinations, trash entries) are
//! resolved by canonicalizing the nearest existing ancestor and appending
//! the remaining components; `..` and `.` components in the non-existing
//! remainder are rejected outright rather than interpreted.
//!
//! The gateway validates against the server-configured root set before a
//! job row is created; tool handlers re-validate every path against the
//! job's `allowed_roots` on each call.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Errors from workspace scope construction and path resolution.
#[derive(Debug, Error)]
pub enum ScopeError {
    /// The scope was constructed with no roots.
    #[error("workspace scope requires at least one root")]
    EmptyRootSet,

    /// A configured root could not be canonicalized.
    #[error("workspace root {path} is not usable: {source}")]
    BadRoot {
        /// The root as configured.
        path: String,
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The path resolves outside every allowlisted root.
    #[error("path escapes allowed roots: {path}")]
    OutsideRoots {
        /// The offending path as submitted.
        path: String,
    },

    /// A non-existing path segment contained `..` or `.`.
    #[error("path contains traversal components: {path}")]
    Traversal {
        /// The offending path as submitted.
        path: String,
    },

    /// The path has no existing ancestor (cannot anchor resolution).
    #[error("path has no resolvable ancestor: {path}")]
    NoAncestor {
        /// The offending path as submitted.
        path: String,
    },

    /// Canonicalization failed for an existing path.
    #[error("failed to resolve {path}: {source}")]
    Io {
        /// The offending path as submitted.
        path: String,
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

/// An immutable set of canonical workspace roots with containment checks.
///
/// Roots are canonicalized at construction time, so a root that is itself a
/// symlink is pinned to its target once and for all requests.
#[derive(Debug, Clone)]
pub struct WorkspaceScope {
    roots: Vec<PathBuf>,
}

impl WorkspaceScope {
    /// Builds a scope from the given roots, canonicalizing each.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::EmptyRootSet`] for an empty iterator and
    /// [`ScopeError::BadRoot`] if any root does not exist or cannot be
    /// canonicalized.
    pub fn new<I, P>(roots: I) -> Result<Self, ScopeError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut canonical = Vec::new();
        for root in roots {
            let root = root.as_ref();
            let resolved = root.canonicalize().map_err(|source| ScopeError::BadRoot {
                path: root.display().to_string(),
                source,
            })?;
            canonical.push(resolved);
        }
        if canonical.is_empty() {
            return Err(ScopeError::EmptyRootSet);
        }
        Ok(Self { roots: canonical })
    }

    /// The canonical root set.
    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Resolves `path` to canonical form and verifies containment.
    ///
    /// Existing paths are canonicalized directly (following symlinks).
    /// Non-existing paths are anchored at the nearest existing ancestor;
    /// the unresolved remainder must consist of plain name components.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::OutsideRoots`] when the canonical form is not
    /// a prefix-descendant of any root, and resolution errors otherwise.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf, ScopeError> {
        let path = path.as_ref();
        let canonical = canonicalize_lenient(path)?;
        if self.contains(&canonical) {
            Ok(canonical)
        } else {
            Err(ScopeError::OutsideRoots {
                path: path.display().to_string(),
            })
        }
    }

    /// Whether an already-canonical path is a prefix-descendant of some root.
    #[must_use]
    pub fn contains(&self, canonical: &Path) -> bool {
        self.roots
            .iter()
            .any(|root| canonical == root || canonical.starts_with(root))
    }
}

/// Canonicalizes a path that may not exist yet.
///
/// If the path exists it is canonicalized directly. Otherwise the nearest
/// existing ancestor is canonicalized and the remaining components are
/// appended; any `..` or `.` in the remainder is rejected so a symlink or
/// traversal cannot be smuggled through the not-yet-existing suffix.
///
/// # Errors
///
/// Returns [`ScopeError::Traversal`] for dot components in a non-existing
/// remainder, [`ScopeError::NoAncestor`] when nothing on the path exists,
/// and [`ScopeError::Io`] for other canonicalization failures.
pub fn canonicalize_lenient(path: &Path) -> Result<PathBuf, ScopeError> {
    match path.canonicalize() {
        Ok(resolved) => Ok(resolved),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let mut ancestor = path;
            let mut remainder = Vec::new();
            loop {
                let Some(parent) = ancestor.parent() else {
                    return Err(ScopeError::NoAncestor {
                        path: path.display().to_string(),
                    });
                };
                if let Some(name) = ancestor.file_name() {
                    remainder.push(name.to_os_string());
                } else {
                    return Err(ScopeError::Traversal {
                        path: path.display().to_string(),
                    });
                }
                ancestor = parent;
                if ancestor.exists() {
                    break;
                }
            }

            // The remainder was collected leaf-first; it must be plain names.
            for part in &remainder {
                let part = Path::new(part);
                if !matches!(part.components().next(), Some(Component::Normal(_))) {
                    return Err(ScopeError::Traversal {
                        path: path.display().to_string(),
                    });
                }
            }

            let mut resolved = ancestor.canonicalize().map_err(|source| ScopeError::Io {
                path: path.display().to_string(),
                source,
            })?;
            for part in remainder.iter().rev() {
                resolved.push(part);
            }
            Ok(resolved)
        }
        Err(source) => Err(ScopeError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    use tempfile::TempDir;

    fn scope_for(dir: &TempDir) -> WorkspaceScope {
        WorkspaceScope::new([dir.path()]).unwrap()
    }

    #[test]
    fn empty_root_set_is_rejected() {
        let err = WorkspaceScope::new(Vec::<PathBuf>::new()).unwrap_err();
        assert!(matches!(err, ScopeError::EmptyRootSet));
    }

    #[test]
    fn missing_root_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = WorkspaceScope::new([dir.path().join("nope")]).unwrap_err();
        assert!(matches!(err, ScopeError::BadRoot { .. }));
    }

    #[test]
    fn resolves_existing_path_inside_root() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"x").unwrap();

        let scope = scope_for(&dir);
        let resolved = scope.resolve(&file).unwrap();
        assert!(scope.contains(&resolved));
    }

    #[test]
    fn rejects_path_outside_roots() {
        let dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let file = other.path().join("b.txt");
        fs::write(&file, b"x").unwrap();

        let scope = scope_for(&dir);
        let err = scope.resolve(&file).unwrap_err();
        assert!(matches!(err, ScopeError::OutsideRoots { .. }));
    }

    #[test]
    fn dotdot_traversal_lands_outside() {
        let dir = TempDir::new().unwrap();
        let sneaky = dir.path().join("..").join("etc").join("passwd");

        let scope = scope_for(&dir);
        assert!(scope.resolve(&sneaky).is_err());
    }

    #[test]
    fn nonexistent_path_resolves_via_ancestor() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("new_dir").join("new_file.txt");

        let scope = scope_for(&dir);
        let resolved = scope.resolve(&target).unwrap();
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
        assert!(resolved.ends_with("new_dir/new_file.txt"));
    }

    #[test]
    fn nonexistent_remainder_with_dotdot_is_rejected() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("ghost").join("..").join("..").join("out");

        let scope = scope_for(&dir);
        let err = scope.resolve(&target).unwrap_err();
        assert!(matches!(
            err,
            ScopeError::Traversal { .. } | ScopeError::OutsideRoots { .. }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_caught() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let secret = outside.path().join("secret.txt");
        fs::write(&secret, b"s").unwrap();

        let link = dir.path().join("link.txt");
        std::os::unix::fs::symlink(&secret, &link).unwrap();

        let scope = scope_for(&dir);
        let err = scope.resolve(&link).unwrap_err();
        assert!(matches!(err, ScopeError::OutsideRoots { .. }));
    }
}
