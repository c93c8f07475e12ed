//! Virtual path resolution.
//!
//! Tools address files through virtual absolute paths under `/workspace`,
//! `/memories`, `/blocks`, `/skills`. The resolver maps these to real
//! paths under the agent root and rejects every escape route: unknown
//! prefixes, `..` traversal, absolute re-rooting, and symlinks whose
//! canonical target leaves the sandbox.

use std::path::{Component, Path, PathBuf};

/// The four virtual roots an agent may address.
pub const SANDBOX_ROOTS: &[&str] = &["workspace", "memories", "blocks", "skills"];

/// Resolution failure. The message never leaks the real agent root; the
/// concrete prefix is replaced with `<sandbox>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDenied(pub String);

impl std::fmt::Display for AccessDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Access denied: {}", self.0)
    }
}

impl std::error::Error for AccessDenied {}

/// Replace the concrete agent-root prefix in a message with `<sandbox>`.
fn sanitize(message: String, agent_root: &Path) -> String {
    message.replace(&agent_root.to_string_lossy().to_string(), "<sandbox>")
}

/// Split a virtual path into (root, tail). The path must begin with one
/// of the four sandbox roots.
fn split_virtual(virtual_path: &str) -> Result<(&'static str, &str), AccessDenied> {
    for root in SANDBOX_ROOTS {
        let prefix = format!("/{}", root);
        if virtual_path == prefix {
            return Ok((root, ""));
        }
        if let Some(tail) = virtual_path.strip_prefix(&format!("{}/", prefix)) {
            return Ok((root, tail));
        }
    }
    Err(AccessDenied(format!(
        "path {} must start with one of /workspace, /memories, /blocks, /skills",
        virtual_path
    )))
}

/// Lexically normalize a relative path: drop `.`, resolve `..` against
/// preceding components. Returns None if the path would climb above its
/// start.
fn lexical_normalize(path: &Path) -> Option<PathBuf> {
    let mut parts: Vec<std::ffi::OsString> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return None;
                }
            }
            Component::Normal(part) => parts.push(part.to_os_string()),
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    let mut out = PathBuf::new();
    for part in parts {
        out.push(part);
    }
    Some(out)
}

/// Walk from `path` upward until an existing ancestor is found, then
/// canonicalize that ancestor and reattach the remaining suffix.
fn canonicalize_existing_prefix(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path;
    let mut suffix: Vec<&std::ffi::OsStr> = Vec::new();

    loop {
        if existing.exists() {
            break;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                suffix.push(name);
                existing = parent;
            }
            _ => break,
        }
    }

    let mut canonical = existing.canonicalize()?;
    for name in suffix.iter().rev() {
        canonical.push(name);
    }
    Ok(canonical)
}

/// Map a virtual sandbox path to a real path under `agent_root`.
pub fn resolve_sandbox_path(
    agent_root: &Path,
    virtual_path: &str,
) -> Result<PathBuf, AccessDenied> {
    let (root_sub, tail) = split_virtual(virtual_path)?;

    // Lexical pass: a tail that climbs out of its root is rejected before
    // touching the filesystem.
    let relative = match lexical_normalize(Path::new(tail)) {
        Some(rel) => Path::new(root_sub).join(rel),
        None => {
            return Err(AccessDenied(format!(
                "path {} escapes the {} sandbox area",
                virtual_path, root_sub
            )))
        }
    };

    if !relative.starts_with(root_sub) {
        return Err(AccessDenied(format!(
            "path {} escapes the {} sandbox area",
            virtual_path, root_sub
        )));
    }

    let real = agent_root.join(&relative);

    // Symlink pass: canonicalize the nearest existing ancestor and check
    // the canonical result still lies under the canonical agent root.
    let canonical_root = agent_root.canonicalize().map_err(|e| {
        AccessDenied(sanitize(
            format!("agent root is not accessible: {}", e),
            agent_root,
        ))
    })?;

    let canonical = canonicalize_existing_prefix(&real).map_err(|e| {
        AccessDenied(sanitize(
            format!("failed to resolve {}: {}", virtual_path, e),
            agent_root,
        ))
    })?;

    let canonical_relative = match canonical.strip_prefix(&canonical_root) {
        Ok(rel) => rel,
        Err(_) => {
            return Err(AccessDenied(format!(
                "path {} escapes the {} sandbox area",
                virtual_path, root_sub
            )))
        }
    };

    if canonical_relative.is_absolute() || !canonical_relative.starts_with(root_sub) {
        return Err(AccessDenied(format!(
            "path {} escapes the {} sandbox area",
            virtual_path, root_sub
        )));
    }

    Ok(canonical)
}
