use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn normalize(path: &Path) -> PathBuf {
    match fs::canonicalize(path) {
        Ok(normalized) => normalized,
        Err(_) => path.to_path_buf(),
    }
}

fn push_unique(out: &mut Vec<PathBuf>, path: &Path) {
    if path.as_os_str().is_empty() {
        return;
    }

    let normalized = normalize(path);
    if !out.contains(&normalized) {
        out.push(normalized);
    }
}

fn is_regular_file(path: &Path) -> bool {
    fs::metadata(path).map(|meta| meta.is_file()).unwrap_or(false)
}

/// Directory holding the running executable, when it can be determined.
pub fn executable_dir() -> Option<PathBuf> {
    let exe = env::current_exe().ok()?;
    let exe = normalize(&exe);
    exe.parent().map(Path::to_path_buf)
}

/// Candidate project roots in probe order: working directory, its parent,
/// executable directory, its parent.
pub fn default_search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = env::current_dir() {
        push_unique(&mut roots, &cwd);
        if let Some(parent) = cwd.parent() {
            push_unique(&mut roots, parent);
        }
    }

    if let Some(exe_dir) = executable_dir() {
        push_unique(&mut roots, &exe_dir);
        if let Some(parent) = exe_dir.parent() {
            push_unique(&mut roots, parent);
        }
    }

    roots
}

/// Picks the first candidate root containing every required relative file.
/// Falls back to the first candidate (or `.`) so startup can still report
/// a meaningful file-not-found error.
pub fn resolve_root_with_required_files(required: &[&Path]) -> PathBuf {
    let roots = default_search_roots();

    for root in &roots {
        if required.iter().all(|rel| is_regular_file(&root.join(rel))) {
            return root.clone();
        }
    }

    roots.into_iter().next().unwrap_or_else(|| PathBuf::from("."))
}

/// The server's project root: the first candidate holding both the config
/// file and the env file.
pub fn resolve_root() -> PathBuf {
    resolve_root_with_required_files(&[Path::new("config/server.conf"), Path::new(".env")])
}

/// Finds `relative` under the first candidate root that holds it as a
/// regular file.
pub fn resolve_file_in_default_roots(relative: &Path) -> Option<PathBuf> {
    for root in default_search_roots() {
        let candidate = root.join(relative);
        if is_regular_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Absolute paths pass through; relative paths resolve under `root`.
pub fn resolve_from_root(root: &Path, raw: &Path) -> PathBuf {
    if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        root.join(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_from_root_absolute_passthrough() {
        let resolved = resolve_from_root(Path::new("/srv/chat"), Path::new("/etc/certs/ca.pem"));
        assert_eq!(resolved, PathBuf::from("/etc/certs/ca.pem"));
    }

    #[test]
    fn test_resolve_from_root_relative_joins() {
        let resolved = resolve_from_root(Path::new("/srv/chat"), Path::new("certs/ca.pem"));
        assert_eq!(resolved, PathBuf::from("/srv/chat/certs/ca.pem"));
    }

    #[test]
    fn test_default_search_roots_deduplicates() {
        let roots = default_search_roots();
        assert!(!roots.is_empty());
        for (i, root) in roots.iter().enumerate() {
            assert!(!roots[i + 1..].contains(root));
        }
    }

    #[test]
    fn test_resolve_root_falls_back_to_first_candidate() {
        let required = [Path::new("definitely/not/a/real/file.xyz")];
        let resolved = resolve_root_with_required_files(&required);
        assert!(!resolved.as_os_str().is_empty());
    }
}
