//! Source tree scanning.
//!
//! Walks `[source] root` and returns every file matching the include globs
//! (and none of the exclude globs), with a SHA-256 of its raw bytes and its
//! modification time. The scan is read-only and sorted by relative path so
//! that passes are deterministic.
//!
//! # Default Globs
//!
//! Includes `**/*.md`, `**/*.markdown`, `**/*.docx`, `**/*.pdf`. Excludes
//! `**/.git/**` and Office lock files (`~$*`). User excludes are added to
//! the built-in ones rather than replacing them.

use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use docsage_core::{Error, Result};

use crate::config::SourceConfig;

const BUILTIN_EXCLUDES: [&str; 2] = ["**/.git/**", "**/~$*"];

/// A file found during a scan.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// `/`-separated path relative to the source root.
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub content_hash: String,
    /// Unix seconds.
    pub modified_at: i64,
    pub size: u64,
}

/// Result of walking the source tree.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub files: Vec<ScannedFile>,
    /// Files that matched but could not be read, by relative path.
    pub unreadable: Vec<(String, Error)>,
    /// Entries the walk could not descend into, by relative path. Nothing
    /// is known about what lies under them this pass; `""` is the root.
    pub unreadable_dirs: Vec<(String, Error)>,
}

impl ScanResult {
    /// True when `relative_path` may exist but was not observed: it could
    /// not be read, or it lies under an entry the walk could not enter.
    pub fn is_unobserved(&self, relative_path: &str) -> bool {
        self.unreadable.iter().any(|(p, _)| p == relative_path)
            || self
                .unreadable_dirs
                .iter()
                .any(|(prefix, _)| is_under(relative_path, prefix))
    }
}

fn is_under(path: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || path == prefix
        || (path.starts_with(prefix) && path[prefix.len()..].starts_with('/'))
}

/// Walk the source root.
///
/// A missing or unreadable root fails the whole scan; a single unreadable
/// file is reported in [`ScanResult::unreadable`] instead.
pub fn scan_source(config: &SourceConfig) -> Result<ScanResult> {
    let root = &config.root;
    let root_meta = std::fs::metadata(root).map_err(|source| Error::Io {
        path: root.clone(),
        source,
    })?;
    if !root_meta.is_dir() {
        return Err(Error::InvalidInput(format!(
            "source root is not a directory: {}",
            root.display()
        )));
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes: Vec<String> = BUILTIN_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut result = ScanResult::default();

    let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().unwrap_or(root.as_path()).to_path_buf();
                let rel_str = path
                    .strip_prefix(root)
                    .unwrap_or(path.as_path())
                    .to_string_lossy()
                    .replace('\\', "/");
                tracing::warn!(path = %rel_str, error = %e, "could not walk directory entry");
                let message = e.to_string();
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other(message));
                result
                    .unreadable_dirs
                    .push((rel_str, Error::Io { path, source }));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        // Apply exclude patterns
        if exclude_set.is_match(&rel_str) {
            continue;
        }

        // Apply include patterns
        if !include_set.is_match(&rel_str) {
            continue;
        }

        match scan_file(path, rel_str.clone()) {
            Ok(file) => result.files.push(file),
            Err(e) => {
                tracing::warn!(path = %rel_str, error = %e, "could not read file during scan");
                result.unreadable.push((rel_str, e));
            }
        }
    }

    // Sort for deterministic ordering
    result
        .files
        .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    result.unreadable.sort_by(|a, b| a.0.cmp(&b.0));
    result.unreadable_dirs.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(result)
}

fn scan_file(path: &Path, relative_path: String) -> Result<ScannedFile> {
    let io_err = |source| Error::Io {
        path: path.to_path_buf(),
        source,
    };
    let metadata = std::fs::metadata(path).map_err(io_err)?;
    let modified_at = metadata
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    let mut file = std::fs::File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(io_err)?;

    Ok(ScannedFile {
        relative_path,
        absolute_path: path.to_path_buf(),
        content_hash: format!("{:x}", hasher.finalize()),
        modified_at,
        size: metadata.len(),
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::InvalidInput(format!("invalid glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::InvalidInput(format!("invalid glob set: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsage_core::models::sha256_hex;
    use std::fs;

    fn source(root: &Path) -> SourceConfig {
        SourceConfig {
            root: root.to_path_buf(),
            include_globs: vec![
                "**/*.md".to_string(),
                "**/*.docx".to_string(),
                "**/*.pdf".to_string(),
            ],
            exclude_globs: vec!["drafts/**".to_string()],
            follow_symlinks: false,
            max_file_bytes: 1 << 20,
        }
    }

    #[test]
    fn scan_applies_globs_and_sorts() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("hr/policies")).unwrap();
        fs::create_dir_all(root.join("drafts")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("zeta.md"), "z").unwrap();
        fs::write(root.join("hr/policies/retention.md"), "r").unwrap();
        fs::write(root.join("hr/~$lock.docx"), "lock").unwrap();
        fs::write(root.join("drafts/wip.md"), "w").unwrap();
        fs::write(root.join(".git/HEAD.md"), "g").unwrap();
        fs::write(root.join("notes.txt"), "t").unwrap();

        let result = scan_source(&source(root)).unwrap();
        let paths: Vec<&str> = result.files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["hr/policies/retention.md", "zeta.md"]);
        assert_eq!(result.files[1].content_hash, sha256_hex(b"z"));
        assert_eq!(result.files[1].size, 1);
        assert!(result.unreadable.is_empty());
        assert!(result.unreadable_dirs.is_empty());
    }

    fn io_error(path: &str) -> Error {
        Error::Io {
            path: PathBuf::from(path),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        }
    }

    #[test]
    fn unobserved_paths_cover_unreadable_dirs() {
        let scan = ScanResult {
            files: Vec::new(),
            unreadable: vec![("locked.md".to_string(), io_error("locked.md"))],
            unreadable_dirs: vec![("hr".to_string(), io_error("hr"))],
        };
        assert!(scan.is_unobserved("locked.md"));
        assert!(scan.is_unobserved("hr/retention.md"));
        assert!(scan.is_unobserved("hr/policies/leave.docx"));
        assert!(!scan.is_unobserved("hrm/notes.md"));
        assert!(!scan.is_unobserved("kitchen.md"));

        let root_failed = ScanResult {
            unreadable_dirs: vec![(String::new(), io_error("."))],
            ..ScanResult::default()
        };
        assert!(root_failed.is_unobserved("anything/at/all.pdf"));
    }

    #[test]
    fn missing_root_fails_scan() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = scan_source(&source(&tmp.path().join("nope"))).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = source(tmp.path());
        config.include_globs = vec!["[".to_string()];
        assert!(matches!(
            scan_source(&config),
            Err(Error::InvalidInput(_))
        ));
    }
}
