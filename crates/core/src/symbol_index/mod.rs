//! Symbol Index (C1, §4.1). Maintains per-file symbol records with ranges,
//! parents, and kinds, refreshing lazily on read or write. Regex-based
//! per-extension extraction — a legitimate fallback per §9's design note;
//! the contract is parser-agnostic so a real grammar can front this later.

mod extract;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::model::{RelationshipKind, Relationship, Symbol};

struct CachedFile {
    mtime: Option<SystemTime>,
    symbols: Vec<Symbol>,
}

/// Read-mostly; writes (invalidate, reparse) are serialized behind a mutex
/// per §5 ("writes happen on a serialized background queue; reads return
/// the last-parsed snapshot").
pub struct SymbolIndex {
    cache: Mutex<HashMap<PathBuf, CachedFile>>,
}

impl Default for SymbolIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolIndex {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the current symbol list for `file`, recomputing if the file
    /// has changed since the last parse. Read errors and unknown extensions
    /// return an empty list rather than failing.
    pub fn symbols(&self, file: &Path) -> Vec<Symbol> {
        let mtime = std::fs::metadata(file).and_then(|m| m.modified()).ok();

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = cache.get(file) {
            if entry.mtime == mtime && mtime.is_some() {
                return entry.symbols.clone();
            }
        }

        let symbols = parse_file(file).unwrap_or_default();
        cache.insert(
            file.to_path_buf(),
            CachedFile {
                mtime,
                symbols: symbols.clone(),
            },
        );
        symbols
    }

    /// Forces reparse on next query.
    pub fn invalidate(&self, file: &Path) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.remove(file);
    }

    /// Scans `project` for files referencing `symbol_name` in a way that
    /// matches one of `relation_set`. Best-effort; callers must tolerate an
    /// empty result (§4.1).
    pub fn find_related(
        &self,
        symbol_name: &str,
        project: &Path,
        relation_set: &[RelationshipKind],
    ) -> Vec<Relationship> {
        let mut out = Vec::new();
        let Ok(walker) = std::fs::read_dir(project) else {
            return out;
        };
        let mut stack: Vec<PathBuf> = walker.filter_map(|e| e.ok().map(|e| e.path())).collect();
        let mut visited = 0usize;
        const MAX_FILES: usize = 2000;

        while let Some(path) = stack.pop() {
            if visited >= MAX_FILES {
                break;
            }
            if path.is_dir() {
                if is_skipped_dir(&path) {
                    continue;
                }
                if let Ok(children) = std::fs::read_dir(&path) {
                    stack.extend(children.filter_map(|e| e.ok().map(|e| e.path())));
                }
                continue;
            }
            visited += 1;
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            for kind in relation_set {
                if extract::matches_relationship(&content, symbol_name, *kind) {
                    out.push(Relationship {
                        source_file: path.clone(),
                        relationship_kind: *kind,
                    });
                }
            }
        }
        out
    }
}

fn is_skipped_dir(path: &Path) -> bool {
    matches!(
        path.file_name().and_then(|n| n.to_str()),
        Some("node_modules" | ".git" | "target" | "vendor" | "dist" | "build" | ".build")
    )
}

fn parse_file(file: &Path) -> std::io::Result<Vec<Symbol>> {
    let content = std::fs::read_to_string(file)?;
    let ext = file.extension().and_then(|e| e.to_str()).unwrap_or("");
    Ok(extract::extract_symbols(&content, ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn unknown_extension_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.xyz");
        std::fs::write(&path, "anything").unwrap();
        let index = SymbolIndex::new();
        assert!(index.symbols(&path).is_empty());
    }

    #[test]
    fn reparses_after_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs");
        std::fs::write(&path, "fn one() {}\n").unwrap();
        let index = SymbolIndex::new();
        assert_eq!(index.symbols(&path).len(), 1);

        std::thread::sleep(std::time::Duration::from_millis(10));
        let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        write!(f, "fn two() {{}}\n").unwrap();
        drop(f);

        index.invalidate(&path);
        let symbols = index.symbols(&path);
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].name, "two");
    }

    #[test]
    fn missing_file_returns_empty_not_error() {
        let index = SymbolIndex::new();
        assert!(index.symbols(Path::new("/does/not/exist.rs")).is_empty());
    }
}
