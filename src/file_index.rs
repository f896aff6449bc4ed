//! File index
//!
//! Walks the watched directories, stats every file and records the order in
//! which files were discovered. Editor droppings and excluded directories
//! never make it into the index.

use glob::Pattern;
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::error::AutotestError;

/// A file seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub mtime: SystemTime,
}

/// Directory exclusion patterns, collected during setup and compiled once
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    patterns: Vec<String>,
}

impl Exclusions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, pattern: impl Into<String>) -> &mut Self {
        self.patterns.push(pattern.into());
        self
    }

    pub fn remove(&mut self, pattern: &str) -> &mut Self {
        self.patterns.retain(|p| p != pattern);
        self
    }

    pub fn clear(&mut self) -> &mut Self {
        self.patterns.clear();
        self
    }

    /// Combine all patterns into a single alternation, or `None` when there is nothing to exclude
    pub fn compile(self) -> Result<Option<Regex>, AutotestError> {
        if self.patterns.is_empty() {
            return Ok(None);
        }

        for pattern in &self.patterns {
            Regex::new(pattern).map_err(|source| AutotestError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
        }

        let combined = self
            .patterns
            .iter()
            .map(|p| format!("(?:{})", p))
            .collect::<Vec<_>>()
            .join("|");

        Regex::new(&combined)
            .map(Some)
            .map_err(|source| AutotestError::InvalidPattern {
                pattern: combined,
                source,
            })
    }
}

/// The set of files found by the latest scan, in discovery order
#[derive(Debug, Clone, Default)]
pub struct KnownFiles {
    order: Vec<String>,
    set: HashSet<String>,
}

impl KnownFiles {
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut known = Self::default();
        for path in paths {
            known.push(path.into());
        }
        known
    }

    fn push(&mut self, path: String) {
        if self.set.insert(path.clone()) {
            self.order.push(path);
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.set.contains(path)
    }

    pub fn paths(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Known files whose path matches `re`
    pub fn files_matching(&self, re: &Regex) -> Vec<String> {
        self.order.iter().filter(|f| re.is_match(f)).cloned().collect()
    }

    /// Known files whose path matches the glob `pattern`. An invalid glob matches nothing.
    pub fn files_matching_glob(&self, pattern: &str) -> Vec<String> {
        match Pattern::new(pattern) {
            Ok(glob) => self.order.iter().filter(|f| glob.matches(f)).cloned().collect(),
            Err(e) => {
                tracing::warn!(pattern, "invalid glob: {}", e);
                Vec::new()
            }
        }
    }
}

pub struct FileIndex {
    root: PathBuf,
    targets: Vec<String>,
    exclusions: Option<Regex>,
    known: KnownFiles,
}

impl FileIndex {
    pub fn new(root: &Path, directories: &[String], extra_files: &[String], exclusions: Option<Regex>) -> Self {
        let targets = directories.iter().chain(extra_files.iter()).cloned().collect();
        Self {
            root: root.to_path_buf(),
            targets,
            exclusions,
            known: KnownFiles::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk every target and stat what is found. Rebuilds the known-file set.
    pub fn scan(&mut self) -> Vec<FileRecord> {
        let mut records = Vec::new();
        let mut known = KnownFiles::default();

        for target in &self.targets {
            let start = if target == "." {
                self.root.clone()
            } else {
                self.root.join(target)
            };

            let mut found: Vec<FileRecord> = WalkDir::new(&start)
                .into_iter()
                .filter_entry(|entry| !self.is_pruned(&relative_path(&self.root, entry.path())))
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        tracing::trace!("skipping unreadable entry: {}", e);
                        None
                    }
                })
                .filter_map(|entry| {
                    let path = relative_path(&self.root, entry.path());
                    if path.is_empty() || is_ignorable(&path) {
                        return None;
                    }

                    // May have vanished since the directory was listed
                    let metadata = fs::metadata(entry.path()).ok()?;
                    if !metadata.is_file() {
                        return None;
                    }
                    let mtime = metadata.modified().ok()?;

                    Some(FileRecord { path, mtime })
                })
                .collect();

            found.sort_by(|a, b| a.path.cmp(&b.path));

            for record in found {
                if !known.contains(&record.path) {
                    known.push(record.path.clone());
                    records.push(record);
                }
            }
        }

        tracing::debug!(files = records.len(), "scan complete");
        self.known = known;
        records
    }

    pub fn known(&self) -> &KnownFiles {
        &self.known
    }

    pub fn known_paths(&self) -> &[String] {
        self.known.paths()
    }

    fn is_pruned(&self, path: &str) -> bool {
        if path == "tmp" || path.starts_with("tmp/") {
            return true;
        }
        self.exclusions.as_ref().is_some_and(|re| re.is_match(path))
    }
}

/// The point in time before which files count as already seen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    watermark: SystemTime,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl Snapshot {
    pub fn new() -> Self {
        Self {
            watermark: SystemTime::UNIX_EPOCH,
        }
    }

    pub fn watermark(&self) -> SystemTime {
        self.watermark
    }

    /// Nothing has been evaluated since the last reset
    pub fn is_initial(&self) -> bool {
        self.watermark == SystemTime::UNIX_EPOCH
    }

    pub fn reset(&mut self) {
        self.watermark = SystemTime::UNIX_EPOCH;
    }

    pub fn set(&mut self, watermark: SystemTime) {
        self.watermark = watermark;
    }

    /// Records newer than the watermark, in scan order
    pub fn changed<'a>(&self, records: &'a [FileRecord]) -> Vec<&'a FileRecord> {
        records.iter().filter(|r| r.mtime > self.watermark).collect()
    }

    /// Move the watermark to the newest mtime in `records`
    pub fn advance(&mut self, records: &[FileRecord]) {
        if let Some(max) = records.iter().map(|r| r.mtime).max() {
            if max > self.watermark {
                self.watermark = max;
            }
        }
    }
}

/// Swap files, backups, patch leftovers, RCS files and emacs autosaves
pub fn is_ignorable(path: &str) -> bool {
    const SUFFIXES: &[&str] = &["swp", "~", "rej", "orig", ",v"];

    if SUFFIXES.iter().any(|s| path.ends_with(s)) {
        return true;
    }

    path.split('/').any(|part| part.starts_with('#') || part.starts_with(".#"))
}

fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    normalize_path(&rel.to_string_lossy())
}

/// Normalize path separators and remove leading ./
pub fn normalize_path(path: &str) -> String {
    let mut path = path.replace('\\', "/");
    while let Some(rest) = path.strip_prefix("./") {
        path = rest.to_string();
    }
    if path == "." {
        path.clear();
    }
    path
}
