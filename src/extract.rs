use std::io::{Cursor, Read};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, error, info, warn};
use zip::ZipArchive;

use crate::download::DEFAULT_SIZE_CAP;
use crate::error::HarvestError;
use crate::fs_util;
use crate::validate::is_valid_tree;

pub const TREE_SUFFIXES: &[&str] = &["nwk", "newick", "tre", "tree", "treefile"];
pub const NEXUS_SUFFIXES: &[&str] = &["nex", "nexus"];
pub const TEXT_SUFFIXES: &[&str] = &["txt"];
pub const ARCHIVE_SUFFIXES: &[&str] = &["zip"];

pub const DEFAULT_MAX_DEPTH: usize = 8;
pub const DEFAULT_MAX_EXTRACTED_BYTES: u64 = 4 * DEFAULT_SIZE_CAP;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Tree,
    NeedsValidation,
    Archive,
    Ignored,
}

impl EntryKind {
    pub fn classify(name: &str) -> Self {
        let suffix = suffix_of(name);
        let suffix = suffix.as_str();
        if NEXUS_SUFFIXES.contains(&suffix) || TEXT_SUFFIXES.contains(&suffix) {
            EntryKind::NeedsValidation
        } else if TREE_SUFFIXES.contains(&suffix) {
            EntryKind::Tree
        } else if ARCHIVE_SUFFIXES.contains(&suffix) {
            EntryKind::Archive
        } else {
            EntryKind::Ignored
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: Utf8PathBuf,
    pub kind: EntryKind,
}

impl ArchiveEntry {
    pub fn new(path: Utf8PathBuf) -> Self {
        let kind = EntryKind::classify(path.as_str());
        Self { path, kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Deepest nested archive that is still opened; the outer archive is 0.
    pub max_depth: usize,
    /// Uncompressed bytes read from one archive, nested archives included.
    pub max_extracted_bytes: u64,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_extracted_bytes: DEFAULT_MAX_EXTRACTED_BYTES,
        }
    }
}

pub fn extract_trees(archive: &[u8], out_dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    TreeExtractor::default().extract_trees(archive, out_dir)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TreeExtractor {
    options: ExtractOptions,
}

struct Frame {
    archive: ZipArchive<Cursor<Vec<u8>>>,
    next: usize,
    depth: usize,
    container: Option<Utf8PathBuf>,
}

impl TreeExtractor {
    pub fn new(options: ExtractOptions) -> Self {
        Self { options }
    }

    pub fn extract_trees(&self, archive: &[u8], out_dir: &Utf8Path) -> Vec<Utf8PathBuf> {
        match self.try_extract_trees(archive, out_dir) {
            Ok(trees) => trees,
            Err(err) => {
                error!(%out_dir, %err, "archive extraction failed");
                Vec::new()
            }
        }
    }

    pub fn try_extract_trees(
        &self,
        archive: &[u8],
        out_dir: &Utf8Path,
    ) -> Result<Vec<Utf8PathBuf>, HarvestError> {
        let archive = ZipArchive::new(Cursor::new(archive.to_vec()))
            .map_err(|err| HarvestError::BadArchive(err.to_string()))?;
        let mut stack = vec![Frame {
            archive,
            next: 0,
            depth: 0,
            container: None,
        }];
        let mut trees = Vec::new();
        let mut remaining = self.options.max_extracted_bytes;

        while let Some(frame) = stack.last_mut() {
            if frame.next >= frame.archive.len() {
                if let Some(container) = stack.pop().and_then(|done| done.container) {
                    debug!(%container, "removing nested archive");
                    fs_util::discard(&container);
                }
                continue;
            }
            let index = frame.next;
            frame.next += 1;
            let depth = frame.depth;
            let Some((entry, bytes)) = read_entry(&mut frame.archive, index, &mut remaining) else {
                continue;
            };
            let target = out_dir.join(&entry.path);

            match entry.kind {
                EntryKind::Tree => {
                    if write(&target, &bytes) {
                        trees.push(target);
                    }
                }
                EntryKind::NeedsValidation => {
                    if let Some(path) = keep_if_tree(target, &bytes) {
                        trees.push(path);
                    }
                }
                EntryKind::Archive => {
                    if depth >= self.options.max_depth {
                        warn!(entry = %entry.path, depth, "nested archive too deep, skipped");
                        continue;
                    }
                    info!(entry = %entry.path, "extracting nested archive");
                    if !write(&target, &bytes) {
                        continue;
                    }
                    match ZipArchive::new(Cursor::new(bytes)) {
                        Ok(nested) => stack.push(Frame {
                            archive: nested,
                            next: 0,
                            depth: depth + 1,
                            container: Some(target),
                        }),
                        Err(err) => {
                            error!(entry = %entry.path, %err, "nested archive unreadable");
                            fs_util::discard(&target);
                        }
                    }
                }
                EntryKind::Ignored => {}
            }
        }

        Ok(trees)
    }

    pub fn store_download(
        &self,
        bytes: &[u8],
        filename: &str,
        out_dir: &Utf8Path,
    ) -> Vec<Utf8PathBuf> {
        let Some(name) = Utf8Path::new(filename).file_name() else {
            warn!(filename, "download has no usable file name");
            return Vec::new();
        };
        let target = out_dir.join(name);
        match EntryKind::classify(name) {
            EntryKind::Archive => self.extract_trees(bytes, out_dir),
            EntryKind::Tree => {
                if write(&target, bytes) {
                    vec![target]
                } else {
                    Vec::new()
                }
            }
            EntryKind::NeedsValidation => keep_if_tree(target, bytes).into_iter().collect(),
            EntryKind::Ignored => {
                debug!(filename, "download is not a tree file");
                Vec::new()
            }
        }
    }
}

fn read_entry(
    archive: &mut ZipArchive<Cursor<Vec<u8>>>,
    index: usize,
    remaining: &mut u64,
) -> Option<(ArchiveEntry, Vec<u8>)> {
    let mut file = match archive.by_index(index) {
        Ok(file) => file,
        Err(err) => {
            warn!(index, %err, "unreadable zip entry");
            return None;
        }
    };
    if file.is_dir() {
        return None;
    }
    let Some(relative) = file
        .enclosed_name()
        .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
    else {
        warn!(name = file.name(), "zip entry outside the output folder, skipped");
        return None;
    };
    if is_resource_fork(&relative) {
        debug!(entry = %relative, "skipping resource fork");
        return None;
    }
    let entry = ArchiveEntry::new(relative);
    if entry.kind == EntryKind::Ignored {
        debug!(entry = %entry.path, "not a tree file");
        return None;
    }
    if file.size() > *remaining {
        warn!(
            entry = %entry.path,
            size = file.size(),
            remaining = *remaining,
            "zip entry over extraction limit, skipped"
        );
        return None;
    }
    let mut bytes = Vec::with_capacity(file.size() as usize);
    let limit = remaining.saturating_add(1);
    if let Err(err) = file.by_ref().take(limit).read_to_end(&mut bytes) {
        warn!(entry = %entry.path, %err, "failed to read zip entry");
        return None;
    }
    let read = bytes.len() as u64;
    if read > *remaining {
        warn!(
            entry = %entry.path,
            remaining = *remaining,
            "zip entry inflated past extraction limit, skipped"
        );
        return None;
    }
    *remaining -= read;
    Some((entry, bytes))
}

fn keep_if_tree(target: Utf8PathBuf, bytes: &[u8]) -> Option<Utf8PathBuf> {
    if !write(&target, bytes) {
        return None;
    }
    if is_valid_tree(&String::from_utf8_lossy(bytes)) {
        Some(target)
    } else {
        info!(path = %target, "not a tree file, removed");
        fs_util::discard(&target);
        None
    }
}

fn write(target: &Utf8Path, bytes: &[u8]) -> bool {
    match fs_util::write_file(target, bytes) {
        Ok(()) => true,
        Err(err) => {
            warn!(path = %target, %err, "failed to write extracted file");
            false
        }
    }
}

fn is_resource_fork(path: &Utf8Path) -> bool {
    path.components()
        .any(|component| component.as_str() == "__MACOSX")
        || path
            .file_name()
            .map(|name| name.starts_with("._"))
            .unwrap_or(false)
}

fn suffix_of(name: &str) -> String {
    Utf8Path::new(name)
        .extension()
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}
