//! Filesystem-backed storage view.
//!
//! Keys map to files under a root directory. Every key segment becomes a
//! directory except the last, which becomes a file prefixed with `_`. This
//! lets a key and its descendants coexist:
//!
//! ```text
//! a7      -> <root>/_a7
//! a7/3    -> <root>/a7/_3
//! a7/3/c  -> <root>/a7/3/_c
//! ```
//!
//! Writes go to a temporary file in the target directory and are renamed
//! into place, so readers never observe a torn value.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::context::Context;
use crate::error::ViewResult;
use crate::traits::{validate_key, StorageView};

const FILE_MARKER: char = '_';

/// A [`StorageView`] rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileView {
    root: PathBuf,
}

impl FileView {
    /// Open (or create) a view rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> ViewResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        let mut segments = key.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_some() {
                path.push(segment);
            } else {
                path.push(format!("{FILE_MARKER}{segment}"));
            }
        }
        path
    }

    fn write_atomic(dir: &Path, path: &Path, value: &[u8]) -> io::Result<()> {
        let mut tmp = match tempfile::NamedTempFile::new_in(dir) {
            Ok(tmp) => tmp,
            // A concurrent delete may have pruned the directory.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(dir)?;
                tempfile::NamedTempFile::new_in(dir)?
            }
            Err(e) => return Err(e),
        };
        tmp.write_all(value)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Remove empty directories from `dir` up to (not including) the root.
    fn prune_empty_dirs(&self, mut dir: &Path) {
        while dir != self.root && dir.starts_with(&self.root) {
            if fs::remove_dir(dir).is_err() {
                break;
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }
}

impl StorageView for FileView {
    fn get(&self, ctx: &Context, key: &str) -> ViewResult<Option<Vec<u8>>> {
        ctx.check()?;
        validate_key(key)?;
        match fs::read(self.path_for(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, ctx: &Context, key: &str, value: &[u8]) -> ViewResult<()> {
        ctx.check()?;
        validate_key(key)?;
        let path = self.path_for(key);
        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&dir)?;
        Self::write_atomic(&dir, &path, value)?;
        debug!(key, len = value.len(), "file view put");
        Ok(())
    }

    fn delete(&self, ctx: &Context, key: &str) -> ViewResult<()> {
        ctx.check()?;
        validate_key(key)?;
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent);
        }
        Ok(())
    }

    fn list(&self, ctx: &Context, prefix: &str) -> ViewResult<Vec<String>> {
        ctx.check()?;
        let (dir_part, partial) = match prefix.rfind('/') {
            Some(pos) => (&prefix[..pos], &prefix[pos + 1..]),
            None => ("", prefix),
        };
        let dir = if dir_part.is_empty() {
            self.root.clone()
        } else {
            validate_key(dir_part)?;
            self.root.join(dir_part)
        };

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let child = if entry.file_type()?.is_dir() {
                format!("{name}/")
            } else if let Some(stripped) = name.strip_prefix(FILE_MARKER) {
                stripped.to_string()
            } else {
                // Temporary files from in-flight writes.
                continue;
            };
            if let Some(rest) = child.strip_prefix(partial) {
                if !rest.is_empty() {
                    out.push(rest.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }
}
