use crate::error::ExtractError;
use log::{info, warn};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

const TAR_BLOCK: usize = 512;
const MAX_LINK_HOPS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractOutcome {
    Extracted { entries: usize },
    /// The decompressed payload was not a tar archive. Nothing was extracted.
    NotAnArchive,
}

/// Decompresses a `.tar.zst` archive and unpacks it under a destination directory.
pub struct Extractor {
    archive: PathBuf,
    destination: PathBuf,
}

/// Decompressed tar living next to the extracted tree; removed on every exit path.
struct IntermediateFile {
    path: PathBuf,
}

impl IntermediateFile {
    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IntermediateFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Could not remove {}: {}", self.path.display(), e);
            }
        }
    }
}

impl Extractor {
    pub fn new(archive: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Result<Self, ExtractError> {
        let destination = destination.into();
        fs::create_dir_all(&destination).map_err(|e| ExtractError::io(&destination, e))?;
        Ok(Self {
            archive: archive.into(),
            destination,
        })
    }

    pub fn extract(&self) -> Result<ExtractOutcome, ExtractError> {
        let intermediate = IntermediateFile {
            path: self.intermediate_path(),
        };
        self.decompress_into(intermediate.path())?;

        if !is_tar_archive(intermediate.path())? {
            warn!("Extraction failed: {} does not contain a tar archive", self.archive.display());
            return Ok(ExtractOutcome::NotAnArchive);
        }

        let root = self
            .destination
            .canonicalize()
            .map_err(|e| ExtractError::io(&self.destination, e))?;

        // Every entry is checked before anything is written.
        validate_entries(intermediate.path(), &root)?;
        let entries = unpack_entries(intermediate.path(), &root)?;

        info!("Extraction complete: {} entries into {}", entries, root.display());
        Ok(ExtractOutcome::Extracted { entries })
    }

    fn intermediate_path(&self) -> PathBuf {
        let stem = self
            .archive
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_else(|| "archive.tar".into());
        self.destination.join(stem)
    }

    fn decompress_into(&self, target: &Path) -> Result<(), ExtractError> {
        let input = File::open(&self.archive).map_err(|e| ExtractError::io(&self.archive, e))?;
        let mut output = BufWriter::new(File::create(target).map_err(|e| ExtractError::io(target, e))?);

        zstd::stream::copy_decode(BufReader::new(input), &mut output).map_err(|source| {
            ExtractError::Decompress {
                archive: self.archive.clone(),
                source,
            }
        })?;
        output.flush().map_err(|e| ExtractError::io(target, e))
    }
}

/// Checks the first header block the way tar readers sniff a file: the stored
/// checksum must match the one recomputed over the block.
pub fn is_tar_archive(path: &Path) -> Result<bool, ExtractError> {
    let mut file = File::open(path).map_err(|e| ExtractError::io(path, e))?;
    let mut block = [0u8; TAR_BLOCK];
    match file.read_exact(&mut block) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(ExtractError::io(path, e)),
    }

    let header = tar::Header::from_byte_slice(&block);
    let stored = match header.cksum() {
        Ok(sum) => sum,
        Err(_) => return Ok(false),
    };
    let mut recomputed = header.clone();
    recomputed.set_cksum();
    Ok(recomputed.cksum().map(|sum| sum == stored).unwrap_or(false))
}

/// Symlinks created by earlier entries of the archive being checked, keyed by
/// their root-relative location. Targets are kept raw and resolved on use.
#[derive(Default)]
struct LinkTable {
    links: HashMap<PathBuf, PathBuf>,
}

impl LinkTable {
    /// Walks `path` from the root-relative directory `base`, substituting any
    /// recorded symlink met along the way. `None` means the walk left the root
    /// (or looped).
    fn resolve(&self, base: &Path, path: &Path, follow_last: bool) -> Option<PathBuf> {
        let mut hops = 0;
        self.walk(base.to_path_buf(), path, follow_last, &mut hops)
    }

    fn walk(&self, mut resolved: PathBuf, path: &Path, follow_last: bool, hops: &mut usize) -> Option<PathBuf> {
        let components: Vec<Component> = path.components().collect();
        for (i, component) in components.iter().enumerate() {
            match component {
                Component::Prefix(_) | Component::RootDir => return None,
                Component::CurDir => {}
                Component::ParentDir => {
                    if !resolved.pop() {
                        return None;
                    }
                }
                Component::Normal(name) => {
                    resolved.push(name);
                    if i + 1 == components.len() && !follow_last {
                        continue;
                    }
                    if let Some(target) = self.links.get(&resolved) {
                        *hops += 1;
                        if *hops > MAX_LINK_HOPS {
                            return None;
                        }
                        resolved.pop();
                        resolved = self.walk(resolved, target, true, hops)?;
                    }
                }
            }
        }
        Some(resolved)
    }

    fn record(&mut self, link: PathBuf, target: PathBuf) {
        self.links.insert(link, target);
    }
}

fn validate_entries(tar_path: &Path, root: &Path) -> Result<(), ExtractError> {
    let file = File::open(tar_path).map_err(|e| ExtractError::io(tar_path, e))?;
    let mut archive = tar::Archive::new(BufReader::new(file));
    let mut links = LinkTable::default();

    for entry in archive.entries().map_err(|e| ExtractError::io(tar_path, e))? {
        let entry = entry.map_err(|e| ExtractError::io(tar_path, e))?;
        let entry_path = entry
            .path()
            .map_err(|e| ExtractError::io(tar_path, e))?
            .into_owned();
        let traversal = || ExtractError::PathTraversal {
            entry: entry_path.clone(),
            destination: root.to_path_buf(),
        };

        let located = links.resolve(Path::new(""), &entry_path, false).ok_or_else(traversal)?;
        if !is_contained(root, &located)? {
            return Err(traversal());
        }

        let kind = entry.header().entry_type();
        if kind.is_symlink() || kind.is_hard_link() {
            if let Some(target) = entry.link_name().map_err(|e| ExtractError::io(tar_path, e))? {
                let target = target.into_owned();
                // Symlinks resolve from the entry's directory, hard links from the archive root.
                let base = if kind.is_symlink() {
                    located.parent().map(Path::to_path_buf).unwrap_or_default()
                } else {
                    PathBuf::new()
                };
                let resolved = links.resolve(&base, &target, true).ok_or_else(traversal)?;
                if !is_contained(root, &resolved)? {
                    return Err(traversal());
                }
                if kind.is_symlink() {
                    links.record(located, target);
                }
            }
        }
    }
    Ok(())
}

fn unpack_entries(tar_path: &Path, root: &Path) -> Result<usize, ExtractError> {
    let file = File::open(tar_path).map_err(|e| ExtractError::io(tar_path, e))?;
    let mut archive = tar::Archive::new(BufReader::new(file));
    let mut unpacked = Vec::new();

    for entry in archive.entries().map_err(|e| ExtractError::io(tar_path, e))? {
        let mut entry = entry.map_err(|e| ExtractError::io(tar_path, e))?;
        let entry_path = entry
            .path()
            .map_err(|e| ExtractError::io(tar_path, e))?
            .into_owned();
        let traversal = ExtractError::PathTraversal {
            entry: entry_path.clone(),
            destination: root.to_path_buf(),
        };

        match entry.unpack_in(root) {
            Ok(true) => unpacked.push(entry_path),
            Ok(false) => {
                remove_unpacked(root, &unpacked);
                return Err(traversal);
            }
            Err(e) => {
                // Judge against what is on disk now, before rolling it back.
                let escaped = !is_contained(root, &entry_path).unwrap_or(false);
                remove_unpacked(root, &unpacked);
                return Err(if escaped { traversal } else { ExtractError::io(&entry_path, e) });
            }
        }
    }
    Ok(unpacked.len())
}

/// Removes entries written before a failed unpack, newest first, along with
/// any directories the removal leaves empty.
fn remove_unpacked(root: &Path, unpacked: &[PathBuf]) {
    for relative in unpacked.iter().rev() {
        let path = root.join(relative);
        let removed = match fs::symlink_metadata(&path) {
            // Directories may hold files that predate this extraction.
            Ok(meta) if meta.is_dir() => {
                let _ = fs::remove_dir(&path);
                Ok(())
            }
            Ok(_) => fs::remove_file(&path),
            Err(_) => continue,
        };
        if let Err(e) = removed {
            warn!("Could not remove partially extracted {}: {}", path.display(), e);
        }

        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir == root || !dir.starts_with(root) || fs::remove_dir(dir).is_err() {
                break;
            }
            parent = dir.parent();
        }
    }
}

/// Resolves `relative` against the canonical `root` (lexically, then through any
/// symlinks already on disk) and reports whether the result stays under `root`.
fn is_contained(root: &Path, relative: &Path) -> Result<bool, ExtractError> {
    let mut resolved = PathBuf::new();
    for component in root.join(relative).components() {
        match component {
            Component::ParentDir => {
                if !resolved.pop() {
                    return Ok(false);
                }
            }
            Component::CurDir => {}
            other => resolved.push(other.as_os_str()),
        }
    }

    let resolved = canonicalize_existing_prefix(&resolved)?;
    Ok(resolved.starts_with(root))
}

fn canonicalize_existing_prefix(path: &Path) -> Result<PathBuf, ExtractError> {
    let mut existing = path.to_path_buf();
    let mut remainder = Vec::new();
    while !existing.exists() {
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                remainder.push(name);
                existing = parent.to_path_buf();
            }
            _ => return Ok(path.to_path_buf()),
        }
    }

    let mut canonical = existing.canonicalize().map_err(|e| ExtractError::io(&existing, e))?;
    for name in remainder.into_iter().rev() {
        canonical.push(name);
    }
    Ok(canonical)
}
