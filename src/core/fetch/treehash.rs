// src/core/fetch/treehash.rs

//! Dual-convention tree hashing over a decompressed tar stream (C5).
//!
//! Two SHA-1 digests are produced from a single traversal of the materialized
//! tar bytes: one over every entry ("no-skip"), and one that omits directory
//! entries with no file descendants ("skip-empty") — the convention used by
//! older tarballs. A directory's emptiness can only be known after seeing every
//! entry below it, so entries are walked twice: a cheap first pass collects
//! which directories have file descendants, and a second pass feeds each
//! entry's bytes into one or both hashers.

use std::collections::HashSet;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tar::EntryType;

/// Decompressed tar bytes, either held in memory or spooled to disk, depending
/// on the streaming threshold applied during download.
pub enum Materialized {
    InMemory(Vec<u8>),
    OnDisk(PathBuf),
}

impl Materialized {
    fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        match self {
            Materialized::InMemory(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            Materialized::OnDisk(path) => Ok(Box::new(std::io::BufReader::new(
                std::fs::File::open(path)?,
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeHashes {
    pub skip_empty: String,
    pub no_skip: String,
}

fn normalized_dir(path: &str) -> String {
    path.trim_end_matches('/').to_string()
}

fn entry_type_tag(ty: EntryType) -> u8 {
    if ty.is_dir() {
        b'd'
    } else if ty.is_symlink() {
        b'l'
    } else {
        b'f'
    }
}

/// Computes both tree hashes over `src` in a single two-pass traversal.
pub fn compute_tree_hashes(src: &Materialized) -> io::Result<TreeHashes> {
    let mut dirs_with_file_descendants: HashSet<String> = HashSet::new();
    {
        let mut archive = tar::Archive::new(src.reader()?);
        for entry in archive.entries()? {
            let entry = entry?;
            if entry.header().entry_type().is_file() {
                let path = entry.path()?.to_string_lossy().to_string();
                let mut p = Path::new(&path).parent();
                while let Some(parent) = p {
                    if parent.as_os_str().is_empty() {
                        break;
                    }
                    dirs_with_file_descendants.insert(normalized_dir(&parent.to_string_lossy()));
                    p = parent.parent();
                }
            }
        }
    }

    let mut skip_hasher = Sha1::new();
    let mut noskip_hasher = Sha1::new();
    {
        let mut archive = tar::Archive::new(src.reader()?);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let ty = entry.header().entry_type();
            let path = entry.path()?.to_string_lossy().to_string();
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;

            let mut record = Vec::with_capacity(content.len() + path.len() + 16);
            record.push(entry_type_tag(ty));
            record.push(0);
            record.extend_from_slice(path.as_bytes());
            record.push(0);
            record.extend_from_slice(&(content.len() as u64).to_le_bytes());
            record.extend_from_slice(&content);

            noskip_hasher.update(&record);

            let is_empty_dir = ty.is_dir() && !dirs_with_file_descendants.contains(&normalized_dir(&path));
            if !is_empty_dir {
                skip_hasher.update(&record);
            }
        }
    }

    Ok(TreeHashes {
        skip_empty: hex::encode(skip_hasher.finalize()),
        no_skip: hex::encode(noskip_hasher.finalize()),
    })
}
