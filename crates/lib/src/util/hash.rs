//! Fingerprints for drift detection.
//!
//! [`ConfigHash`] identifies a resource's rendered configuration; it is stored in state
//! records and stamped on runtime objects as a label. [`context_digest`] fingerprints an
//! image build context so that edits to the context trigger a rebuild.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::consts::CONFIG_HASH_PREFIX_LEN;

pub type HashError = serde_json::Error;

/// Truncated SHA-256 of a value's JSON form, as lowercase hex.
///
/// Configuration maps are `BTreeMap`s, so key order never affects the hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigHash(pub String);

impl std::fmt::Display for ConfigHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<ConfigHash, HashError> {
    let json = serde_json::to_vec(self)?;
    let mut hex = hex_digest(Sha256::digest(&json));
    hex.truncate(CONFIG_HASH_PREFIX_LEN);
    Ok(ConfigHash(hex))
  }
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
  #[error("cannot walk {path}: {source}")]
  Walk {
    path: PathBuf,
    #[source]
    source: walkdir::Error,
  },

  #[error("cannot read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Digest of a build context directory.
///
/// Covers relative paths, file contents and symlink targets, in path order. Timestamps and
/// permissions are ignored. Entries whose file name is in `exclude` are skipped with
/// everything below them.
pub fn context_digest(root: &Path, exclude: &[&str]) -> Result<String, ContextError> {
  let walker = WalkDir::new(root)
    .min_depth(1)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(|entry| entry.file_name().to_str().is_none_or(|name| !exclude.contains(&name)));

  let mut hasher = Sha256::new();
  for entry in walker {
    let entry = entry.map_err(|source| ContextError::Walk {
      path: root.to_path_buf(),
      source,
    })?;
    let path = entry.path();
    let relative = path.strip_prefix(root).unwrap_or(path).to_string_lossy();
    let read_err = |source| ContextError::Read {
      path: path.to_path_buf(),
      source,
    };

    let file_type = entry.file_type();
    let line = if file_type.is_symlink() {
      let target = std::fs::read_link(path).map_err(read_err)?;
      format!("link {} -> {}", relative, target.to_string_lossy())
    } else if file_type.is_dir() {
      format!("dir {}", relative)
    } else if file_type.is_file() {
      let mut file_hasher = Sha256::new();
      io::copy(&mut File::open(path).map_err(read_err)?, &mut file_hasher).map_err(read_err)?;
      format!("file {} {}", relative, hex_digest(file_hasher.finalize()))
    } else {
      // sockets, fifos, devices
      continue;
    };
    hasher.update(line.as_bytes());
    hasher.update(b"\n");
  }

  Ok(hex_digest(hasher.finalize()))
}

fn hex_digest(bytes: impl AsRef<[u8]>) -> String {
  bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;
  use std::fs;

  use super::*;
  use tempfile::TempDir;

  #[derive(Serialize)]
  struct Labels(BTreeMap<&'static str, &'static str>);

  impl Hashable for Labels {}

  fn context() -> TempDir {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("Dockerfile"), "FROM alpine\nCOPY app /app\n").unwrap();
    fs::create_dir(temp.path().join("app")).unwrap();
    fs::write(temp.path().join("app").join("main.sh"), "echo hi").unwrap();
    temp
  }

  #[test]
  fn config_hash_is_truncated_hex() {
    let hash = Labels(BTreeMap::from([("tier", "web")])).compute_hash().unwrap();
    assert_eq!(hash.0.len(), CONFIG_HASH_PREFIX_LEN);
    assert!(hash.0.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
  }

  #[test]
  fn config_hash_ignores_insertion_order() {
    let mut forward = BTreeMap::new();
    forward.insert("a", "1");
    forward.insert("b", "2");
    let mut backward = BTreeMap::new();
    backward.insert("b", "2");
    backward.insert("a", "1");
    assert_eq!(
      Labels(forward).compute_hash().unwrap(),
      Labels(backward).compute_hash().unwrap()
    );
  }

  #[test]
  fn context_digest_is_stable() {
    let temp = context();
    assert_eq!(
      context_digest(temp.path(), &[]).unwrap(),
      context_digest(temp.path(), &[]).unwrap()
    );
    assert_eq!(context_digest(temp.path(), &[]).unwrap().len(), 64);
  }

  #[test]
  fn editing_a_file_changes_the_digest() {
    let temp = context();
    let before = context_digest(temp.path(), &[]).unwrap();
    fs::write(temp.path().join("app").join("main.sh"), "echo bye").unwrap();
    assert_ne!(before, context_digest(temp.path(), &[]).unwrap());
  }

  #[test]
  fn moving_a_file_changes_the_digest() {
    let temp = context();
    let before = context_digest(temp.path(), &[]).unwrap();
    fs::rename(temp.path().join("app").join("main.sh"), temp.path().join("main.sh")).unwrap();
    assert_ne!(before, context_digest(temp.path(), &[]).unwrap());
  }

  #[test]
  fn excluded_entries_are_ignored() {
    let temp = context();
    let before = context_digest(temp.path(), &[".git"]).unwrap();
    fs::create_dir(temp.path().join(".git")).unwrap();
    fs::write(temp.path().join(".git").join("HEAD"), "ref: refs/heads/main").unwrap();
    assert_eq!(before, context_digest(temp.path(), &[".git"]).unwrap());
  }

  #[cfg(unix)]
  #[test]
  fn symlink_targets_are_part_of_the_digest() {
    let temp = context();
    std::os::unix::fs::symlink("app/main.sh", temp.path().join("entry")).unwrap();
    let before = context_digest(temp.path(), &[]).unwrap();
    fs::remove_file(temp.path().join("entry")).unwrap();
    std::os::unix::fs::symlink("Dockerfile", temp.path().join("entry")).unwrap();
    assert_ne!(before, context_digest(temp.path(), &[]).unwrap());
  }

  #[test]
  fn missing_context_is_an_error() {
    let temp = TempDir::new().unwrap();
    assert!(context_digest(&temp.path().join("absent"), &[]).is_err());
  }
}
