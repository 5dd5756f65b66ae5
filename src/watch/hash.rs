// src/watch/hash.rs

//! Content fingerprints for tracked files.
//!
//! A file's content id is a BLAKE3 digest of its bytes. Files recognized as
//! text (by extension, see [`HashPolicy`]) are whitespace-normalized first,
//! so purely cosmetic edits produce the same id:
//!
//! - every line is trimmed,
//! - internal runs of whitespace collapse to a single space,
//! - blank lines are dropped,
//! - the surviving lines are joined with `\n`.
//!
//! Anything else (or a "text" file that is not valid UTF-8) is hashed raw.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::Result;

/// Extensions hashed with whitespace normalization unless configured
/// otherwise.
pub const DEFAULT_TEXT_EXTENSIONS: &[&str] = &[
    "c", "cfg", "conf", "cpp", "css", "go", "h", "hpp", "html", "ini", "java",
    "js", "json", "lua", "md", "py", "rb", "rs", "sh", "toml", "ts", "txt",
    "yaml", "yml",
];

/// Decides which files are hashed as normalized text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashPolicy {
    text_extensions: BTreeSet<String>,
}

impl Default for HashPolicy {
    fn default() -> Self {
        Self::with_text_extensions(DEFAULT_TEXT_EXTENSIONS.iter().copied())
    }
}

impl HashPolicy {
    /// Build a policy from a list of extensions (with or without a leading
    /// dot, case-insensitive).
    pub fn with_text_extensions<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let text_extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self { text_extensions }
    }

    /// A policy that hashes every file raw.
    pub fn raw_only() -> Self {
        Self {
            text_extensions: BTreeSet::new(),
        }
    }

    pub fn text_extensions(&self) -> impl Iterator<Item = &str> {
        self.text_extensions.iter().map(String::as_str)
    }

    pub fn is_text(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.text_extensions.contains(&e.to_lowercase()))
            .unwrap_or(false)
    }

    /// Compute the content id of `path` under this policy.
    pub fn content_id(&self, path: &Path) -> Result<String> {
        if self.is_text(path) {
            let bytes = std::fs::read(path)?;
            match std::str::from_utf8(&bytes) {
                Ok(text) => {
                    debug!("hashing text file {:?}", path);
                    return Ok(hash_bytes(normalize_text(text).as_bytes()));
                }
                Err(_) => debug!("{:?} is not valid UTF-8; hashing raw", path),
            }
            return Ok(hash_bytes(&bytes));
        }
        compute_file_hash(path)
    }
}

/// Whitespace-normalize a text document (see module docs).
pub fn normalize_text(text: &str) -> String {
    let lines: Vec<String> = text
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect();
    lines.join("\n")
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Compute the raw hash of a single file.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let mut hasher = Hasher::new();
    let mut file = File::open(path)?;
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Compute the aggregate id of a set of files.
///
/// `entries` must already be sorted by path. Both the path and the content
/// id feed the digest, so the result changes whenever the set of paths or
/// any content changes.
pub fn compute_aggregate_hash<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a Path, &'a str)>,
{
    let mut hasher = Hasher::new();
    for (path, content_id) in entries {
        hasher.update(path.as_os_str().as_encoded_bytes());
        hasher.update(&[0]);
        hasher.update(content_id.as_bytes());
        hasher.update(&[b'\n']);
    }
    hasher.finalize().to_hex().to_string()
}
