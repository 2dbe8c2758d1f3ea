//! Import map: stable path to resource id lookup.
//!
//! Ids are derived from the BLAKE3 hash of the normalized absolute path, so
//! the same path yields the same id in every run and process. Looked up
//! entries are recorded in a map file, one per line:
//!
//! ```text
//! <uuid> <signature-hex16> <normalized path>
//! ```

use crate::error::{Error, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

/// Resolved identity of an imported source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    /// Normalized absolute path, `/` separated.
    pub path: String,
    pub id: Uuid,
    /// Path signature, independent of the id bits.
    pub signature: u64,
}

impl ImportEntry {
    /// Derive the entry for a path.
    pub fn derive(path: &Path) -> Result<Self> {
        let normalized = normalize_path(path)?;
        let hash = blake3::hash(normalized.as_bytes());
        let bytes = hash.as_bytes();

        let mut id = [0u8; 16];
        id.copy_from_slice(&bytes[..16]);
        let mut signature = [0u8; 8];
        signature.copy_from_slice(&bytes[16..24]);

        Ok(Self {
            path: normalized,
            id: Uuid::from_bytes(id),
            signature: u64::from_le_bytes(signature),
        })
    }

    /// Serialize the entry to a map line.
    pub fn to_line(&self) -> String {
        format!("{} {:016x} {}", self.id.hyphenated(), self.signature, self.path)
    }

    /// Parse an entry from a map line.
    pub fn from_line(line: &str) -> Result<Self> {
        let mut parts = line.splitn(3, ' ');
        let (Some(id), Some(signature), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::parse(
                "import map",
                format!("expected 3 fields: {}", line),
            ));
        };

        let id = Uuid::parse_str(id)
            .map_err(|e| Error::parse("import map", format!("invalid id {}: {}", id, e)))?;
        let signature = u64::from_str_radix(signature, 16).map_err(|e| {
            Error::parse("import map", format!("invalid signature {}: {}", signature, e))
        })?;

        Ok(Self {
            path: path.to_string(),
            id,
            signature,
        })
    }
}

/// Make a path absolute and fold `.` and `..` lexically.
///
/// The result uses `/` separators regardless of host. Paths containing line
/// breaks are rejected.
pub fn normalize_path(path: &Path) -> Result<String> {
    if path.as_os_str().is_empty() {
        return Err(Error::invalid_argument("Empty import path"));
    }
    // One map line per entry
    if path.to_string_lossy().contains(['\n', '\r']) {
        return Err(Error::invalid_argument(format!(
            "Import path contains a line break: {:?}",
            path
        )));
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut prefix = String::new();
    let mut parts: Vec<String> = Vec::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(p) => prefix = p.as_os_str().to_string_lossy().replace('\\', "/"),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                parts.pop();
            }
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
        }
    }

    Ok(format!("{}/{}", prefix, parts.join("/")))
}

/// Recorded path to id mappings backed by a file.
#[derive(Debug, Clone)]
pub struct ImportMap {
    path: PathBuf,
}

impl ImportMap {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up the id for a source file path.
    ///
    /// Returns the recorded entry if the path was seen before; otherwise the
    /// derived entry is recorded and returned.
    pub fn lookup(&self, path: &Path) -> Result<ImportEntry> {
        let derived = ImportEntry::derive(path)?;
        if let Some(entry) = self.entries()?.into_iter().find(|e| e.path == derived.path) {
            return Ok(entry);
        }

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", derived.to_line())?;
        file.flush()?;

        tracing::debug!(path = %derived.path, id = %derived.id, "recorded import");
        Ok(derived)
    }

    /// All recorded entries, in recording order.
    pub fn entries(&self) -> Result<Vec<ImportEntry>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        // Paths may end in whitespace, so lines are parsed untrimmed
        content
            .lines()
            .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
            .map(ImportEntry::from_line)
            .collect()
    }
}
