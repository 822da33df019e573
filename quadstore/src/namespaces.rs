//! Namespace prefixes.
//!
//! The committed prefix map lives in `namespaces.dat` and is rewritten as a
//! whole at commit: the new image goes to a temporary file that is synced and
//! renamed over the old one, so a crash leaves either the old or the new map.
//!
//! ```text
//! "QSNS" [version u32] [count u32] ([len u32][prefix][len u32][name])* [crc32 u32]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard};

/// File name inside the store directory.
pub const NAMESPACES_FILE_NAME: &str = "namespaces.dat";

const MAGIC: &[u8; 4] = b"QSNS";
const VERSION: u32 = 1;

/// The committed namespace map of one store.
pub struct Namespaces {
    path: PathBuf,
    map: RwLock<BTreeMap<String, String>>,
    force_sync: bool,
}

impl Namespaces {
    /// Load `namespaces.dat` from `dir`; a missing file is an empty map.
    pub fn open(dir: &Path, force_sync: bool) -> Result<Self, NamespaceError> {
        let path = dir.join(NAMESPACES_FILE_NAME);
        let map = match fs::read(&path) {
            Ok(bytes) => decode(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(NamespaceError::Io(e)),
        };
        Ok(Self {
            path,
            map: RwLock::new(map),
            force_sync,
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, String>>, NamespaceError> {
        self.map.read().map_err(|_| NamespaceError::LockPoisoned)
    }

    /// Committed name for `prefix`.
    pub fn get(&self, prefix: &str) -> Result<Option<String>, NamespaceError> {
        Ok(self.read()?.get(prefix).cloned())
    }

    /// Every committed mapping, ordered by prefix.
    pub fn all(&self) -> Result<BTreeMap<String, String>, NamespaceError> {
        Ok(self.read()?.clone())
    }

    /// Persist `changes` on top of the committed map and publish the result.
    pub fn apply(&self, changes: &NamespaceChanges) -> Result<(), NamespaceError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut map = self.map.write().map_err(|_| NamespaceError::LockPoisoned)?;
        let next = changes.merged(&map);
        self.write_file(&next)?;
        tracing::debug!(namespaces = next.len(), "persisted namespaces");
        *map = next;
        Ok(())
    }

    fn write_file(&self, map: &BTreeMap<String, String>) -> Result<(), NamespaceError> {
        let tmp = self.path.with_extension("dat.tmp");
        fs::write(&tmp, encode(map))?;
        if self.force_sync {
            fs::File::open(&tmp)?.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        #[cfg(unix)]
        if self.force_sync
            && let Some(dir) = self.path.parent()
        {
            fs::File::open(dir)?.sync_all()?;
        }
        Ok(())
    }
}

/// Namespace edits buffered in a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceChanges {
    cleared: bool,
    /// `None` removes the prefix.
    edits: BTreeMap<String, Option<String>>,
}

impl NamespaceChanges {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.cleared && self.edits.is_empty()
    }

    pub fn set(&mut self, prefix: &str, name: &str) {
        self.edits.insert(prefix.to_string(), Some(name.to_string()));
    }

    pub fn remove(&mut self, prefix: &str) {
        self.edits.insert(prefix.to_string(), None);
    }

    pub fn clear(&mut self) {
        self.cleared = true;
        self.edits.clear();
    }

    /// Name of `prefix` as this transaction sees it.
    pub fn get(&self, committed: &Namespaces, prefix: &str) -> Result<Option<String>, NamespaceError> {
        match self.edits.get(prefix) {
            Some(edit) => Ok(edit.clone()),
            None if self.cleared => Ok(None),
            None => committed.get(prefix),
        }
    }

    /// The committed map with these edits applied.
    #[must_use]
    pub fn merged(&self, committed: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut map = if self.cleared {
            BTreeMap::new()
        } else {
            committed.clone()
        };
        for (prefix, edit) in &self.edits {
            match edit {
                Some(name) => map.insert(prefix.clone(), name.clone()),
                None => map.remove(prefix),
            };
        }
        map
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn encode(map: &BTreeMap<String, String>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_be_bytes());
    out.extend_from_slice(&(map.len() as u32).to_be_bytes());
    for (prefix, name) in map {
        put_str(&mut out, prefix);
        put_str(&mut out, name);
    }
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

fn decode(bytes: &[u8]) -> Result<BTreeMap<String, String>, NamespaceError> {
    let corrupt = |msg: &str| NamespaceError::Corruption(msg.to_string());
    if bytes.len() < 16 || &bytes[0..4] != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let (body, crc) = bytes.split_at(bytes.len() - 4);
    let mut expected = [0u8; 4];
    expected.copy_from_slice(crc);
    if crc32fast::hash(body) != u32::from_be_bytes(expected) {
        return Err(corrupt("checksum mismatch"));
    }

    let mut pos = 4;
    let u32_at = |pos: &mut usize| -> Result<u32, NamespaceError> {
        let slice = body
            .get(*pos..*pos + 4)
            .ok_or_else(|| corrupt("truncated"))?;
        *pos += 4;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(slice);
        Ok(u32::from_be_bytes(buf))
    };
    let version = u32_at(&mut pos)?;
    if version != VERSION {
        return Err(NamespaceError::Corruption(format!(
            "unsupported version {version}"
        )));
    }
    let count = u32_at(&mut pos)?;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let mut strings = [String::new(), String::new()];
        for s in &mut strings {
            let len = u32_at(&mut pos)? as usize;
            let raw = body
                .get(pos..pos + len)
                .ok_or_else(|| corrupt("truncated"))?;
            pos += len;
            *s = String::from_utf8(raw.to_vec()).map_err(|_| corrupt("invalid UTF-8"))?;
        }
        let [prefix, name] = strings;
        map.insert(prefix, name);
    }
    Ok(map)
}

/// Errors reading or writing `namespaces.dat`.
#[derive(Debug)]
pub enum NamespaceError {
    Io(std::io::Error),
    Corruption(String),
    LockPoisoned,
}

impl std::fmt::Display for NamespaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "namespace file I/O error: {e}"),
            Self::Corruption(msg) => write!(f, "corrupt namespace file: {msg}"),
            Self::LockPoisoned => write!(f, "namespace lock poisoned"),
        }
    }
}

impl std::error::Error for NamespaceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NamespaceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_persist_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let namespaces = Namespaces::open(dir.path(), true).expect("open");
        let mut changes = NamespaceChanges::default();
        changes.set("ex", "http://example.org/");
        changes.set("foaf", "http://xmlns.com/foaf/0.1/");
        namespaces.apply(&changes).expect("apply");

        let reopened = Namespaces::open(dir.path(), true).expect("reopen");
        assert_eq!(
            reopened.get("ex").expect("get"),
            Some("http://example.org/".to_string())
        );
        assert_eq!(reopened.all().expect("all").len(), 2);
        assert!(!dir.path().join("namespaces.dat.tmp").exists());
    }

    #[test]
    fn test_buffered_edits_shadow_committed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let namespaces = Namespaces::open(dir.path(), false).expect("open");
        let mut base = NamespaceChanges::default();
        base.set("a", "urn:a");
        base.set("b", "urn:b");
        namespaces.apply(&base).expect("apply");

        let mut changes = NamespaceChanges::default();
        changes.remove("a");
        assert_eq!(changes.get(&namespaces, "a").expect("get"), None);
        assert_eq!(
            changes.get(&namespaces, "b").expect("get"),
            Some("urn:b".into())
        );
        // Nothing is visible to others until applied.
        assert_eq!(namespaces.get("a").expect("get"), Some("urn:a".into()));

        changes.clear();
        changes.set("c", "urn:c");
        assert_eq!(changes.get(&namespaces, "b").expect("get"), None);
        namespaces.apply(&changes).expect("apply");
        let all = namespaces.all().expect("all");
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["c"]);
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let namespaces = Namespaces::open(dir.path(), false).expect("open");
        let mut changes = NamespaceChanges::default();
        changes.set("ex", "http://example.org/");
        namespaces.apply(&changes).expect("apply");

        let path = dir.path().join(NAMESPACES_FILE_NAME);
        let mut bytes = fs::read(&path).expect("read");
        bytes[14] ^= 0x55;
        fs::write(&path, bytes).expect("write");
        assert!(matches!(
            Namespaces::open(dir.path(), false),
            Err(NamespaceError::Corruption(_))
        ));
    }
}
