//! Release artifact sets: the local master payload and what devices carry.
//!
//! Comparison is by file name only; contents are never hashed.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::PreconditionError;
use crate::transport::RemoteEntry;

/// Release artifacts in the local master payload folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterSet {
    dir: PathBuf,
    files: BTreeSet<String>,
}

impl MasterSet {
    /// Read the regular files in `dir` whose names pass `filter`.
    pub fn read(dir: &Path, filter: impl Fn(&str) -> bool) -> Result<Self, PreconditionError> {
        let fail = |source| PreconditionError::MasterFolder {
            path: dir.to_path_buf(),
            source,
        };

        let mut files = BTreeSet::new();
        for entry in fs::read_dir(dir).map_err(fail)? {
            let entry = entry.map_err(fail)?;
            if !entry.file_type().map_err(fail)?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if filter(&name) {
                files.insert(name);
            }
        }

        debug!("Master payload {}: {:?}", dir.display(), files);
        Ok(Self {
            dir: dir.to_path_buf(),
            files,
        })
    }

    /// Sorted file names.
    pub fn names(&self) -> &BTreeSet<String> {
        &self.files
    }

    /// Local path of a master file.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Names of the files in a listing that pass `filter`, sorted.
pub fn artifact_names(entries: &[RemoteEntry], filter: impl Fn(&str) -> bool) -> BTreeSet<String> {
    entries
        .iter()
        .filter(|e| !e.is_dir && filter(&e.name))
        .map(|e| e.name.clone())
        .collect()
}

/// File-name difference between a device and the master set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadDiff {
    /// On the device but not in master.
    pub outdated: Vec<String>,

    /// In master but not on the device.
    pub missing: Vec<String>,
}

impl PayloadDiff {
    pub fn between(device: &BTreeSet<String>, master: &BTreeSet<String>) -> Self {
        Self {
            outdated: device.difference(master).cloned().collect(),
            missing: master.difference(device).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outdated.is_empty() && self.missing.is_empty()
    }
}

/// Manifest text: one name per line, each line newline-terminated.
pub fn render_manifest<'a>(names: impl IntoIterator<Item = &'a String>) -> String {
    names.into_iter().fold(String::new(), |mut text, name| {
        text.push_str(name);
        text.push('\n');
        text
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_diff() {
        let diff = PayloadDiff::between(&set(&["A.iso", "C.iso"]), &set(&["A.iso", "B.iso"]));
        assert_eq!(diff.outdated, vec!["C.iso"]);
        assert_eq!(diff.missing, vec!["B.iso"]);
        assert!(PayloadDiff::between(&set(&["A.iso"]), &set(&["A.iso"])).is_empty());
    }

    #[test]
    fn test_read_master() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("core-2.iso"), b"iso").unwrap();
        fs::write(dir.path().join("core-2.sig"), b"sig").unwrap();
        fs::write(dir.path().join("README"), b"txt").unwrap();
        fs::create_dir(dir.path().join("old.iso")).unwrap();

        let master = MasterSet::read(dir.path(), |n| n.ends_with(".iso")).unwrap();
        assert_eq!(master.names(), &set(&["core-2.iso"]));
        assert_eq!(master.path("core-2.iso"), dir.path().join("core-2.iso"));
    }

    #[test]
    fn test_missing_master() {
        let dir = tempfile::tempdir().unwrap();
        let err = MasterSet::read(&dir.path().join("absent"), |_| true).unwrap_err();
        assert!(matches!(err, PreconditionError::MasterFolder { .. }));
    }

    #[test]
    fn test_artifact_names_and_manifest() {
        let entries = vec![
            RemoteEntry::file("b.iso"),
            RemoteEntry::file("B.sig"),
            RemoteEntry::file("a.iso"),
            RemoteEntry::file("notes.txt"),
            RemoteEntry::dir("x.iso"),
        ];
        let names = artifact_names(&entries, |n| n.ends_with(".iso") || n.ends_with(".sig"));
        assert_eq!(render_manifest(&names), "B.sig\na.iso\nb.iso\n");
        assert_eq!(render_manifest(&BTreeSet::new()), "");
    }
}
