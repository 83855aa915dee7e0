//! Artifact manifest and the output directory store.
//!
//! The manifest is static: a list of files the compile step must produce and
//! the flat names they get in the output directory. Collection is
//! all-or-nothing; a run either refreshes every listed file or leaves the
//! output directory untouched.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, warn};

use crate::error::{BuildError, Result};
use crate::orchestrator::BuildPhase;

/// One file to copy out of the build tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the build directory.
    pub source: PathBuf,
    /// File name inside the output directory.
    pub dest_name: String,
}

impl ManifestEntry {
    pub fn new(source: impl Into<PathBuf>, dest_name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            dest_name: dest_name.into(),
        }
    }
}

/// Ordered list of artifacts produced by a successful compile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    entries: Vec<ManifestEntry>,
}

impl ArtifactManifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    /// Build from `(source, dest_name)` pairs.
    pub fn from_pairs<S, D>(pairs: impl IntoIterator<Item = (S, D)>) -> Self
    where
        S: Into<PathBuf>,
        D: Into<String>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(s, d)| ManifestEntry::new(s, d))
                .collect(),
        )
    }

    /// The artifacts of the native project as built by the image.
    pub fn standard() -> Self {
        Self::from_pairs([
            ("lib/libkiln_native.so", "libkiln_native.so"),
            ("python/_kiln_native.abi3.so", "_kiln_native.abi3.so"),
        ])
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check that every destination is a plain file name and unique.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut seen = HashSet::new();
        for entry in &self.entries {
            let mut components = Path::new(&entry.dest_name).components();
            let flat = matches!(
                (components.next(), components.next()),
                (Some(Component::Normal(_)), None)
            );
            if !flat {
                return Err(format!(
                    "destination '{}' must be a plain file name",
                    entry.dest_name
                ));
            }
            if !seen.insert(entry.dest_name.as_str()) {
                return Err(format!("duplicate destination '{}'", entry.dest_name));
            }
        }
        Ok(())
    }
}

/// A file written to the output directory by [`ArtifactStore::collect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedArtifact {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    /// Hex-encoded SHA-256 of the file contents.
    pub sha256: String,
}

/// One line of the completion listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub name: String,
    pub size: u64,
}

/// Filesystem location holding build outputs.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy every manifest entry from `build_dir` into the store.
    ///
    /// All sources are checked before anything is written. Copies land in
    /// temp files next to their destination and are renamed into place only
    /// once every copy has succeeded. Replaced files are moved aside first
    /// and restored if a later rename fails.
    pub fn collect(
        &self,
        manifest: &ArtifactManifest,
        build_dir: &Path,
    ) -> Result<Vec<CollectedArtifact>> {
        let phase = BuildPhase::Collect;

        manifest
            .validate()
            .map_err(|reason| BuildError::InvalidManifest { phase, reason })?;

        let mut sources = Vec::with_capacity(manifest.entries().len());
        for entry in manifest.entries() {
            let path = build_dir.join(&entry.source);
            if !path.is_file() {
                return Err(BuildError::MissingArtifact { phase, path });
            }
            sources.push((entry, path));
        }

        fs::create_dir_all(&self.root).map_err(|source| BuildError::Environment {
            phase,
            path: self.root.clone(),
            source,
        })?;

        let mut staged = Vec::with_capacity(sources.len());
        for (entry, source_path) in sources {
            let (tmp, size, sha256) = stage_copy(&source_path, &self.root)?;
            staged.push((entry, tmp, size, sha256));
        }

        let mut journal = Vec::with_capacity(staged.len());
        let mut collected = Vec::with_capacity(staged.len());
        for (entry, tmp, size, sha256) in staged {
            let dest = self.root.join(&entry.dest_name);
            if let Err(e) = replace_file(tmp, &dest, &self.root, &mut journal) {
                roll_back(journal);
                return Err(e);
            }
            debug!(artifact = %entry.dest_name, size, "collected artifact");
            collected.push(CollectedArtifact {
                name: entry.dest_name.clone(),
                path: dest,
                size,
                sha256,
            });
        }

        Ok(collected)
    }

    /// Files currently in the store, sorted by name.
    pub fn listing(&self) -> Result<Vec<ListingEntry>> {
        let env_err = |source| BuildError::Environment {
            phase: BuildPhase::Done,
            path: self.root.clone(),
            source,
        };

        let mut entries = Vec::new();
        for dirent in fs::read_dir(&self.root).map_err(env_err)? {
            let dirent = dirent.map_err(env_err)?;
            let metadata = dirent.metadata().map_err(env_err)?;
            if !metadata.is_file() {
                continue;
            }
            entries.push(ListingEntry {
                name: dirent.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

/// Render a listing the way `ls -l` users expect to read it.
pub fn render_listing(root: &Path, entries: &[ListingEntry]) -> String {
    let mut out = format!("{}:\n", root.display());
    let width = entries
        .iter()
        .map(|e| e.size.to_string().len())
        .max()
        .unwrap_or(0);
    for entry in entries {
        out.push_str(&format!("  {:>width$}  {}\n", entry.size, entry.name));
    }
    out
}

/// A destination overwritten during collection, with the previous file if
/// there was one.
struct Replaced {
    dest: PathBuf,
    backup: Option<TempPath>,
}

fn replace_file(
    tmp: NamedTempFile,
    dest: &Path,
    root: &Path,
    journal: &mut Vec<Replaced>,
) -> Result<()> {
    let env_err = |source| BuildError::Environment {
        phase: BuildPhase::Collect,
        path: dest.to_path_buf(),
        source,
    };

    let backup = if dest.is_file() {
        let backup = NamedTempFile::new_in(root).map_err(env_err)?.into_temp_path();
        fs::rename(dest, &backup).map_err(env_err)?;
        Some(backup)
    } else {
        None
    };
    journal.push(Replaced {
        dest: dest.to_path_buf(),
        backup,
    });

    tmp.persist(dest).map_err(|e| env_err(e.error))?;
    Ok(())
}

/// Undo `journal` newest first. Backups not restored are deleted on drop.
fn roll_back(journal: Vec<Replaced>) {
    for replaced in journal.into_iter().rev() {
        let restored = match &replaced.backup {
            Some(backup) => fs::rename(backup, &replaced.dest),
            None if replaced.dest.is_file() => fs::remove_file(&replaced.dest),
            None => Ok(()),
        };
        if let Err(e) = restored {
            warn!(path = %replaced.dest.display(), error = %e, "failed to restore artifact");
        }
    }
}

fn stage_copy(source_path: &Path, dest_dir: &Path) -> Result<(NamedTempFile, u64, String)> {
    let phase = BuildPhase::Collect;
    let src_err = |source| BuildError::Environment {
        phase,
        path: source_path.to_path_buf(),
        source,
    };
    let dest_err = |source| BuildError::Environment {
        phase,
        path: dest_dir.to_path_buf(),
        source,
    };

    let mut input = File::open(source_path).map_err(src_err)?;
    let permissions = input.metadata().map_err(src_err)?.permissions();

    let mut tmp = NamedTempFile::new_in(dest_dir).map_err(dest_err)?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = input.read(&mut buf).map_err(src_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        tmp.write_all(&buf[..n]).map_err(dest_err)?;
        size += n as u64;
    }
    tmp.as_file().sync_all().map_err(dest_err)?;
    tmp.as_file().set_permissions(permissions).map_err(dest_err)?;

    Ok((tmp, size, hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_validate_rejects_nested_destination() {
        let manifest = ArtifactManifest::from_pairs([("a.so", "lib/a.so")]);
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_destination() {
        let manifest = ArtifactManifest::from_pairs([("a.so", "x.so"), ("b.so", "x.so")]);
        assert!(manifest.validate().unwrap_err().contains("duplicate"));
    }

    #[test]
    fn test_standard_manifest_is_valid() {
        assert!(ArtifactManifest::standard().validate().is_ok());
        assert!(!ArtifactManifest::standard().is_empty());
    }

    #[test]
    fn test_collect_copies_flat_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        write(&build.join("lib/liba.so"), b"alpha");
        let store = ArtifactStore::new(dir.path().join("out"));
        let manifest = ArtifactManifest::from_pairs([("lib/liba.so", "liba.so")]);

        let collected = store.collect(&manifest, &build).unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].size, 5);
        assert_eq!(fs::read(dir.path().join("out/liba.so")).unwrap(), b"alpha");
        assert_eq!(collected[0].sha256.len(), 64);
    }

    #[test]
    fn test_collect_missing_source_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        write(&build.join("present.so"), b"x");
        let out = dir.path().join("out");
        let store = ArtifactStore::new(&out);
        let manifest = ArtifactManifest::from_pairs([
            ("present.so", "present.so"),
            ("absent.so", "absent.so"),
        ]);

        let err = store.collect(&manifest, &build).unwrap_err();
        assert!(matches!(err, BuildError::MissingArtifact { .. }));
        assert!(!out.join("present.so").exists());
    }

    #[test]
    fn test_collect_failed_rename_restores_previous_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        write(&build.join("liba.so"), b"new alpha");
        write(&build.join("libb.so"), b"new beta");
        let out = dir.path().join("out");
        write(&out.join("liba.so"), b"old alpha");
        // A non-empty directory where the second file should land.
        write(&out.join("libb.so/keep"), b"k");

        let store = ArtifactStore::new(&out);
        let manifest =
            ArtifactManifest::from_pairs([("liba.so", "liba.so"), ("libb.so", "libb.so")]);

        let err = store.collect(&manifest, &build).unwrap_err();
        assert!(matches!(err, BuildError::Environment { .. }));
        assert_eq!(fs::read(out.join("liba.so")).unwrap(), b"old alpha");
        assert_eq!(fs::read(out.join("libb.so/keep")).unwrap(), b"k");

        let names: Vec<String> = store.listing().unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["liba.so".to_string()]);
    }

    #[test]
    fn test_collect_replaces_existing_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        write(&build.join("liba.so"), b"new");
        let out = dir.path().join("out");
        write(&out.join("liba.so"), b"old");

        let store = ArtifactStore::new(&out);
        let manifest = ArtifactManifest::from_pairs([("liba.so", "liba.so")]);
        store.collect(&manifest, &build).unwrap();

        assert_eq!(fs::read(out.join("liba.so")).unwrap(), b"new");
        assert_eq!(store.listing().unwrap().len(), 1);
    }

    #[test]
    fn test_listing_sorted_and_rendered() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("b.so"), b"bb");
        write(&dir.path().join("a.so"), b"a");
        fs::create_dir(dir.path().join("sub")).unwrap();

        let store = ArtifactStore::new(dir.path());
        let listing = store.listing().unwrap();
        let names: Vec<&str> = listing.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.so", "b.so"]);

        let rendered = render_listing(dir.path(), &listing);
        assert!(rendered.contains("a.so"));
        assert!(rendered.lines().count() == 3);
    }
}
