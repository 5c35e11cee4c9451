//! Content-addressed storage for candidate artifacts.
//!
//! An artifact is the set of source files in the working copy after a
//! generation call. Each stored artifact lives under `<root>/<digest>/`, so the
//! same content is written once and a rollback can always restore it.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use coordination::ArtifactRef;
use ignore::WalkBuilder;
use tracing::{debug, info};

/// Directories never captured from the working copy.
const SKIP_DIRS: &[&str] = &["__pycache__", "node_modules", "target", "venv"];

/// Files of one candidate, keyed by path relative to the working copy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Artifact {
    pub files: BTreeMap<String, String>,
}

impl Artifact {
    pub fn new(files: BTreeMap<String, String>) -> Self {
        Self { files }
    }

    pub fn single(path: impl Into<String>, content: impl Into<String>) -> Self {
        let mut files = BTreeMap::new();
        files.insert(path.into(), content.into());
        Self { files }
    }

    /// blake3 over every `(path, content)` pair in path order.
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (path, content) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update(&[0]);
            hasher.update(&(content.len() as u64).to_le_bytes());
            hasher.update(content.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Capture the text files under `dir`, honouring `.gitignore` and skipping
    /// hidden entries and dependency caches.
    pub fn capture(dir: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();
        let walker = WalkBuilder::new(dir)
            .hidden(true)
            .git_ignore(true)
            .require_git(false)
            .filter_entry(|entry| {
                !entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| SKIP_DIRS.contains(&name))
            })
            .build();

        for entry in walker {
            let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            // Binary files are not part of a strategy artifact.
            let Ok(content) = std::fs::read_to_string(path) else {
                debug!(path = %path.display(), "Skipping non-UTF-8 file");
                continue;
            };
            let rel = path
                .strip_prefix(dir)
                .with_context(|| format!("{} is outside {}", path.display(), dir.display()))?;
            files.insert(rel.to_string_lossy().replace('\\', "/"), content);
        }
        Ok(Self { files })
    }

    /// Write every file into `dir`, creating parent directories.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        for (rel, content) in &self.files {
            let path = dir.join(checked_relative(rel)?);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::write(&path, content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        Ok(())
    }
}

/// Reject absolute paths and `..` so stored files cannot escape their directory.
fn checked_relative(rel: &str) -> Result<PathBuf> {
    let path = PathBuf::from(rel);
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        bail!("Artifact path '{rel}' must be relative and stay inside the artifact");
    }
    Ok(path)
}

/// Directory-per-digest artifact store.
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

    /// Persist `artifact` and return its reference. Idempotent per digest.
    pub fn store(&self, artifact: &Artifact) -> Result<ArtifactRef> {
        let digest = artifact.digest();
        let dir = self.root.join(&digest);
        if !dir.exists() {
            let staging = self.root.join(format!(".{digest}.tmp"));
            if staging.exists() {
                std::fs::remove_dir_all(&staging)?;
            }
            artifact.write_to(&staging)?;
            std::fs::rename(&staging, &dir)
                .with_context(|| format!("Failed to publish artifact {}", dir.display()))?;
            debug!(digest = %&digest[..12], files = artifact.files.len(), "Stored artifact");
        }
        Ok(ArtifactRef::new(digest, dir))
    }

    pub fn load(&self, reference: &ArtifactRef) -> Result<Artifact> {
        let artifact = Artifact::capture(&reference.path).with_context(|| {
            format!("Failed to load artifact {}", reference.short_digest())
        })?;
        if artifact.digest() != reference.digest {
            bail!(
                "Artifact {} is corrupt: content digest does not match",
                reference.short_digest()
            );
        }
        Ok(artifact)
    }

    /// Overwrite the working copy with a stored artifact.
    pub fn restore(&self, reference: &ArtifactRef, workdir: &Path) -> Result<Artifact> {
        let artifact = self.load(reference)?;
        artifact.write_to(workdir)?;
        info!(
            digest = %reference.short_digest(),
            workdir = %workdir.display(),
            "Restored artifact into working copy"
        );
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Artifact {
        let mut files = BTreeMap::new();
        files.insert("main.py".to_string(), "class Alpha: pass\n".to_string());
        files.insert("lib/util.py".to_string(), "def f(): return 1\n".to_string());
        Artifact::new(files)
    }

    #[test]
    fn digest_depends_on_paths_and_content() {
        let a = sample();
        let mut b = sample();
        assert_eq!(a.digest(), b.digest());

        b.files.insert("main.py".into(), "class Alpha: pass \n".into());
        assert_ne!(a.digest(), b.digest());

        let renamed = Artifact::single("other.py", "class Alpha: pass\n");
        let original = Artifact::single("main.py", "class Alpha: pass\n");
        assert_ne!(renamed.digest(), original.digest());
    }

    #[test]
    fn store_load_restore() {
        let store_dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(store_dir.path());

        let artifact = sample();
        let reference = store.store(&artifact).unwrap();
        assert_eq!(reference.digest, artifact.digest());
        assert_eq!(store.load(&reference).unwrap(), artifact);

        // Storing again is a no-op with the same reference.
        assert_eq!(store.store(&artifact).unwrap(), reference);

        std::fs::write(work.path().join("main.py"), "broken").unwrap();
        store.restore(&reference, work.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(work.path().join("main.py")).unwrap(),
            "class Alpha: pass\n"
        );
        assert!(work.path().join("lib/util.py").exists());
    }

    #[test]
    fn capture_skips_hidden_and_cache_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "x = 1\n").unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        std::fs::create_dir_all(dir.path().join("__pycache__")).unwrap();
        std::fs::write(dir.path().join("__pycache__/m.txt"), "c").unwrap();

        let artifact = Artifact::capture(dir.path()).unwrap();
        assert_eq!(artifact.files.len(), 1);
        assert_eq!(artifact.get("main.py"), Some("x = 1\n"));
    }

    #[test]
    fn capture_honours_gitignore() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "*.log\nbuild/\n").unwrap();
        std::fs::write(dir.path().join("main.py"), "x = 1\n").unwrap();
        std::fs::write(dir.path().join("backtest.log"), "noise").unwrap();
        std::fs::create_dir_all(dir.path().join("build")).unwrap();
        std::fs::write(dir.path().join("build/out.txt"), "compiled").unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("lib/signals.py"), "def s(): pass\n").unwrap();

        let artifact = Artifact::capture(dir.path()).unwrap();
        let paths: Vec<&str> = artifact.files.keys().map(String::as_str).collect();
        assert_eq!(paths, vec!["lib/signals.py", "main.py"]);
    }

    #[test]
    fn tampered_artifact_detected() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(store_dir.path());
        let reference = store.store(&sample()).unwrap();
        std::fs::write(reference.path.join("main.py"), "tampered").unwrap();
        assert!(store.load(&reference).is_err());
    }

    #[test]
    fn escaping_paths_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = Artifact::single("../evil.py", "x");
        assert!(artifact.write_to(dir.path()).is_err());
    }
}
