use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use common::manifest::{
    render_template, vhost_legacy_path, vhost_location_path, EntryKind, ManifestEntry,
    ManifestError, ManifestFile,
};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("refusing to write outside the apply directory: {0:?}")]
    UnsafePath(String),
    #[error("no domain configured for vhost entry {0:?}")]
    NoVhostDomain(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ApplyError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Write `content` to `path` only if it differs from what is on disk.
///
/// Returns whether a write happened. The new content lands in a sibling
/// temporary file that is renamed over the target, so readers never observe
/// a partial file and a running executable can be replaced in place.
pub fn write_if_changed(path: &Path, content: &[u8]) -> Result<bool, ApplyError> {
    let previous = match fs::metadata(path) {
        Ok(metadata) => {
            let current = fs::read(path).map_err(|e| ApplyError::io(path, e))?;
            if current == content {
                return Ok(false);
            }
            Some(metadata.permissions())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(ApplyError::io(path, e)),
    };

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| ApplyError::io(parent, e))?;

    let mut staged = tempfile::NamedTempFile::new_in(parent).map_err(|e| ApplyError::io(parent, e))?;
    staged
        .write_all(content)
        .and_then(|_| staged.as_file().sync_all())
        .map_err(|e| ApplyError::io(staged.path(), e))?;
    if let Some(permissions) = previous {
        fs::set_permissions(staged.path(), permissions)
            .map_err(|e| ApplyError::io(staged.path(), e))?;
    }
    staged
        .persist(path)
        .map_err(|e| ApplyError::io(path, e.error))?;

    Ok(true)
}

/// Summary of one manifest application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Relative paths that were actually written
    pub written: Vec<String>,
    /// Protected entries that were ignored
    pub skipped: Vec<String>,
    /// Entries that failed to decode or write
    pub failed: usize,
    /// The agent's own executable was among the written files
    pub self_changed: bool,
}

impl ApplyReport {
    pub fn changed(&self) -> bool {
        !self.written.is_empty()
    }
}

enum EntryOutcome {
    Unchanged,
    Written(String),
    Skipped,
}

/// Reconciles manifest entries against a directory tree.
#[derive(Debug, Clone)]
pub struct Applier {
    root: PathBuf,
    vhost_domain: Option<String>,
    self_path: String,
}

impl Applier {
    pub fn new(root: impl Into<PathBuf>, vhost_domain: Option<String>, self_path: &str) -> Self {
        Self {
            root: root.into(),
            vhost_domain: vhost_domain.filter(|d| !d.is_empty()),
            self_path: canonical_relative(self_path),
        }
    }

    /// Apply every file of a manifest. A failing entry is logged and does
    /// not stop the others.
    pub fn apply(&self, files: &[ManifestFile]) -> ApplyReport {
        let mut report = ApplyReport::default();

        for file in files {
            let result = file
                .decode()
                .map_err(ApplyError::from)
                .and_then(|entry| self.apply_entry(&entry));

            match result {
                Ok(EntryOutcome::Written(relative_path)) => {
                    tracing::info!(path = %relative_path, "updated file");
                    if relative_path == self.self_path {
                        report.self_changed = true;
                    }
                    report.written.push(relative_path);
                }
                Ok(EntryOutcome::Skipped) => {
                    tracing::debug!(path = %file.path, "skipping protected file");
                    report.skipped.push(file.path.clone());
                }
                Ok(EntryOutcome::Unchanged) => {}
                Err(e) => {
                    tracing::error!(path = %file.path, "failed to apply manifest entry: {}", e);
                    report.failed += 1;
                }
            }
        }

        report
    }

    fn apply_entry(&self, entry: &ManifestEntry) -> Result<EntryOutcome, ApplyError> {
        match entry.kind() {
            EntryKind::Unsafe => Err(ApplyError::UnsafePath(entry.relative_path.clone())),
            EntryKind::Protected => Ok(EntryOutcome::Skipped),
            EntryKind::VirtualHost => {
                let domain = self
                    .vhost_domain
                    .as_deref()
                    .ok_or_else(|| ApplyError::NoVhostDomain(entry.relative_path.clone()))?;

                let legacy = self.root.join(vhost_legacy_path(domain));
                match fs::remove_file(&legacy) {
                    Ok(()) => tracing::info!(path = ?legacy, "removed superseded vhost file"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!(path = ?legacy, "failed to remove vhost file: {}", e),
                }

                let relative_path = vhost_location_path(domain);
                let content = render_template(entry.content.clone());
                self.write(relative_path, &content)
            }
            EntryKind::Regular => {
                let relative_path = canonical_relative(&entry.relative_path);
                self.write(relative_path, &entry.content)
            }
        }
    }

    fn write(&self, relative_path: String, content: &[u8]) -> Result<EntryOutcome, ApplyError> {
        if write_if_changed(&self.root.join(&relative_path), content)? {
            Ok(EntryOutcome::Written(relative_path))
        } else {
            Ok(EntryOutcome::Unchanged)
        }
    }
}

/// `./bin//probe` and `bin/probe` name the same file.
fn canonical_relative(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    use super::*;

    fn file(path: &str, content: &[u8]) -> ManifestFile {
        ManifestFile {
            path: path.to_string(),
            content_b64: STANDARD.encode(content),
        }
    }

    fn applier(dir: &tempfile::TempDir) -> Applier {
        Applier::new(dir.path(), Some("example.com".to_string()), "bin/probe")
    }

    #[test]
    fn test_write_if_changed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/file.txt");

        assert!(write_if_changed(&path, b"one").unwrap());
        assert!(!write_if_changed(&path, b"one").unwrap());
        assert!(write_if_changed(&path, b"two").unwrap());
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_preserves_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe");
        fs::write(&path, b"old").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

        assert!(write_if_changed(&path, b"new").unwrap());
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_second_apply_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let applier = applier(&dir);
        let manifest = vec![file("public/index.html", b"<h1>hi</h1>"), file("config\\app.json", b"{}")];

        let first = applier.apply(&manifest);
        assert_eq!(first.written, vec!["public/index.html", "config/app.json"]);
        assert!(first.changed());

        let second = applier.apply(&manifest);
        assert!(!second.changed());
        assert_eq!(second, ApplyReport::default());
    }

    #[test]
    fn test_protected_files_are_never_written() {
        let dir = tempfile::tempdir().unwrap();
        let applier = applier(&dir);
        for content in [&b""[..], b"SECRET=1", b"\x00\xff"] {
            let report = applier.apply(&[
                file(".env", content),
                file("deploy/prod.env", content),
                file("package-lock.json", content),
                file("Cargo.lock", content),
            ]);
            assert!(!report.changed());
            assert_eq!(report.skipped.len(), 4);
        }
        assert!(!dir.path().join(".env").exists());
        assert!(!dir.path().join("Cargo.lock").exists());
    }

    #[test]
    fn test_vhost_entry_is_remapped() {
        let dir = tempfile::tempdir().unwrap();
        let vhost = dir.path().join("vhost.d");
        fs::create_dir_all(&vhost).unwrap();
        fs::write(vhost.join("example.com"), b"old snippet").unwrap();

        let report = applier(&dir).apply(&[file("vhost.d/anything.conf", b"proxy_pass x;")]);

        assert_eq!(report.written, vec!["vhost.d/example.com_location"]);
        assert!(!vhost.join("example.com").exists());
        assert!(!vhost.join("anything.conf").exists());
        assert_eq!(
            fs::read(vhost.join("example.com_location")).unwrap(),
            b"proxy_pass x;"
        );
    }

    #[test]
    fn test_vhost_without_domain_fails_alone() {
        let dir = tempfile::tempdir().unwrap();
        let applier = Applier::new(dir.path(), None, "bin/probe");

        let report = applier.apply(&[file("vhost.d/x", b"a"), file("ok.txt", b"b")]);
        assert_eq!(report.failed, 1);
        assert_eq!(report.written, vec!["ok.txt"]);
    }

    #[test]
    fn test_bad_entries_do_not_abort_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = vec![
            file("../escape.txt", b"x"),
            file("/etc/passwd", b"x"),
            ManifestFile {
                path: "broken.txt".into(),
                content_b64: "!!!".into(),
            },
            file("fine.txt", b"y"),
        ];

        let report = applier(&dir).apply(&manifest);
        assert_eq!(report.failed, 3);
        assert_eq!(report.written, vec!["fine.txt"]);
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn test_self_change_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let applier = applier(&dir);

        let report = applier.apply(&[file("./bin/probe", b"v2")]);
        assert!(report.self_changed);

        let report = applier.apply(&[file("bin/probe", b"v2")]);
        assert!(!report.self_changed);
    }
}
