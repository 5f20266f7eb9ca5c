//! The controller's file manifest.
//!
//! The controller answers `GET /probe/update/files` with
//! `{ "files": [{ "path": "...", "content_b64": "..." }] }`. Paths are
//! relative to the agent's apply directory and are entirely controlled by
//! the controller, so every path is classified before anything touches disk.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Directory whose entries are proxy virtual host snippets.
pub const VHOST_DIR: &str = "vhost.d";
/// Suffix appended to the domain when a vhost snippet is written.
pub const VHOST_LOCATION_SUFFIX: &str = "_location";
/// Environment files are local secrets and are never overwritten.
pub const ENV_FILE_SUFFIX: &str = ".env";
/// Dependency lock files are pinned per host.
pub const LOCK_FILES: &[&str] = &["package-lock.json", "Cargo.lock"];

/// A file as the controller sends it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestFile {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub content_b64: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestResponse {
    #[serde(default)]
    pub files: Vec<ManifestFile>,
}

impl ManifestResponse {
    /// Parse a manifest body. Anything that is not a JSON object with a
    /// `files` array counts as an empty manifest; individual entries that are
    /// not objects are skipped.
    pub fn parse_lenient(body: &[u8]) -> Self {
        let value: serde_json::Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(_) => return Self::default(),
        };

        let files = value
            .get("files")
            .and_then(|files| files.as_array())
            .map(|files| {
                files
                    .iter()
                    .filter_map(|f| serde_json::from_value::<ManifestFile>(f.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        Self { files }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("entry {path:?} has invalid base64 content: {source}")]
    InvalidContent {
        path: String,
        #[source]
        source: base64::DecodeError,
    },
}

/// A decoded manifest entry with a normalized relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub relative_path: String,
    pub content: Bytes,
}

impl ManifestFile {
    pub fn decode(&self) -> Result<ManifestEntry, ManifestError> {
        let content = STANDARD
            .decode(self.content_b64.trim())
            .map_err(|source| ManifestError::InvalidContent {
                path: self.path.clone(),
                source,
            })?;
        Ok(ManifestEntry {
            relative_path: normalize_path(&self.path),
            content: Bytes::from(content),
        })
    }
}

/// Backslashes become forward slashes; nothing else is rewritten.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// How an entry must be handled by the applier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Plain write-if-changed
    Regular,
    /// A proxy vhost snippet, rewritten to `vhost.d/<domain>_location`
    VirtualHost,
    /// Environment or lock file, never written
    Protected,
    /// Absolute, empty, or escaping the apply directory
    Unsafe,
}

impl ManifestEntry {
    pub fn kind(&self) -> EntryKind {
        classify(&self.relative_path)
    }
}

pub fn classify(relative_path: &str) -> EntryKind {
    if relative_path.is_empty()
        || relative_path.starts_with('/')
        || relative_path.split('/').any(|segment| segment == "..")
        || relative_path.contains(':')
    {
        return EntryKind::Unsafe;
    }

    if relative_path.starts_with("vhost.d/") {
        return EntryKind::VirtualHost;
    }

    let file_name = relative_path.rsplit('/').next().unwrap_or(relative_path);
    if relative_path.ends_with(ENV_FILE_SUFFIX) || LOCK_FILES.contains(&file_name) {
        return EntryKind::Protected;
    }

    EntryKind::Regular
}

/// Path (relative to the apply directory) a vhost snippet is written to.
pub fn vhost_location_path(domain: &str) -> String {
    format!("{}/{}{}", VHOST_DIR, domain, VHOST_LOCATION_SUFFIX)
}

/// Path of the plain, domain-named snippet that the location file replaces.
pub fn vhost_legacy_path(domain: &str) -> String {
    format!("{}/{}", VHOST_DIR, domain)
}

/// Content templating hook for vhost snippets. Identity for now.
pub fn render_template(content: Bytes) -> Bytes {
    content
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(path: &str, content: &[u8]) -> ManifestFile {
        ManifestFile {
            path: path.to_string(),
            content_b64: STANDARD.encode(content),
        }
    }

    #[test]
    fn test_decode_normalizes_backslashes() {
        let entry = file("conf\\nginx\\site.conf", b"server {}").decode().unwrap();
        assert_eq!(entry.relative_path, "conf/nginx/site.conf");
        assert_eq!(&entry.content[..], b"server {}");
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        let bad = ManifestFile {
            path: "a.txt".into(),
            content_b64: "not base64 !!".into(),
        };
        assert!(matches!(
            bad.decode(),
            Err(ManifestError::InvalidContent { .. })
        ));
    }

    #[test]
    fn test_parse_lenient_handles_garbage() {
        assert!(ManifestResponse::parse_lenient(b"").files.is_empty());
        assert!(ManifestResponse::parse_lenient(b"<html>").files.is_empty());
        assert!(ManifestResponse::parse_lenient(b"{}").files.is_empty());
        assert!(ManifestResponse::parse_lenient(br#"{"files": "nope"}"#)
            .files
            .is_empty());

        let parsed =
            ManifestResponse::parse_lenient(br#"{"files": [1, {"path": "a", "content_b64": ""}]}"#);
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(parsed.files[0].path, "a");
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("server.js"), EntryKind::Regular);
        assert_eq!(classify("bin/probe"), EntryKind::Regular);
        assert_eq!(classify("vhost.d/anything"), EntryKind::VirtualHost);
        assert_eq!(classify(".env"), EntryKind::Protected);
        assert_eq!(classify("config/prod.env"), EntryKind::Protected);
        assert_eq!(classify("package-lock.json"), EntryKind::Protected);
        assert_eq!(classify("sub/Cargo.lock"), EntryKind::Protected);
        assert_eq!(classify(""), EntryKind::Unsafe);
        assert_eq!(classify("/etc/passwd"), EntryKind::Unsafe);
        assert_eq!(classify("../outside"), EntryKind::Unsafe);
        assert_eq!(classify("a/../../b"), EntryKind::Unsafe);
        assert_eq!(classify("C:/windows"), EntryKind::Unsafe);
    }

    #[test]
    fn test_vhost_paths() {
        assert_eq!(vhost_legacy_path("example.com"), "vhost.d/example.com");
        assert_eq!(
            vhost_location_path("example.com"),
            "vhost.d/example.com_location"
        );
    }
}
