//! The filesystem sink materializes applied configuration as one file per config key, so
//! that processes without a client of their own can pick it up from disk.
//!
//! Files are named `<config id>.<digest>`, where the config id is sanitized and the digest
//! is the first 16 hex characters of the SHA-256 of the raw key. Distinct keys never share
//! a file even when their config ids sanitize to the same name.
use crate::config_key::{ConfigKey, Product};
use crate::integrity::sha256_hex;
use crate::listener::{ListenerError, PollingRateHinter, ProductListener};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const COMMITTED_FILE: &str = ".committed";

#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl From<SinkError> for ListenerError {
    fn from(e: SinkError) -> Self {
        ListenerError::Other(Box::new(e))
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> SinkError + '_ {
    move |source| SinkError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Maps a config id to a safe file name.
pub fn sanitize_file_name(config_id: &str) -> String {
    let name: String = config_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    // Never hidden and never `.` or `..`.
    if name.starts_with('.') {
        format!("_{name}")
    } else {
        name
    }
}

/// The file name a key is stored under.
pub fn file_name(key: &ConfigKey) -> String {
    let digest = sha256_hex(key.as_str().as_bytes());
    format!("{}.{}", sanitize_file_name(key.config_id()), &digest[..16])
}

pub struct FilesystemListener {
    dir: PathBuf,
    materialized: BTreeSet<String>,
}

impl FilesystemListener {
    pub fn new(base_dir: &Path, product: Product) -> Result<Self, SinkError> {
        let dir = base_dir.join(product.as_str());
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        Ok(FilesystemListener {
            dir,
            materialized: BTreeSet::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &ConfigKey) -> (String, PathBuf) {
        let name = file_name(key);
        let path = self.dir.join(&name);
        (name, path)
    }

    // Writes through a temporary file so readers never see partial content.
    fn write_file(&self, path: &Path, content: &[u8]) -> Result<(), SinkError> {
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        let tmp = path.with_file_name(format!(".{name}.tmp"));
        fs::write(&tmp, content).map_err(io_error(&tmp))?;
        fs::rename(&tmp, path).map_err(io_error(path))
    }
}

impl ProductListener for FilesystemListener {
    fn accept(
        &mut self,
        key: &ConfigKey,
        content: &[u8],
        _hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ListenerError> {
        let (name, path) = self.path_for(key);
        self.write_file(&path, content)?;
        tracing::debug!(path = %path.display(), bytes = content.len(), "Stored configuration file");
        self.materialized.insert(name);
        Ok(())
    }

    fn remove(
        &mut self,
        key: &ConfigKey,
        _hinter: &mut dyn PollingRateHinter,
    ) -> Result<(), ListenerError> {
        let (name, path) = self.path_for(key);
        self.materialized.remove(&name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path)(e).into()),
        }
    }

    fn commit(&mut self, _hinter: &mut dyn PollingRateHinter) -> Result<(), ListenerError> {
        let mut listing = String::new();
        for name in &self.materialized {
            listing.push_str(name);
            listing.push('\n');
        }

        let path = self.dir.join(COMMITTED_FILE);
        self.write_file(&path, listing.as_bytes())?;
        tracing::info!(
            dir = %self.dir.display(),
            configs = self.materialized.len(),
            "Committed configuration"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::NoopHinter;

    fn key(raw: &str) -> ConfigKey {
        ConfigKey::parse(raw).unwrap()
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("cfg-1_a.json"), "cfg-1_a.json");
        assert_eq!(sanitize_file_name("a b:c"), "a_b_c");
        assert_eq!(sanitize_file_name(".."), "_..");
        assert_eq!(sanitize_file_name(".committed"), "_.committed");
    }

    #[test]
    fn test_accept_remove_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut listener = FilesystemListener::new(dir.path(), Product::ApmTracing).unwrap();
        let product_dir = dir.path().join("APM_TRACING");
        assert_eq!(listener.dir(), product_dir);

        let k1 = key("org1/APM_TRACING/cfg1/config");
        let k2 = key("org1/APM_TRACING/cfg2/config");
        listener.accept(&k1, b"one", &mut NoopHinter).unwrap();
        listener.accept(&k2, b"two", &mut NoopHinter).unwrap();
        listener.commit(&mut NoopHinter).unwrap();

        let (name1, name2) = (file_name(&k1), file_name(&k2));
        assert!(name1.starts_with("cfg1."));
        assert_eq!(fs::read(product_dir.join(&name1)).unwrap(), b"one");
        assert_eq!(fs::read(product_dir.join(&name2)).unwrap(), b"two");
        assert_eq!(
            fs::read_to_string(product_dir.join(COMMITTED_FILE)).unwrap(),
            format!("{name1}\n{name2}\n")
        );

        listener.accept(&k1, b"one v2", &mut NoopHinter).unwrap();
        listener.remove(&k2, &mut NoopHinter).unwrap();
        listener.commit(&mut NoopHinter).unwrap();

        assert_eq!(fs::read(product_dir.join(&name1)).unwrap(), b"one v2");
        assert!(!product_dir.join(&name2).exists());
        assert_eq!(
            fs::read_to_string(product_dir.join(COMMITTED_FILE)).unwrap(),
            format!("{name1}\n")
        );
    }

    #[test]
    fn test_file_names_are_distinct_per_key() {
        let spaced = key("org1/APM_TRACING/a b/config");
        let colon = key("org1/APM_TRACING/a:b/config");
        let other_org = key("org2/APM_TRACING/a b/config");
        assert_eq!(sanitize_file_name(spaced.config_id()), sanitize_file_name(colon.config_id()));
        assert_ne!(file_name(&spaced), file_name(&colon));
        assert_ne!(file_name(&spaced), file_name(&other_org));
        assert_eq!(file_name(&spaced), file_name(&key("org1/APM_TRACING/a b/config")));
    }

    #[test]
    fn test_removing_one_key_keeps_a_similar_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut listener = FilesystemListener::new(dir.path(), Product::ApmTracing).unwrap();
        let spaced = key("org1/APM_TRACING/a b/config");
        let colon = key("org1/APM_TRACING/a:b/config");

        listener.accept(&spaced, b"spaced", &mut NoopHinter).unwrap();
        listener.accept(&colon, b"colon", &mut NoopHinter).unwrap();
        listener.remove(&spaced, &mut NoopHinter).unwrap();
        listener.commit(&mut NoopHinter).unwrap();

        let remaining = listener.dir().join(file_name(&colon));
        assert_eq!(fs::read(&remaining).unwrap(), b"colon");
        assert!(!listener.dir().join(file_name(&spaced)).exists());
        assert_eq!(
            fs::read_to_string(listener.dir().join(COMMITTED_FILE)).unwrap(),
            format!("{}\n", file_name(&colon))
        );
    }

    #[test]
    fn test_remove_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut listener = FilesystemListener::new(dir.path(), Product::AsmDd).unwrap();
        assert!(
            listener
                .remove(&key("org1/ASM_DD/gone/config"), &mut NoopHinter)
                .is_ok()
        );
    }

    #[test]
    fn test_io_failure_is_not_reportable() {
        let dir = tempfile::tempdir().unwrap();
        let mut listener = FilesystemListener::new(dir.path(), Product::AsmDd).unwrap();
        fs::remove_dir_all(dir.path().join("ASM_DD")).unwrap();

        let err = listener
            .accept(&key("org1/ASM_DD/rules/config"), b"x", &mut NoopHinter)
            .unwrap_err();
        assert!(matches!(err, ListenerError::Other(_)));
    }
}
