//! Content-addressed installer for the embedded Copilot CLI binary.
//!
//! Hosts that bundle the CLI binary into their own artifact hand this crate
//! the payload and its SHA-256 digest; [`Installer::install`] produces a
//! verified executable path. Repeated calls - across threads or processes -
//! converge on the same path without re-writing or corrupting the binary: a
//! scoped advisory file lock serializes concurrent installs, and a digest
//! mismatch against an existing file at the target path is a hard error.
//!
//! ```no_run
//! use copilot_installer::Installer;
//!
//! # fn run() -> copilot_installer::Result<()> {
//! let payload = std::fs::read("bundled/copilot-binary").unwrap();
//! let digest: [u8; 32] = [0; 32]; // shipped alongside the payload
//! let path = Installer::new(payload.as_slice(), digest)
//!     .with_version("1.2.3")
//!     .install()?;
//! # Ok(())
//! # }
//! ```

mod lock;

pub use lock::FileLock;

use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub type Result<T> = std::result::Result<T, InstallError>;

/// Errors that can occur while installing the embedded CLI.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("creating install directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("hashing existing binary {path}: {source}")]
    HashExisting {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A file already sits at the target path but its content does not match
    /// the expected digest.
    #[error("existing binary at {path} does not match the expected digest")]
    ExistingDigestMismatch { path: PathBuf },

    /// The payload stream itself hashed to something other than the declared
    /// digest; the partial file is removed.
    #[error("embedded CLI payload does not match the expected digest")]
    PayloadDigestMismatch,

    #[error("writing binary file {path}: {source}")]
    WriteBinary {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("writing license file {path}: {source}")]
    WriteLicense {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Installs an embedded CLI payload to a stable, content-verified path.
///
/// Owns all of its state; construct one wherever needed and inject it into
/// whatever resolves the CLI path for a client.
pub struct Installer<R> {
    cli: R,
    cli_sha256: [u8; 32],
    license: Option<Vec<u8>>,
    dir: Option<PathBuf>,
    version: Option<String>,
}

impl<R: Read> Installer<R> {
    pub fn new(cli: R, cli_sha256: [u8; 32]) -> Self {
        Self {
            cli,
            cli_sha256,
            license: None,
            dir: None,
            version: None,
        }
    }

    /// License text written next to the installed binary.
    pub fn with_license(mut self, license: impl Into<Vec<u8>>) -> Self {
        self.license = Some(license.into());
        self
    }

    /// Install directory override. Defaults to `copilot-sdk` under the user
    /// cache directory (temp dir when no cache dir is available).
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Version tag suffixed onto the binary name so versions can coexist.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Install (or locate a previous install of) the binary and return its
    /// path.
    pub fn install(self) -> Result<PathBuf> {
        let dir = self.dir.clone().unwrap_or_else(default_install_dir);
        install_at(
            self.cli,
            self.cli_sha256,
            self.license.as_deref(),
            &dir,
            self.version.as_deref(),
        )
    }
}

fn default_install_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("copilot-sdk")
}

fn install_at(
    mut cli: impl Read,
    expected: [u8; 32],
    license: Option<&[u8]>,
    dir: &Path,
    version: Option<&str>,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|source| InstallError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let version = version.map(sanitize_version).filter(|v| !v.is_empty());
    let lock_name = match &version {
        Some(v) => format!(".copilot-cli-{v}.lock"),
        None => ".copilot-cli.lock".to_string(),
    };

    // Serializes concurrent installs. Best effort: if the lock cannot be
    // taken the install still proceeds, and the digest checks below keep the
    // result correct.
    let lock = FileLock::acquire(&dir.join(&lock_name));
    if let Err(e) = &lock {
        warn!("could not acquire install lock {}: {}", lock_name, e);
    }

    let binary_name = if cfg!(windows) { "copilot.exe" } else { "copilot" };
    let final_path = versioned_binary_path(dir, binary_name, version.as_deref());

    if final_path.exists() {
        let existing = hash_file(&final_path).map_err(|source| InstallError::HashExisting {
            path: final_path.clone(),
            source,
        })?;
        if existing != expected {
            return Err(InstallError::ExistingDigestMismatch { path: final_path });
        }
        debug!("embedded CLI already installed at {}", final_path.display());
        return Ok(final_path);
    }

    write_verified(&mut cli, expected, &final_path)?;

    if let Some(license) = license {
        let license_path = PathBuf::from(format!("{}.license", final_path.display()));
        fs::write(&license_path, license).map_err(|source| InstallError::WriteLicense {
            path: license_path.clone(),
            source,
        })?;
    }

    debug!("installed embedded CLI at {}", final_path.display());
    Ok(final_path)
}

/// Copy the payload to `path`, hashing as it streams. A digest mismatch
/// removes the partial file and fails the install.
fn write_verified(cli: &mut impl Read, expected: [u8; 32], path: &Path) -> Result<()> {
    let map_io = |source: io::Error| InstallError::WriteBinary {
        path: path.to_path_buf(),
        source,
    };

    let mut file = open_executable(path).map_err(map_io)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = cli.read(&mut buf).map_err(map_io)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).map_err(map_io)?;
    }
    file.flush().map_err(map_io)?;
    drop(file);

    let actual: [u8; 32] = hasher.finalize().into();
    if actual != expected {
        let _ = fs::remove_file(path);
        return Err(InstallError::PayloadDigestMismatch);
    }
    Ok(())
}

#[cfg(unix)]
fn open_executable(path: &Path) -> io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o755)
        .open(path)
}

#[cfg(not(unix))]
fn open_executable(path: &Path) -> io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// `copilot` + version `1.2.3` -> `copilot_1.2.3`; extensions are preserved
/// (`copilot.exe` -> `copilot_1.2.3.exe`).
fn versioned_binary_path(dir: &Path, binary_name: &str, version: Option<&str>) -> PathBuf {
    let Some(version) = version else {
        return dir.join(binary_name);
    };
    match binary_name.rsplit_once('.') {
        Some((base, ext)) => dir.join(format!("{base}_{version}.{ext}")),
        None => dir.join(format!("{binary_name}_{version}")),
    }
}

/// Restrict a version tag to filename-safe characters.
fn sanitize_version(version: &str) -> String {
    version
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// SHA-256 of a file on disk.
fn hash_file(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = b"#!/bin/sh\necho copilot\n";

    fn digest_of(bytes: &[u8]) -> [u8; 32] {
        Sha256::digest(bytes).into()
    }

    #[test]
    fn installs_and_returns_stable_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = Installer::new(PAYLOAD, digest_of(PAYLOAD))
            .with_dir(dir.path())
            .install()
            .unwrap();

        assert!(path.starts_with(dir.path()));
        assert_eq!(fs::read(&path).unwrap(), PAYLOAD);

        // Second install converges on the same verified path.
        let again = Installer::new(PAYLOAD, digest_of(PAYLOAD))
            .with_dir(dir.path())
            .install()
            .unwrap();
        assert_eq!(path, again);
    }

    #[test]
    fn version_suffixes_binary_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = Installer::new(PAYLOAD, digest_of(PAYLOAD))
            .with_dir(dir.path())
            .with_version("1.2.3+build 7")
            .install()
            .unwrap();

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains("1.2.3_build_7"), "got {name}");
    }

    #[test]
    fn existing_file_with_wrong_digest_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let first = Installer::new(PAYLOAD, digest_of(PAYLOAD))
            .with_dir(dir.path())
            .install()
            .unwrap();
        fs::write(&first, b"tampered").unwrap();

        let err = Installer::new(PAYLOAD, digest_of(PAYLOAD))
            .with_dir(dir.path())
            .install()
            .unwrap_err();
        assert!(matches!(err, InstallError::ExistingDigestMismatch { .. }));
    }

    #[test]
    fn corrupt_payload_is_rejected_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let err = Installer::new(PAYLOAD, digest_of(b"something else"))
            .with_dir(dir.path())
            .install()
            .unwrap_err();
        assert!(matches!(err, InstallError::PayloadDigestMismatch));

        // No partial binary left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.ends_with(".lock"))
            .collect();
        assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
    }

    #[test]
    fn license_is_written_next_to_the_binary() {
        let dir = tempfile::tempdir().unwrap();
        let path = Installer::new(PAYLOAD, digest_of(PAYLOAD))
            .with_dir(dir.path())
            .with_license(&b"MIT"[..])
            .install()
            .unwrap();

        let license_path = dir.path().join(format!(
            "{}.license",
            path.file_name().unwrap().to_string_lossy()
        ));
        assert_eq!(fs::read(license_path).unwrap(), b"MIT");
    }

    #[test]
    fn concurrent_installs_converge() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let root = root.clone();
                std::thread::spawn(move || {
                    Installer::new(PAYLOAD, digest_of(PAYLOAD))
                        .with_dir(root)
                        .install()
                        .unwrap()
                })
            })
            .collect();

        let paths: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(fs::read(&paths[0]).unwrap(), PAYLOAD);
    }

    #[test]
    fn versioned_path_preserves_extension() {
        let dir = PathBuf::from("/cache");
        assert_eq!(
            versioned_binary_path(&dir, "copilot.exe", Some("2.0")),
            PathBuf::from("/cache/copilot_2.0.exe")
        );
        assert_eq!(
            versioned_binary_path(&dir, "copilot", None),
            PathBuf::from("/cache/copilot")
        );
    }
}
