//! Transfer Packager
//!
//! Bundles resolved certificate files into a gzip-compressed tar archive and
//! seals it for one recipient. The client side uses [`unpack`] to write a
//! decrypted archive into its destination directory.
//!
//! Entries are stored by base name only. Two source files sharing a base name
//! end up as two entries with the same name, and the later one wins on unpack.

use crate::encryption::{CryptoError, KeyError, Recipient};
use crate::store::CertificateFile;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};
use thiserror::Error;
use tracing::{debug, warn};

/// Private keys travel in the archive, so entries are owner read/write only
const ARCHIVED_FILE_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to build archive: {0}")]
    Archive(#[source] io::Error),
    #[error("failed to parse recipient public key: {0}")]
    InvalidRecipient(#[from] KeyError),
    #[error("failed to encrypt archive: {0}")]
    Encrypt(#[from] CryptoError),
}

#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("archive is corrupt: {0}")]
    Corrupt(#[source] io::Error),
    #[error("archive entry escapes the destination directory: {0}")]
    UnsafePath(PathBuf),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Build the archive for `files` and encrypt it to `recipient_public_key`.
/// Either the full ciphertext is returned or an error, never partial output.
pub fn package(
    files: &[&CertificateFile],
    recipient_public_key: &str,
) -> Result<Vec<u8>, PackageError> {
    let archive = build_archive(files)?;
    let recipient: Recipient = recipient_public_key.parse()?;
    let sealed = recipient.encrypt(&archive)?;
    debug!(
        files = files.len(),
        archive_bytes = archive.len(),
        sealed_bytes = sealed.len(),
        "Packaged certificate archive"
    );
    Ok(sealed)
}

/// Gzip-compressed tar of `files`, flattened to their base names.
pub fn build_archive(files: &[&CertificateFile]) -> Result<Vec<u8>, PackageError> {
    let mut tar_builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));

    for file in files {
        let file_data = fs::read(&file.path).map_err(|source| PackageError::ReadFile {
            path: file.path.clone(),
            source,
        })?;
        let file_name = file.path.file_name().ok_or_else(|| {
            PackageError::Archive(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no file name", file.path.display()),
            ))
        })?;

        let mut tar_header = Header::new_gnu();
        tar_header.set_entry_type(EntryType::Regular);
        tar_header.set_size(file_data.len() as u64);
        tar_header.set_mode(ARCHIVED_FILE_MODE);
        tar_builder
            .append_data(&mut tar_header, file_name, file_data.as_slice())
            .map_err(PackageError::Archive)?;
    }

    let encoder = tar_builder.into_inner().map_err(PackageError::Archive)?;
    encoder.finish().map_err(PackageError::Archive)
}

/// Extract a decrypted archive under `destination`, overwriting files of the
/// same name. Directory entries are not materialized; parents of files are
/// created as needed. Returns the written paths in archive order.
pub fn unpack(archive: &[u8], destination: &Path) -> Result<Vec<PathBuf>, UnpackError> {
    fs::create_dir_all(destination).map_err(|source| UnpackError::Write {
        path: destination.to_path_buf(),
        source,
    })?;

    let mut tar_archive = Archive::new(GzDecoder::new(archive));
    let mut written = Vec::new();

    for entry in tar_archive.entries().map_err(UnpackError::Corrupt)? {
        let mut entry = entry.map_err(UnpackError::Corrupt)?;
        let entry_type = entry.header().entry_type();
        let relative = entry.path().map_err(UnpackError::Corrupt)?.into_owned();

        match entry_type {
            EntryType::Directory => continue,
            EntryType::Regular | EntryType::GNUSparse | EntryType::Continuous => {}
            other => {
                warn!(entry = %relative.display(), entry_type = ?other, "Skipping non-regular archive entry");
                continue;
            }
        }

        if !is_safe_relative(&relative) {
            return Err(UnpackError::UnsafePath(relative));
        }

        let mode = entry
            .header()
            .mode()
            .map_or(ARCHIVED_FILE_MODE, |mode| mode & 0o777);
        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(UnpackError::Corrupt)?;

        let target = destination.join(&relative);
        write_file(&target, &contents, mode).map_err(|source| UnpackError::Write {
            path: target.clone(),
            source,
        })?;
        debug!(file = %target.display(), bytes = contents.len(), "Extracted file");
        written.push(target);
    }

    Ok(written)
}

fn is_safe_relative(path: &Path) -> bool {
    path.components().next().is_some()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

fn write_file(target: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    let mut file = options.open(target)?;
    file.write_all(contents)?;

    // The open mode only applies to newly created files
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(target, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}
