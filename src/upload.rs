//! File uploads arriving over the duplex transport.
//!
//! Frame body layout (after the `0x01` marker): big-endian u16 filename
//! length, filename bytes, then the file contents. The filename must be
//! a bare basename; anything carrying path components is rejected before
//! the filesystem is touched.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid upload frame")]
    InvalidFormat,
    #[error("Invalid filename")]
    InvalidFilename,
    #[error("failed to store upload: {0}")]
    Storage(#[from] std::io::Error),
}

/// A successfully stored upload.
#[derive(Debug)]
pub struct StoredUpload {
    pub filename: String,
    pub absolute_path: PathBuf,
}

/// Decode the upload frame body into `(filename, contents)`.
pub fn decode_frame(body: &[u8]) -> Result<(String, &[u8]), UploadError> {
    if body.len() < 2 {
        return Err(UploadError::InvalidFormat);
    }
    let name_len = u16::from_be_bytes([body[0], body[1]]) as usize;
    let rest = &body[2..];
    if name_len > rest.len() {
        return Err(UploadError::InvalidFormat);
    }
    let name = std::str::from_utf8(&rest[..name_len])
        .map_err(|_| UploadError::InvalidFormat)?
        .to_string();
    Ok((name, &rest[name_len..]))
}

/// Validate that `name` is a plain basename.
///
/// Rejects empty names, `.`, `..`, and anything containing a path
/// separator or NUL so an upload can never escape the uploads directory.
pub fn sanitize_filename(name: &str) -> Result<&str, UploadError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(UploadError::InvalidFilename);
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(UploadError::InvalidFilename);
    }
    Ok(name)
}

/// Decode, sanitize, and store an upload frame body under `uploads_dir`.
///
/// The directory is created on demand, group-writable, so other tools in
/// a shared workspace can pick the files up. Returns the stored filename
/// and its absolute path (the path is also fed to the child as input).
pub fn save_upload(uploads_dir: &Path, body: &[u8]) -> Result<StoredUpload, UploadError> {
    let (name, data) = decode_frame(body)?;
    let name = sanitize_filename(&name)?;

    std::fs::create_dir_all(uploads_dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(uploads_dir, std::fs::Permissions::from_mode(0o775));
    }

    let path = uploads_dir.join(name);
    std::fs::write(&path, data)?;
    let absolute_path = std::fs::canonicalize(&path)?;

    info!(
        filename = %name,
        bytes = data.len(),
        path = %absolute_path.display(),
        "stored uploaded file"
    );

    Ok(StoredUpload {
        filename: name.to_string(),
        absolute_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(name: &str, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(name.len() as u16).to_be_bytes());
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(data);
        body
    }

    #[test]
    fn decodes_name_and_contents() {
        let body = frame("hello", b"DATA");
        let (name, data) = decode_frame(&body).unwrap();
        assert_eq!(name, "hello");
        assert_eq!(data, b"DATA");
    }

    #[test]
    fn declared_length_beyond_frame_is_invalid() {
        let mut body = frame("hello", b"");
        body.truncate(4);
        assert!(matches!(decode_frame(&body), Err(UploadError::InvalidFormat)));
        assert!(matches!(decode_frame(&[0x00]), Err(UploadError::InvalidFormat)));
    }

    #[test]
    fn sanitizer_rejects_traversal() {
        for bad in ["", ".", "..", "../../etc/passwd", "a/b", "a\\b", "nul\0byte"] {
            assert!(
                matches!(sanitize_filename(bad), Err(UploadError::InvalidFilename)),
                "accepted {bad:?}"
            );
        }
        assert_eq!(sanitize_filename("notes.txt").unwrap(), "notes.txt");
        assert_eq!(sanitize_filename(".env").unwrap(), ".env");
    }

    #[test]
    fn stores_file_under_uploads_dir() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        let body = frame("hello", b"DATA...");

        let stored = save_upload(&uploads, &body).unwrap();
        assert_eq!(stored.filename, "hello");
        assert!(stored.absolute_path.is_absolute());
        assert_eq!(std::fs::read(&stored.absolute_path).unwrap(), b"DATA...");
    }

    #[test]
    fn traversal_upload_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = dir.path().join("uploads");
        let body = frame("../../etc/passwd", b"oops");

        let err = save_upload(&uploads, &body).unwrap_err();
        assert!(matches!(err, UploadError::InvalidFilename));
        assert!(!uploads.exists());
    }
}
