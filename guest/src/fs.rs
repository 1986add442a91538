use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Cannot create directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot read directory '{path}': {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot iterate directory '{path}': {source}")]
    ReadDirEntry {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot remove directory '{path}': {source}")]
    RemoveDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot create file '{path}': {source}")]
    CreateFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot determine if path exists '{path}': {source}")]
    PathExists {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot set permissions on '{path}': {source}")]
    SetMode {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot delete file '{path}': {source}")]
    RemoveFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub async fn create_dir<P: AsRef<Path>>(path: P) -> Result<(), FsError> {
    let p = path.as_ref();
    fs::create_dir_all(p)
        .await
        .map_err(|source| FsError::CreateDir {
            path: p.to_path_buf(),
            source,
        })
}

pub async fn read_dir<P: AsRef<Path>>(path: P) -> Result<Vec<PathBuf>, FsError> {
    let p = path.as_ref();
    let mut dir = fs::read_dir(p).await.map_err(|source| FsError::ReadDir {
        path: p.to_path_buf(),
        source,
    })?;

    let mut entries = Vec::new();
    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|source| FsError::ReadDirEntry {
            path: p.to_path_buf(),
            source,
        })?
    {
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}

pub async fn remove_dir<P: AsRef<Path>>(path: P) -> Result<(), FsError> {
    let p = path.as_ref();
    fs::remove_dir_all(p)
        .await
        .map_err(|source| FsError::RemoveDir {
            path: p.to_path_buf(),
            source,
        })
}

pub async fn create_file<P: AsRef<Path>>(path: P) -> Result<tokio::fs::File, FsError> {
    let p = path.as_ref();
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(p)
        .await
        .map_err(|source| FsError::CreateFile {
            path: p.to_path_buf(),
            source,
        })
}

/// Open for appending, creating the file when missing.
pub async fn append_file<P: AsRef<Path>>(path: P) -> Result<tokio::fs::File, FsError> {
    let p = path.as_ref();
    fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(p)
        .await
        .map_err(|source| FsError::CreateFile {
            path: p.to_path_buf(),
            source,
        })
}

pub async fn path_exists<P: AsRef<Path>>(path: P) -> Result<bool, FsError> {
    let p = path.as_ref();
    fs::try_exists(p)
        .await
        .map_err(|source| FsError::PathExists {
            path: p.to_path_buf(),
            source,
        })
}

pub async fn write_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), FsError> {
    let p = path.as_ref();
    let mut file = create_file(p).await?;
    file.write_all(data)
        .await
        .map_err(|source| FsError::WriteFile {
            path: p.to_path_buf(),
            source,
        })
}

pub async fn set_file_mode<P: AsRef<Path>>(path: P, mode: u32) -> Result<(), FsError> {
    let p = path.as_ref();
    fs::set_permissions(p, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|source| FsError::SetMode {
            path: p.to_path_buf(),
            source,
        })
}

/// Write a file and restrict its permissions to `mode`.
pub async fn write_file_with_mode<P: AsRef<Path>>(
    path: P,
    data: &[u8],
    mode: u32,
) -> Result<(), FsError> {
    write_file(path.as_ref(), data).await?;
    set_file_mode(path, mode).await
}

pub async fn read_file_to_string<P: AsRef<Path>>(path: P) -> Result<String, FsError> {
    let p = path.as_ref();
    fs::read_to_string(p)
        .await
        .map_err(|source| FsError::ReadFile {
            path: p.to_path_buf(),
            source,
        })
}

pub async fn remove_file<P: AsRef<Path>>(path: P) -> Result<(), FsError> {
    let p = path.as_ref();
    fs::remove_file(p)
        .await
        .map_err(|source| FsError::RemoveFile {
            path: p.to_path_buf(),
            source,
        })
}

/// Remove a file, treating an already-missing file as success.
pub async fn remove_file_if_exists<P: AsRef<Path>>(path: P) -> Result<(), FsError> {
    let p = path.as_ref();
    match fs::remove_file(p).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(FsError::RemoveFile {
            path: p.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_with_mode_restricts_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        write_file_with_mode(&path, b"key", 0o600).await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(read_file_to_string(&path).await.unwrap(), "key");
    }

    #[tokio::test]
    async fn remove_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        remove_file_if_exists(dir.path().join("nope")).await.unwrap();
        assert!(remove_file(dir.path().join("nope")).await.is_err());
    }
}
