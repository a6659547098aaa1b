use std::io;
use std::path::Path;
use tokio::io::AsyncReadExt;

#[derive(thiserror::Error, Debug)]
pub enum LocalFileError {
    #[error("could not read file: {0}")]
    Io(#[from] io::Error),
    #[error("file exceeds the maximum of {max} bytes")]
    TooLarge { max: usize },
}

/// Reads a local configuration file, refusing anything above `max_size` bytes without
/// reading more than one byte past the limit.
pub async fn load(path: &Path, max_size: usize) -> Result<Vec<u8>, LocalFileError> {
    let file = tokio::fs::File::open(path).await?;
    let mut content = Vec::new();
    file.take((max_size as u64).saturating_add(1))
        .read_to_end(&mut content)
        .await?;

    if content.len() > max_size {
        return Err(LocalFileError::TooLarge { max: max_size });
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"rules\": []}").unwrap();

        assert_eq!(load(file.path(), 1024).await.unwrap(), b"{\"rules\": []}");
        assert_eq!(load(file.path(), 13).await.unwrap().len(), 13);
        assert!(matches!(
            load(file.path(), 12).await,
            Err(LocalFileError::TooLarge { max: 12 })
        ));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load(&dir.path().join("absent.json"), 1024).await,
            Err(LocalFileError::Io(e)) if e.kind() == io::ErrorKind::NotFound
        ));
    }
}
