use std::collections::BTreeMap;
use std::path::Path;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::stream::ByteStream;

pub const METADATA_FILE_NAME: &str = "metadata.yml";

/// Stream audio chunks into `output_path`, creating the podcast directory and
/// its `metadata.yml` on first use. On failure the partial file stays on disk
/// for inspection. Returns the number of bytes written.
pub async fn store(
    mut chunks: ByteStream,
    output_path: &Path,
    metadata: &BTreeMap<String, String>,
) -> Result<u64, StorageError> {
    let dir = output_path.parent().unwrap_or(Path::new("."));
    ensure_dir_with_metadata(dir, metadata).await?;

    let mut file = tokio::fs::File::create(output_path)
        .await
        .map_err(|e| StorageError::Write {
            path: output_path.to_path_buf(),
            source: e,
        })?;

    let mut written: u64 = 0;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)
            .await
            .map_err(|e| StorageError::Write {
                path: output_path.to_path_buf(),
                source: e,
            })?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| StorageError::Write {
        path: output_path.to_path_buf(),
        source: e,
    })?;

    info!(path = %output_path.display(), bytes = written, "audio file saved");
    Ok(written)
}

/// Create the podcast directory if needed and write `metadata.yml` exactly
/// once; an existing file is never rewritten.
pub async fn ensure_dir_with_metadata(
    dir: &Path,
    metadata: &BTreeMap<String, String>,
) -> Result<(), StorageError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| StorageError::CreateDir {
            path: dir.to_path_buf(),
            source: e,
        })?;

    let metadata_path = dir.join(METADATA_FILE_NAME);
    if tokio::fs::try_exists(&metadata_path).await.unwrap_or(false) {
        return Ok(());
    }

    let content = serde_yml::to_string(metadata).map_err(|e| StorageError::Metadata {
        path: metadata_path.clone(),
        source: std::io::Error::other(e),
    })?;
    tokio::fs::write(&metadata_path, content)
        .await
        .map_err(|e| StorageError::Metadata {
            path: metadata_path.clone(),
            source: e,
        })?;
    debug!(path = %metadata_path.display(), "metadata file written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::stream;

    use super::*;
    use crate::error::StreamError;

    fn chunks(items: Vec<Result<Bytes, StreamError>>) -> ByteStream {
        Box::pin(stream::iter(items))
    }

    fn metadata() -> BTreeMap<String, String> {
        BTreeMap::from([("title".to_string(), "Morning Show".to_string())])
    }

    #[tokio::test]
    async fn store_writes_chunks_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("morning-show").join("episode.mp3");

        let written = store(
            chunks(vec![
                Ok(Bytes::from_static(b"abc")),
                Ok(Bytes::from_static(b"defg")),
            ]),
            &output,
            &metadata(),
        )
        .await
        .unwrap();

        assert_eq!(written, 7);
        assert_eq!(std::fs::read(&output).unwrap(), b"abcdefg");

        let metadata_file = output.parent().unwrap().join(METADATA_FILE_NAME);
        let content = std::fs::read_to_string(metadata_file).unwrap();
        assert!(content.contains("title: Morning Show"));
    }

    #[tokio::test]
    async fn metadata_is_written_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let podcast_dir = dir.path().join("morning-show");

        ensure_dir_with_metadata(&podcast_dir, &metadata())
            .await
            .unwrap();
        let metadata_file = podcast_dir.join(METADATA_FILE_NAME);
        std::fs::write(&metadata_file, "title: Hand Edited\n").unwrap();

        ensure_dir_with_metadata(&podcast_dir, &metadata())
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&metadata_file).unwrap(),
            "title: Hand Edited\n"
        );
    }

    #[tokio::test]
    async fn stream_failure_leaves_the_partial_file_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("morning-show").join("episode.mp3");

        let result = store(
            chunks(vec![
                Ok(Bytes::from_static(b"abc")),
                Err(StreamError::Playlist {
                    url: "http://example.invalid/live.m3u8".to_string(),
                    message: "connection reset".to_string(),
                }),
            ]),
            &output,
            &metadata(),
        )
        .await;

        assert!(matches!(result, Err(StorageError::Stream(_))));
        assert_eq!(std::fs::read(&output).unwrap(), b"abc");
    }
}
