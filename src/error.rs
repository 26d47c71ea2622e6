use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
#[error("invalid url: {0}")]
pub struct InvalidUrl(pub String);

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("HTTP request failed for {url}: {source}")]
    Http { url: String, source: reqwest::Error },
    #[error("failed to parse playlist from {url}: {message}")]
    Playlist { url: String, message: String },
    #[error("cannot resolve segment '{segment}' against {url}")]
    SegmentUrl { url: String, segment: String },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to create output directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write metadata file {}: {source}", .path.display())]
    Metadata {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write audio file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Stream(#[from] StreamError),
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("podcast directory does not exist: {}", .0.display())]
    MissingDir(PathBuf),
    #[error("failed to read podcast directory {}: {source}", .path.display())]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write feed file {}: {source}", .path.display())]
    WriteFeed {
        path: PathBuf,
        source: std::io::Error,
    },
}
