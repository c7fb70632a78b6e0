//! Locating and streaming job output files.

use addlidar_core::prelude::*;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio_util::io::ReaderStream;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Maps job records to files under the output root, as mounted in this process.
#[derive(Debug, Clone)]
pub struct OutputResolver {
    root: PathBuf,
    chunk_size: usize,
}

/// An opened output file, ready to be streamed.
#[derive(Debug)]
pub struct ResolvedOutput {
    pub file: File,
    pub path: PathBuf,
    pub file_name: String,
    pub len: u64,
    pub content_type: String,
}

impl OutputResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Opens the output of a succeeded job.
    ///
    /// Only `Succeeded` records resolve. A succeeded job whose file is absent
    /// yields [`JobError::OutputMissing`].
    pub async fn resolve(&self, record: &JobRecord) -> Result<ResolvedOutput, JobError> {
        if record.state != JobState::Succeeded {
            return Err(JobError::NotReady {
                job_name: record.job_name.clone(),
                state: record.state,
            });
        }

        let missing = |detail: String| JobError::OutputMissing {
            job_name: record.job_name.clone(),
            detail,
        };

        let file_name = record
            .output_file
            .clone()
            .ok_or_else(|| missing("no output file was recorded".into()))?;
        if file_name.is_empty()
            || file_name.contains(['/', '\\'])
            || file_name == "."
            || file_name == ".."
        {
            return Err(missing(format!("'{file_name}' is not a plain file name")));
        }

        let path = self.root.join(&file_name);
        let file = File::open(&path)
            .await
            .map_err(|e| missing(format!("{}: {e}", path.display())))?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(missing(format!("{} is not a regular file", path.display())));
        }

        let content_type = mime_guess::from_path(&path)
            .first_or_octet_stream()
            .to_string();

        Ok(ResolvedOutput {
            file,
            path,
            file_name,
            len: metadata.len(),
            content_type,
        })
    }

    /// Reads the file in fixed-size chunks; memory use does not grow with file size.
    pub fn stream(&self, output: ResolvedOutput) -> BoxStream<'static, io::Result<Bytes>> {
        ReaderStream::with_capacity(output.file, self.chunk_size).boxed()
    }
}
