use std::{
    io::{self, Write},
    path::Path,
};
use tempfile::{Builder, TempPath};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const STAGED_PREFIX: &str = "upload-";
const STAGED_SUFFIX: &str = ".csv";

/// An uploaded file copied to local disk for the duration of one request.
///
/// The file is deleted when the value is dropped, so no exit path can leave
/// it behind. [`StagedUpload::remove`] deletes it eagerly and logs the outcome.
#[derive(Debug)]
pub struct StagedUpload {
    path: TempPath,
    len: u64,
}

impl StagedUpload {
    /// Stage an in-memory buffer synchronously.
    pub fn from_bytes(dir: &Path, data: &[u8]) -> io::Result<Self> {
        let mut file = staged_builder().tempfile_in(dir)?;
        file.write_all(data)?;
        file.flush()?;
        Ok(StagedUpload {
            path: file.into_temp_path(),
            len: data.len() as u64,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    pub fn remove(self) {
        let shown = self.path.display().to_string();
        match self.path.close() {
            Ok(()) => debug!(path = %shown, "removed staged upload"),
            Err(e) => warn!(path = %shown, error = %e, "failed to remove staged upload"),
        }
    }
}

fn staged_builder() -> Builder<'static, 'static> {
    let mut builder = Builder::new();
    builder.prefix(STAGED_PREFIX).suffix(STAGED_SUFFIX);
    builder
}

/// Streams request body chunks into a new staged file.
///
/// Dropping the writer before [`UploadWriter::finish`] discards the partial file.
pub struct UploadWriter {
    file: tokio::fs::File,
    path: TempPath,
    len: u64,
}

impl UploadWriter {
    pub fn create(dir: &Path) -> io::Result<Self> {
        let (file, path) = staged_builder().tempfile_in(dir)?.into_parts();
        Ok(UploadWriter {
            file: tokio::fs::File::from_std(file),
            path,
            len: 0,
        })
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.len += chunk.len() as u64;
        Ok(())
    }

    pub async fn finish(mut self) -> io::Result<StagedUpload> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        debug!(path = %self.path.display(), bytes = self.len, "staged upload");
        Ok(StagedUpload {
            path: self.path,
            len: self.len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn entries(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn remove_deletes_the_file() {
        let dir = tempdir().unwrap();
        let staged = StagedUpload::from_bytes(dir.path(), b"a,b\n").unwrap();
        let path = staged.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(staged.len(), 4);

        staged.remove();
        assert!(!path.exists());
        assert_eq!(entries(dir.path()), 0);
    }

    #[test]
    fn drop_deletes_the_file() {
        let dir = tempdir().unwrap();
        {
            let _staged = StagedUpload::from_bytes(dir.path(), b"x").unwrap();
            assert_eq!(entries(dir.path()), 1);
        }
        assert_eq!(entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn writer_streams_chunks_to_disk() {
        let dir = tempdir().unwrap();
        let mut writer = UploadWriter::create(dir.path()).unwrap();
        writer.write_chunk(b"h1,h2\n").await.unwrap();
        writer.write_chunk(b"1,2\n").await.unwrap();
        let staged = writer.finish().await.unwrap();

        assert_eq!(staged.len(), 10);
        assert_eq!(fs::read_to_string(staged.path()).unwrap(), "h1,h2\n1,2\n");
    }

    #[tokio::test]
    async fn abandoned_writer_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let mut writer = UploadWriter::create(dir.path()).unwrap();
        writer.write_chunk(b"partial").await.unwrap();
        drop(writer);
        assert_eq!(entries(dir.path()), 0);
    }
}
