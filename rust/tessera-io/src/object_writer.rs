// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

use std::pin::Pin;
use std::sync::{Arc, LazyLock};
use std::task::{Context, Poll};

use async_trait::async_trait;
use object_store::{buffered::BufWriter, path::Path, ObjectStore};
use pin_project::pin_project;
use snafu::location;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use tessera_core::{Error, Result};

use crate::traits::Writer;

/// Size of the in-memory buffer before the upload switches to a multipart upload.
///
/// Can be overridden with `TESSERA_WRITER_BUFFER_SIZE`.
pub static WRITER_BUFFER_SIZE: LazyLock<usize> = LazyLock::new(|| {
    std::env::var("TESSERA_WRITER_BUFFER_SIZE")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(5 * 1024 * 1024)
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub size: usize,
}

/// AsyncWrite with the capability to tell the position the data is written.
///
/// The object only becomes visible at `path` once [`Self::shutdown`] returns.
#[pin_project]
pub struct ObjectWriter {
    #[pin]
    writer: BufWriter,

    path: Path,

    cursor: usize,
}

impl std::fmt::Debug for ObjectWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectWriter")
            .field("path", &self.path)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl ObjectWriter {
    pub fn new(object_store: Arc<dyn ObjectStore>, path: &Path) -> Self {
        Self {
            writer: BufWriter::with_capacity(object_store, path.clone(), *WRITER_BUFFER_SIZE),
            cursor: 0,
            path: path.clone(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush the remaining bytes and make the object visible.
    pub async fn shutdown(&mut self) -> Result<WriteResult> {
        AsyncWriteExt::shutdown(&mut self.writer)
            .await
            .map_err(|e| Error::IO {
                source: format!("failed to shutdown object writer for {}: {}", self.path, e).into(),
                location: location!(),
            })?;
        debug!(path = %self.path, size = self.cursor, "object written");
        Ok(WriteResult { size: self.cursor })
    }

    /// Abandon the upload. Nothing is left visible at the target path.
    pub async fn abort(&mut self) -> Result<()> {
        self.writer.abort().await.map_err(|e| Error::IO {
            source: format!("failed to abort object writer for {}: {}", self.path, e).into(),
            location: location!(),
        })
    }
}

#[async_trait]
impl Writer for ObjectWriter {
    async fn tell(&mut self) -> Result<usize> {
        Ok(self.cursor)
    }
}

impl AsyncWrite for ObjectWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        this.writer.poll_write(cx, buf).map_ok(|n| {
            *this.cursor += n;
            n
        })
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().writer.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().writer.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;

    use super::*;

    #[tokio::test]
    async fn test_write() {
        let store = Arc::new(InMemory::new());
        let path = Path::from("foo");

        let mut object_writer = ObjectWriter::new(store.clone(), &path);
        assert_eq!(object_writer.tell().await.unwrap(), 0);

        let buf = vec![0; 256];
        assert_eq!(object_writer.write(buf.as_slice()).await.unwrap(), 256);
        assert_eq!(object_writer.tell().await.unwrap(), 256);

        object_writer.write_all(buf.as_slice()).await.unwrap();
        assert_eq!(object_writer.tell().await.unwrap(), 512);

        // Not visible until shut down
        assert!(store.head(&path).await.is_err());
        let res = object_writer.shutdown().await.unwrap();
        assert_eq!(res.size, 512);
        assert_eq!(store.head(&path).await.unwrap().size, 512);
    }

    #[tokio::test]
    async fn test_abort() {
        let store = Arc::new(InMemory::new());
        let path = Path::from("bar");

        let mut object_writer = ObjectWriter::new(store.clone(), &path);
        assert_eq!(object_writer.path(), &path);
        object_writer.write_all(&[1, 2, 3]).await.unwrap();
        object_writer.abort().await.unwrap();
        assert!(store.head(&path).await.is_err());
    }
}
