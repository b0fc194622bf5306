// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Tessera Authors

//! Dataset-level access to an [object_store::ObjectStore].

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{
    path::Path, ObjectMeta, ObjectStore as OSObjectStore, PutMode, PutOptions, PutPayload,
};
use snafu::location;
use url::Url;

use crate::object_writer::{ObjectWriter, WriteResult};
use tessera_core::{Error, Result};

const LOCAL_BLOCK_SIZE: usize = 4 * 1024;
const MEMORY_BLOCK_SIZE: usize = 64 * 1024;

/// Every `memory://` URI in a process resolves to this store, so a dataset
/// written through one handle can be opened through another.
static SHARED_MEMORY_STORE: LazyLock<Arc<InMemory>> = LazyLock::new(|| Arc::new(InMemory::new()));

/// An object store plus the URI scheme it was resolved from.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    pub inner: Arc<dyn OSObjectStore>,
    scheme: String,
    block_size: usize,
}

impl std::fmt::Display for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectStore({})", self.scheme)
    }
}

/// Parameters to create an [ObjectStore]
#[derive(Debug, Clone, Default)]
pub struct ObjectStoreParams {
    /// Preferred IO size. Defaults to 4KiB for local files and 64KiB in memory.
    pub block_size: Option<usize>,
    /// Options for the store backend. Neither the local nor the memory
    /// store reads any.
    pub storage_options: Option<HashMap<String, String>>,
}

/// Turn a dataset location into a URL. Anything that does not parse as a
/// URL is a local path, relative to the working directory.
fn parse_location(uri: &str) -> Result<Url> {
    let as_directory = |path: &str| {
        let absolute = std::path::absolute(path)?;
        Url::from_directory_path(absolute).map_err(|_| {
            Error::invalid_input(format!("Invalid dataset location: '{path}'"), location!())
        })
    };
    match Url::parse(uri) {
        // A Windows drive letter parses as a one-letter scheme
        Ok(url) if url.scheme().len() == 1 && cfg!(windows) => as_directory(uri),
        Ok(url) => Ok(url),
        Err(_) => as_directory(uri),
    }
}

impl ObjectStore {
    /// Resolve `uri` with default parameters.
    ///
    /// Returns the store and the dataset's path inside it.
    pub async fn from_uri(uri: &str) -> Result<(Arc<Self>, Path)> {
        Self::from_uri_and_params(uri, &ObjectStoreParams::default()).await
    }

    /// Resolve `uri`: `file://` URLs and plain paths go to the local file
    /// system, `memory://` to the shared in-memory store.
    pub async fn from_uri_and_params(
        uri: &str,
        params: &ObjectStoreParams,
    ) -> Result<(Arc<Self>, Path)> {
        let url = parse_location(uri)?;
        let (store, path) = match url.scheme() {
            "file" => {
                let local_path = url.to_file_path().map_err(|_| {
                    Error::invalid_input(format!("Invalid local path: '{uri}'"), location!())
                })?;
                (Self::local(), Path::from_absolute_path(local_path)?)
            }
            "memory" => {
                // memory://bucket/path keeps the bucket as the first segment
                let path = format!("{}{}", url.host_str().unwrap_or_default(), url.path());
                (Self::memory(), Path::parse(path)?)
            }
            scheme => {
                return Err(Error::invalid_input(
                    format!("Unsupported URI scheme {scheme} in uri {uri}"),
                    location!(),
                ))
            }
        };
        let store = Self {
            block_size: params.block_size.unwrap_or(store.block_size),
            ..store
        };
        Ok((Arc::new(store), path))
    }

    pub fn local() -> Self {
        Self {
            inner: Arc::new(LocalFileSystem::new()),
            scheme: "file".to_string(),
            block_size: LOCAL_BLOCK_SIZE,
        }
    }

    /// The process-wide in-memory object store.
    pub fn memory() -> Self {
        Self {
            inner: SHARED_MEMORY_STORE.clone(),
            scheme: "memory".to_string(),
            block_size: MEMORY_BLOCK_SIZE,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Start writing a new object at `path`.
    pub fn create(&self, path: &Path) -> ObjectWriter {
        ObjectWriter::new(self.inner.clone(), path)
    }

    /// Write `content` to `path` with a single request, replacing any
    /// existing object. Readers see either the old or the new content.
    pub async fn put(&self, path: &Path, content: impl Into<Bytes>) -> Result<WriteResult> {
        let content: Bytes = content.into();
        let size = content.len();
        self.inner.put(path, PutPayload::from(content)).await?;
        Ok(WriteResult { size })
    }

    /// Write `content` to `path` only if nothing exists there yet.
    ///
    /// Returns `false` if the path was already taken.
    pub async fn put_if_not_exists(&self, path: &Path, content: impl Into<Bytes>) -> Result<bool> {
        let options = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        let payload = PutPayload::from(content.into());
        match self.inner.put_opts(path, payload, options).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete `path`. Returns false if there was nothing to delete.
    pub async fn delete_if_exists(&self, path: &Path) -> Result<bool> {
        match self.inner.delete(path).await {
            Ok(()) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of the files and directories directly under `dir_path`.
    pub async fn read_dir(&self, dir_path: impl Into<Path>) -> Result<Vec<String>> {
        let listing = self.inner.list_with_delimiter(Some(&dir_path.into())).await?;
        let objects = listing.objects.iter().map(|meta| &meta.location);
        Ok(listing
            .common_prefixes
            .iter()
            .chain(objects)
            .filter_map(|path| path.filename().map(str::to_string))
            .collect())
    }

    /// List all files under `path`, recursively.
    ///
    /// A missing directory lists as empty.
    pub fn list(&self, path: Option<&Path>) -> BoxStream<'_, Result<ObjectMeta>> {
        self.inner.list(path).map_err(Error::from).boxed()
    }

    pub async fn exists(&self, path: &Path) -> Result<bool> {
        match self.inner.head(path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the whole object at `path`.
    pub async fn read_one_all(&self, path: &Path) -> Result<Bytes> {
        Ok(self.inner.get(path).await?.bytes().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    #[rstest]
    #[case::plain("{dir}/tables/events")]
    #[case::dot_segment("{dir}/./tables/events")]
    #[case::file_url("file://{dir}/tables/events")]
    #[tokio::test]
    async fn test_local_locations(#[case] template: &str) {
        let tmp_dir = tempfile::tempdir().unwrap();
        let dir = tmp_dir.path().to_str().unwrap();
        std::fs::create_dir_all(tmp_dir.path().join("tables/events")).unwrap();
        std::fs::write(tmp_dir.path().join("tables/events/marker"), "here").unwrap();

        let uri = template.replace("{dir}", dir);
        let (store, path) = ObjectStore::from_uri(&uri).await.unwrap();
        assert_eq!(store.scheme(), "file");
        assert_eq!(store.block_size(), LOCAL_BLOCK_SIZE);
        let contents = store.read_one_all(&path.child("marker")).await.unwrap();
        assert_eq!(contents.as_ref(), b"here");
    }

    #[rstest]
    #[case("memory://shared/ds", "shared/ds")]
    #[case("memory:///ds", "ds")]
    #[tokio::test]
    async fn test_memory_paths(#[case] uri: &str, #[case] expected: &str) {
        let (store, path) = ObjectStore::from_uri(uri).await.unwrap();
        assert_eq!(store.scheme(), "memory");
        assert_eq!(path.to_string(), expected);
    }

    #[tokio::test]
    async fn test_params_and_schemes() {
        let params = ObjectStoreParams {
            block_size: Some(1024),
            ..Default::default()
        };
        let (store, _) = ObjectStore::from_uri_and_params("memory://params", &params)
            .await
            .unwrap();
        assert_eq!(store.block_size(), 1024);

        let err = ObjectStore::from_uri("s3://bucket/foo").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }), "{err:?}");
    }

    #[test_log::test(tokio::test)]
    async fn test_put_if_not_exists() {
        let store = ObjectStore::memory();
        let path = Path::from("test_put_if_not_exists/1.manifest");
        assert!(store.put_if_not_exists(&path, "a").await.unwrap());
        assert!(!store.put_if_not_exists(&path, "b").await.unwrap());
        assert_eq!(store.read_one_all(&path).await.unwrap().as_ref(), b"a");
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (store, base) = ObjectStore::from_uri(tmp_dir.path().to_str().unwrap())
            .await
            .unwrap();

        let missing = store
            .list(Some(&base.child("missing")))
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert!(missing.is_empty());

        let dir = base.child("a");
        store.put(&dir.child("x"), "1").await.unwrap();
        store.put(&dir.child("sub").child("y"), "22").await.unwrap();
        let mut names = store.read_dir(dir.clone()).await.unwrap();
        names.sort();
        assert_eq!(names, vec!["sub", "x"]);
        let listed = store
            .list(Some(&dir))
            .try_collect::<Vec<_>>()
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);

        assert!(store.delete_if_exists(&dir.child("x")).await.unwrap());
        assert!(!store.delete_if_exists(&dir.child("x")).await.unwrap());
        assert!(!store.exists(&dir.child("x")).await.unwrap());
        assert!(store.exists(&dir.child("sub").child("y")).await.unwrap());
    }
}
