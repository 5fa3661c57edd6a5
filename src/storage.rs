use anyhow::{bail, Context};
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::PathPart;
use object_store::{path::Path, ObjectStore, WriteMultipart};
use std::fmt::{Display, Formatter};
use std::num::NonZeroUsize;
use tracing::debug;

use crate::compression::Compression;
use url::Url;

#[derive(Debug)]
pub struct StorageBackend {
    url: Url,
    store: Box<dyn ObjectStore>,
    path: Path,
    part_size: byte_unit::Byte,
    concurrent_uploads: Option<NonZeroUsize>,
}

impl Display for StorageBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.url.as_str())
    }
}

fn open_store(url: &Url) -> anyhow::Result<(Box<dyn ObjectStore>, Path)> {
    let store: Box<dyn ObjectStore> = match (url.scheme(), url.host_str()) {
        ("file", None) => Box::new(LocalFileSystem::new()),
        ("memory", None | Some("")) => Box::new(InMemory::new()),
        ("s3" | "s3a", Some(_)) => Box::new(
            AmazonS3Builder::from_env()
                .with_url(url.to_string())
                .build()?,
        ),
        ("gs", Some(_)) => Box::new(
            GoogleCloudStorageBuilder::from_env()
                .with_url(url.to_string())
                .build()?,
        ),
        ("az" | "adl" | "azure" | "abfs" | "abfss", Some(_)) => Box::new(
            MicrosoftAzureBuilder::from_env()
                .with_url(url.to_string())
                .build()?,
        ),
        _ => bail!("Unknown storage target {url}."),
    };

    let path = Path::parse(url.path()).with_context(|| format!("Invalid output path in {url}"))?;
    Ok((store, path))
}

impl StorageBackend {
    pub fn from_url(
        url: &Url,
        part_size: byte_unit::Byte,
        concurrent_uploads: Option<NonZeroUsize>,
    ) -> anyhow::Result<StorageBackend> {
        let (store, path) = open_store(url)?;
        Ok(StorageBackend {
            url: url.clone(),
            store,
            path,
            part_size,
            concurrent_uploads,
        })
    }

    fn object_path(&self, file_name: &str, compression: Compression) -> Path {
        let name = match compression.extension() {
            Some(ext) => format!("{file_name}.{ext}"),
            None => file_name.to_string(),
        };
        Path::from_iter(self.path.parts().chain([PathPart::from(name)]))
    }

    /// Starts a multipart upload and returns the object's URL with its writer.
    pub async fn create_streaming_upload(
        &self,
        file_name: &str,
        compression: Compression,
    ) -> anyhow::Result<(Url, WriteMultipart)> {
        let key_path = self.object_path(file_name, compression);
        let upload = self.store.put_multipart(&key_path).await?;
        debug!("Created multipart upload for {key_path:?}");

        let mut object_url = self.url.clone();
        object_url.set_path(&format!("/{key_path}"));

        let writer = WriteMultipart::new_with_chunk_size(upload, self.part_size.as_u64() as usize);
        Ok((object_url, writer))
    }

    pub async fn wait_for_capacity(&self, upload: &mut WriteMultipart) -> anyhow::Result<()> {
        if let Some(concurrency) = self.concurrent_uploads {
            upload.wait_for_capacity(concurrency.get()).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub async fn read(&self, object_url: &Url) -> anyhow::Result<Vec<u8>> {
        let path = Path::parse(object_url.path())?;
        let bytes = self.store.get(&path).await?.bytes().await?;
        Ok(bytes.to_vec())
    }
}
