use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use huddle::error::Error;
use huddle::upload::{MediaHost, UploadAuthority, UploadAuthorization, UploadRequest};

use crate::MemoryRelay;

impl MemoryRelay {
    /// Makes the next authorization requests fail until reset
    pub fn fail_authorization(&self, fail: bool) {
        self.inner.failures.lock().authorization = fail;
    }

    /// Makes the next uploads fail until reset
    pub fn fail_uploads(&self, fail: bool) {
        self.inner.failures.lock().upload = fail;
    }

    /// Contents stored under `url`
    pub fn uploaded(&self, url: &str) -> Option<Bytes> {
        self.inner.uploads.read().get(url).cloned()
    }

    pub fn upload_count(&self) -> usize {
        self.inner.uploads.read().len()
    }
}

#[async_trait]
impl UploadAuthority for MemoryRelay {
    async fn get_upload_authorization(&self) -> Result<UploadAuthorization, Error> {
        if self.inner.failures.lock().authorization {
            return Err(Error::UploadAuthorization(
                "signing service unavailable".into(),
            ));
        }
        let signature = uuid::Uuid::new_v4().simple().to_string();
        self.inner.signatures.lock().insert(signature.clone());
        Ok(UploadAuthorization {
            signature,
            timestamp: Utc::now().timestamp(),
        })
    }
}

#[async_trait]
impl MediaHost for MemoryRelay {
    async fn upload(&self, request: UploadRequest) -> Result<String, Error> {
        if self.inner.failures.lock().upload {
            return Err(Error::Upload("media host rejected the upload".into()));
        }
        if !self.inner.signatures.lock().remove(&request.signature) {
            return Err(Error::Upload("invalid signature".into()));
        }
        if request.file.is_empty() {
            return Err(Error::Upload("empty file".into()));
        }
        let url = format!(
            "memory://{}/{}",
            request.folder,
            uuid::Uuid::new_v4().simple()
        );
        log::debug!(
            "stored {} bytes of {} at {url}",
            request.file.len(),
            request.mime_type
        );
        self.inner.uploads.write().insert(url.clone(), request.file);
        Ok(url)
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use huddle::error::Error;
    use huddle::upload::{MediaHost, UploadAuthority, UploadRequest};

    use crate::MemoryRelay;

    #[tokio::test]
    async fn signatures_are_single_use() -> anyhow::Result<()> {
        let relay = MemoryRelay::new();
        let auth = relay.get_upload_authorization().await?;
        let request = UploadRequest::new(
            Bytes::from_static(b"data"),
            "video/webm",
            "tasktalk-recordings",
            auth,
        );
        let url = relay.upload(request.clone()).await?;
        assert!(url.starts_with("memory://tasktalk-recordings/"));
        assert_eq!(relay.uploaded(&url), Some(Bytes::from_static(b"data")));
        assert!(matches!(relay.upload(request).await, Err(Error::Upload(_))));
        Ok(())
    }

    #[tokio::test]
    async fn failures_can_be_injected() {
        let relay = MemoryRelay::new();
        relay.fail_authorization(true);
        assert!(matches!(
            relay.get_upload_authorization().await,
            Err(Error::UploadAuthorization(_))
        ));
        relay.fail_authorization(false);
        assert!(relay.get_upload_authorization().await.is_ok());
    }
}
