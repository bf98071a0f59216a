use futures::TryStreamExt;
use reqwest::header::{CONTENT_LENGTH, IF_NONE_MATCH};
use reqwest::StatusCode;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;
use url::Url;

use crate::storage::key::{normalize_key, segments};
use crate::storage::{Content, ContentStream, StorageEngine, StorageError};

const API_VERSION: &str = "2021-08-06";

/// Azure Blob Storage backend speaking the blob REST API.
///
/// Create-only writes use a conditional `PUT` with `If-None-Match: *`, which
/// the service evaluates atomically, so concurrent uploads of one key resolve
/// to a single winner.
pub struct AzureBlobStorage {
    http: reqwest::Client,
    container_url: Url,
    sas_token: Option<String>,
}

impl AzureBlobStorage {
    pub fn new(
        account_url: &str,
        container: &str,
        sas_token: Option<String>,
    ) -> Result<Self, StorageError> {
        Self::with_client(reqwest::Client::new(), account_url, container, sas_token)
    }

    pub fn with_client(
        http: reqwest::Client,
        account_url: &str,
        container: &str,
        sas_token: Option<String>,
    ) -> Result<Self, StorageError> {
        let mut container_url = Url::parse(account_url).map_err(|e| {
            StorageError::Backend(format!("invalid account url {}: {}", account_url, e))
        })?;
        container_url
            .path_segments_mut()
            .map_err(|_| {
                StorageError::Backend(format!("account url {} cannot be a base", account_url))
            })?
            .pop_if_empty()
            .push(container);

        Ok(Self {
            http,
            container_url,
            sas_token: sas_token
                .map(|t| t.trim_start_matches('?').to_string())
                .filter(|t| !t.is_empty()),
        })
    }

    fn blob_url(&self, normalized: &str) -> Result<Url, StorageError> {
        let mut url = self.container_url.clone();
        url.path_segments_mut()
            .map_err(|_| StorageError::Backend("container url cannot be a base".to_string()))?
            .extend(segments(normalized));
        if let Some(sas) = &self.sas_token {
            url.set_query(Some(sas.as_str()));
        }
        Ok(url)
    }
}

fn backend(e: reqwest::Error) -> StorageError {
    StorageError::Backend(e.without_url().to_string())
}

#[async_trait::async_trait]
impl StorageEngine for AzureBlobStorage {
    async fn save(&self, key: &str, content: Content) -> Result<(), StorageError> {
        let normalized = normalize_key(key)?;
        let url = self.blob_url(&normalized)?;

        let body = reqwest::Body::wrap_stream(ReaderStream::new(content.stream));
        let response = self
            .http
            .put(url)
            .header("x-ms-version", API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .header(IF_NONE_MATCH, "*")
            .header(CONTENT_LENGTH, content.len)
            .body(body)
            .send()
            .await
            .map_err(backend)?;

        match response.status() {
            s if s.is_success() => {
                debug!("Uploaded blob {} ({} bytes)", normalized, content.len);
                Ok(())
            }
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                Err(StorageError::Conflict(normalized))
            }
            s => Err(StorageError::Backend(format!(
                "PUT {} returned {}",
                normalized, s
            ))),
        }
    }

    async fn load(&self, key: &str) -> Result<ContentStream, StorageError> {
        let normalized = normalize_key(key)?;
        let url = self.blob_url(&normalized)?;

        let response = self
            .http
            .get(url)
            .header("x-ms-version", API_VERSION)
            .send()
            .await
            .map_err(backend)?;

        match response.status() {
            StatusCode::OK => {
                let stream = Box::pin(response.bytes_stream().map_err(std::io::Error::other));
                Ok(Box::new(StreamReader::new(stream)))
            }
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(normalized)),
            s => Err(StorageError::Backend(format!(
                "GET {} returned {}",
                normalized, s
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use wiremock::matchers::{body_bytes, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const KEY: &str = "foo.pdb/00112233445566778899aabbccddeeffFFFFFFFF/foo.pdb";

    fn storage(server: &MockServer) -> AzureBlobStorage {
        AzureBlobStorage::new(&server.uri(), "symbols", Some("?sv=2021&sig=abc".into())).unwrap()
    }

    #[tokio::test]
    async fn save_issues_conditional_put() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(format!("/symbols/{}", KEY)))
            .and(header("If-None-Match", "*"))
            .and(header("x-ms-blob-type", "BlockBlob"))
            .and(query_param("sig", "abc"))
            .and(body_bytes(b"pdb bytes".to_vec()))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        storage(&server)
            .save(KEY, Content::from_bytes(b"pdb bytes".to_vec()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn existing_blob_maps_to_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let err = storage(&server)
            .save(KEY, Content::from_bytes(b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn failed_precondition_maps_to_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(412))
            .mount(&server)
            .await;

        let err = storage(&server)
            .save(KEY, Content::from_bytes(b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn server_errors_are_backend_errors() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = storage(&server)
            .save(KEY, Content::from_bytes(b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
    }

    #[tokio::test]
    async fn load_streams_blob_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/symbols/{}", KEY)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"pdb bytes".to_vec()))
            .mount(&server)
            .await;

        let mut stream = storage(&server).load(KEY).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"pdb bytes");
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(matches!(
            storage(&server).load(KEY).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn escaping_keys_never_reach_the_service() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let err = storage(&server)
            .save("../../etc/passwd", Content::from_bytes(b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }
}
