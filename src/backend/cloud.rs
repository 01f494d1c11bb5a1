use crate::backend::{
    validate_locator, BackendError, BackendResult, BlobMeta, Conditions, ListPage, ReadOutcome,
    StorageBackend, WriteProps,
};
use crate::config::CloudSettings;
use crate::probe::{format_http_date, parse_http_date};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::{header, Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Upper bound for uploads and downloads; metadata probes use the shorter configured timeout.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Object resource as returned by the JSON object API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource {
    name: String,
    updated: Option<String>,
    content_type: Option<String>,
    size: Option<String>,
    etag: Option<String>,
}

impl ObjectResource {
    fn into_meta(self) -> BlobMeta {
        let last_modified = self
            .updated
            .as_deref()
            .and_then(|u| OffsetDateTime::parse(u, &Rfc3339).ok())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        BlobMeta {
            locator: self.name,
            last_modified,
            content_type: self.content_type,
            size: self.size.and_then(|s| s.parse().ok()).unwrap_or(0),
            etag: self.etag,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectResource>,
    next_page_token: Option<String>,
}

/// Blob container reached over HTTP.
///
/// Speaks a JSON object API: `GET .../o/{name}` for metadata,
/// `?alt=media` for bytes, media uploads under `/upload`, paged listing with
/// `pageToken`. The client is built once and shared by every request.
pub struct CloudBackend {
    client: Client,
    settings: CloudSettings,
    probe_timeout: Duration,
}

impl CloudBackend {
    pub fn new(settings: CloudSettings, probe_timeout: Duration) -> BackendResult<Self> {
        Url::parse(&settings.endpoint)
            .map_err(|e| BackendError::InvalidLocator(format!("{}: {}", settings.endpoint, e)))?;
        let client = Client::builder().timeout(TRANSFER_TIMEOUT).build()?;
        Ok(Self { client, settings, probe_timeout })
    }

    fn objects_url(&self) -> BackendResult<Url> {
        let raw = format!("{}/storage/v1/b/{}/o", self.settings.endpoint, self.settings.bucket);
        Url::parse(&raw).map_err(|e| BackendError::InvalidLocator(format!("{}: {}", raw, e)))
    }

    fn object_url(&self, locator: &str) -> BackendResult<Url> {
        let mut url = self.objects_url()?;
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidLocator(locator.to_string()))?
            .push(validate_locator(locator)?);
        Ok(url)
    }

    fn upload_url(&self, locator: &str) -> BackendResult<Url> {
        let raw = format!("{}/upload/storage/v1/b/{}/o", self.settings.endpoint, self.settings.bucket);
        let mut url = Url::parse(&raw).map_err(|e| BackendError::InvalidLocator(format!("{}: {}", raw, e)))?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", validate_locator(locator)?);
        Ok(url)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.settings.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn meta_from_headers(locator: &str, headers: &header::HeaderMap) -> BlobMeta {
        let text = |name: header::HeaderName| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);
        BlobMeta {
            locator: locator.to_string(),
            last_modified: text(header::LAST_MODIFIED)
                .as_deref()
                .and_then(parse_http_date)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
            content_type: text(header::CONTENT_TYPE),
            size: text(header::CONTENT_LENGTH).and_then(|v| v.parse().ok()).unwrap_or(0),
            etag: text(header::ETAG),
        }
    }

    fn unexpected(status: StatusCode, locator: &str) -> BackendError {
        BackendError::Status { status: status.as_u16(), locator: locator.to_string() }
    }
}

#[async_trait::async_trait]
impl StorageBackend for CloudBackend {
    fn name(&self) -> &'static str {
        "cloud"
    }

    async fn metadata(&self, locator: &str) -> BackendResult<Option<BlobMeta>> {
        let url = self.object_url(locator)?;
        let resp = self
            .authorized(self.client.get(url))
            .timeout(self.probe_timeout)
            .send()
            .await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let object: ObjectResource = resp.json().await?;
                Ok(Some(object.into_meta()))
            }
            s => Err(Self::unexpected(s, locator)),
        }
    }

    async fn read(&self, locator: &str, conditions: &Conditions) -> BackendResult<ReadOutcome> {
        let mut url = self.object_url(locator)?;
        url.query_pairs_mut().append_pair("alt", "media");

        let mut req = self.authorized(self.client.get(url));
        if let Some(etag) = &conditions.if_none_match {
            req = req.header(header::IF_NONE_MATCH, etag);
        }
        if let Some(since) = conditions.if_modified_since {
            req = req.header(header::IF_MODIFIED_SINCE, format_http_date(since));
        }
        if let Some(cc) = &conditions.cache_control {
            req = req.header(header::CACHE_CONTROL, cc);
        }

        let resp = req.send().await?;
        let meta = Self::meta_from_headers(locator, resp.headers());
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(ReadOutcome::NotFound),
            StatusCode::NOT_MODIFIED => Ok(ReadOutcome::NotModified(meta)),
            s if s.is_success() => {
                let body = resp
                    .bytes_stream()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
                    .boxed();
                Ok(ReadOutcome::Content { meta, body })
            }
            s => Err(Self::unexpected(s, locator)),
        }
    }

    async fn write(&self, locator: &str, data: Bytes, props: &WriteProps) -> BackendResult<()> {
        let size = data.len();
        let resp = self
            .authorized(self.client.post(self.upload_url(locator)?))
            .header(header::CONTENT_TYPE, &props.content_type)
            .body(data)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::unexpected(resp.status(), locator));
        }

        // Properties are set in a second call, as with most blob APIs.
        let mut patch = serde_json::json!({ "contentType": props.content_type });
        if let Some(cc) = &props.cache_control {
            patch["cacheControl"] = cc.clone().into();
        }
        if let Some(by) = &props.processed_by {
            patch["metadata"] = serde_json::json!({ "imageProcessedBy": by });
        }
        let resp = self
            .authorized(self.client.patch(self.object_url(locator)?))
            .json(&patch)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::unexpected(resp.status(), locator));
        }

        tracing::debug!(locator, size, "Uploaded blob");
        Ok(())
    }

    async fn list(&self, prefix: &str, marker: Option<&str>, limit: usize) -> BackendResult<ListPage> {
        let mut url = self.objects_url()?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("maxResults", &limit.to_string());
            if !prefix.is_empty() {
                q.append_pair("prefix", prefix);
            }
            if let Some(token) = marker {
                q.append_pair("pageToken", token);
            }
        }

        let resp = self.authorized(self.client.get(url)).send().await?;
        if !resp.status().is_success() {
            return Err(Self::unexpected(resp.status(), prefix));
        }
        let list: ObjectList = resp.json().await?;
        Ok(ListPage {
            items: list.items.into_iter().map(ObjectResource::into_meta).collect(),
            next_marker: list.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn delete(&self, locator: &str) -> BackendResult<()> {
        let resp = self.authorized(self.client.delete(self.object_url(locator)?)).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(()),
            s if s.is_success() => Ok(()),
            s => Err(Self::unexpected(s, locator)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::collect_body;
    use wiremock::matchers::{body_bytes, header as header_is, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer) -> CloudBackend {
        CloudBackend::new(
            CloudSettings { endpoint: server.uri(), bucket: "media".into(), token: Some("t0k".into()) },
            Duration::from_millis(500),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn metadata_parses_object_resource() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/media/o/c1%2Fic~a.jpg"))
            .and(header_is("authorization", "Bearer t0k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "c1/ic~a.jpg",
                "updated": "2024-03-01T10:00:00Z",
                "contentType": "image/jpeg",
                "size": "1234",
                "etag": "CJv9"
            })))
            .mount(&server)
            .await;

        let meta = backend(&server).metadata("c1/ic~a.jpg").await.unwrap().unwrap();
        assert_eq!(meta.size, 1234);
        assert_eq!(meta.last_modified.unix_timestamp(), 1_709_287_200);
        assert_eq!(meta.etag.as_deref(), Some("CJv9"));
    }

    #[tokio::test]
    async fn metadata_missing_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        assert!(backend(&server).metadata("c1/ic~a.jpg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_forwards_validators_and_surfaces_304() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/media/o/c1%2Fic~a.jpg"))
            .and(query_param("alt", "media"))
            .and(header_is("if-none-match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304).insert_header("etag", "\"v1\""))
            .mount(&server)
            .await;

        let cond = Conditions { if_none_match: Some("\"v1\"".into()), ..Default::default() };
        match backend(&server).read("c1/ic~a.jpg", &cond).await.unwrap() {
            ReadOutcome::NotModified(meta) => assert_eq!(meta.etag.as_deref(), Some("\"v1\"")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_streams_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("alt", "media"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(b"png-bytes".to_vec()),
            )
            .mount(&server)
            .await;

        match backend(&server).read("c1/ic~a.png", &Conditions::default()).await.unwrap() {
            ReadOutcome::Content { meta, body } => {
                assert_eq!(meta.content_type.as_deref(), Some("image/png"));
                assert_eq!(collect_body(body).await.unwrap(), Bytes::from_static(b"png-bytes"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_uploads_then_patches_properties() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/storage/v1/b/media/o"))
            .and(query_param("name", "c1/ic~a.jpg"))
            .and(header_is("content-type", "image/jpeg"))
            .and(body_bytes(b"jpeg".to_vec()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/storage/v1/b/media/o/c1%2Fic~a.jpg"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let props = WriteProps {
            content_type: "image/jpeg".into(),
            cache_control: Some("public, max-age=604800".into()),
            processed_by: Some("imagecache/0.1.0".into()),
        };
        backend(&server)
            .write("c1/ic~a.jpg", Bytes::from_static(b"jpeg"), &props)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn list_follows_page_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/media/o"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{ "name": "c2/ic~b.jpg", "updated": "2024-03-01T10:00:00Z", "size": "1" }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/media/o"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{ "name": "c1/ic~a.jpg", "updated": "2024-03-01T10:00:00Z", "size": "1" }],
                "nextPageToken": "p2"
            })))
            .mount(&server)
            .await;

        let b = backend(&server);
        let first = b.list("", None, 1).await.unwrap();
        assert_eq!(first.items[0].locator, "c1/ic~a.jpg");
        assert_eq!(first.next_marker.as_deref(), Some("p2"));

        let second = b.list("", first.next_marker.as_deref(), 1).await.unwrap();
        assert_eq!(second.items[0].locator, "c2/ic~b.jpg");
        assert!(second.next_marker.is_none());
    }
}
