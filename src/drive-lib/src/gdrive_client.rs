use std::io::Cursor;
use std::ops::Range;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::TryStreamExt;
use log::{debug, info};
use reqwest::header::{CONTENT_TYPE, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::StreamReader;

use crate::{
    ContentReader, DriveError, DriveNode, DriveResult, MetadataUpdate, NodeKind, ObjectId,
    ObjectStore,
};

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const DEFAULT_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const FILE_MIME_TYPE: &str = "application/octet-stream";
const FILE_FIELDS: &str =
    "id,name,mimeType,size,md5Checksum,headRevisionId,modifiedTime,parents,trashed";
const LIST_PAGE_SIZE: &str = "1000";
const ID_BATCH: &str = "50";

#[derive(Clone, Debug)]
pub struct GDriveConfig {
    /// OAuth bearer token, acquired outside this crate.
    pub access_token: String,
    pub api_base: String,
    pub upload_base: String,
    pub request_timeout: Duration,
}

impl GDriveConfig {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            upload_base: DEFAULT_UPLOAD_BASE.to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mime_type: String,
    size: Option<String>,
    md5_checksum: Option<String>,
    head_revision_id: Option<String>,
    modified_time: Option<String>,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    trashed: bool,
}

impl DriveFile {
    /// Items in the trash are gone as far as the filesystem is concerned.
    fn into_live_node(self) -> DriveResult<DriveNode> {
        if self.trashed {
            return Err(DriveError::NotFound(format!("object {} is trashed", self.id)));
        }
        Ok(self.into_node())
    }

    fn into_node(self) -> DriveNode {
        let kind = if self.mime_type == FOLDER_MIME_TYPE {
            NodeKind::Dir
        } else {
            NodeKind::File
        };
        let size = match kind {
            NodeKind::Dir => 0,
            NodeKind::File => self
                .size
                .as_deref()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0),
        };
        let modified_at = self
            .modified_time
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.timestamp_millis().max(0) as u64)
            .unwrap_or(0);
        DriveNode {
            id: ObjectId(self.id),
            name: self.name,
            kind,
            size,
            revision: self.md5_checksum.or(self.head_revision_id),
            modified_at,
            parents: self.parents.into_iter().map(ObjectId).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeneratedIds {
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorItem {
    #[serde(default)]
    reason: String,
}

/// Google Drive v3 REST client. Credentials are handed in as a ready token.
pub struct GDriveClient {
    client: Client,
    config: GDriveConfig,
    root_id: ObjectId,
    /// Ids fetched ahead from `files/generateIds`.
    id_pool: Mutex<Vec<String>>,
}

impl GDriveClient {
    /// Build the client and resolve the concrete id behind the `root` alias.
    pub async fn connect(config: GDriveConfig) -> DriveResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DriveError::Internal(format!("build http client failed: {}", e)))?;
        let mut this = Self {
            client,
            config,
            root_id: ObjectId::new("root"),
            id_pool: Mutex::new(Vec::new()),
        };
        let root = this.get_metadata(&ObjectId::new("root")).await?;
        info!("google drive root folder id: {}", root.id);
        this.root_id = root.id;
        Ok(this)
    }

    fn file_url(&self, id: &ObjectId) -> String {
        format!("{}/files/{}", self.config.api_base, id.as_str())
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(&self.config.access_token)
            .query(&[("supportsAllDrives", "true")])
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> DriveResult<Response> {
        let resp = self.authed(builder).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_error(status, what, &body))
    }

    async fn send_for_node(&self, builder: RequestBuilder, what: &str) -> DriveResult<DriveNode> {
        let resp = self.send(builder, what).await?;
        let file: DriveFile = resp.json().await?;
        file.into_live_node()
    }

    fn pop_pooled_id(&self) -> DriveResult<Option<String>> {
        let mut pool = self
            .id_pool
            .lock()
            .map_err(|e| DriveError::Internal(format!("lock id pool: {}", e)))?;
        Ok(pool.pop())
    }

    /// Drive answers 409 when a create reuses an id, which after a lost reply
    /// means our earlier attempt went through. Adopt that object if it is
    /// the one we asked for.
    async fn adopt_created(
        &self,
        id: &ObjectId,
        parent: &ObjectId,
        name: &str,
        kind: NodeKind,
        err: DriveError,
    ) -> DriveResult<DriveNode> {
        let node = match self.get_metadata(id).await {
            Ok(node) => node,
            Err(_) => return Err(err),
        };
        if node.name == name && node.kind == kind && node.has_parent(parent) {
            debug!("create {} under {}: adopting existing {}", name, parent, id);
            return Ok(node);
        }
        Err(err)
    }
}

fn mime_for(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Dir => FOLDER_MIME_TYPE,
        NodeKind::File => FILE_MIME_TYPE,
    }
}

/// `multipart/related` upload body: JSON metadata part, then the media part.
fn multipart_related_body(boundary: &str, metadata: &serde_json::Value, data: &[u8]) -> Bytes {
    let meta = metadata.to_string();
    let mut buf = BytesMut::with_capacity(data.len() + meta.len() + 4 * boundary.len() + 128);
    buf.put_slice(format!("--{}\r\n", boundary).as_bytes());
    buf.put_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    buf.put_slice(meta.as_bytes());
    buf.put_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    buf.put_slice(format!("Content-Type: {}\r\n\r\n", FILE_MIME_TYPE).as_bytes());
    buf.put_slice(data);
    buf.put_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    buf.freeze()
}

fn classify_error(status: StatusCode, what: &str, body: &str) -> DriveError {
    let parsed = serde_json::from_str::<ApiErrorBody>(body).ok();
    let message = parsed
        .as_ref()
        .map(|b| b.error.message.clone())
        .unwrap_or_else(|| body.chars().take(200).collect());
    let info = format!("{}: {}", what, message);
    let rate_limited = parsed
        .as_ref()
        .map(|b| {
            b.error.errors.iter().any(|e| {
                matches!(
                    e.reason.as_str(),
                    "rateLimitExceeded" | "userRateLimitExceeded" | "backendError"
                )
            })
        })
        .unwrap_or(false);
    if rate_limited {
        return DriveError::Transient(info);
    }
    DriveError::from_http_status(status.as_u16(), info)
}

#[async_trait]
impl ObjectStore for GDriveClient {
    fn root_id(&self) -> ObjectId {
        self.root_id.clone()
    }

    async fn get_metadata(&self, id: &ObjectId) -> DriveResult<DriveNode> {
        let req = self
            .client
            .get(self.file_url(id))
            .query(&[("fields", FILE_FIELDS)]);
        self.send_for_node(req, &format!("get {}", id)).await
    }

    async fn allocate_id(&self) -> DriveResult<ObjectId> {
        if let Some(id) = self.pop_pooled_id()? {
            return Ok(ObjectId(id));
        }
        let req = self
            .client
            .get(format!("{}/files/generateIds", self.config.api_base))
            .query(&[("count", ID_BATCH), ("space", "drive"), ("type", "files")]);
        let resp = self.send(req, "generate ids").await?;
        let mut generated: GeneratedIds = resp.json().await?;
        let id = generated
            .ids
            .pop()
            .ok_or_else(|| DriveError::Permanent("generate ids: empty batch".to_string()))?;
        let mut pool = self
            .id_pool
            .lock()
            .map_err(|e| DriveError::Internal(format!("lock id pool: {}", e)))?;
        pool.extend(generated.ids);
        Ok(ObjectId(id))
    }

    async fn create_object(
        &self,
        id: &ObjectId,
        parent: &ObjectId,
        name: &str,
        kind: NodeKind,
    ) -> DriveResult<DriveNode> {
        let body = json!({
            "id": id.as_str(),
            "name": name,
            "mimeType": mime_for(kind),
            "parents": [parent.as_str()],
        });
        let req = self
            .client
            .post(format!("{}/files", self.config.api_base))
            .query(&[("fields", FILE_FIELDS)])
            .json(&body);
        match self
            .send_for_node(req, &format!("create {} under {}", name, parent))
            .await
        {
            Err(err @ DriveError::AlreadyExists(_)) => {
                self.adopt_created(id, parent, name, kind, err).await
            }
            other => other,
        }
    }

    async fn create_with_content(
        &self,
        id: &ObjectId,
        parent: &ObjectId,
        name: &str,
        data: Bytes,
    ) -> DriveResult<DriveNode> {
        debug!("create {} under {} with {} bytes", name, parent, data.len());
        let metadata = json!({
            "id": id.as_str(),
            "name": name,
            "mimeType": FILE_MIME_TYPE,
            "parents": [parent.as_str()],
        });
        let boundary = format!("drive-{}", uuid::Uuid::new_v4().simple());
        let body = multipart_related_body(&boundary, &metadata, &data);
        let req = self
            .client
            .post(format!("{}/files", self.config.upload_base))
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .header(
                CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body);
        match self
            .send_for_node(req, &format!("create {} under {}", name, parent))
            .await
        {
            Err(err @ DriveError::AlreadyExists(_)) => {
                self.adopt_created(id, parent, name, NodeKind::File, err)
                    .await
            }
            other => other,
        }
    }

    async fn update_metadata(
        &self,
        id: &ObjectId,
        update: &MetadataUpdate,
    ) -> DriveResult<DriveNode> {
        let mut req = self
            .client
            .patch(self.file_url(id))
            .query(&[("fields", FILE_FIELDS)]);
        if let Some(parent) = update.add_parent.as_ref() {
            req = req.query(&[("addParents", parent.as_str())]);
        }
        if let Some(parent) = update.remove_parent.as_ref() {
            req = req.query(&[("removeParents", parent.as_str())]);
        }
        let body = match update.name.as_ref() {
            Some(name) => json!({ "name": name }),
            None => json!({}),
        };
        self.send_for_node(req.json(&body), &format!("update {}", id))
            .await
    }

    async fn delete_object(&self, id: &ObjectId) -> DriveResult<()> {
        let req = self.client.delete(self.file_url(id));
        self.send(req, &format!("delete {}", id)).await?;
        Ok(())
    }

    async fn upload_content(&self, id: &ObjectId, data: Bytes) -> DriveResult<DriveNode> {
        debug!("upload {} bytes to {}", data.len(), id);
        let req = self
            .client
            .patch(format!("{}/files/{}", self.config.upload_base, id.as_str()))
            .query(&[("uploadType", "media"), ("fields", FILE_FIELDS)])
            .header(CONTENT_TYPE, FILE_MIME_TYPE)
            .body(data);
        self.send_for_node(req, &format!("upload {}", id)).await
    }

    async fn download_content(
        &self,
        id: &ObjectId,
        range: Option<Range<u64>>,
    ) -> DriveResult<ContentReader> {
        let mut req = self
            .client
            .get(self.file_url(id))
            .query(&[("alt", "media")]);
        if let Some(r) = range.as_ref() {
            if r.start >= r.end {
                return Ok(Box::pin(Cursor::new(Bytes::new())));
            }
            req = req.header(RANGE, format!("bytes={}-{}", r.start, r.end - 1));
        }
        let resp = self.send(req, &format!("download {}", id)).await?;
        let stream = Box::pin(
            resp.bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn list_children(&self, parent: &ObjectId) -> DriveResult<Vec<DriveNode>> {
        let query = format!("'{}' in parents and trashed = false", parent.as_str());
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut req = self.client.get(format!("{}/files", self.config.api_base)).query(&[
                ("q", query.as_str()),
                ("fields", fields.as_str()),
                ("pageSize", LIST_PAGE_SIZE),
                ("includeItemsFromAllDrives", "true"),
            ]);
            if let Some(token) = page_token.as_ref() {
                req = req.query(&[("pageToken", token.as_str())]);
            }
            let resp = self.send(req, &format!("list {}", parent)).await?;
            let page: FileList = resp.json().await?;
            out.extend(page.files.into_iter().map(DriveFile::into_node));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        // Drive answers an empty list for a deleted parent; tell the two apart.
        if out.is_empty() && *parent != self.root_id {
            self.get_metadata(parent).await?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_file_into_node() {
        let json = r#"{
            "id": "abc",
            "name": "a.txt",
            "mimeType": "text/plain",
            "size": "5",
            "md5Checksum": "5d41402abc4b2a76b9719d911017c592",
            "modifiedTime": "2024-01-02T03:04:05.678Z",
            "parents": ["p1", "p2"]
        }"#;
        let file: DriveFile = serde_json::from_str(json).unwrap();
        let node = file.into_node();
        assert_eq!(node.id, ObjectId::new("abc"));
        assert_eq!(node.kind, NodeKind::File);
        assert_eq!(node.size, 5);
        assert_eq!(node.modified_at, 1704164645678);
        assert_eq!(node.parents.len(), 2);
        assert_eq!(
            node.revision.as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
    }

    #[test]
    fn test_folder_has_zero_size() {
        let json = r#"{"id":"d","name":"docs","mimeType":"application/vnd.google-apps.folder"}"#;
        let node = serde_json::from_str::<DriveFile>(json).unwrap().into_node();
        assert_eq!(node.kind, NodeKind::Dir);
        assert_eq!(node.size, 0);
        assert!(node.parents.is_empty());
    }

    #[test]
    fn test_trashed_item_is_not_found() {
        let json = r#"{
            "id": "t1",
            "name": "old.txt",
            "mimeType": "text/plain",
            "size": "3",
            "parents": ["p1"],
            "trashed": true
        }"#;
        let file: DriveFile = serde_json::from_str(json).unwrap();
        assert!(file.into_live_node().unwrap_err().is_not_found());

        let json = r#"{"id":"t2","name":"live.txt","mimeType":"text/plain","trashed":false}"#;
        let node = serde_json::from_str::<DriveFile>(json)
            .unwrap()
            .into_live_node()
            .unwrap();
        assert_eq!(node.name, "live.txt");
        assert!(FILE_FIELDS.split(',').any(|f| f == "trashed"));
    }

    #[test]
    fn test_multipart_related_body_layout() {
        let meta = json!({"id": "x1", "name": "a.txt"});
        let body = multipart_related_body("b0", &meta, b"payload");
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with("--b0\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{"));
        assert!(text.contains("\"id\":\"x1\""));
        assert!(text.contains("\r\n--b0\r\nContent-Type: application/octet-stream\r\n\r\npayload\r\n--b0--\r\n"));
    }

    #[test]
    fn test_classify_rate_limit_as_transient() {
        let body = r#"{"error":{"code":403,"message":"Rate Limit Exceeded","errors":[{"reason":"userRateLimitExceeded"}]}}"#;
        let err = classify_error(StatusCode::FORBIDDEN, "list", body);
        assert!(err.is_transient());

        let body = r#"{"error":{"code":403,"message":"forbidden","errors":[{"reason":"insufficientPermissions"}]}}"#;
        let err = classify_error(StatusCode::FORBIDDEN, "list", body);
        assert!(matches!(err, DriveError::PermissionDenied(_)));

        let err = classify_error(StatusCode::BAD_GATEWAY, "list", "<html>");
        assert!(err.is_transient());
    }
}
