use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use drive_lib::{DriveError, DriveNode, DrivePath};
use drive_meta::{LockDepth, LockInfo, LockRequest, LockScope, WriteMode, LOCK_TOKEN_PREFIX};
use futures::StreamExt;
use log::{debug, info, warn};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt::Write as _;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use xmlparser::{ElementEnd, Token, Tokenizer};

use crate::dav_daemon::DavState;

const ALLOWED_METHODS: &str = "OPTIONS, GET, HEAD, PUT, DELETE, MKCOL, MOVE, PROPFIND, LOCK, UNLOCK";
const MAX_LOCK_BODY: usize = 64 * 1024;

/// Characters escaped inside one href path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// A request failure carrying the status it is answered with.
#[derive(Debug)]
pub struct DavError {
    pub status: StatusCode,
    pub message: String,
}

impl DavError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<DriveError> for DavError {
    fn from(err: DriveError) -> Self {
        Self::new(map_drive_err(&err), err.to_string())
    }
}

impl IntoResponse for DavError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

type DavResult<T> = Result<T, DavError>;

/// One protocol status per error kind. Handlers refine a few by method.
pub fn map_drive_err(err: &DriveError) -> StatusCode {
    match err {
        DriveError::NotFound(_) => StatusCode::NOT_FOUND,
        DriveError::AlreadyExists(_) => StatusCode::PRECONDITION_FAILED,
        DriveError::NotADirectory(_) => StatusCode::CONFLICT,
        DriveError::IsADirectory(_) => StatusCode::METHOD_NOT_ALLOWED,
        DriveError::DirectoryNotEmpty(_) => StatusCode::CONFLICT,
        DriveError::Conflict(_) => StatusCode::LOCKED,
        DriveError::Expired(_) => StatusCode::PRECONDITION_FAILED,
        DriveError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        DriveError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        DriveError::InvalidParam(_) => StatusCode::BAD_REQUEST,
        DriveError::Permanent(_) => StatusCode::BAD_GATEWAY,
        DriveError::Cancelled(_) => StatusCode::BAD_REQUEST,
        DriveError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// A missing parent collection is 409 for methods that create a resource.
fn parent_missing_is_conflict(err: DriveError) -> DavError {
    if err.is_not_found() {
        DavError::new(StatusCode::CONFLICT, err.to_string())
    } else {
        err.into()
    }
}

/// Entry point for every request not routed elsewhere.
pub async fn handle_dav(State(state): State<Arc<DavState>>, req: Request) -> Response {
    let method = req.method().clone();
    let uri = req.uri().path().to_string();
    match dispatch(&state, req).await {
        Ok(resp) => {
            debug!("{} {} -> {}", method, uri, resp.status());
            resp
        }
        Err(err) => {
            if err.status.is_server_error() {
                warn!("{} {} -> {}: {}", method, uri, err.status, err.message);
            } else {
                debug!("{} {} -> {}: {}", method, uri, err.status, err.message);
            }
            err.into_response()
        }
    }
}

async fn dispatch(state: &DavState, req: Request) -> DavResult<Response> {
    let path = request_path(req.uri().path())?;
    match req.method().as_str() {
        "OPTIONS" => Ok(handle_options()),
        "GET" => handle_get(state, &path, req.headers(), false).await,
        "HEAD" => handle_get(state, &path, req.headers(), true).await,
        "PUT" => handle_put(state, &path, req).await,
        "MKCOL" => handle_mkcol(state, &path, req.headers()).await,
        "DELETE" => handle_delete(state, &path, req.headers()).await,
        "MOVE" => handle_move(state, &path, req.headers()).await,
        "PROPFIND" => handle_propfind(state, &path, req.headers()).await,
        "LOCK" => handle_lock(state, &path, req).await,
        "UNLOCK" => handle_unlock(state, &path, req.headers()),
        other => Err(DavError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("method {} not supported", other),
        )),
    }
}

// ========== Methods ==========

fn handle_options() -> Response {
    let mut resp = StatusCode::OK.into_response();
    let headers = resp.headers_mut();
    headers.insert("DAV", HeaderValue::from_static("1, 2"));
    headers.insert(header::ALLOW, HeaderValue::from_static(ALLOWED_METHODS));
    headers.insert("MS-Author-Via", HeaderValue::from_static("DAV"));
    resp
}

async fn handle_get(
    state: &DavState,
    path: &DrivePath,
    headers: &HeaderMap,
    head_only: bool,
) -> DavResult<Response> {
    let node = state.fs.stat(path).await?;
    if node.is_dir() {
        if head_only {
            return Ok(StatusCode::OK.into_response());
        }
        return Err(DavError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("{} is a collection", path),
        ));
    }

    let range = match header_str(headers, header::RANGE.as_str()) {
        Some(value) => match parse_range(value, node.size) {
            Some(range) => Some(range),
            None => {
                let mut resp = (StatusCode::RANGE_NOT_SATISFIABLE, "").into_response();
                if let Ok(v) = HeaderValue::from_str(&format!("bytes */{}", node.size)) {
                    resp.headers_mut().insert(header::CONTENT_RANGE, v);
                }
                return Ok(resp);
            }
        },
        None => None,
    };

    let status = if range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let length = match &range {
        Some(r) => r.end - r.start,
        None => node.size,
    };

    let body = if head_only {
        Body::empty()
    } else {
        let reader = state.fs.open_for_read(path, range.clone()).await?;
        Body::from_stream(ReaderStream::new(reader))
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, length)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ETAG, etag(&node));
    if let Some(modified) = http_date(node.modified_at) {
        builder = builder.header(header::LAST_MODIFIED, modified);
    }
    if let Some(r) = &range {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", r.start, r.end - 1, node.size),
        );
    }
    builder
        .body(body)
        .map_err(|e| DavError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn handle_put(state: &DavState, path: &DrivePath, req: Request) -> DavResult<Response> {
    let tokens = submitted_tokens(req.headers());
    state.locks.confirm_write(path, &tokens, false)?;

    let exclusive = header_str(req.headers(), header::IF_NONE_MATCH.as_str()) == Some("*");
    let mode = if exclusive {
        WriteMode::CreateExclusive
    } else {
        WriteMode::CreateOrTruncate
    };
    let mut writer = state
        .fs
        .open_for_write(path, mode)
        .await
        .map_err(parent_missing_is_conflict)?;
    let mut body = req.into_body().into_data_stream();
    while let Some(chunk) = body.next().await {
        // On error the writer is dropped here and nothing is committed.
        let chunk = chunk.map_err(|e| DriveError::Cancelled(format!("request body: {}", e)))?;
        writer.write_chunk(&chunk)?;
    }
    let committed = writer.close().await?;
    info!("PUT {} committed {} bytes", path, committed.node.size);

    let status = if committed.created {
        StatusCode::CREATED
    } else {
        StatusCode::NO_CONTENT
    };
    Ok((status, [(header::ETAG, etag(&committed.node))]).into_response())
}

async fn handle_mkcol(state: &DavState, path: &DrivePath, headers: &HeaderMap) -> DavResult<Response> {
    let tokens = submitted_tokens(headers);
    state.locks.confirm_write(path, &tokens, false)?;
    match state.fs.mkdir(path).await {
        Ok(_) => Ok(StatusCode::CREATED.into_response()),
        Err(DriveError::AlreadyExists(msg)) => Err(DavError::new(StatusCode::METHOD_NOT_ALLOWED, msg)),
        Err(err) => Err(parent_missing_is_conflict(err)),
    }
}

async fn handle_delete(state: &DavState, path: &DrivePath, headers: &HeaderMap) -> DavResult<Response> {
    let tokens = submitted_tokens(headers);
    state.locks.confirm_write(path, &tokens, true)?;
    state.fs.remove(path).await?;
    let dropped = state.locks.remove_locks_under(path);
    if dropped > 0 {
        debug!("DELETE {} dropped {} locks", path, dropped);
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn handle_move(state: &DavState, path: &DrivePath, headers: &HeaderMap) -> DavResult<Response> {
    let destination = header_str(headers, "Destination")
        .ok_or_else(|| DavError::new(StatusCode::BAD_REQUEST, "missing Destination header"))?;
    let dest = destination_path(destination)?;
    let overwrite = !matches!(header_str(headers, "Overwrite"), Some("F") | Some("f"));

    let tokens = submitted_tokens(headers);
    state.locks.confirm_write(path, &tokens, true)?;
    state.locks.confirm_write(&dest, &tokens, true)?;

    // Everything the rename needs is checked before the destination is
    // touched. With the source present, NotFound means a missing parent.
    state.fs.stat(path).await?;
    state
        .fs
        .check_rename(path, &dest)
        .await
        .map_err(parent_missing_is_conflict)?;

    let mut replaced = false;
    if overwrite && *path != dest {
        match state.fs.stat(&dest).await {
            Ok(_) => {
                state.fs.remove(&dest).await?;
                state.locks.remove_locks_under(&dest);
                replaced = true;
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
    }

    state
        .fs
        .rename(path, &dest)
        .await
        .map_err(parent_missing_is_conflict)?;
    state.locks.move_locks(path, &dest);

    let status = if replaced {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::CREATED
    };
    Ok(status.into_response())
}

async fn handle_propfind(
    state: &DavState,
    path: &DrivePath,
    headers: &HeaderMap,
) -> DavResult<Response> {
    let depth_one = header_str(headers, "Depth") != Some("0");
    let node = state.fs.stat(path).await?;

    let mut entries = vec![(path.clone(), node.clone())];
    if node.is_dir() && depth_one {
        for child in state.fs.list_children(path).await? {
            entries.push((path.join(&child.name), child));
        }
    }

    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<D:multistatus xmlns:D=\"DAV:\">");
    for (entry_path, entry) in &entries {
        let locks = state.locks.locks_covering(entry_path);
        write_response(&mut xml, entry_path, entry, &locks);
    }
    xml.push_str("</D:multistatus>");

    Ok((
        StatusCode::MULTI_STATUS,
        [(header::CONTENT_TYPE, "application/xml; charset=utf-8")],
        xml,
    )
        .into_response())
}

async fn handle_lock(state: &DavState, path: &DrivePath, req: Request) -> DavResult<Response> {
    let timeout = header_str(req.headers(), "Timeout").and_then(parse_timeout);
    let depth = match header_str(req.headers(), "Depth") {
        Some("0") => LockDepth::Zero,
        _ => LockDepth::Infinity,
    };
    let tokens = submitted_tokens(req.headers());
    let body = axum::body::to_bytes(req.into_body(), MAX_LOCK_BODY)
        .await
        .map_err(|e| DavError::new(StatusCode::BAD_REQUEST, format!("lock body: {}", e)))?;
    let body = String::from_utf8_lossy(&body);

    let Some(request) = parse_lock_body(&body, depth)? else {
        // No body: refresh the lock named in the If header.
        let token = tokens
            .first()
            .ok_or_else(|| DavError::new(StatusCode::BAD_REQUEST, "lock refresh without token"))?;
        let lock = state.locks.refresh_lock_on(path, token, timeout)?;
        return Ok(lock_response(StatusCode::OK, &lock));
    };

    let lock = state.locks.create_lock(path, request, timeout)?;
    let created = match state.fs.stat(path).await {
        Ok(_) => false,
        Err(err) if err.is_not_found() => {
            // Locking an unmapped path reserves it with an empty file.
            let result = match state.fs.open_for_write(path, WriteMode::CreateExclusive).await {
                Ok(writer) => writer.close().await.map(|_| ()),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                let _ = state.locks.release_lock(&lock.token);
                return Err(parent_missing_is_conflict(err));
            }
            true
        }
        Err(err) => {
            let _ = state.locks.release_lock(&lock.token);
            return Err(err.into());
        }
    };

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let mut resp = lock_response(status, &lock);
    if let Ok(v) = HeaderValue::from_str(&format!("<{}>", lock.token)) {
        resp.headers_mut().insert("Lock-Token", v);
    }
    Ok(resp)
}

fn handle_unlock(state: &DavState, path: &DrivePath, headers: &HeaderMap) -> DavResult<Response> {
    let token = header_str(headers, "Lock-Token")
        .map(|v| v.trim().trim_start_matches('<').trim_end_matches('>').to_string())
        .ok_or_else(|| DavError::new(StatusCode::BAD_REQUEST, "missing Lock-Token header"))?;
    let confirmed = state
        .locks
        .confirm_lock(path, &token)
        .and_then(|_| state.locks.release_lock(&token));
    match confirmed {
        Ok(()) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(err @ DriveError::NotFound(_)) | Err(err @ DriveError::Conflict(_)) => {
            Err(DavError::new(StatusCode::CONFLICT, err.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

// ========== Header and body parsing ==========

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// Decode a request URI path into a normalized drive path.
pub fn request_path(raw: &str) -> DavResult<DrivePath> {
    let decoded = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|e| DavError::new(StatusCode::BAD_REQUEST, format!("bad path encoding: {}", e)))?;
    Ok(DrivePath::parse(&decoded)?)
}

/// Destination headers carry an absolute URI or an absolute path.
pub fn destination_path(value: &str) -> DavResult<DrivePath> {
    let without_authority = match value.find("://") {
        Some(idx) => {
            let rest = &value[idx + 3..];
            rest.find('/').map(|slash| &rest[slash..]).unwrap_or("/")
        }
        None => value,
    };
    let without_query = without_authority
        .split(['?', '#'])
        .next()
        .unwrap_or(without_authority);
    request_path(without_query)
}

/// Lock tokens named in `If` and `Lock-Token` headers.
pub fn submitted_tokens(headers: &HeaderMap) -> Vec<String> {
    let mut tokens = Vec::new();
    for name in ["If", "Lock-Token"] {
        for value in headers.get_all(name) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            let mut rest = value;
            while let Some(start) = rest.find('<') {
                let Some(len) = rest[start + 1..].find('>') else {
                    break;
                };
                let candidate = &rest[start + 1..start + 1 + len];
                if candidate.starts_with(LOCK_TOKEN_PREFIX) && !tokens.iter().any(|t| t == candidate) {
                    tokens.push(candidate.to_string());
                }
                rest = &rest[start + 1 + len + 1..];
            }
        }
    }
    tokens
}

/// `bytes=a-b`, `bytes=a-` or `bytes=-n` against a file of `size` bytes.
/// `None` means the range cannot be satisfied.
pub fn parse_range(value: &str, size: u64) -> Option<Range<u64>> {
    let first = value.strip_prefix("bytes=")?.split(',').next()?.trim();
    let (start, end) = first.split_once('-')?;
    let (start, end) = match (start.trim(), end.trim()) {
        ("", suffix) => {
            let n: u64 = suffix.parse().ok()?;
            if n == 0 {
                return None;
            }
            (size.saturating_sub(n), size)
        }
        (start, "") => (start.parse().ok()?, size),
        (start, end) => {
            let end: u64 = end.parse().ok()?;
            (start.parse().ok()?, end.saturating_add(1).min(size))
        }
    };
    if start >= size || start >= end {
        return None;
    }
    Some(start..end)
}

/// `Second-N` or `Infinite`; the first understood value wins.
pub fn parse_timeout(value: &str) -> Option<Duration> {
    value.split(',').map(str::trim).find_map(|v| {
        if v.eq_ignore_ascii_case("infinite") {
            Some(Duration::MAX)
        } else {
            v.strip_prefix("Second-")
                .and_then(|n| n.parse::<u64>().ok())
                .map(Duration::from_secs)
        }
    })
}

/// `None` for an empty body (a refresh); otherwise the requested scope and owner.
pub fn parse_lock_body(body: &str, depth: LockDepth) -> DavResult<Option<LockRequest>> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    let mut stack: Vec<String> = Vec::new();
    let mut scope = LockScope::Exclusive;
    let mut owner = String::new();
    for token in Tokenizer::from(body) {
        let token = token
            .map_err(|e| DavError::new(StatusCode::BAD_REQUEST, format!("lock body: {}", e)))?;
        match token {
            Token::ElementStart { local, .. } => {
                let local = local.as_str();
                if local == "shared" && stack.last().map(String::as_str) == Some("lockscope") {
                    scope = LockScope::Shared;
                }
                stack.push(local.to_string());
            }
            Token::ElementEnd { end, .. } => {
                if !matches!(end, ElementEnd::Open) {
                    stack.pop();
                }
            }
            Token::Text { text } | Token::Cdata { text, .. } => {
                if stack.iter().any(|s| s == "owner") {
                    owner.push_str(text.as_str().trim());
                }
            }
            _ => {}
        }
    }
    Ok(Some(LockRequest {
        depth,
        scope,
        owner: (!owner.is_empty()).then_some(owner),
    }))
}

// ========== Responses ==========

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Percent-encoded href; collections end with `/`.
pub fn href_for(path: &DrivePath, is_dir: bool) -> String {
    let mut href = String::new();
    for segment in path.components() {
        href.push('/');
        href.extend(utf8_percent_encode(segment, SEGMENT));
    }
    if href.is_empty() || is_dir {
        href.push('/');
    }
    href
}

fn http_date(unix_ms: u64) -> Option<String> {
    let ts = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(unix_ms as i64)?;
    Some(ts.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}

fn etag(node: &DriveNode) -> String {
    match &node.revision {
        Some(rev) => format!("\"{}\"", rev),
        None => format!("\"{}-{}\"", node.id, node.modified_at),
    }
}

fn write_response(xml: &mut String, path: &DrivePath, node: &DriveNode, locks: &[LockInfo]) {
    let name = if path.is_root() {
        ""
    } else {
        node.name.as_str()
    };
    let _ = write!(
        xml,
        "<D:response><D:href>{}</D:href><D:propstat><D:prop><D:displayname>{}</D:displayname>",
        xml_escape(&href_for(path, node.is_dir())),
        xml_escape(name)
    );
    if node.is_dir() {
        xml.push_str("<D:resourcetype><D:collection/></D:resourcetype>");
    } else {
        let _ = write!(
            xml,
            "<D:resourcetype/><D:getcontentlength>{}</D:getcontentlength>\
             <D:getcontenttype>application/octet-stream</D:getcontenttype>",
            node.size
        );
    }
    if let Some(modified) = http_date(node.modified_at) {
        let _ = write!(xml, "<D:getlastmodified>{}</D:getlastmodified>", modified);
    }
    let _ = write!(xml, "<D:getetag>{}</D:getetag>", xml_escape(&etag(node)));
    xml.push_str(
        "<D:supportedlock>\
         <D:lockentry><D:lockscope><D:exclusive/></D:lockscope><D:locktype><D:write/></D:locktype></D:lockentry>\
         <D:lockentry><D:lockscope><D:shared/></D:lockscope><D:locktype><D:write/></D:locktype></D:lockentry>\
         </D:supportedlock><D:lockdiscovery>",
    );
    for lock in locks {
        write_active_lock(xml, lock);
    }
    xml.push_str(
        "</D:lockdiscovery></D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat></D:response>",
    );
}

fn write_active_lock(xml: &mut String, lock: &LockInfo) {
    let scope = match lock.scope {
        LockScope::Exclusive => "<D:exclusive/>",
        LockScope::Shared => "<D:shared/>",
    };
    let depth = match lock.depth {
        LockDepth::Zero => "0",
        LockDepth::Infinity => "infinity",
    };
    let _ = write!(
        xml,
        "<D:activelock><D:locktype><D:write/></D:locktype><D:lockscope>{}</D:lockscope>\
         <D:depth>{}</D:depth>",
        scope, depth
    );
    if let Some(owner) = &lock.owner {
        let _ = write!(xml, "<D:owner>{}</D:owner>", xml_escape(owner));
    }
    let _ = write!(
        xml,
        "<D:timeout>Second-{}</D:timeout><D:locktoken><D:href>{}</D:href></D:locktoken>\
         <D:lockroot><D:href>{}</D:href></D:lockroot></D:activelock>",
        lock.remaining().as_secs(),
        xml_escape(&lock.token),
        xml_escape(&href_for(&lock.path, false))
    );
}

fn lock_response(status: StatusCode, lock: &LockInfo) -> Response {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<D:prop xmlns:D=\"DAV:\"><D:lockdiscovery>",
    );
    write_active_lock(&mut xml, lock);
    xml.push_str("</D:lockdiscovery></D:prop>");
    (
        status,
        [(header::CONTENT_TYPE, "application/xml; charset=utf-8")],
        xml,
    )
        .into_response()
}
