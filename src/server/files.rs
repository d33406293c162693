//! Static file responses.
//!
//! Files are served by `tower-http`'s [`ServeDir`], which handles ranges,
//! conditional requests, `Last-Modified`, content types, HEAD and
//! `index.html`. Directories without an index fall through to a generated
//! listing.

use std::convert::Infallible;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::header::{self, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Bytes;
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use tower::{Service, ServiceBuilder, ServiceExt};
use tower_http::services::ServeDir;
use tower_http::services::fs::ServeFileSystemResponseBody;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::warn;

/// Body of every static-file response.
pub type FileBody = ServeFileSystemResponseBody;

const CROSS_ORIGIN_OPENER_POLICY: HeaderName = HeaderName::from_static("cross-origin-opener-policy");
const CROSS_ORIGIN_EMBEDDER_POLICY: HeaderName =
    HeaderName::from_static("cross-origin-embedder-policy");

/// Characters escaped in directory-listing links.
const LINK_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Why a request path cannot be mapped onto the served directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathError {
    /// Percent-decoding produced invalid UTF-8.
    BadEncoding,
    /// A segment would leave the served root.
    Traversal,
}

/// Maps a URI path onto a path below `root`.
///
/// Every decoded segment must be a single plain file name on the host
/// platform, so `..`, drive prefixes and embedded separators are rejected.
pub fn resolve_path(root: &Path, uri_path: &str) -> Result<PathBuf, PathError> {
    let decoded = percent_decode_str(uri_path)
        .decode_utf8()
        .map_err(|_| PathError::BadEncoding)?;

    let mut path = root.to_path_buf();
    for segment in decoded.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        if segment.contains('\0') {
            return Err(PathError::Traversal);
        }
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) => path.push(name),
            _ => return Err(PathError::Traversal),
        }
    }
    Ok(path)
}

/// Serves files below a root directory.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    serve_dir: ServeDir<DirectoryListing>,
    cross_origin_isolation: bool,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>, cross_origin_isolation: bool) -> Self {
        let root = root.into();
        let serve_dir = ServeDir::new(&root)
            .append_index_html_on_directories(true)
            .fallback(DirectoryListing {
                root: Arc::new(root),
            });
        Self {
            serve_dir,
            cross_origin_isolation,
        }
    }

    /// Builds the response for a request. Never fails; errors become status codes.
    pub async fn respond<B>(&self, request: Request<B>) -> Response<FileBody>
    where
        B: Send + 'static,
    {
        let isolation = |value: &'static str| {
            self.cross_origin_isolation
                .then(|| HeaderValue::from_static(value))
        };
        let service = ServiceBuilder::new()
            .layer(SetResponseHeaderLayer::overriding(
                CROSS_ORIGIN_OPENER_POLICY,
                isolation("same-origin"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                CROSS_ORIGIN_EMBEDDER_POLICY,
                isolation("require-corp"),
            ))
            .service(self.serve_dir.clone());

        match service.oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

/// Fallback for paths [`ServeDir`] has no file for: lists directories that
/// lack an `index.html`, 404 for everything else.
#[derive(Debug, Clone)]
pub struct DirectoryListing {
    root: Arc<PathBuf>,
}

impl<B> Service<Request<B>> for DirectoryListing {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let root = Arc::clone(&self.root);
        let method = request.method().clone();
        let uri_path = request.uri().path().to_string();
        Box::pin(async move { Ok(list_directory(&root, &method, &uri_path).await) })
    }
}

async fn list_directory(root: &Path, method: &Method, uri_path: &str) -> Response<Full<Bytes>> {
    let dir = match resolve_path(root, uri_path) {
        Ok(dir) => dir,
        Err(PathError::BadEncoding) => return text_response(StatusCode::BAD_REQUEST),
        Err(PathError::Traversal) => return text_response(StatusCode::NOT_FOUND),
    };
    let is_dir = tokio::fs::metadata(&dir)
        .await
        .is_ok_and(|metadata| metadata.is_dir());
    if !is_dir || !uri_path.ends_with('/') {
        return text_response(StatusCode::NOT_FOUND);
    }

    let names = match read_names(&dir).await {
        Ok(names) => names,
        Err(e) => {
            warn!("failed to list {}: {}", dir.display(), e);
            return text_response(StatusCode::FORBIDDEN);
        }
    };

    let title = format!(
        "Directory listing for {}",
        escape_html(&percent_decode_str(uri_path).decode_utf8_lossy())
    );
    let mut html = format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n</head>\n<body>\n<h1>{title}</h1>\n<hr>\n<ul>\n"
    );
    for name in &names {
        html.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>\n",
            utf8_percent_encode(name, LINK_SEGMENT),
            escape_html(name)
        ));
    }
    html.push_str("</ul>\n<hr>\n</body>\n</html>\n");

    let length = html.len();
    let body = if method == Method::HEAD {
        Full::default()
    } else {
        Full::new(Bytes::from(html))
    };
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    response
}

/// Entry names sorted case-insensitively, directories with a trailing `/`.
async fn read_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            name.push('/');
        }
        names.push(name);
    }
    names.sort_by_key(|name| name.to_lowercase());
    Ok(names)
}

fn text_response(status: StatusCode) -> Response<Full<Bytes>> {
    let reason = status.canonical_reason().unwrap_or("Error");
    let mut response = Response::new(Full::new(Bytes::from(format!(
        "{} {}\n",
        status.as_u16(),
        reason
    ))));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn escape_html(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
