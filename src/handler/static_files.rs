use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::handler::Handler;
use crate::http::mime;
use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};

const CACHE_CONTROL: &str = "public, max-age=3600";
const INDEX_FILE: &str = "index.html";

/// Serves files below a root directory.
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    /// The root must exist; it is stored canonicalised.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().canonicalize()?;
        if !root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            ));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a request path to a file under the root.
    ///
    /// Segments are percent-decoded one by one; `.` and empty segments are
    /// dropped, `..` or a decoded separator is refused with 403. The result is
    /// canonicalised so symlinks pointing outside the root are refused too.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, StatusCode> {
        let mut candidate = self.root.clone();
        for raw in path.split('/') {
            let segment = urlencoding::decode(raw).map_err(|_| StatusCode::BadRequest)?;
            match &*segment {
                "" | "." => continue,
                ".." => return Err(StatusCode::Forbidden),
                s if s.contains(['/', '\\', '\0']) => return Err(StatusCode::Forbidden),
                s => candidate.push(s),
            }
        }

        let mut resolved = match candidate.canonicalize() {
            Ok(p) => p,
            Err(e) if is_missing(&e) => return Err(StatusCode::NotFound),
            Err(_) => return Err(StatusCode::Forbidden),
        };
        if !resolved.starts_with(&self.root) {
            return Err(StatusCode::Forbidden);
        }

        if resolved.is_dir() {
            resolved.push(INDEX_FILE);
            if !resolved.is_file() {
                return Err(StatusCode::NotFound);
            }
        }
        Ok(resolved)
    }

    fn serve(&self, request: &Request) -> Response {
        let file = match self.resolve(&request.path) {
            Ok(file) => file,
            Err(status) => {
                if status == StatusCode::Forbidden {
                    warn!(path = %request.path, "Refused path outside the static root");
                }
                return Response::error(status);
            }
        };

        let head = request.method == Method::HEAD;
        let (length, body) = if head {
            match fs::metadata(&file) {
                Ok(meta) => (meta.len(), Vec::new()),
                Err(e) => return read_failure(&file, e),
            }
        } else {
            match fs::read(&file) {
                Ok(bytes) => (bytes.len() as u64, bytes),
                Err(e) => return read_failure(&file, e),
            }
        };

        debug!(file = %file.display(), bytes = length, "Serving static file");

        ResponseBuilder::new(StatusCode::Ok)
            .header("Content-Type", mime::from_path(&file))
            .header("Content-Length", length.to_string())
            .header("Cache-Control", CACHE_CONTROL)
            .body(body)
            .build()
    }
}

/// `/file.txt/x` fails with `NotADirectory`; it names nothing, like a missing file.
fn is_missing(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory)
}

fn read_failure(file: &Path, e: io::Error) -> Response {
    match e.kind() {
        _ if is_missing(&e) => Response::not_found(),
        io::ErrorKind::PermissionDenied => Response::forbidden(),
        _ => {
            warn!(file = %file.display(), error = %e, "Failed to read static file");
            Response::internal_error()
        }
    }
}

impl Handler for StaticFiles {
    fn handle(&self, request: &Request) -> Response {
        match request.method {
            Method::GET | Method::HEAD => self.serve(request),
            _ => {
                let mut response = Response::method_not_allowed();
                response.set_header("Allow", "GET, HEAD");
                response
            }
        }
    }
}
