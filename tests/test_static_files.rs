use std::fs;
use std::path::PathBuf;

use sluice::handler::{Handler, StaticFiles};
use sluice::http::request::{Method, Request, RequestBuilder};
use sluice::http::response::StatusCode;

/// A fresh directory tree under the system temp dir, removed on drop.
struct Site {
    root: PathBuf,
}

impl Site {
    fn new(name: &str) -> Self {
        let root = std::env::temp_dir().join(format!("sluice-static-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::write(root.join("index.html"), "<h1>home</h1>").unwrap();
        fs::write(root.join("style.css"), "body { margin: 0 }").unwrap();
        fs::write(root.join("hello world.txt"), "spaced").unwrap();
        fs::write(root.join("sub").join("data.json"), "{\"ok\":true}").unwrap();
        fs::write(root.join("docs").join("index.html"), "<p>docs</p>").unwrap();
        Self { root }
    }

    fn files(&self) -> StaticFiles {
        StaticFiles::new(&self.root).unwrap()
    }
}

impl Drop for Site {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn req(method: Method, target: &str) -> Request {
    RequestBuilder::new().method(method).path(target).build().unwrap()
}

#[test]
fn test_static_serves_file_with_headers() {
    let site = Site::new("serve");
    let res = site.files().handle(&req(Method::GET, "/style.css"));

    assert_eq!(res.status, StatusCode::Ok);
    assert_eq!(res.body, b"body { margin: 0 }");
    assert_eq!(res.header("Content-Type"), Some("text/css"));
    assert_eq!(res.header("Content-Length"), Some("18"));
    assert_eq!(res.header("Cache-Control"), Some("public, max-age=3600"));
}

#[test]
fn test_static_directory_serves_index() {
    let site = Site::new("index");
    let files = site.files();

    let res = files.handle(&req(Method::GET, "/"));
    assert_eq!(res.status, StatusCode::Ok);
    assert_eq!(res.body, b"<h1>home</h1>");
    assert_eq!(res.header("Content-Type"), Some("text/html"));

    let res = files.handle(&req(Method::GET, "/docs/"));
    assert_eq!(res.body, b"<p>docs</p>");

    // A directory without an index is not listed.
    assert_eq!(files.handle(&req(Method::GET, "/sub")).status, StatusCode::NotFound);
}

#[test]
fn test_static_query_and_percent_encoding() {
    let site = Site::new("encoding");
    let files = site.files();

    let res = files.handle(&req(Method::GET, "/hello%20world.txt?v=3"));
    assert_eq!(res.status, StatusCode::Ok);
    assert_eq!(res.body, b"spaced");
    assert_eq!(res.header("Content-Type"), Some("text/plain"));

    let res = files.handle(&req(Method::GET, "/./sub//data.json"));
    assert_eq!(res.status, StatusCode::Ok);
    assert_eq!(res.header("Content-Type"), Some("application/json"));
}

#[test]
fn test_static_missing_file_is_404() {
    let site = Site::new("missing");
    let files = site.files();
    let res = files.handle(&req(Method::GET, "/nope.html"));
    assert_eq!(res.status, StatusCode::NotFound);
    assert_eq!(res.body, b"404 Not Found");

    // A file used as a directory names nothing either.
    for target in ["/style.css/x", "/sub/data.json/deeper/file"] {
        assert_eq!(files.handle(&req(Method::GET, target)).status, StatusCode::NotFound, "{target}");
    }
}

#[test]
fn test_static_refuses_traversal() {
    let site = Site::new("traversal");
    let files = site.files();

    for target in [
        "/../etc/passwd",
        "/sub/../../etc/passwd",
        "/%2e%2e/etc/passwd",
        "/sub/..%2f..%2fetc%2fpasswd",
        "/sub%5c..%5c..%5cx",
    ] {
        let res = files.handle(&req(Method::GET, target));
        assert_eq!(res.status, StatusCode::Forbidden, "{target}");
    }
}

#[cfg(unix)]
#[test]
fn test_static_refuses_symlink_out_of_root() {
    let site = Site::new("symlink");
    let outside = std::env::temp_dir().join(format!("sluice-outside-{}.txt", std::process::id()));
    fs::write(&outside, "secret").unwrap();
    std::os::unix::fs::symlink(&outside, site.root.join("leak.txt")).unwrap();

    let res = site.files().handle(&req(Method::GET, "/leak.txt"));
    assert_eq!(res.status, StatusCode::Forbidden);

    fs::remove_file(&outside).unwrap();
}

#[test]
fn test_static_head_has_length_but_no_body() {
    let site = Site::new("head");
    let res = site.files().handle(&req(Method::HEAD, "/index.html"));

    assert_eq!(res.status, StatusCode::Ok);
    assert!(res.body.is_empty());
    assert_eq!(res.header("Content-Length"), Some("13"));
}

#[test]
fn test_static_rejects_other_methods() {
    let site = Site::new("methods");
    let files = site.files();

    for method in [Method::POST, Method::PUT, Method::DELETE] {
        let res = files.handle(&req(method, "/index.html"));
        assert_eq!(res.status, StatusCode::MethodNotAllowed);
        assert_eq!(res.header("Allow"), Some("GET, HEAD"));
    }
}

#[test]
fn test_static_root_must_exist() {
    assert!(StaticFiles::new("/definitely/not/here").is_err());
}
