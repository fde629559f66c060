//! Request handlers.
//!
//! The server hands every decoded request to one [`Handler`] and writes back
//! whatever it returns. Handlers run on worker threads, several at a time, so
//! they must be `Send + Sync`.
//!
//! - **`static_files`**: serves a directory tree
//! - **`router`**: dispatches on method and path pattern
//!
//! Any `Fn(&Request) -> Response` closure is a handler:
//!
//! ```
//! use sluice::handler::Handler;
//! use sluice::http::request::{Method, RequestBuilder};
//! use sluice::http::response::Response;
//!
//! let echo = |req: &sluice::http::request::Request| Response::ok(req.path.clone());
//! let req = RequestBuilder::new().method(Method::GET).path("/ping").build().unwrap();
//! assert_eq!(echo.handle(&req).body, b"/ping");
//! ```

pub mod router;
pub mod static_files;

use crate::http::request::Request;
use crate::http::response::Response;

pub use router::{Params, Router};
pub use static_files::StaticFiles;

pub trait Handler: Send + Sync {
    fn handle(&self, request: &Request) -> Response;
}

impl<F> Handler for F
where
    F: Fn(&Request) -> Response + Send + Sync,
{
    fn handle(&self, request: &Request) -> Response {
        self(request)
    }
}

/// Answers every request with `404 Not Found`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotFound;

impl Handler for NotFound {
    fn handle(&self, _request: &Request) -> Response {
        Response::not_found()
    }
}
