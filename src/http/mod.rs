//! HTTP protocol codec.
//!
//! This module turns a connection's inbound byte stream into [`request::Request`]
//! values and turns [`response::Response`] values back into wire bytes.
//!
//! # Architecture
//!
//! - **`parser`**: Incremental, chunk-invariant request decoder (one per connection)
//! - **`request`**: HTTP request representation and parsing utilities
//! - **`response`**: HTTP response representation with builder pattern
//! - **`writer`**: Serializes responses into HTTP/1.1 wire format
//! - **`mime`**: MIME type detection based on file extensions
//!
//! # Example
//!
//! ```
//! use sluice::http::parser::Parser;
//! use sluice::http::response::Response;
//! use sluice::http::writer::encode_response;
//!
//! let mut parser = Parser::new();
//! parser.feed(b"GET /hel").unwrap();
//! parser.feed(b"lo HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
//!
//! let request = parser.next_request().unwrap();
//! assert_eq!(request.path, "/hello");
//!
//! let wire = encode_response(&Response::ok("hi"));
//! assert!(wire.starts_with(b"HTTP/1.1 200 OK\r\n"));
//! ```

pub mod mime;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
