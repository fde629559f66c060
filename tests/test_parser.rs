use sluice::http::parser::{MAX_BODY_LEN, MAX_HEAD_LEN, ParseError, ParseState, Parser, parse_http_request};
use sluice::http::request::{Method, Request, Version};
use sluice::http::response::StatusCode;

fn feed_all(parser: &mut Parser, chunks: &[&[u8]]) -> Vec<Request> {
    let mut out = Vec::new();
    for chunk in chunks {
        parser.feed(chunk).unwrap();
        while let Some(req) = parser.next_request() {
            out.push(req);
        }
    }
    out
}

#[test]
fn test_parse_simple_get_request() {
    let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let (parsed, consumed) = parse_http_request(req).unwrap();

    assert_eq!(parsed.method, Method::GET);
    assert_eq!(parsed.path, "/");
    assert_eq!(parsed.version, Version::Http11);
    assert_eq!(parsed.headers.get("Host").unwrap(), "example.com");
    assert_eq!(consumed, req.len());
}

#[test]
fn test_parse_post_request_with_body() {
    let req = b"POST /api HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
    let (parsed, consumed) = parse_http_request(req).unwrap();

    assert_eq!(parsed.method, Method::POST);
    assert_eq!(parsed.path, "/api");
    assert_eq!(parsed.body, b"hello".to_vec());
    assert_eq!(consumed, req.len());
}

#[test]
fn test_parse_multiple_headers() {
    let req = b"GET /path HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test-client\r\nAccept: */*\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.headers.get("Host").unwrap(), "example.com");
    assert_eq!(parsed.headers.get("User-Agent").unwrap(), "test-client");
    assert_eq!(parsed.headers.get("Accept").unwrap(), "*/*");
}

#[test]
fn test_parse_request_with_path_and_query_string() {
    let req = b"GET /search?q=rust HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.path, "/search");
    assert_eq!(parsed.query.as_deref(), Some("q=rust"));
    assert_eq!(parsed.target(), "/search?q=rust");
}

#[test]
fn test_parse_http10_request() {
    let (parsed, _) = parse_http_request(b"GET / HTTP/1.0\r\n\r\n").unwrap();
    assert_eq!(parsed.version, Version::Http10);
    assert!(!parsed.keep_alive());
}

#[test]
fn test_parse_incomplete_request_missing_blank_line() {
    let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n";
    assert!(matches!(parse_http_request(req), Err(ParseError::Incomplete)));
}

#[test]
fn test_parse_incomplete_request_partial_body() {
    let req = b"POST /api HTTP/1.1\r\nContent-Length: 10\r\n\r\nhello";
    assert!(matches!(parse_http_request(req), Err(ParseError::Incomplete)));
}

#[test]
fn test_parse_invalid_http_method() {
    let req = b"INVALID / HTTP/1.1\r\n\r\n";
    assert!(matches!(parse_http_request(req), Err(ParseError::InvalidMethod)));

    // Methods are case-sensitive.
    let req = b"get / HTTP/1.1\r\n\r\n";
    assert!(matches!(parse_http_request(req), Err(ParseError::InvalidMethod)));
}

#[test]
fn test_parse_malformed_header() {
    let req = b"GET / HTTP/1.1\r\nBrokenHeader\r\n\r\n";
    assert!(matches!(parse_http_request(req), Err(ParseError::InvalidHeader)));
}

#[test]
fn test_parse_unsupported_version() {
    let req = b"GET / HTTP/2.0\r\n\r\n";
    let err = parse_http_request(req).unwrap_err();
    assert_eq!(err, ParseError::UnsupportedVersion);
    assert_eq!(err.status(), StatusCode::HttpVersionNotSupported);
}

#[test]
fn test_parse_malformed_version_is_bad_request() {
    let cases: [&[u8]; 6] = [
        b"GET / HTTP/1.1 junk\r\n\r\n",
        b"GET / HTTP/1.1x\r\n\r\n",
        b"GET / HTTP/1.1\rX\r\n\r\n",
        b"GET / HTTP/11\r\n\r\n",
        b"GET / HTTP/a.b\r\n\r\n",
        b"GET / FTP/1.1\r\n\r\n",
    ];
    for req in cases {
        let err = parse_http_request(req).unwrap_err();
        assert_eq!(err, ParseError::InvalidRequest, "{:?}", String::from_utf8_lossy(req));
        assert_eq!(err.status(), StatusCode::BadRequest);
    }

    // Well-formed but unsupported stays 505.
    let err = parse_http_request(b"GET / HTTP/0.9\r\n\r\n").unwrap_err();
    assert_eq!(err, ParseError::UnsupportedVersion);
}

#[test]
fn test_parse_various_http_methods() {
    let methods = vec![
        ("GET", Method::GET),
        ("POST", Method::POST),
        ("PUT", Method::PUT),
        ("DELETE", Method::DELETE),
        ("HEAD", Method::HEAD),
        ("OPTIONS", Method::OPTIONS),
        ("PATCH", Method::PATCH),
        ("TRACE", Method::TRACE),
        ("CONNECT", Method::CONNECT),
    ];

    for (method_str, expected_method) in methods {
        let req = format!("{} / HTTP/1.1\r\n\r\n", method_str);
        let (parsed, _) = parse_http_request(req.as_bytes()).unwrap();
        assert_eq!(parsed.method, expected_method);
    }
}

#[test]
fn test_parse_request_with_empty_body() {
    let req = b"POST /api HTTP/1.1\r\nContent-Length: 0\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();
    assert!(parsed.body.is_empty());
}

#[test]
fn test_parse_request_with_binary_body() {
    let req = b"POST /upload HTTP/1.1\r\nContent-Length: 4\r\n\r\n\x00\x01\x02\x03";
    let (parsed, _) = parse_http_request(req).unwrap();
    assert_eq!(parsed.body, vec![0, 1, 2, 3]);
}

#[test]
fn test_parse_header_case_preservation() {
    let req = b"GET / HTTP/1.1\r\nContent-Type: application/json\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert!(parsed.headers.contains_key("Content-Type"));
    assert_eq!(parsed.header("content-type"), Some("application/json"));
}

#[test]
fn test_parse_repeated_headers_are_joined() {
    let req = b"GET / HTTP/1.1\r\nAccept: text/html\r\naccept: text/plain\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();
    assert_eq!(parsed.header("Accept"), Some("text/html, text/plain"));
}

#[test]
fn test_parse_content_length_errors() {
    let cases: [&[u8]; 3] = [
        b"POST / HTTP/1.1\r\nContent-Length: abc\r\n\r\n",
        b"POST / HTTP/1.1\r\nContent-Length: -1\r\n\r\n",
        b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\nabcd",
    ];
    for req in cases {
        let err = parse_http_request(req).unwrap_err();
        assert_eq!(err, ParseError::InvalidContentLength);
        assert_eq!(err.status(), StatusCode::BadRequest);
    }

    // Identical duplicates are harmless.
    let req = b"POST / HTTP/1.1\r\nContent-Length: 2\r\nContent-Length: 2\r\n\r\nok";
    let (parsed, _) = parse_http_request(req).unwrap();
    assert_eq!(parsed.body, b"ok");
}

#[test]
fn test_parse_transfer_encoding_is_not_implemented() {
    let req = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";
    let err = parse_http_request(req).unwrap_err();
    assert_eq!(err, ParseError::UnsupportedTransferEncoding);
    assert_eq!(err.status(), StatusCode::NotImplemented);
}

#[test]
fn test_parse_limits() {
    let body_len = MAX_BODY_LEN + 1;
    let req = format!("POST / HTTP/1.1\r\nContent-Length: {body_len}\r\n\r\n");
    let err = parse_http_request(req.as_bytes()).unwrap_err();
    assert_eq!(err, ParseError::BodyTooLarge);
    assert_eq!(err.status(), StatusCode::PayloadTooLarge);

    let long = "a".repeat(MAX_HEAD_LEN);
    let req = format!("GET / HTTP/1.1\r\nX-Long: {long}\r\n\r\n");
    let err = parse_http_request(req.as_bytes()).unwrap_err();
    assert_eq!(err, ParseError::HeadTooLarge);
    assert_eq!(err.status(), StatusCode::RequestHeaderFieldsTooLarge);

    let req = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ / HTTP/1.1\r\n\r\n";
    assert_eq!(parse_http_request(req).unwrap_err(), ParseError::InvalidMethod);
}

#[test]
fn test_parser_is_chunk_invariant() {
    let wire: &[u8] = b"POST /submit?x=1 HTTP/1.1\r\nHost: a\r\nContent-Length: 11\r\n\r\nhello world\
GET /next HTTP/1.1\r\nHost: a\r\n\r\n";

    let mut whole = Parser::new();
    let expected = feed_all(&mut whole, &[wire]);
    assert_eq!(expected.len(), 2);

    for split in 1..wire.len() {
        let (a, b) = wire.split_at(split);
        let mut parser = Parser::new();
        assert_eq!(feed_all(&mut parser, &[a, b]), expected, "split at {split}");
    }

    let bytes: Vec<&[u8]> = wire.chunks(1).collect();
    let mut parser = Parser::new();
    assert_eq!(feed_all(&mut parser, &bytes), expected);
}

#[test]
fn test_parser_pipelined_requests_in_order() {
    let mut parser = Parser::new();
    let completed = parser
        .feed(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\nGET /c HTTP/1.1\r\n\r\n")
        .unwrap();
    assert_eq!(completed, 3);

    let paths: Vec<String> = std::iter::from_fn(|| parser.next_request())
        .map(|r| r.path)
        .collect();
    assert_eq!(paths, ["/a", "/b", "/c"]);
}

#[test]
fn test_parser_skips_blank_lines_between_requests() {
    let mut parser = Parser::new();
    let reqs = feed_all(&mut parser, &[b"\r\n\r\nGET / HTTP/1.1\r\n\r\n\r\nGET /x HTTP/1.1\r\n\r\n".as_slice()]);
    assert_eq!(reqs.len(), 2);
    assert_eq!(reqs[1].path, "/x");
}

#[test]
fn test_parser_error_is_sticky() {
    let mut parser = Parser::new();
    assert_eq!(parser.feed(b"BAD!METHOD\x01 / HTTP/1.1\r\n"), Err(ParseError::InvalidMethod));
    assert_eq!(parser.state(), ParseState::Error);

    assert_eq!(parser.feed(b"GET / HTTP/1.1\r\n\r\n"), Err(ParseError::InvalidMethod));
    assert!(parser.next_request().is_none());
}

#[test]
fn test_parser_keeps_requests_completed_before_error() {
    let mut parser = Parser::new();
    let result = parser.feed(b"GET /ok HTTP/1.1\r\n\r\nNOPE / HTTP/1.1\r\n\r\n");
    assert_eq!(result, Err(ParseError::InvalidMethod));
    assert_eq!(parser.next_request().unwrap().path, "/ok");
    assert!(parser.next_request().is_none());
}

#[test]
fn test_parser_states_progress() {
    let mut parser = Parser::new();
    assert_eq!(parser.state(), ParseState::Method);
    parser.feed(b"GET").unwrap();
    assert_eq!(parser.state(), ParseState::Method);
    parser.feed(b" /x").unwrap();
    assert_eq!(parser.state(), ParseState::Url);
    parser.feed(b" HTTP/1.1").unwrap();
    assert_eq!(parser.state(), ParseState::Version);
    parser.feed(b"\r\nContent-Length: 2").unwrap();
    assert_eq!(parser.state(), ParseState::HeaderValue);
    parser.feed(b"\r\n\r\n").unwrap();
    assert_eq!(parser.state(), ParseState::Body);
    assert_eq!(parser.feed(b"hi").unwrap(), 1);
    assert_eq!(parser.state(), ParseState::Complete);
}

#[test]
fn test_parser_missing_content_length_means_empty_body() {
    // Bytes after the head belong to the next request, not to a body.
    let mut parser = Parser::new();
    let reqs = feed_all(&mut parser, &[b"POST /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n".as_slice()]);
    assert_eq!(reqs.len(), 2);
    assert_eq!(reqs[0].method, Method::POST);
    assert!(reqs[0].body.is_empty());
    assert_eq!(reqs[1].path, "/b");
}
