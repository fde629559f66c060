use bytes::{BufMut, Bytes, BytesMut};

use crate::http::response::Response;

const HTTP_VERSION: &str = "HTTP/1.1";

/// Serializes a response into its wire form.
///
/// Headers are emitted in name order so the output is deterministic. A
/// `Content-Length` header is added from the body when the response has none;
/// an explicit one is trusted as-is (HEAD responses rely on that). 1xx and 204
/// responses are written without `Content-Length` and without a body.
pub fn encode_response(resp: &Response) -> Bytes {
    let bodyless = resp.status.forbids_body();
    let mut headers: Vec<(&String, &String)> = resp
        .headers
        .iter()
        .filter(|(k, _)| !(bodyless && k.eq_ignore_ascii_case("Content-Length")))
        .collect();
    headers.sort_by(|a, b| a.0.cmp(b.0));

    let head_len = headers
        .iter()
        .map(|(k, v)| k.len() + v.len() + 4)
        .sum::<usize>()
        + 64;
    let body: &[u8] = if bodyless { &[] } else { &resp.body };
    let mut buf = BytesMut::with_capacity(head_len + body.len());

    // Status line
    buf.put_slice(HTTP_VERSION.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(resp.status.as_u16().to_string().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(resp.status.reason_phrase().as_bytes());
    buf.put_slice(b"\r\n");

    if !bodyless && resp.header("Content-Length").is_none() {
        buf.put_slice(b"Content-Length: ");
        buf.put_slice(body.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");
    }

    for (k, v) in headers {
        buf.put_slice(k.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(v.as_bytes());
        buf.put_slice(b"\r\n");
    }

    // Header/body separator
    buf.put_slice(b"\r\n");

    buf.put_slice(body);

    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::{ResponseBuilder, StatusCode};

    #[test]
    fn encodes_status_line_headers_and_body() {
        let resp = ResponseBuilder::new(StatusCode::Ok)
            .header("Content-Type", "text/plain")
            .body(b"hi".to_vec())
            .build();

        let wire = encode_response(&resp);
        assert_eq!(
            &wire[..],
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nContent-Type: text/plain\r\n\r\nhi"
        );
    }

    #[test]
    fn adds_missing_content_length() {
        let resp = Response {
            status: StatusCode::Ok,
            headers: Default::default(),
            body: b"abc".to_vec(),
        };

        let wire = encode_response(&resp);
        assert_eq!(&wire[..], b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc");
    }

    #[test]
    fn no_content_has_no_length_or_body() {
        let built = ResponseBuilder::new(StatusCode::NoContent).build();
        assert_eq!(&encode_response(&built)[..], b"HTTP/1.1 204 No Content\r\n\r\n");

        // Hand-assembled responses are cleaned up on the wire as well.
        let mut resp = Response {
            status: StatusCode::NoContent,
            headers: Default::default(),
            body: b"stray".to_vec(),
        };
        resp.set_header("content-length", "5");
        resp.set_header("Server", "x");
        assert_eq!(
            &encode_response(&resp)[..],
            b"HTTP/1.1 204 No Content\r\nServer: x\r\n\r\n"
        );
    }
}
