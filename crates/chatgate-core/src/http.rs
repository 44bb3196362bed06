//! HTTP/1.1 fragments the gateway writes by hand.

/// Upper bound on a request head (request line + headers).
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Request methods recognised when sniffing a new connection.
pub const METHODS: [&str; 9] = [
    "GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "CONNECT", "OPTIONS", "TRACE",
];

/// True when `token` is a request method, case-insensitively.
pub fn is_method(token: &[u8]) -> bool {
    METHODS.iter().any(|m| m.as_bytes().eq_ignore_ascii_case(token))
}

/// Current time as an IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date() -> String {
    chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Head of a 200 response carrying an envelope body of `content_length` bytes.
pub fn ok_response_head(content_length: usize) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/octet-stream\r\n\
         Connection: Keep-Alive\r\n\
         Content-Length: {content_length}\r\n\
         Date: {}\r\n\
         \r\n",
        http_date()
    )
}

/// Complete 400 response with an empty body.
pub fn bad_request_response() -> String {
    format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Connection: close\r\n\
         Content-Length: 0\r\n\
         Date: {}\r\n\
         \r\n",
        http_date()
    )
}
