//! sniproxy/src/sniffer.rs
//! Protocol sniffers: given a prefix of application bytes, extract a routing
//! hostname without consuming (removing) any of it, since both the TLS
//! ClientHello and the HTTP request line + headers must be replayed to the
//! backend byte-for-byte (SPEC_FULL.md §4.B).

/// Outcome of [`Sniffer::parse`].
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// A hostname was found. `consumed` is always 0 for both variants in
    /// this crate: the sniffer only *looks*, the backend gets everything.
    Hostname { hostname: String, consumed: usize },
    /// The request parses so far but carries no SNI / Host.
    NoHostname,
    /// `prefix` is a strict prefix of a well-formed request; the caller
    /// should read more bytes and call `parse` again.
    NeedMore,
    /// The prefix is structurally invalid.
    Malformed { detail: String },
}

/// A protocol sniffer, selected once per listener at config time.
pub trait Sniffer: Send + Sync {
    fn name(&self) -> &'static str;
    fn parse(&self, prefix: &[u8]) -> ParseResult;
    /// Bytes pushed back to the client on routing failure (a TLS alert or an
    /// HTTP 400), per SPEC_FULL.md §4.B.
    fn abort_message(&self) -> &'static [u8];
}

/// Looks inside a TLS ClientHello for the `server_name` extension (type 0).
pub struct TlsSniffer;

const TLS_ALERT_HANDSHAKE_FAILURE: &[u8] = &[0x15, 0x03, 0x01, 0x00, 0x02, 0x02, 0x28];

impl Sniffer for TlsSniffer {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn abort_message(&self) -> &'static [u8] {
        TLS_ALERT_HANDSHAKE_FAILURE
    }

    fn parse(&self, buf: &[u8]) -> ParseResult {
        if buf.is_empty() {
            return ParseResult::NeedMore;
        }
        if buf[0] != 0x16 {
            return ParseResult::Malformed {
                detail: format!("not a TLS handshake record (content type {:#04x})", buf[0]),
            };
        }
        if buf.len() < 5 {
            return ParseResult::NeedMore;
        }
        let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
        if buf.len() < 5 + record_len {
            return ParseResult::NeedMore;
        }

        let mut pos = 5usize;
        macro_rules! need {
            ($n:expr) => {
                if pos + $n > buf.len() {
                    return ParseResult::NeedMore;
                }
            };
        }

        need!(4);
        if buf[pos] != 0x01 {
            return ParseResult::Malformed {
                detail: format!("handshake type {:#04x} is not ClientHello", buf[pos]),
            };
        }
        pos += 4; // handshake type + 3-byte length

        need!(2);
        pos += 2; // client version

        need!(32);
        pos += 32; // random

        need!(1);
        let session_id_len = buf[pos] as usize;
        pos += 1;
        need!(session_id_len);
        pos += session_id_len;

        need!(2);
        let cipher_suites_len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
        pos += 2;
        need!(cipher_suites_len);
        pos += cipher_suites_len;

        need!(1);
        let compression_methods_len = buf[pos] as usize;
        pos += 1;
        need!(compression_methods_len);
        pos += compression_methods_len;

        if pos == buf.len() {
            // ClientHello with no extensions block at all.
            return ParseResult::NoHostname;
        }
        need!(2);
        let extensions_len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
        pos += 2;
        need!(extensions_len);
        let extensions_end = pos + extensions_len;

        while pos + 4 <= extensions_end {
            let ext_type = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
            let ext_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
            pos += 4;
            if pos + ext_len > extensions_end {
                return ParseResult::Malformed {
                    detail: "extension length overruns extensions block".to_string(),
                };
            }

            if ext_type == 0x0000 {
                if ext_len < 2 {
                    return ParseResult::Malformed {
                        detail: "server_name extension too short".to_string(),
                    };
                }
                let list_len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
                let mut p = pos + 2;
                let list_end = pos + 2 + list_len.min(ext_len.saturating_sub(2));
                while p + 3 <= list_end {
                    let name_type = buf[p];
                    let name_len = u16::from_be_bytes([buf[p + 1], buf[p + 2]]) as usize;
                    p += 3;
                    if p + name_len > list_end {
                        break;
                    }
                    if name_type == 0x00 {
                        return match std::str::from_utf8(&buf[p..p + name_len]) {
                            Ok(s) => ParseResult::Hostname {
                                hostname: s.to_ascii_lowercase(),
                                consumed: 0,
                            },
                            Err(_) => ParseResult::Malformed {
                                detail: "server name is not valid UTF-8".to_string(),
                            },
                        };
                    }
                    p += name_len;
                }
                return ParseResult::NoHostname;
            }

            pos += ext_len;
        }

        ParseResult::NoHostname
    }
}

/// Looks for a `Host:` header before the first blank line of an HTTP/1.x
/// request.
pub struct HttpSniffer {
    pub max_header_bytes: usize,
}

impl Default for HttpSniffer {
    fn default() -> Self {
        HttpSniffer {
            max_header_bytes: 8192,
        }
    }
}

const HTTP_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

impl Sniffer for HttpSniffer {
    fn name(&self) -> &'static str {
        "http"
    }

    fn abort_message(&self) -> &'static [u8] {
        HTTP_BAD_REQUEST
    }

    fn parse(&self, buf: &[u8]) -> ParseResult {
        let scan_len = buf.len().min(self.max_header_bytes);
        let header_end = find_subslice(&buf[..scan_len], b"\r\n\r\n");
        let header_end = match header_end {
            Some(idx) => idx,
            None => {
                if buf.len() >= self.max_header_bytes {
                    return ParseResult::Malformed {
                        detail: "request headers exceed the configured limit".to_string(),
                    };
                }
                return ParseResult::NeedMore;
            }
        };

        let request_line_end = match find_subslice(&buf[..header_end], b"\r\n") {
            Some(idx) => idx,
            None => header_end,
        };
        if !is_well_formed_request_line(&buf[..request_line_end]) {
            return ParseResult::Malformed {
                detail: "malformed HTTP request line".to_string(),
            };
        }

        match extract_host_header(&buf[..header_end]) {
            Some(host) => ParseResult::Hostname {
                hostname: host.to_ascii_lowercase(),
                consumed: 0,
            },
            None => ParseResult::NoHostname,
        }
    }
}

fn is_well_formed_request_line(line: &[u8]) -> bool {
    let text = match std::str::from_utf8(line) {
        Ok(t) => t,
        Err(_) => return false,
    };
    let parts: Vec<&str> = text.split(' ').collect();
    parts.len() == 3 && parts[2].starts_with("HTTP/")
}

/// Extracts the value of a `Host:` header from a buffer of HTTP header
/// lines (request line + headers, no trailing blank line required).
fn extract_host_header(buf: &[u8]) -> Option<String> {
    let pattern = b"host:";
    let mut i = 0;
    while i + pattern.len() <= buf.len() {
        // only match at the start of a line
        let at_line_start = i == 0 || buf[i - 1] == b'\n';
        if at_line_start && buf[i..i + pattern.len()].eq_ignore_ascii_case(pattern) {
            let start = i + pattern.len();
            let mut end = start;
            while end < buf.len() && buf[end] != b'\r' && buf[end] != b'\n' {
                end += 1;
            }
            let value = &buf[start..end];
            let trimmed = trim_ascii_whitespace(value);
            if !trimmed.is_empty() {
                return std::str::from_utf8(trimmed).ok().map(|s| s.to_string());
            }
            return None;
        }
        i += 1;
    }
    None
}

fn trim_ascii_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != b' ' && *b != b'\t');
    let end = bytes.iter().rposition(|b| *b != b' ' && *b != b'\t');
    match (start, end) {
        (Some(s), Some(e)) => &bytes[s..=e],
        _ => &[],
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_hello_with_sni(host: &str) -> Vec<u8> {
        let mut ext = vec![0x00, 0x00]; // extension type: server_name
        let mut server_name_list = vec![0x00]; // name type: host_name
        server_name_list.extend((host.len() as u16).to_be_bytes());
        server_name_list.extend(host.as_bytes());
        let mut sni_ext_body = ((server_name_list.len()) as u16).to_be_bytes().to_vec();
        sni_ext_body.extend(server_name_list);
        ext.extend((sni_ext_body.len() as u16).to_be_bytes());
        ext.extend(sni_ext_body);

        let mut hs_body = vec![0x03, 0x03]; // client version
        hs_body.extend([0u8; 32]); // random
        hs_body.push(0); // session id len
        hs_body.extend((2u16).to_be_bytes()); // cipher suites len
        hs_body.extend([0x00, 0x2f]); // one cipher suite
        hs_body.push(1); // compression methods len
        hs_body.push(0);
        hs_body.extend((ext.len() as u16).to_be_bytes());
        hs_body.extend(ext);

        let mut hs = vec![0x01]; // ClientHello
        let len = hs_body.len() as u32;
        hs.extend(&len.to_be_bytes()[1..]); // 3-byte length
        hs.extend(hs_body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend((hs.len() as u16).to_be_bytes());
        record.extend(hs);
        record
    }

    #[test]
    fn tls_extracts_sni() {
        let hello = client_hello_with_sni("Example.com");
        let result = TlsSniffer.parse(&hello);
        assert_eq!(
            result,
            ParseResult::Hostname {
                hostname: "example.com".to_string(),
                consumed: 0
            }
        );
    }

    #[test]
    fn tls_need_more_on_truncated_record() {
        let hello = client_hello_with_sni("a.test");
        let result = TlsSniffer.parse(&hello[..hello.len() - 4]);
        assert_eq!(result, ParseResult::NeedMore);
    }

    #[test]
    fn tls_malformed_on_bad_content_type() {
        let result = TlsSniffer.parse(&[0x00, 0x01, 0x02, 0x03, 0x04]);
        assert!(matches!(result, ParseResult::Malformed { .. }));
    }

    #[test]
    fn http_extracts_host() {
        let req = b"GET / HTTP/1.1\r\nHost: nope.test\r\n\r\n";
        let result = HttpSniffer::default().parse(req);
        assert_eq!(
            result,
            ParseResult::Hostname {
                hostname: "nope.test".to_string(),
                consumed: 0
            }
        );
    }

    #[test]
    fn http_need_more_without_blank_line() {
        let req = b"GET / HTTP/1.1\r\nHost: nope.test\r\n";
        let result = HttpSniffer::default().parse(req);
        assert_eq!(result, ParseResult::NeedMore);
    }

    #[test]
    fn http_no_hostname_without_host_header() {
        let req = b"GET / HTTP/1.0\r\n\r\n";
        let result = HttpSniffer::default().parse(req);
        assert_eq!(result, ParseResult::NoHostname);
    }

    #[test]
    fn http_malformed_request_line() {
        let req = b"NOT A REQUEST LINE\r\n\r\n";
        let result = HttpSniffer::default().parse(req);
        assert!(matches!(result, ParseResult::Malformed { .. }));
    }
}
