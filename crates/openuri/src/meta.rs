//! Response metadata: status line, headers and the attributes derived from them
//!
//! Header names are stored lower-cased. Repeated headers are joined with
//! `", "` so every field has exactly one value.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

/// Charset assumed when a response does not declare one
pub const DEFAULT_CHARSET: &str = "iso-8859-1";

/// Content type assumed when a response does not declare a parsable one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Raw `[code, message]` pair of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    code: String,
    message: String,
}

impl StatusLine {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Three-digit code exactly as the peer sent it
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Reason phrase, possibly empty
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Numeric code, if the code is numeric
    pub fn as_u16(&self) -> Option<u16> {
        self.code.parse().ok()
    }

    pub fn is_success(&self) -> bool {
        self.as_u16().is_some_and(|c| (200..300).contains(&c))
    }
}

impl Default for StatusLine {
    fn default() -> Self {
        Self::new("200", "OK")
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} {}", self.code, self.message)
        }
    }
}

/// Parsed `Content-Type` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    /// `type/subtype`, lower-cased
    pub media_type: String,
    /// Parameters in order of appearance, names lower-cased
    pub params: Vec<(String, String)>,
}

impl ContentType {
    /// Parse a `type/subtype; name=value` header value.
    ///
    /// Values may be tokens or quoted strings with backslash escapes.
    /// Returns `None` when the value does not follow that grammar.
    pub fn parse(value: &str) -> Option<Self> {
        let mut cursor = Cursor::new(value.as_bytes());
        cursor.skip_lws();
        let kind = cursor.token()?.to_ascii_lowercase();
        cursor.skip_lws();
        cursor.expect(b'/')?;
        cursor.skip_lws();
        let subtype = cursor.token()?.to_ascii_lowercase();
        cursor.skip_lws();

        let mut params = Vec::new();
        while cursor.eat(b';') {
            cursor.skip_lws();
            if cursor.at_end() {
                // trailing ';' is tolerated
                break;
            }
            let name = cursor.token()?.to_ascii_lowercase();
            cursor.skip_lws();
            cursor.expect(b'=')?;
            cursor.skip_lws();
            let value = if cursor.peek() == Some(b'"') {
                cursor.quoted_string()?
            } else {
                cursor.token()?
            };
            cursor.skip_lws();
            params.push((name, value));
        }

        if !cursor.at_end() {
            return None;
        }

        Some(Self {
            media_type: format!("{kind}/{subtype}"),
            params,
        })
    }

    /// First parameter with the given (lower-case) name
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Declared charset, lower-cased
    pub fn charset(&self) -> Option<String> {
        self.param("charset").map(str::to_ascii_lowercase)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, b: u8) -> Option<()> {
        self.eat(b).then_some(())
    }

    fn skip_lws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn token(&mut self) -> Option<String> {
        let start = self.pos;
        while self.peek().is_some_and(is_token_byte) {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        Some(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn quoted_string(&mut self) -> Option<String> {
        self.expect(b'"')?;
        let mut out = Vec::new();
        loop {
            match self.peek()? {
                b'"' => {
                    self.pos += 1;
                    return Some(String::from_utf8_lossy(&out).into_owned());
                }
                b'\\' => {
                    self.pos += 1;
                    let escaped = self.peek().filter(u8::is_ascii)?;
                    out.push(escaped);
                    self.pos += 1;
                }
                b if b >= 0x20 || matches!(b, b'\r' | b'\n' | b'\t') => {
                    if b == 0x7f {
                        return None;
                    }
                    out.push(b);
                    self.pos += 1;
                }
                _ => return None,
            }
        }
    }
}

const fn is_token_byte(b: u8) -> bool {
    !matches!(
        b,
        0x00..=b' '
            | b'('
            | b')'
            | b'<'
            | b'>'
            | b'@'
            | b','
            | b';'
            | b':'
            | b'\\'
            | b'"'
            | b'/'
            | b'['
            | b']'
            | b'?'
            | b'='
            | b'{'
            | b'}'
            | 0x7f
    )
}

/// Parse an HTTP date: RFC 1123, with RFC 850 and asctime accepted for
/// older servers.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    // Sunday, 06-Nov-94 08:49:37 GMT
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%A, %d-%b-%y %H:%M:%S GMT") {
        return Some(naive.and_utc());
    }
    // Sun Nov  6 08:49:37 1994
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&collapsed, "%a %b %e %H:%M:%S %Y")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Metadata attached to every opened resource
#[derive(Debug, Clone, Default)]
pub struct Meta {
    status: StatusLine,
    base_uri: Option<Url>,
    headers: BTreeMap<String, String>,
    content_type: Option<ContentType>,
    last_modified: Option<DateTime<Utc>>,
}

impl Meta {
    pub fn new(status: StatusLine, base_uri: Option<Url>) -> Self {
        Self {
            status,
            base_uri,
            ..Self::default()
        }
    }

    /// Build metadata from a status line and raw header fields
    pub fn from_fields<'a, I>(status: StatusLine, base_uri: Option<Url>, fields: I) -> Self
    where
        I: IntoIterator<Item = &'a (String, String)>,
    {
        let mut meta = Self::new(status, base_uri);
        for (name, value) in fields {
            meta.add_field(name, value);
        }
        meta
    }

    /// Record one header field, re-deriving the typed attributes it feeds
    pub fn add_field(&mut self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        let value = value.trim();
        let joined = match self.headers.get(&name) {
            Some(existing) => format!("{existing}, {value}"),
            None => value.to_string(),
        };

        match name.as_str() {
            "content-type" => self.content_type = ContentType::parse(&joined),
            "last-modified" => self.last_modified = parse_http_date(&joined),
            _ => {}
        }
        self.headers.insert(name, joined);
    }

    /// `[code, message]` of the final response
    pub fn status(&self) -> &StatusLine {
        &self.status
    }

    /// Final URI after redirects
    pub fn base_uri(&self) -> Option<&Url> {
        self.base_uri.as_ref()
    }

    /// Header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// All headers, names lower-cased
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Media type, `application/octet-stream` when absent or unparsable
    pub fn content_type(&self) -> &str {
        self.content_type
            .as_ref()
            .map_or(DEFAULT_CONTENT_TYPE, |ct| ct.media_type.as_str())
    }

    /// Parsed content type with parameters
    pub fn content_type_parsed(&self) -> Option<&ContentType> {
        self.content_type.as_ref()
    }

    /// Declared charset lower-cased, `iso-8859-1` when absent
    pub fn charset(&self) -> String {
        self.content_type
            .as_ref()
            .and_then(ContentType::charset)
            .unwrap_or_else(|| DEFAULT_CHARSET.to_string())
    }

    /// Content-Encoding tokens lower-cased, in header order. Empty when absent.
    pub fn content_encoding(&self) -> Vec<String> {
        self.header("content-encoding")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_ascii_lowercase)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    /// Declared Content-Length, if present and numeric
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    pub(crate) fn set_status(&mut self, status: StatusLine) {
        self.status = status;
    }
}
