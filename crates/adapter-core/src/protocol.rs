//! Command framing, response classification and field extraction.
//!
//! Every device here speaks short ASCII command lines and answers with either
//! an acknowledgment, a data line, or an error marker followed by a code.
//! [`ResponseRules`] captures those three shapes for one device and
//! [`ResponseRules::classify`] applies them in a fixed order:
//!
//! 1. error marker present -> [`AdapterError::DeviceReported`] via the [`ErrorTable`]
//! 2. acknowledgment token present -> [`Classified::Ack`]
//! 3. anything else -> [`Classified::Data`]
//!
//! Data lines are then picked apart with [`Locate`] and [`FieldSpec`].

use crate::error::{AdapterError, AdapterResult, UNKNOWN_DEVICE_ERROR};
use crate::property::{PropertyType, PropertyValue};

/// Carriage return terminator.
pub const CR: &[u8] = b"\r";
/// Line feed terminator.
pub const LF: &[u8] = b"\n";
/// Carriage return + line feed terminator.
pub const CRLF: &[u8] = b"\r\n";
/// End-of-text byte used by framed pump replies.
pub const ETX: &[u8] = b"\x03";

// =============================================================================
// Command
// =============================================================================

/// An outbound instruction.
///
/// Built fresh for every exchange and never mutated once handed to the
/// transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    selector: Option<String>,
    verb: String,
    params: Vec<String>,
    separator: &'static str,
    terminator: &'static [u8],
}

impl Command {
    /// New command with the given verb, no selector and a CR terminator.
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            selector: None,
            verb: verb.into(),
            params: Vec::new(),
            separator: "",
            terminator: CR,
        }
    }

    /// Channel, axis or pump address written before the verb.
    pub fn selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    /// Append a parameter.
    pub fn param(mut self, param: impl ToString) -> Self {
        self.params.push(param.to_string());
        self
    }

    /// Text placed between the verb and each parameter (default: none).
    pub fn separator(mut self, separator: &'static str) -> Self {
        self.separator = separator;
        self
    }

    /// Line terminator appended on the wire.
    pub fn terminated(mut self, terminator: &'static [u8]) -> Self {
        self.terminator = terminator;
        self
    }

    /// The terminator this command is sent with.
    pub fn terminator(&self) -> &'static [u8] {
        self.terminator
    }

    /// Command text without the terminator.
    pub fn text(&self) -> String {
        let mut out = String::new();
        if let Some(selector) = &self.selector {
            out.push_str(selector);
        }
        out.push_str(&self.verb);
        for param in &self.params {
            out.push_str(self.separator);
            out.push_str(param);
        }
        out
    }

    /// Full wire bytes: text followed by the terminator.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = self.text().into_bytes();
        bytes.extend_from_slice(self.terminator);
        bytes
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text().escape_debug())
    }
}

// =============================================================================
// Device error tables
// =============================================================================

/// One row in a device's error table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceErrorEntry {
    /// Token following the error marker on the wire.
    pub token: &'static str,
    /// Code surfaced to the host.
    pub code: i32,
    /// Human readable description.
    pub description: &'static str,
    /// Informational status, not a fault.
    pub benign: bool,
}

impl DeviceErrorEntry {
    /// A fault entry.
    pub const fn fault(token: &'static str, code: i32, description: &'static str) -> Self {
        Self {
            token,
            code,
            description,
            benign: false,
        }
    }

    /// An informational entry that classification lets through.
    pub const fn benign(token: &'static str, description: &'static str) -> Self {
        Self {
            token,
            code: 0,
            description,
            benign: true,
        }
    }
}

/// Fixed lookup from device error tokens to host codes.
#[derive(Debug, Clone, Copy)]
pub struct ErrorTable {
    entries: &'static [DeviceErrorEntry],
    unknown_code: i32,
}

impl ErrorTable {
    /// Table with the default code for unmapped tokens.
    pub const fn new(entries: &'static [DeviceErrorEntry]) -> Self {
        Self {
            entries,
            unknown_code: UNKNOWN_DEVICE_ERROR,
        }
    }

    /// Override the code used for tokens missing from the table.
    pub const fn with_unknown_code(mut self, code: i32) -> Self {
        self.unknown_code = code;
        self
    }

    /// Look up a token (case-insensitive).
    pub fn lookup(&self, token: &str) -> Option<&'static DeviceErrorEntry> {
        self.entries
            .iter()
            .find(|entry| entry.token.eq_ignore_ascii_case(token))
    }

    /// Error for a token; unmapped tokens become the generic unknown error.
    pub fn resolve(&self, token: &str) -> AdapterError {
        match self.lookup(token) {
            Some(entry) => AdapterError::device(entry.code, entry.description),
            None => AdapterError::device(
                self.unknown_code,
                format!("unknown device error '{}'", token),
            ),
        }
    }

    /// All entries, for hosts that register messages up front.
    pub fn entries(&self) -> &'static [DeviceErrorEntry] {
        self.entries
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Where the error marker sits in a response.
#[derive(Debug, Clone, Copy)]
pub struct ErrorMarker {
    /// Literal marker text, e.g. `%SYS-` or `GS`.
    pub token: &'static str,
    /// Required byte offset of the marker; `None` means anywhere.
    pub offset: Option<usize>,
    /// Width of the code following the marker; `None` takes the rest of the line.
    pub code_len: Option<usize>,
}

/// Outcome of a successful classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classified<'a> {
    /// Acknowledgment token seen, no payload.
    Ack,
    /// Informational marker (benign table entry), safe to skip.
    Info(&'a str),
    /// A data line to extract fields from.
    Data(&'a str),
}

/// Per-device response shapes.
#[derive(Debug, Clone, Copy)]
pub struct ResponseRules {
    /// Error marker, if the device has one.
    pub error_marker: Option<ErrorMarker>,
    /// Acknowledgment token, if the device sends one.
    pub ack: Option<&'static str>,
    /// Error code table.
    pub errors: ErrorTable,
}

impl ResponseRules {
    /// Rules with only an error table; markers and ack are added with the builders.
    pub const fn new(errors: ErrorTable) -> Self {
        Self {
            error_marker: None,
            ack: None,
            errors,
        }
    }

    /// Set the error marker.
    pub const fn with_error_marker(mut self, marker: ErrorMarker) -> Self {
        self.error_marker = Some(marker);
        self
    }

    /// Set the acknowledgment token.
    pub const fn with_ack(mut self, ack: &'static str) -> Self {
        self.ack = Some(ack);
        self
    }

    /// Classify one response line.
    ///
    /// # Errors
    ///
    /// [`AdapterError::DeviceReported`] when the error marker is present and
    /// the token is not a benign table entry.
    pub fn classify<'a>(&self, response: &'a str) -> AdapterResult<Classified<'a>> {
        if let Some(token) = self.error_token(response) {
            match self.errors.lookup(token) {
                Some(entry) if entry.benign => return Ok(Classified::Info(response)),
                _ => return Err(self.errors.resolve(token)),
            }
        }

        if let Some(ack) = self.ack {
            if response.contains(ack) {
                return Ok(Classified::Ack);
            }
        }

        Ok(Classified::Data(response))
    }

    /// Classify and require an acknowledgment (or an empty line when the
    /// device has no ack token).
    pub fn expect_ack(&self, response: &str) -> AdapterResult<()> {
        match self.classify(response)? {
            Classified::Ack | Classified::Info(_) => Ok(()),
            Classified::Data(_) if self.ack.is_none() => Ok(()),
            Classified::Data(data) => Err(AdapterError::UnrecognizedResponse(format!(
                "expected acknowledgment, got '{}'",
                data.escape_debug()
            ))),
        }
    }

    /// Classify and require a data line.
    pub fn expect_data<'a>(&self, response: &'a str) -> AdapterResult<&'a str> {
        match self.classify(response)? {
            Classified::Data(data) => Ok(data),
            other => Err(AdapterError::UnrecognizedResponse(format!(
                "expected data, got {:?}",
                other
            ))),
        }
    }

    fn error_token<'a>(&self, response: &'a str) -> Option<&'a str> {
        let marker = self.error_marker?;
        let start = match marker.offset {
            Some(at) => {
                if !response.get(at..)?.starts_with(marker.token) {
                    return None;
                }
                at
            }
            None => response.find(marker.token)?,
        };
        let rest = response.get(start + marker.token.len()..)?;
        let code = match marker.code_len {
            Some(len) => rest.get(..len.min(rest.len())).unwrap_or(rest),
            None => rest,
        };
        Some(code.trim_matches(is_line_noise))
    }
}

// =============================================================================
// Field extraction
// =============================================================================

/// How to find a field inside a data line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locate {
    /// Fixed byte offset and length.
    Offset {
        /// Byte offset from the start of the response.
        offset: usize,
        /// Field width in bytes.
        len: usize,
    },
    /// Window following the first occurrence of a tag.
    Tag {
        /// Literal tag text.
        tag: &'static str,
        /// Window width; `None` reads to the end of the line.
        width: Option<usize>,
    },
}

impl Locate {
    /// Fixed offset/length field.
    pub const fn at(offset: usize, len: usize) -> Self {
        Self::Offset { offset, len }
    }

    /// Window of `width` bytes after `tag`.
    pub const fn after(tag: &'static str, width: usize) -> Self {
        Self::Tag {
            tag,
            width: Some(width),
        }
    }

    /// Rest of the line after `tag`.
    pub const fn after_to_end(tag: &'static str) -> Self {
        Self::Tag { tag, width: None }
    }

    /// Slice the field out of `response`.
    ///
    /// # Errors
    ///
    /// [`AdapterError::UnrecognizedResponse`] when the reply is too short or the
    /// tag is missing. Short replies are never padded.
    pub fn slice<'a>(&self, response: &'a str) -> AdapterResult<&'a str> {
        let found = match *self {
            Locate::Offset { offset, len } => response.get(offset..offset + len),
            Locate::Tag { tag, width } => response.find(tag).and_then(|pos| {
                let start = pos + tag.len();
                match width {
                    Some(width) => response.get(start..start + width),
                    None => response.get(start..),
                }
            }),
        };
        found.ok_or_else(|| {
            AdapterError::UnrecognizedResponse(format!(
                "field {:?} not present in '{}'",
                self,
                response.escape_debug()
            ))
        })
    }
}

/// A field location plus its semantic type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Where the field is.
    pub locate: Locate,
    /// How to interpret it.
    pub kind: PropertyType,
}

/// A value pulled out of a response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedField<'a> {
    /// Raw text of the field.
    pub raw: &'a str,
    /// Typed value.
    pub value: PropertyValue,
}

impl FieldSpec {
    /// Integer field.
    pub const fn integer(locate: Locate) -> Self {
        Self {
            locate,
            kind: PropertyType::Integer,
        }
    }

    /// Float field.
    pub const fn float(locate: Locate) -> Self {
        Self {
            locate,
            kind: PropertyType::Float,
        }
    }

    /// Enumerated string field, returned trimmed.
    pub const fn text(locate: Locate) -> Self {
        Self {
            locate,
            kind: PropertyType::Text,
        }
    }

    /// Locate and parse the field.
    pub fn extract<'a>(&self, response: &'a str) -> AdapterResult<ParsedField<'a>> {
        let raw = self.locate.slice(response)?;
        let value = match self.kind {
            PropertyType::Integer => PropertyValue::Integer(parse_i64_field(raw)?),
            PropertyType::Float => PropertyValue::Float(parse_f64_field(raw)?),
            PropertyType::Text => PropertyValue::Text(raw.trim_matches(is_line_noise).to_string()),
        };
        Ok(ParsedField { raw, value })
    }
}

// =============================================================================
// Numeric parsing
// =============================================================================

/// What a property does when a reply's numeric field is malformed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MalformedPolicy {
    /// Return [`AdapterError::UnrecognizedResponse`].
    #[default]
    Surface,
    /// Log a warning and report the previously cached value.
    ///
    /// Compatibility mode for hosts that relied on the old adapters silently
    /// leaving the value untouched.
    KeepPrevious,
}

fn is_line_noise(c: char) -> bool {
    c.is_whitespace() || c == '\x03' || c == '\x02' || c == '\0'
}

fn reject(text: &str) -> AdapterError {
    AdapterError::UnrecognizedResponse(format!("malformed number '{}'", text.escape_debug()))
}

/// Length of the longest decimal float prefix of `s`.
fn float_prefix_len(s: &[u8]) -> usize {
    let mut i = 0;
    if matches!(s.first(), Some(b'+' | b'-')) {
        i += 1;
    }
    let int_start = i;
    while s.get(i).is_some_and(u8::is_ascii_digit) {
        i += 1;
    }
    let mut digits = i - int_start;
    if s.get(i) == Some(&b'.') {
        let frac_start = i + 1;
        let mut j = frac_start;
        while s.get(j).is_some_and(u8::is_ascii_digit) {
            j += 1;
        }
        digits += j - frac_start;
        i = j;
    }
    if digits == 0 {
        return 0;
    }
    if matches!(s.get(i), Some(b'e' | b'E')) {
        let mut j = i + 1;
        if matches!(s.get(j), Some(b'+' | b'-')) {
            j += 1;
        }
        let exp_start = j;
        while s.get(j).is_some_and(u8::is_ascii_digit) {
            j += 1;
        }
        if j > exp_start {
            i = j;
        }
    }
    i
}

/// Parse a float permissively: leading whitespace is skipped, parsing stops at
/// the first non-numeric byte, and the remainder must be whitespace or line
/// terminators.
pub fn parse_f64_field(text: &str) -> AdapterResult<f64> {
    let trimmed = text.trim_start_matches(is_line_noise);
    let len = float_prefix_len(trimmed.as_bytes());
    if len == 0 {
        return Err(reject(text));
    }
    let (number, rest) = trimmed.split_at(len);
    if !rest.chars().all(is_line_noise) {
        return Err(reject(text));
    }
    number.parse::<f64>().map_err(|_| reject(text))
}

/// Parse an integer permissively: decimal or `0x` hexadecimal, same trailing
/// rules as [`parse_f64_field`].
pub fn parse_i64_field(text: &str) -> AdapterResult<i64> {
    let trimmed = text.trim_start_matches(is_line_noise);
    let (negative, unsigned) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let (radix, body) = match unsigned.get(..2) {
        Some("0x") | Some("0X") => (16, &unsigned[2..]),
        _ => (10, unsigned),
    };
    let len = body
        .bytes()
        .take_while(|b| (*b as char).is_digit(radix))
        .count();
    if len == 0 {
        return Err(reject(text));
    }
    let (digits, rest) = body.split_at(len);
    if !rest.chars().all(is_line_noise) {
        return Err(reject(text));
    }
    let magnitude = i64::from_str_radix(digits, radix).map_err(|_| reject(text))?;
    Ok(if negative { -magnitude } else { magnitude })
}

/// Format a number for a fixed-width decimal field: at most `significant`
/// significant digits, no trailing zeros, no exponent.
pub fn format_significant(value: f64, significant: usize) -> String {
    if value == 0.0 || !value.is_finite() {
        return "0".to_string();
    }
    let magnitude = value.abs().log10().floor() as i32;
    let decimals = (significant as i32 - 1 - magnitude).max(0) as usize;
    trim_decimals(format!("{:.*}", decimals, value))
}

/// Like [`format_significant`], but dropping decimals until the text fits in
/// `width` characters. Values whose integer part alone is wider come back
/// unshortened; callers bound the domain.
pub fn format_in_width(value: f64, significant: usize, width: usize) -> String {
    let text = format_significant(value, significant);
    if text.len() <= width {
        return text;
    }
    let integer = format!("{:.0}", value);
    let decimals = width.saturating_sub(integer.len() + 1);
    if decimals == 0 {
        return integer;
    }
    trim_decimals(format!("{:.*}", decimals, value))
}

fn trim_decimals(text: String) -> String {
    if text.contains('.') {
        let trimmed = text.trim_end_matches('0').trim_end_matches('.');
        if trimmed.is_empty() || trimmed == "-" {
            "0".to_string()
        } else {
            trimmed.to_string()
        }
    } else {
        text
    }
}
