// FASTEN URI parsing and canonicalization.
//
// Grammar: `[fasten:][//[forge!]product[$version]][/namespace/entity]`.
// Parsing keeps the raw text so that "is this already canonical?" can be
// answered by comparing the literal form against `canonical_form()`.

use std::fmt;
use std::str::FromStr;

/// The only scheme accepted when one is present.
pub const SCHEME: &str = "fasten";

/// Errors produced while parsing an address.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UriError {
    #[error("unsupported scheme '{0}' (only '{SCHEME}' is allowed)")]
    UnsupportedScheme(String),

    #[error("forge-product-version '{0}' contains more than one '!'")]
    MultipleForgeSeparators(String),

    #[error("invalid percent escape at byte {0}")]
    InvalidEscape(usize),

    #[error("path '{0}' must start with '/'")]
    RelativePath(String),
}

/// What kind of entity the last path component denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// A type (class, interface, ...). Never a valid call-graph node.
    Type,
    /// A method or function: the entity carries a parameter list.
    Function,
    /// A field or attribute of a type.
    Attribute,
}

impl EntityKind {
    /// Classify a raw entity string.
    pub fn of(entity: &str) -> Self {
        if entity.contains('(') {
            Self::Function
        } else if entity.contains('.') {
            Self::Attribute
        } else {
            Self::Type
        }
    }

    pub fn is_callable_or_attribute(self) -> bool {
        matches!(self, Self::Function | Self::Attribute)
    }
}

/// A parsed package/module/callable address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FastenUri {
    raw: String,
    scheme: Option<String>,
    /// Raw text between `//` and the path; `Some("")` for `///ns/entity`.
    authority: Option<String>,
    forge: Option<String>,
    product: Option<String>,
    version: Option<String>,
    path: String,
    namespace: Option<String>,
    entity: Option<String>,
}

impl FastenUri {
    pub fn parse(input: &str) -> Result<Self, UriError> {
        validate_escapes(input)?;

        let (scheme, rest) = split_scheme(input);
        if let Some(s) = scheme {
            if !s.eq_ignore_ascii_case(SCHEME) {
                return Err(UriError::UnsupportedScheme(s.to_string()));
            }
        }

        let (authority, path) = match rest.strip_prefix("//") {
            Some(after) => match after.find('/') {
                Some(pos) => (Some(&after[..pos]), &after[pos..]),
                None => (Some(after), ""),
            },
            None => (None, rest),
        };

        if !path.is_empty() && !path.starts_with('/') {
            return Err(UriError::RelativePath(path.to_string()));
        }

        let (forge, product, version) = match authority {
            Some(a) if !a.is_empty() => split_authority(a)?,
            _ => (None, None, None),
        };
        let (namespace, entity) = split_path(path);

        Ok(Self {
            raw: input.to_string(),
            scheme: scheme.map(str::to_string),
            authority: authority.map(str::to_string),
            forge,
            product,
            version,
            path: path.to_string(),
            namespace,
            entity,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    pub fn forge(&self) -> Option<&str> {
        self.forge.as_deref()
    }

    pub fn product(&self) -> Option<&str> {
        self.product.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn entity(&self) -> Option<&str> {
        self.entity.as_deref()
    }

    pub fn entity_kind(&self) -> Option<EntityKind> {
        self.entity.as_deref().map(EntityKind::of)
    }

    /// An address naming a product refers to an entity outside the graph's own package.
    pub fn is_external(&self) -> bool {
        self.product.is_some()
    }

    /// Render the canonical textual form of this address.
    ///
    /// Percent escapes get uppercase hex digits, escaped unreserved characters
    /// are decoded, the scheme is lowercased and dot segments are removed from
    /// the path. Structure (including an empty authority) is preserved.
    pub fn canonical_form(&self) -> String {
        let mut out = String::with_capacity(self.raw.len());
        if let Some(scheme) = &self.scheme {
            out.push_str(&scheme.to_ascii_lowercase());
            out.push(':');
        }
        if let Some(authority) = &self.authority {
            out.push_str("//");
            out.push_str(&normalize_escapes(authority));
        }
        out.push_str(&remove_dot_segments(&normalize_escapes(&self.path)));
        out
    }

    pub fn canonicalize(&self) -> Result<Self, UriError> {
        Self::parse(&self.canonical_form())
    }

    pub fn is_canonical(&self) -> bool {
        self.raw == self.canonical_form()
    }
}

impl fmt::Display for FastenUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for FastenUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ── Parsing helpers ────────────────────────────────────────────────

/// Split off a leading `scheme:` if the text before the first ':' is a valid scheme.
fn split_scheme(input: &str) -> (Option<&str>, &str) {
    let Some(pos) = input.find(':') else {
        return (None, input);
    };
    let candidate = &input[..pos];
    let mut chars = candidate.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if valid {
        (Some(candidate), &input[pos + 1..])
    } else {
        (None, input)
    }
}

type Fpv = (Option<String>, Option<String>, Option<String>);

fn split_authority(authority: &str) -> Result<Fpv, UriError> {
    let (forge, product_version) = match authority.split_once('!') {
        Some((forge, rest)) => {
            if rest.contains('!') {
                return Err(UriError::MultipleForgeSeparators(authority.to_string()));
            }
            (non_empty(forge), rest)
        }
        None => (None, authority),
    };
    let (product, version) = match product_version.split_once('$') {
        Some((product, version)) => (non_empty(product), non_empty(version)),
        None => (non_empty(product_version), None),
    };
    Ok((forge, product, version))
}

fn split_path(path: &str) -> (Option<String>, Option<String>) {
    let Some(body) = path.strip_prefix('/') else {
        return (None, None);
    };
    match body.split_once('/') {
        Some((namespace, entity)) => (non_empty(namespace), non_empty(entity)),
        None => (None, non_empty(body)),
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn validate_escapes(input: &str) -> Result<(), UriError> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                return Err(UriError::InvalidEscape(i));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(())
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

fn hex_value(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        _ => b - b'A' + 10,
    }
}

/// Uppercase escape hex digits and decode escaped unreserved characters.
/// Assumes escapes were checked by `validate_escapes`.
fn normalize_escapes(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let decoded = hex_value(bytes[i + 1]) * 16 + hex_value(bytes[i + 2]);
            if is_unreserved(decoded) {
                out.push(decoded);
            } else {
                out.push(b'%');
                out.push(bytes[i + 1].to_ascii_uppercase());
                out.push(bytes[i + 2].to_ascii_uppercase());
            }
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn remove_dot_segments(path: &str) -> String {
    let Some(body) = path.strip_prefix('/') else {
        return path.to_string();
    };
    let segments: Vec<&str> = body.split('/').collect();
    let last = segments.len() - 1;
    let mut kept: Vec<&str> = Vec::with_capacity(segments.len());
    let mut trailing_slash = false;
    for (i, segment) in segments.iter().enumerate() {
        match *segment {
            "." => trailing_slash = i == last,
            ".." => {
                kept.pop();
                trailing_slash = i == last;
            }
            s => {
                kept.push(s);
                trailing_slash = false;
            }
        }
    }
    let mut out = String::from("/");
    out.push_str(&kept.join("/"));
    if trailing_slash && !kept.is_empty() {
        out.push('/');
    }
    out
}
