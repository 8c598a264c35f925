// Exchange format for call graphs handed over by the analysis producers.
//
// One JSON object per package version: identity fields, a depset, the class
// hierarchy (CHA) with graph-scoped local ids for every method, and the arcs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{GraphError, Result};

/// Threshold below which a timestamp is taken to be in seconds.
pub const SECONDS_THRESHOLD: i64 = 1000 * 60 * 60 * 24 * 365;

// ── Local ids ──────────────────────────────────────────────────────

/// Graph-scoped identifier of an internal callable. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawLocalId")]
pub struct LocalId(pub u64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LocalId {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(LocalId)
            .map_err(|_| GraphError::InvalidLocalId(s.to_string()))
    }
}

/// Producers emit local ids both as JSON numbers and as numeric strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawLocalId {
    Number(u64),
    Text(String),
}

impl TryFrom<RawLocalId> for LocalId {
    type Error = GraphError;

    fn try_from(raw: RawLocalId) -> Result<Self> {
        match raw {
            RawLocalId::Number(n) => Ok(Self(n)),
            RawLocalId::Text(s) => s.parse(),
        }
    }
}

// ── Dependencies ───────────────────────────────────────────────────

/// A version interval `[lower..upper]`; `None` means unbounded on that side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Constraint {
    pub lower: Option<String>,
    pub upper: Option<String>,
}

impl FromStr for Constraint {
    type Err = GraphError;

    /// Accepts `[v]` (exact version), `[lo..hi]`, `[lo..]` and `[..hi]`.
    fn from_str(spec: &str) -> Result<Self> {
        let invalid = || GraphError::InvalidConstraint(spec.to_string());
        let inner = spec
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(invalid)?;
        let bound = |s: &str| {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        };
        match inner.split_once("..") {
            Some((lower, upper)) => {
                if upper.contains("..") {
                    return Err(invalid());
                }
                Ok(Self {
                    lower: bound(lower),
                    upper: bound(upper),
                })
            }
            None => Ok(Self {
                lower: bound(inner),
                upper: bound(inner),
            }),
        }
    }
}

impl TryFrom<String> for Constraint {
    type Error = GraphError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}..{}]",
            self.lower.as_deref().unwrap_or(""),
            self.upper.as_deref().unwrap_or("")
        )
    }
}

impl<'de> Deserialize<'de> for Constraint {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Dependency {
    pub product: String,
    pub forge: String,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

// ── Class hierarchy ────────────────────────────────────────────────

/// One CHA entry: a type with its supertypes and the methods it defines.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaType {
    /// Local id (as the producer wrote it) → callable URI.
    #[serde(default)]
    pub methods: BTreeMap<String, String>,
    #[serde(default)]
    pub super_classes: Vec<String>,
    #[serde(default)]
    pub super_interfaces: Vec<String>,
    #[serde(default)]
    pub source_file: Option<String>,
}

// ── Arcs ───────────────────────────────────────────────────────────

/// `[sourceLocalId, targetUri, metadata]`
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalCall(
    pub LocalId,
    pub String,
    pub serde_json::Map<String, serde_json::Value>,
);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Graph {
    #[serde(default)]
    pub internal_calls: Vec<(LocalId, LocalId)>,
    #[serde(default)]
    pub external_calls: Vec<ExternalCall>,
}

impl Graph {
    pub fn arc_count(&self) -> usize {
        self.internal_calls.len() + self.external_calls.len()
    }
}

// ── Record ─────────────────────────────────────────────────────────

/// A call graph for one package version, as produced by an analyzer.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtendedCallGraph {
    pub product: String,
    pub forge: String,
    pub generator: String,
    pub version: String,
    /// Seconds (or milliseconds) since the epoch; absent or `-1` when unknown.
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub depset: Vec<Vec<Dependency>>,
    pub cha: BTreeMap<String, ChaType>,
    pub graph: Graph,
}

impl ExtendedCallGraph {
    /// Parse a record from JSON text. A `{"payload": {...}}` envelope is unwrapped.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(mut value: serde_json::Value) -> Result<Self> {
        if let Some(payload) = value.get_mut("payload").filter(|p| p.is_object()) {
            value = payload.take();
        }
        if !value.is_object() {
            return Err(GraphError::NotAnObject);
        }
        for field in ["product", "forge", "generator", "version"] {
            let present = value
                .get(field)
                .and_then(serde_json::Value::as_str)
                .is_some_and(|s| !s.trim().is_empty());
            if !present {
                return Err(GraphError::MissingField(field));
            }
        }
        Ok(serde_json::from_value(value)?)
    }

    /// `product@version`, used to label log lines.
    pub fn artifact(&self) -> String {
        format!("{}@{}", self.product, self.version)
    }

    /// Timestamp in milliseconds since the epoch, if known.
    ///
    /// Values smaller than one year's worth of milliseconds are taken to be
    /// seconds and scaled up; larger values are already milliseconds.
    pub fn timestamp_millis(&self) -> Option<i64> {
        match self.timestamp {
            None | Some(-1) => None,
            Some(ts) if ts / SECONDS_THRESHOLD < 1 => Some(ts.saturating_mul(1000)),
            Some(ts) => Some(ts),
        }
    }

    pub fn method_count(&self) -> usize {
        self.cha.values().map(|t| t.methods.len()).sum()
    }
}
