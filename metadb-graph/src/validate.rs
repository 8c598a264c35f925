// Arc admission and record validation.
//
// Turns a parsed `ExtendedCallGraph` into a `ValidatedGraph`: the structural
// checks fail the whole record, while the per-node address rules only drop
// the offending arc and count it in the `ArcReport`.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::debug;

use crate::callgraph::{ExtendedCallGraph, LocalId};
use crate::uri::{EntityKind, FastenUri};
use crate::{GraphError, Result};

// ── Node rules ─────────────────────────────────────────────────────

/// Where a node sits in an arc. Only targets may name another product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePosition {
    Source,
    Target,
}

/// Why an arc was dropped. Variants are listed in the order rules are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArcRejection {
    /// The address could not be parsed at all.
    Malformed,
    HasScheme,
    NotCanonical,
    HasForgeOrVersion,
    /// The address names the product being ingested.
    SelfProduct,
    /// An external address used as the call site.
    ExternalSource,
    MissingNamespace,
    /// The entity is a type (or absent), not a callable or attribute.
    NotCallable,
    /// The arc refers to a local id that no CHA entry defines.
    UnknownLocalId,
}

impl ArcRejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::HasScheme => "has_scheme",
            Self::NotCanonical => "not_canonical",
            Self::HasForgeOrVersion => "has_forge_or_version",
            Self::SelfProduct => "self_product",
            Self::ExternalSource => "external_source",
            Self::MissingNamespace => "missing_namespace",
            Self::NotCallable => "not_callable",
            Self::UnknownLocalId => "unknown_local_id",
        }
    }
}

impl std::fmt::Display for ArcRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Applies the address rules relative to the product under ingestion.
#[derive(Debug, Clone)]
pub struct ArcValidator {
    product: String,
}

impl ArcValidator {
    pub fn new(product: impl Into<String>) -> Self {
        Self {
            product: product.into(),
        }
    }

    /// Check one node; the first failing rule names the rejection.
    pub fn check_node(
        &self,
        raw: &str,
        position: NodePosition,
    ) -> std::result::Result<FastenUri, ArcRejection> {
        let uri = FastenUri::parse(raw).map_err(|_| ArcRejection::Malformed)?;
        if uri.scheme().is_some() {
            return Err(ArcRejection::HasScheme);
        }
        if !uri.is_canonical() {
            return Err(ArcRejection::NotCanonical);
        }
        if uri.forge().is_some() || uri.version().is_some() {
            return Err(ArcRejection::HasForgeOrVersion);
        }
        if let Some(product) = uri.product() {
            if product == self.product {
                return Err(ArcRejection::SelfProduct);
            }
            if position == NodePosition::Source {
                return Err(ArcRejection::ExternalSource);
            }
        }
        if uri.namespace().is_none() {
            return Err(ArcRejection::MissingNamespace);
        }
        if !uri
            .entity_kind()
            .is_some_and(EntityKind::is_callable_or_attribute)
        {
            return Err(ArcRejection::NotCallable);
        }
        Ok(uri)
    }

    /// Check both ends of an arc, source first.
    pub fn check_arc(
        &self,
        source: &str,
        target: &str,
    ) -> std::result::Result<(FastenUri, FastenUri), ArcRejection> {
        let source = self.check_node(source, NodePosition::Source)?;
        let target = self.check_node(target, NodePosition::Target)?;
        Ok((source, target))
    }
}

// ── Report ─────────────────────────────────────────────────────────

/// Accepted and rejected arc counts for one or more records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArcReport {
    pub total: usize,
    pub accepted: usize,
    pub rejected: BTreeMap<ArcRejection, usize>,
}

impl ArcReport {
    pub fn accept(&mut self) {
        self.total += 1;
        self.accepted += 1;
    }

    pub fn reject(&mut self, reason: ArcRejection) {
        self.total += 1;
        *self.rejected.entry(reason).or_default() += 1;
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.values().sum()
    }

    pub fn merge(&mut self, other: &Self) {
        self.total += other.total;
        self.accepted += other.accepted;
        for (reason, count) in &other.rejected {
            *self.rejected.entry(*reason).or_default() += count;
        }
    }
}

// ── Validated record ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    pub product: String,
    pub forge: String,
    /// Normalised `[lower..upper]` ranges, in input order.
    pub constraints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSpec {
    pub local_id: LocalId,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSpec {
    pub namespace: String,
    pub source_file: Option<String>,
    /// `{"superClasses": [...], "superInterfaces": [...]}`
    pub metadata: serde_json::Value,
    pub methods: Vec<MethodSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalArc {
    pub source: LocalId,
    pub target: LocalId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalArc {
    pub source: LocalId,
    /// Canonical address of the called entity.
    pub target: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// A record that passed structural validation, with inadmissible arcs removed.
#[derive(Debug, Clone)]
pub struct ValidatedGraph {
    pub product: String,
    pub forge: String,
    pub generator: String,
    pub version: String,
    pub timestamp_millis: Option<i64>,
    pub dependencies: Vec<DependencySpec>,
    pub modules: Vec<ModuleSpec>,
    pub internal_arcs: Vec<InternalArc>,
    pub external_arcs: Vec<ExternalArc>,
    pub report: ArcReport,
}

impl ValidatedGraph {
    pub fn artifact(&self) -> String {
        format!("{}@{}", self.product, self.version)
    }

    pub fn method_count(&self) -> usize {
        self.modules.iter().map(|m| m.methods.len()).sum()
    }
}

/// Validate a parsed record.
///
/// Fails the record on structural problems (bad dependency entries, bad or
/// duplicate local ids, unparseable method addresses). Arcs that break an
/// address rule are dropped and counted.
pub fn validate(cg: &ExtendedCallGraph) -> Result<ValidatedGraph> {
    let dependencies = collect_dependencies(cg)?;
    let (modules, methods) = collect_modules(cg)?;

    let validator = ArcValidator::new(&cg.product);
    let mut report = ArcReport::default();

    let mut internal_arcs = Vec::with_capacity(cg.graph.internal_calls.len());
    for &(source, target) in &cg.graph.internal_calls {
        let outcome = match (methods.get(&source), methods.get(&target)) {
            (Some(s), Some(t)) => validator.check_arc(s, t).map(|_| ()),
            _ => Err(ArcRejection::UnknownLocalId),
        };
        match outcome {
            Ok(()) => {
                report.accept();
                internal_arcs.push(InternalArc { source, target });
            }
            Err(reason) => {
                debug!(%source, %target, %reason, "Dropping internal arc");
                report.reject(reason);
            }
        }
    }

    let mut external_arcs = Vec::with_capacity(cg.graph.external_calls.len());
    for call in &cg.graph.external_calls {
        let source = call.0;
        let outcome = match methods.get(&source) {
            Some(s) => validator.check_arc(s, &call.1),
            None => Err(ArcRejection::UnknownLocalId),
        };
        match outcome {
            Ok((_, target)) => {
                report.accept();
                external_arcs.push(ExternalArc {
                    source,
                    target: target.as_str().to_string(),
                    metadata: call.2.clone(),
                });
            }
            Err(reason) => {
                debug!(%source, target = %call.1, %reason, "Dropping external arc");
                report.reject(reason);
            }
        }
    }

    Ok(ValidatedGraph {
        product: cg.product.clone(),
        forge: cg.forge.clone(),
        generator: cg.generator.clone(),
        version: cg.version.clone(),
        timestamp_millis: cg.timestamp_millis(),
        dependencies,
        modules,
        internal_arcs,
        external_arcs,
        report,
    })
}

fn collect_dependencies(cg: &ExtendedCallGraph) -> Result<Vec<DependencySpec>> {
    let mut out = Vec::new();
    for dep in cg.depset.iter().flatten() {
        if dep.product.trim().is_empty() {
            return Err(GraphError::MissingField("depset.product"));
        }
        if dep.forge.trim().is_empty() {
            return Err(GraphError::MissingField("depset.forge"));
        }
        out.push(DependencySpec {
            product: dep.product.clone(),
            forge: dep.forge.clone(),
            constraints: dep.constraints.iter().map(ToString::to_string).collect(),
        });
    }
    Ok(out)
}

fn collect_modules(cg: &ExtendedCallGraph) -> Result<(Vec<ModuleSpec>, HashMap<LocalId, String>)> {
    let mut modules = Vec::with_capacity(cg.cha.len());
    let mut methods = HashMap::new();

    for (namespace, cha_type) in &cg.cha {
        let mut specs = Vec::with_capacity(cha_type.methods.len());
        for (key, uri) in &cha_type.methods {
            let local_id: LocalId = key.parse()?;
            FastenUri::parse(uri).map_err(|source| GraphError::InvalidUri {
                uri: uri.clone(),
                source,
            })?;
            if methods.insert(local_id, uri.clone()).is_some() {
                return Err(GraphError::DuplicateLocalId(local_id));
            }
            specs.push(MethodSpec {
                local_id,
                uri: uri.clone(),
            });
        }
        modules.push(ModuleSpec {
            namespace: namespace.clone(),
            source_file: cha_type.source_file.clone().filter(|f| !f.is_empty()),
            metadata: serde_json::json!({
                "superClasses": cha_type.super_classes,
                "superInterfaces": cha_type.super_interfaces,
            }),
            methods: specs,
        });
    }

    Ok((modules, methods))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> ArcValidator {
        ArcValidator::new("p")
    }

    fn record(external: &str) -> ExtendedCallGraph {
        let text = format!(
            r#"{{
                "product": "p", "forge": "mvn", "version": "1.0.0", "generator": "G",
                "timestamp": 100, "depset": [],
                "cha": {{
                    "/ns/C": {{"methods": {{"1": "/ns/C.m()V", "2": "/ns/C.n()V"}},
                              "superClasses": ["/java.lang/Object"], "superInterfaces": []}}
                }},
                "graph": {{"internalCalls": [[1, 2], [2, 9]],
                          "externalCalls": [["1", {external:?}, {{"invokestatic": "1"}}]]}}
            }}"#
        );
        ExtendedCallGraph::from_json(&text).unwrap()
    }

    #[test]
    fn accepts_internal_and_external_nodes() {
        let v = validator();
        assert!(v.check_node("/ns/C.m()V", NodePosition::Source).is_ok());
        assert!(v.check_node("//dep/ns/X.y()V", NodePosition::Target).is_ok());
        assert!(v.check_node("/ns/C.field", NodePosition::Target).is_ok());
    }

    #[test]
    fn rule_scheme() {
        assert_eq!(
            validator().check_node("fasten:/ns/C.m()V", NodePosition::Target),
            Err(ArcRejection::HasScheme)
        );
    }

    #[test]
    fn rule_canonical() {
        assert_eq!(
            validator().check_node("/ns/C.m()%2fVoid", NodePosition::Target),
            Err(ArcRejection::NotCanonical)
        );
        assert_eq!(
            validator().check_node("/ns/./C.m()V", NodePosition::Target),
            Err(ArcRejection::NotCanonical)
        );
    }

    #[test]
    fn rule_forge_or_version() {
        let v = validator();
        assert_eq!(
            v.check_node("//mvn!dep/ns/X.y()V", NodePosition::Target),
            Err(ArcRejection::HasForgeOrVersion)
        );
        assert_eq!(
            v.check_node("//dep$1.0/ns/X.y()V", NodePosition::Target),
            Err(ArcRejection::HasForgeOrVersion)
        );
    }

    #[test]
    fn rule_self_product() {
        assert_eq!(
            validator().check_node("//p/ns/C.m()V", NodePosition::Target),
            Err(ArcRejection::SelfProduct)
        );
    }

    #[test]
    fn rule_external_only_as_target() {
        let v = validator();
        assert_eq!(
            v.check_node("//dep/ns/X.y()V", NodePosition::Source),
            Err(ArcRejection::ExternalSource)
        );
        assert_eq!(
            v.check_arc("//dep/ns/X.y()V", "/ns/C.m()V"),
            Err(ArcRejection::ExternalSource)
        );
        assert!(v.check_arc("/ns/C.m()V", "//dep/ns/X.y()V").is_ok());
    }

    #[test]
    fn rule_namespace() {
        assert_eq!(
            validator().check_node("/C.m()V", NodePosition::Target),
            Err(ArcRejection::MissingNamespace)
        );
    }

    #[test]
    fn rule_callable() {
        let v = validator();
        assert_eq!(
            v.check_node("/java.lang/Object", NodePosition::Target),
            Err(ArcRejection::NotCallable)
        );
        assert_eq!(
            v.check_node("//dep/ns/", NodePosition::Target),
            Err(ArcRejection::NotCallable)
        );
    }

    #[test]
    fn malformed_address() {
        assert_eq!(
            validator().check_node("/ns/C.m(%zz)V", NodePosition::Target),
            Err(ArcRejection::Malformed)
        );
        assert_eq!(
            validator().check_node("ns/C.m()V", NodePosition::Target),
            Err(ArcRejection::Malformed)
        );
    }

    #[test]
    fn first_failing_rule_wins() {
        // Scheme and a self product: the scheme rule comes first.
        assert_eq!(
            validator().check_node("fasten://p/ns/C.m()V", NodePosition::Source),
            Err(ArcRejection::HasScheme)
        );
    }

    #[test]
    fn validate_counts_arcs() {
        let graph = validate(&record("//dep/ns/X.y()V")).unwrap();
        assert_eq!(graph.internal_arcs.len(), 1);
        assert_eq!(graph.external_arcs.len(), 1);
        assert_eq!(graph.report.total, 3);
        assert_eq!(graph.report.accepted, 2);
        assert_eq!(graph.report.rejected[&ArcRejection::UnknownLocalId], 1);
        assert_eq!(graph.modules[0].metadata["superClasses"][0], "/java.lang/Object");
        assert_eq!(graph.method_count(), 2);
        assert_eq!(graph.timestamp_millis, Some(100_000));
    }

    #[test]
    fn self_product_target_is_dropped() {
        let graph = validate(&record("//p/ns/C.m()V")).unwrap();
        assert!(graph.external_arcs.is_empty());
        assert_eq!(graph.report.rejected[&ArcRejection::SelfProduct], 1);
    }

    #[test]
    fn schemed_target_is_dropped() {
        let graph = validate(&record("fasten://dep/ns/X.y()V")).unwrap();
        assert!(graph.external_arcs.is_empty());
        assert_eq!(graph.report.rejected[&ArcRejection::HasScheme], 1);
    }

    #[test]
    fn duplicate_local_id_fails_record() {
        let mut cg = record("//dep/ns/X.y()V");
        let mut other = cg.cha["/ns/C"].clone();
        other.methods = [("1".to_string(), "/ns/D.m()V".to_string())].into();
        cg.cha.insert("/ns/D".into(), other);
        assert!(matches!(
            validate(&cg),
            Err(GraphError::DuplicateLocalId(LocalId(1)))
        ));
    }

    #[test]
    fn bad_method_key_fails_record() {
        let mut cg = record("//dep/ns/X.y()V");
        cg.cha
            .get_mut("/ns/C")
            .unwrap()
            .methods
            .insert("one".into(), "/ns/C.o()V".into());
        assert!(matches!(validate(&cg), Err(GraphError::InvalidLocalId(_))));
    }

    #[test]
    fn report_merge_adds_counts() {
        let mut a = ArcReport::default();
        a.accept();
        a.reject(ArcRejection::NotCallable);
        let mut b = ArcReport::default();
        b.reject(ArcRejection::NotCallable);
        a.merge(&b);
        assert_eq!(a.total, 3);
        assert_eq!(a.accepted, 1);
        assert_eq!(a.rejected_count(), 2);
    }
}
