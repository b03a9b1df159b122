//! Path schema: an ordered, conflict-checked trie over dotted field
//! paths, each leaf holding an encryption policy.
//!
//! Two segment names are special: `"$"` marks "each element of the
//! array at this path" and `"*"` marks "any sub-key not otherwise
//! matched". A schema is built once from a flat (dotted) and/or nested
//! configuration, is immutable afterwards, and is replaced wholesale on
//! reconfiguration.
//!
//! Construction rejects any two configured paths standing in a dotted
//! prefix relationship (configuring both `"a"` and `"a.b"` is a
//! contradiction: the first claims the whole subdocument, the second a
//! field inside it).

use crate::config::{CallContext, FieldOptions, Operation};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Segment name matching each element of an array value.
pub const ARRAY_MARKER: &str = "$";

/// Segment name matching any sub-key not otherwise matched.
pub const WILDCARD: &str = "*";

/// Per-field resolver: decides at call time whether (and how) a field
/// is encrypted for the triggering operation.
///
/// Resolvers must be pure functions of the call-site context and cheap
/// enough to invoke at high frequency; memoize external lookups on the
/// caller's side.
pub type FieldResolver =
    dyn Fn(Operation, &CallContext<'_>) -> Result<Option<FieldOptions>> + Send + Sync;

/// A user-supplied schema entry.
#[derive(Clone)]
pub enum FieldSpec {
    /// Field explicitly not encrypted.
    Disabled,
    /// Field encrypted with default options.
    Enabled,
    /// Field encrypted with static option overrides.
    Options(FieldOptions),
    /// Field encryption decided per call.
    Resolver(Arc<FieldResolver>),
    /// Nested sub-schema; equivalent to dotted paths through this key.
    Nested(BTreeMap<String, FieldSpec>),
}

impl FieldSpec {
    /// Wraps a resolver function.
    pub fn resolver<F>(resolver: F) -> Self
    where
        F: Fn(Operation, &CallContext<'_>) -> Result<Option<FieldOptions>>
            + Send
            + Sync
            + 'static,
    {
        Self::Resolver(Arc::new(resolver))
    }

    /// Wraps a nested sub-schema.
    #[must_use]
    pub fn nested(entries: impl IntoIterator<Item = (String, FieldSpec)>) -> Self {
        Self::Nested(entries.into_iter().collect())
    }
}

impl From<bool> for FieldSpec {
    fn from(enabled: bool) -> Self {
        if enabled {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

impl From<FieldOptions> for FieldSpec {
    fn from(options: FieldOptions) -> Self {
        Self::Options(options)
    }
}

impl fmt::Debug for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Enabled => f.write_str("Enabled"),
            Self::Options(options) => f.debug_tuple("Options").field(options).finish(),
            Self::Resolver(_) => f.write_str("Resolver(..)"),
            Self::Nested(map) => f.debug_tuple("Nested").field(map).finish(),
        }
    }
}

/// A leaf's encryption policy inside the built trie.
#[derive(Clone)]
pub enum LeafSpec {
    /// Explicitly disabled; resolves to no match.
    Disabled,
    /// Enabled with defaults; resolves to empty options.
    Enabled,
    /// Enabled with static overrides.
    Options(FieldOptions),
    /// Decided per call.
    Resolver(Arc<FieldResolver>),
}

impl LeafSpec {
    /// Converts this leaf to concrete options for one call.
    ///
    /// `Disabled` and a resolver returning `Ok(None)` are "no match".
    ///
    /// # Errors
    ///
    /// Propagates resolver failures.
    pub fn options(
        &self,
        operation: Operation,
        context: &CallContext<'_>,
    ) -> Result<Option<FieldOptions>> {
        match self {
            Self::Disabled => Ok(None),
            Self::Enabled => Ok(Some(FieldOptions::default())),
            Self::Options(options) => Ok(Some(options.clone())),
            Self::Resolver(resolver) => resolver(operation, context),
        }
    }
}

impl fmt::Debug for LeafSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Enabled => f.write_str("Enabled"),
            Self::Options(options) => f.debug_tuple("Options").field(options).finish(),
            Self::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

/// One node of the built trie: either a leaf policy or a sub-schema.
#[derive(Debug, Clone)]
pub enum SchemaNode {
    /// Terminal policy.
    Leaf(LeafSpec),
    /// Interior node with children.
    Branch(SchemaMap),
}

/// Children of an interior trie node, keyed by segment name.
#[derive(Debug, Clone, Default)]
pub struct SchemaMap {
    children: BTreeMap<String, SchemaNode>,
}

impl SchemaMap {
    /// Exact child lookup, no precedence rules.
    #[must_use]
    pub fn get(&self, segment: &str) -> Option<&SchemaNode> {
        self.children.get(segment)
    }

    /// Looks up a (possibly dotted) key with the full segment precedence:
    ///
    /// 1. an exact child named `key` wins outright;
    /// 2. an array-marker child matches any key except the wildcard
    ///    sentinel (covers both literal `$` access and integer indices);
    /// 3. a wildcard child matches any key except the array sentinel;
    /// 4. otherwise the key is split at its first `.` and resolution
    ///    descends through an exact child for the head segment;
    /// 5. a single unmatched segment yields no match.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<&SchemaNode> {
        if let Some(node) = self.children.get(key) {
            return Some(node);
        }
        if key != WILDCARD {
            if let Some(node) = self.children.get(ARRAY_MARKER) {
                return Some(node);
            }
        }
        if key != ARRAY_MARKER {
            if let Some(node) = self.children.get(WILDCARD) {
                return Some(node);
            }
        }
        let (head, rest) = key.split_once('.')?;
        match self.children.get(head)? {
            SchemaNode::Branch(sub) => sub.lookup(rest),
            leaf @ SchemaNode::Leaf(_) => Some(leaf),
        }
    }

    fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Dotted path of the first leaf below this node, for conflict
    /// diagnostics.
    fn first_leaf_path(&self) -> String {
        let mut segments = Vec::new();
        let mut current = self;
        loop {
            let Some((segment, node)) = current.children.iter().next() else {
                break;
            };
            segments.push(segment.as_str());
            match node {
                SchemaNode::Leaf(_) => break,
                SchemaNode::Branch(sub) => current = sub,
            }
        }
        segments.join(".")
    }
}

/// A built, immutable path schema.
#[derive(Debug, Clone, Default)]
pub struct FieldSchema {
    root: SchemaMap,
}

impl FieldSchema {
    /// Builds a schema from `(path, spec)` entries.
    ///
    /// Paths are dotted; `FieldSpec::Nested` entries are equivalent to
    /// spelling the nested keys out with dots.
    ///
    /// # Errors
    ///
    /// - [`Error::SchemaConflict`] when one configured path is a dotted
    ///   prefix of another;
    /// - [`Error::DuplicatePath`] when the same path appears twice;
    /// - [`Error::InvalidPath`] for empty paths or segments.
    pub fn build<K, I>(entries: I) -> Result<Self>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, FieldSpec)>,
    {
        let mut root = SchemaMap::default();
        for (path, spec) in entries {
            insert_spec(&mut root, &path.into(), spec)?;
        }
        Ok(Self { root })
    }

    /// Whether the schema has no configured paths.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// The root of the trie, for walkers.
    #[must_use]
    pub fn root(&self) -> &SchemaMap {
        &self.root
    }

    /// Resolves a fully-qualified dotted path to concrete encryption
    /// options, or to no match.
    ///
    /// A `Branch` at the end of the path never resolves: configuring
    /// `"object.*"` makes sub-keys of `object` resolve, not `object`
    /// itself.
    ///
    /// # Errors
    ///
    /// Propagates field-resolver failures.
    pub fn resolve(
        &self,
        path: &str,
        operation: Operation,
        context: &CallContext<'_>,
    ) -> Result<Option<FieldOptions>> {
        match self.root.lookup(path) {
            Some(SchemaNode::Leaf(leaf)) => leaf.options(operation, context),
            Some(SchemaNode::Branch(_)) | None => Ok(None),
        }
    }
}

fn insert_spec(root: &mut SchemaMap, path: &str, spec: FieldSpec) -> Result<()> {
    match spec {
        FieldSpec::Nested(entries) => {
            for (key, sub) in entries {
                insert_spec(root, &format!("{path}.{key}"), sub)?;
            }
            Ok(())
        }
        FieldSpec::Disabled => insert_leaf(root, path, LeafSpec::Disabled),
        FieldSpec::Enabled => insert_leaf(root, path, LeafSpec::Enabled),
        FieldSpec::Options(options) => insert_leaf(root, path, LeafSpec::Options(options)),
        FieldSpec::Resolver(resolver) => insert_leaf(root, path, LeafSpec::Resolver(resolver)),
    }
}

fn insert_leaf(root: &mut SchemaMap, path: &str, leaf: LeafSpec) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    if path.is_empty() || segments.iter().any(|segment| segment.is_empty()) {
        return Err(Error::InvalidPath(path.to_string()));
    }
    insert_segments(root, path, &segments, leaf)
}

fn insert_segments(
    map: &mut SchemaMap,
    full_path: &str,
    segments: &[&str],
    leaf: LeafSpec,
) -> Result<()> {
    let segment = segments[0];
    if segments.len() == 1 {
        return match map.children.get(segment) {
            Some(SchemaNode::Branch(sub)) => Err(Error::SchemaConflict {
                shorter: full_path.to_string(),
                longer: format!("{full_path}.{}", sub.first_leaf_path()),
            }),
            Some(SchemaNode::Leaf(_)) => Err(Error::DuplicatePath(full_path.to_string())),
            None => {
                map.children.insert(segment.to_string(), SchemaNode::Leaf(leaf));
                Ok(())
            }
        };
    }

    let node = map
        .children
        .entry(segment.to_string())
        .or_insert_with(|| SchemaNode::Branch(SchemaMap::default()));
    match node {
        SchemaNode::Branch(sub) => insert_segments(sub, full_path, &segments[1..], leaf),
        SchemaNode::Leaf(_) => {
            let consumed = full_path.split('.').count() - segments.len() + 1;
            let shorter: Vec<&str> = full_path.split('.').take(consumed).collect();
            Err(Error::SchemaConflict {
                shorter: shorter.join("."),
                longer: full_path.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Algorithm;

    fn ctx() -> CallContext<'static> {
        CallContext::default()
    }

    fn resolve(schema: &FieldSchema, path: &str) -> Option<FieldOptions> {
        schema.resolve(path, Operation::Find, &ctx()).unwrap()
    }

    #[test]
    fn test_exact_path_resolves() {
        let schema = FieldSchema::build([("ssn", FieldSpec::Enabled)]).unwrap();
        assert_eq!(resolve(&schema, "ssn"), Some(FieldOptions::default()));
        assert_eq!(resolve(&schema, "other"), None);
    }

    #[test]
    fn test_nested_path_resolves() {
        let schema = FieldSchema::build([("profile.email", FieldSpec::Enabled)]).unwrap();
        assert!(resolve(&schema, "profile.email").is_some());
        // The interior node itself never resolves.
        assert_eq!(resolve(&schema, "profile"), None);
    }

    #[test]
    fn test_nested_spec_equivalent_to_dotted() {
        let nested = FieldSchema::build([(
            "profile",
            FieldSpec::nested([("email".to_string(), FieldSpec::Enabled)]),
        )])
        .unwrap();
        assert!(resolve(&nested, "profile.email").is_some());
    }

    #[test]
    fn test_array_marker_matches_indices() {
        let schema = FieldSchema::build([("array.$", FieldSpec::Enabled)]).unwrap();
        assert!(resolve(&schema, "array.$").is_some());
        assert!(resolve(&schema, "array.0").is_some());
        assert!(resolve(&schema, "array.17").is_some());
        // The array node itself never resolves.
        assert_eq!(resolve(&schema, "array"), None);
    }

    #[test]
    fn test_array_marker_rejects_wildcard_sentinel() {
        let schema = FieldSchema::build([("array.$", FieldSpec::Enabled)]).unwrap();
        assert_eq!(resolve(&schema, "array.*"), None);
    }

    #[test]
    fn test_wildcard_matches_unknown_keys() {
        let schema = FieldSchema::build([
            ("object.*", FieldSpec::Enabled),
            ("object.plain", FieldSpec::Disabled),
        ])
        .unwrap();
        assert!(resolve(&schema, "object.anything").is_some());
        // Exact match wins over the wildcard.
        assert_eq!(resolve(&schema, "object.plain"), None);
        // The object itself never resolves.
        assert_eq!(resolve(&schema, "object"), None);
    }

    #[test]
    fn test_wildcard_rejects_array_sentinel() {
        let schema = FieldSchema::build([("object.*", FieldSpec::Enabled)]).unwrap();
        assert_eq!(resolve(&schema, "object.$"), None);
    }

    #[test]
    fn test_prefix_conflict_shorter_first() {
        let err = FieldSchema::build([
            ("a", FieldSpec::Enabled),
            ("a.b", FieldSpec::Enabled),
        ])
        .unwrap_err();
        match err {
            Error::SchemaConflict { shorter, longer } => {
                assert_eq!(shorter, "a");
                assert_eq!(longer, "a.b");
            }
            other => panic!("expected SchemaConflict, got {other:?}"),
        }
    }

    #[test]
    fn test_prefix_conflict_longer_first() {
        let err = FieldSchema::build([
            ("a.b.c", FieldSpec::Enabled),
            ("a.b", FieldSpec::Enabled),
        ])
        .unwrap_err();
        match err {
            Error::SchemaConflict { shorter, longer } => {
                assert_eq!(shorter, "a.b");
                assert_eq!(longer, "a.b.c");
            }
            other => panic!("expected SchemaConflict, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let err = FieldSchema::build([
            ("a.b", FieldSpec::Enabled),
            ("a.b", FieldSpec::Disabled),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::DuplicatePath(path) if path == "a.b"));
    }

    #[test]
    fn test_sibling_paths_do_not_conflict() {
        let schema = FieldSchema::build([
            ("a.b", FieldSpec::Enabled),
            ("a.c", FieldSpec::Enabled),
            ("d", FieldSpec::Enabled),
        ])
        .unwrap();
        assert!(resolve(&schema, "a.b").is_some());
        assert!(resolve(&schema, "a.c").is_some());
        assert!(resolve(&schema, "d").is_some());
    }

    #[test]
    fn test_invalid_paths_rejected() {
        assert!(matches!(
            FieldSchema::build([("", FieldSpec::Enabled)]),
            Err(Error::InvalidPath(_))
        ));
        assert!(matches!(
            FieldSchema::build([("a..b", FieldSpec::Enabled)]),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn test_static_options_pass_through() {
        let options = FieldOptions::new()
            .with_key_alt_name("pii")
            .with_algorithm(Algorithm::Random);
        let schema =
            FieldSchema::build([("secret", FieldSpec::Options(options.clone()))]).unwrap();
        assert_eq!(resolve(&schema, "secret"), Some(options));
    }

    #[test]
    fn test_disabled_leaf_is_no_match() {
        let schema = FieldSchema::build([("plain", FieldSpec::Disabled)]).unwrap();
        assert_eq!(resolve(&schema, "plain"), None);
    }

    #[test]
    fn test_resolver_leaf_consulted_per_call() {
        let schema = FieldSchema::build([(
            "flexible",
            FieldSpec::resolver(|operation, _context| {
                Ok((operation == Operation::Insert).then(FieldOptions::default))
            }),
        )])
        .unwrap();

        assert!(schema
            .resolve("flexible", Operation::Insert, &ctx())
            .unwrap()
            .is_some());
        assert!(schema
            .resolve("flexible", Operation::Find, &ctx())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_resolver_error_propagates() {
        let schema = FieldSchema::build([(
            "flexible",
            FieldSpec::resolver(|_, _| Err(Error::resolution("lookup failed"))),
        )])
        .unwrap();
        let err = schema.resolve("flexible", Operation::Find, &ctx()).unwrap_err();
        assert!(matches!(err, Error::Resolution(_)));
    }

    #[test]
    fn test_empty_schema() {
        let schema = FieldSchema::build(Vec::<(String, FieldSpec)>::new()).unwrap();
        assert!(schema.is_empty());
        assert_eq!(resolve(&schema, "anything"), None);
    }
}
