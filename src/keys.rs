//! Cache namespaces and key formatting
//!
//! Keys are stored as `{namespace}:{identifier}`, or just `{namespace}` for
//! singleton namespaces such as `state`.

use std::fmt;
use std::str::FromStr;

use crate::CacheError;

/// Identifier used for the cross-user insights aggregate
pub const GLOBAL_INSIGHTS_ID: &str = "global";

/// Shape of the value stored under a namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryShape {
    /// Ordered sequence of entities, each carrying an `id`
    List,
    /// A single object
    Scalar,
}

/// What the identifier of a namespace refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    User,
    ShareLink,
    Singleton,
}

/// A family of cache entries derived from the same source query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Collections,
    AutoCollects,
    UserStats,
    Insights,
    ShareLinks,
    State,
}

impl Namespace {
    pub const ALL: [Namespace; 6] = [
        Namespace::Collections,
        Namespace::AutoCollects,
        Namespace::UserStats,
        Namespace::Insights,
        Namespace::ShareLinks,
        Namespace::State,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Collections => "collections",
            Namespace::AutoCollects => "autoCollects",
            Namespace::UserStats => "userStats",
            Namespace::Insights => "insights",
            Namespace::ShareLinks => "shareLinks",
            Namespace::State => "state",
        }
    }

    pub fn shape(&self) -> EntryShape {
        match self {
            Namespace::Collections | Namespace::AutoCollects => EntryShape::List,
            _ => EntryShape::Scalar,
        }
    }

    pub fn identifier_kind(&self) -> IdentifierKind {
        match self {
            Namespace::ShareLinks => IdentifierKind::ShareLink,
            Namespace::State => IdentifierKind::Singleton,
            _ => IdentifierKind::User,
        }
    }

    pub fn is_singleton(&self) -> bool {
        self.identifier_kind() == IdentifierKind::Singleton
    }

    /// Prefix shared by every key in this namespace, used for namespace purges
    pub fn key_prefix(&self) -> String {
        format!("{}:", self.as_str())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Namespace::ALL
            .into_iter()
            .find(|ns| ns.as_str() == s)
            .ok_or_else(|| CacheError::InvalidKey(format!("unknown namespace '{}'", s)))
    }
}

/// Address of one cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: Namespace,
    id: Option<String>,
}

impl CacheKey {
    /// Key for a per-entity namespace (`collections:42`)
    pub fn entity(namespace: Namespace, id: impl Into<String>) -> Self {
        Self {
            namespace,
            id: Some(id.into()),
        }
    }

    /// Key for a singleton namespace (`state`)
    pub fn singleton(namespace: Namespace) -> Self {
        Self {
            namespace,
            id: None,
        }
    }

    /// Build a key from a namespace and an optional identifier
    pub fn new(namespace: Namespace, id: Option<String>) -> Self {
        Self { namespace, id }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Check that identifier presence matches the namespace
    pub fn validate(&self) -> Result<(), CacheError> {
        match (self.namespace.is_singleton(), self.id.as_deref()) {
            (true, None) => Ok(()),
            (true, Some(_)) => Err(CacheError::InvalidKey(format!(
                "namespace '{}' takes no identifier",
                self.namespace
            ))),
            (false, Some(id)) if !id.is_empty() => Ok(()),
            (false, _) => Err(CacheError::InvalidKey(format!(
                "namespace '{}' requires an identifier",
                self.namespace
            ))),
        }
    }

    /// Render the store key
    pub fn format_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{}", self.namespace, id),
            None => f.write_str(self.namespace.as_str()),
        }
    }
}

impl FromStr for CacheKey {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = match s.split_once(':') {
            Some((ns, id)) => CacheKey::entity(ns.parse()?, id),
            None => CacheKey::singleton(s.parse()?),
        };
        key.validate()?;
        Ok(key)
    }
}
