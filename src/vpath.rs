//! Virtual Path Resolution
//!
//! Database objects are addressed through a synthetic filesystem-like
//! namespace: `/database/{category}/{schema}/{name}[.sql]`. This module maps
//! those paths to object references and back.
//!
//! Resolution is a pure function of the path text. It never touches the
//! store; whether the referenced object actually exists is the caller's
//! problem when the reference is dereferenced. A malformed path resolves to
//! `None` rather than an error so callers can distinguish "no such object"
//! from failure.

use serde::{Deserialize, Serialize};

/// Object categories addressable through the virtual namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectCategory {
    /// Stored procedures (the only category with a read surface today)
    StoredProcedures,
    /// Views
    Views,
    /// Scalar and table-valued functions
    Functions,
    /// Tables
    Tables,
}

impl ObjectCategory {
    /// Get the path segment for this category
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StoredProcedures => "stored_procedures",
            Self::Views => "views",
            Self::Functions => "functions",
            Self::Tables => "tables",
        }
    }

    fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "stored_procedures" => Some(Self::StoredProcedures),
            "views" => Some(Self::Views),
            "functions" => Some(Self::Functions),
            "tables" => Some(Self::Tables),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A resolved reference to a database object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Object category
    pub category: ObjectCategory,
    /// Schema the object belongs to
    pub schema: String,
    /// Object name (without any `.sql` suffix)
    pub name: String,
}

impl ObjectRef {
    /// Create a stored-procedure reference
    pub fn stored_procedure(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self { category: ObjectCategory::StoredProcedures, schema: schema.into(), name: name.into() }
    }
}

/// Resolve a virtual path to an object reference
///
/// Grammar: `/database/{category}/{schema}/{name}[.sql]`. A trailing `.sql`
/// is accepted for any category. Unknown category, wrong segment count, or
/// an empty segment all resolve to `None`.
#[must_use]
pub fn resolve(path: &str) -> Option<ObjectRef> {
    let rest = path.strip_prefix("/database/")?;

    let mut segments = rest.split('/');
    let category = ObjectCategory::from_segment(segments.next()?)?;
    let schema = segments.next()?;
    let name = segments.next()?;
    if segments.next().is_some() {
        return None;
    }

    let name = name.strip_suffix(".sql").unwrap_or(name);
    if schema.is_empty() || name.is_empty() {
        return None;
    }

    Some(ObjectRef { category, schema: schema.to_string(), name: name.to_string() })
}

/// Render an object reference back to its canonical virtual path
///
/// Stored procedures carry the `.sql` suffix because their read surface
/// returns SQL text; other categories are addressed bare.
#[must_use]
pub fn to_path(obj: &ObjectRef) -> String {
    let suffix = match obj.category {
        ObjectCategory::StoredProcedures => ".sql",
        _ => "",
    };
    format!("/database/{}/{}/{}{suffix}", obj.category.as_str(), obj.schema, obj.name)
}
