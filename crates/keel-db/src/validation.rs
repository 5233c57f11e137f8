//! Identifier validation for names that end up in dynamic SQL.
//!
//! Collection names become table and index names, so they are checked before
//! any statement is formatted with them.

use keel_core::{defaults, Error, Result};

/// Suffixes of index names derived from a collection name.
const DERIVED_SUFFIXES: &[&str] = &["_ann", "_ann_next", "_payload"];

/// Names rejected even though they are syntactically valid identifiers.
const RESERVED_NAMES: &[&str] = &[
    "select", "insert", "update", "delete", "drop", "create", "alter", "table", "index",
    "vector", "public", "user",
];

/// Validate a vector collection name.
///
/// Names must:
/// - Not be empty or longer than [`defaults::COLLECTION_NAME_MAX_LEN`]
/// - Start with a lowercase ASCII letter
/// - Contain only lowercase ASCII letters, digits and underscores
/// - Not start with `pg_` or be a reserved word
/// - Not end in a suffix used for the collection's own indexes
///
/// # Examples
///
/// ```
/// use keel_db::validate_collection_name;
///
/// assert!(validate_collection_name("documents").is_ok());
/// assert!(validate_collection_name("docs_v2").is_ok());
/// assert!(validate_collection_name("2docs").is_err());
/// assert!(validate_collection_name("Docs").is_err());
/// ```
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput(
            "Collection name cannot be empty".to_string(),
        ));
    }

    if name.len() > defaults::COLLECTION_NAME_MAX_LEN {
        return Err(Error::InvalidInput(format!(
            "Collection name exceeds {} character limit: {} characters",
            defaults::COLLECTION_NAME_MAX_LEN,
            name.len()
        )));
    }

    if let Some(first) = name.chars().next() {
        if !first.is_ascii_lowercase() {
            return Err(Error::InvalidInput(format!(
                "Collection name must start with a lowercase letter, found: '{}'",
                first
            )));
        }
    }

    if let Some(ch) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
    {
        return Err(Error::InvalidInput(format!(
            "Collection name contains invalid character: '{}'. Only a-z, 0-9 and underscore allowed",
            ch
        )));
    }

    if name.starts_with("pg_") || RESERVED_NAMES.contains(&name) {
        return Err(Error::InvalidInput(format!(
            "Collection name is reserved: {}",
            name
        )));
    }

    // Tables and indexes share one namespace in the vector schema.
    if let Some(suffix) = DERIVED_SUFFIXES.iter().find(|s| name.ends_with(**s)) {
        return Err(Error::InvalidInput(format!(
            "Collection name cannot end with '{}'",
            suffix
        )));
    }

    Ok(())
}

/// Fully qualified table name of a collection. `name` must be validated.
pub(crate) fn collection_table(name: &str) -> String {
    format!("{}.{}", defaults::VECTOR_SCHEMA, name)
}

/// Unqualified name of the collection's approximate index.
pub(crate) fn collection_index(name: &str) -> String {
    format!("{}_ann", name)
}

/// Name used while a replacement index is built.
pub(crate) fn collection_index_next(name: &str) -> String {
    format!("{}_ann_next", name)
}
