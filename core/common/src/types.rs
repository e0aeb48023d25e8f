//! Common types used throughout hybridsync.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A row as seen by both stores: a JSON object keyed by column name.
pub type Record = Map<String, Value>;

/// Stringified `id` column of a record, if present.
///
/// String ids are returned as-is; numeric ids are rendered in decimal.
pub fn record_id(record: &Record) -> Option<String> {
    record.get("id").and_then(value_key)
}

/// Render a scalar JSON value as a key string.
pub fn value_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Identifier of the tenant (shop) a mutation belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShopId(String);

impl ShopId {
    /// Shop used when a mutation carries no tenant information.
    pub const DEFAULT: &'static str = "default";

    /// Create a new ShopId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty or only whitespace
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "ShopId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// The shop used for untagged mutations.
    pub fn default_shop() -> Self {
        Self(Self::DEFAULT.to_string())
    }

    /// Resolve the owning shop of a record from its `shop_id` or `shopId`
    /// column. Numeric ids are accepted and stringified.
    pub fn from_record(record: &Record) -> Option<Self> {
        ["shop_id", "shopId"]
            .iter()
            .filter_map(|key| record.get(*key))
            .find_map(|value| value_key(value).and_then(|key| Self::new(key).ok()))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a table in the local and remote stores.
///
/// Restricted to ASCII alphanumerics and underscores so it can be embedded in
/// SQL parameters and URL paths without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
    /// Create a validated table name.
    ///
    /// # Errors
    /// - Returns error if the name is empty or contains other characters than
    ///   `[A-Za-z0-9_]`
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Table name cannot be empty".to_string(),
            ));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(crate::Error::InvalidInput(format!(
                "Invalid table name: {}",
                name
            )));
        }
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TableName {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Equality predicate over top-level record columns.
///
/// An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFilter(BTreeMap<String, Value>);

impl RecordFilter {
    /// Create an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter on a single `id` column.
    pub fn by_id(id: impl Into<Value>) -> Self {
        Self::new().eq("id", id)
    }

    /// Add an equality constraint.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    /// Build a filter from a JSON object.
    ///
    /// # Errors
    /// - Returns error if `value` is not an object
    pub fn from_json(value: Value) -> crate::Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map.into_iter().collect())),
            other => Err(crate::Error::InvalidInput(format!(
                "Filter must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Value constrained for a column, if any.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Iterate over the constraints in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Check whether the filter has no constraints.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check whether a record satisfies every constraint.
    pub fn matches(&self, record: &Record) -> bool {
        self.0
            .iter()
            .all(|(column, expected)| record.get(column) == Some(expected))
    }
}

impl fmt::Display for RecordFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(column, value)| format!("{}={}", column, value))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_shop_id_creation() {
        let id = ShopId::new("shop-1").unwrap();
        assert_eq!(id.as_str(), "shop-1");
        assert!(ShopId::new("  ").is_err());
    }

    #[test]
    fn test_shop_id_from_record() {
        let snake = record(json!({"id": "c1", "shop_id": "s1"}));
        let camel = record(json!({"id": "c1", "shopId": "s2"}));
        let numeric = record(json!({"shop_id": 42}));
        let missing = record(json!({"id": "c1"}));

        assert_eq!(ShopId::from_record(&snake).unwrap().as_str(), "s1");
        assert_eq!(ShopId::from_record(&camel).unwrap().as_str(), "s2");
        assert_eq!(ShopId::from_record(&numeric).unwrap().as_str(), "42");
        assert!(ShopId::from_record(&missing).is_none());
    }

    #[test]
    fn test_record_id() {
        assert_eq!(record_id(&record(json!({"id": "c1"}))).as_deref(), Some("c1"));
        assert_eq!(record_id(&record(json!({"id": 12}))).as_deref(), Some("12"));
        assert_eq!(record_id(&record(json!({"id": ""}))), None);
        assert_eq!(record_id(&record(json!({"name": "x"}))), None);
    }

    #[test]
    fn test_table_name_validation() {
        assert!(TableName::new("customers").is_ok());
        assert!(TableName::new("repair_orders2").is_ok());
        assert!(TableName::new("").is_err());
        assert!(TableName::new("customers; drop").is_err());
        assert!(TableName::new("a/b").is_err());
    }

    #[test]
    fn test_filter_matches() {
        let row = record(json!({"id": "c1", "shop_id": "s1", "name": "Ada"}));

        assert!(RecordFilter::new().matches(&row));
        assert!(RecordFilter::by_id("c1").matches(&row));
        assert!(RecordFilter::by_id("c1").eq("shop_id", "s1").matches(&row));
        assert!(!RecordFilter::by_id("c2").matches(&row));
        assert!(!RecordFilter::new().eq("missing", 1).matches(&row));
    }

    #[test]
    fn test_filter_from_json() {
        let filter = RecordFilter::from_json(json!({"id": 7})).unwrap();
        assert_eq!(filter.get("id"), Some(&json!(7)));
        assert!(RecordFilter::from_json(json!([1, 2])).is_err());
    }

    proptest! {
        #[test]
        fn table_names_from_word_chars_are_accepted(name in "[A-Za-z0-9_]{1,32}") {
            prop_assert!(TableName::new(name).is_ok());
        }

        #[test]
        fn table_names_with_punctuation_are_rejected(
            prefix in "[a-z]{0,8}",
            bad in "[-./; '\"]",
            suffix in "[a-z]{0,8}",
        ) {
            let name = format!("{}{}{}", prefix, bad, suffix);
            prop_assert!(TableName::new(name).is_err());
        }
    }
}
