//! Evaluation results.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::HostError;

/// Shape the caller wants the host to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// A JSON-compatible structured value.
    #[default]
    Structured,
    /// The value serialized to raw bytes by the host.
    Raw,
}

/// Why the host rejected the submitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The code did not parse.
    Parse,
    /// The code raised an error while running.
    Runtime,
}

/// Outcome of an evaluation.
///
/// Exactly one shape is ever populated.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationResult {
    Structured(Value),
    Raw(Vec<u8>),
    Error {
        message: String,
        category: ErrorCategory,
    },
}

impl EvaluationResult {
    /// True when the host reported an error.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Turn an error result into [`HostError::Evaluation`].
    ///
    /// # Errors
    /// Returns the evaluation error when this result is [`EvaluationResult::Error`].
    pub fn into_success(self) -> Result<Self, HostError> {
        match self {
            Self::Error { message, .. } => Err(HostError::Evaluation { message }),
            other => Ok(other),
        }
    }

    /// Coerce a structured result into `T`.
    ///
    /// # Errors
    /// Returns [`HostError::Evaluation`] for error results and
    /// [`HostError::Format`] when the value is raw or does not fit `T`.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T, HostError> {
        match self {
            Self::Structured(value) => serde_json::from_value(value)
                .map_err(|e| HostError::Format(format!("cannot convert value: {e}"))),
            Self::Raw(_) => Err(HostError::Format(
                "expected a structured value, got raw bytes".to_string(),
            )),
            Self::Error { message, .. } => Err(HostError::Evaluation { message }),
        }
    }
}

/// Column-oriented table returned by table fetches.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl DataTable {
    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of the named column, top to bottom.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let index = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().filter_map(|row| row.get(index)).collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_into_typed() {
        let value: i64 = EvaluationResult::Structured(json!(2)).into_typed().unwrap();
        assert_eq!(value, 2);

        let err = EvaluationResult::Structured(json!("two"))
            .into_typed::<i64>()
            .unwrap_err();
        assert!(matches!(err, HostError::Format(_)));

        let err = EvaluationResult::Raw(vec![1])
            .into_typed::<i64>()
            .unwrap_err();
        assert!(matches!(err, HostError::Format(_)));

        let err = EvaluationResult::Error {
            message: "x".to_string(),
            category: ErrorCategory::Runtime,
        }
        .into_typed::<i64>()
        .unwrap_err();
        assert!(matches!(err, HostError::Evaluation { message } if message == "x"));
    }

    #[test]
    fn test_table_column() {
        let table: DataTable = serde_json::from_value(json!({
            "columns": ["a", "b"],
            "rows": [[1, "x"], [2, "y"]]
        }))
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.column("b").unwrap(), vec![&json!("x"), &json!("y")]);
        assert!(table.column("c").is_none());
    }
}
