//! Read-merge-write of JSON array files.

use std::{fs, path::Path};

use log::{info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::store::StoreResult;

/// Counts reported after an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub added: usize,
    pub total: usize,
}

/// Read an existing array file. Anything other than a readable JSON array
/// counts as an empty start.
pub fn load_existing(path: &Path) -> Vec<Value> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => {
            info!("{} not found, creating new file", path.display());
            return Vec::new();
        }
    };

    match serde_json::from_str::<Value>(&contents) {
        Ok(Value::Array(items)) => items,
        Ok(_) => {
            warn!("{} does not hold a JSON array; starting empty", path.display());
            Vec::new()
        }
        Err(err) => {
            warn!("{} is not valid JSON ({err}); starting empty", path.display());
            Vec::new()
        }
    }
}

/// Append `records` to the array stored at `path`.
pub fn append_records<T: Serialize>(path: &Path, records: &[T]) -> StoreResult<AppendOutcome> {
    let mut existing = load_existing(path);
    for record in records {
        existing.push(serde_json::to_value(record)?);
    }

    write_array(path, &existing)?;
    let outcome = AppendOutcome {
        added: records.len(),
        total: existing.len(),
    };
    info!(
        "saved {} new records to {} (total: {})",
        outcome.added,
        path.display(),
        outcome.total
    );
    Ok(outcome)
}

/// Overwrite `path` with a pretty-printed array.
pub fn write_array<T: Serialize>(path: &Path, records: &[T]) -> StoreResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(records)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_keeps_prior_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        fs::write(&path, r#"[{"a":1},{"a":2},{"a":3}]"#).unwrap();

        let outcome = append_records(&path, &[json!({"b": 1}), json!({"b": 2})]).unwrap();
        assert_eq!(outcome, AppendOutcome { added: 2, total: 5 });

        let stored = load_existing(&path);
        assert_eq!(stored.len(), 5);
        assert_eq!(stored[0], json!({"a": 1}));
        assert_eq!(stored[4], json!({"b": 2}));
    }

    #[test]
    fn test_append_to_missing_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output").join("data.json");

        let outcome = append_records(&path, &[json!(1)]).unwrap();
        assert_eq!(outcome.total, 1);
        assert!(path.exists());
    }

    #[test]
    fn test_corrupt_or_non_array_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let corrupt = dir.path().join("corrupt.json");
        fs::write(&corrupt, "[{").unwrap();
        assert_eq!(append_records(&corrupt, &[json!(1)]).unwrap().total, 1);

        let object = dir.path().join("object.json");
        fs::write(&object, r#"{"a": 1}"#).unwrap();
        assert_eq!(append_records(&object, &[json!(1), json!(2)]).unwrap().total, 2);
    }
}
