// Node results come back in one of two shapes: a plain ordered tuple of outputs,
// or a keyed mapping. Some keyed mappings carry their ordered payload under "result",
// next to UI-only entries.
//
// Note: older comments around this convention talk about a "results" key. The host
// only ever checks "result" (singular), so that's what we do too.

use std::collections::BTreeMap;

use thiserror::Error;

/// Fallback key for keyed results that wrap an ordered payload.
pub const RESULT_KEY: &str = "result";

#[derive(Debug, Clone, PartialEq)]
pub enum NodeResult<T> {
    /// Plain positional outputs.
    Sequence(Vec<T>),
    /// Keyed outputs, optionally wrapping a positional payload under `RESULT_KEY`.
    Mapping {
        entries: BTreeMap<usize, T>,
        result: Option<Vec<T>>,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OutputError {
    #[error("output index {index} out of range (node has {len} outputs)")]
    OutOfRange { index: usize, len: usize },
    #[error("no output with key {index}, and no \"{}\" fallback", RESULT_KEY)]
    MissingKey { index: usize },
}

impl<T> NodeResult<T> {
    /// A mapping that only holds a wrapped payload.
    pub fn wrapped(result: Vec<T>) -> Self {
        NodeResult::Mapping {
            entries: BTreeMap::new(),
            result: Some(result),
        }
    }
}

/// Returns the value at `index`, whatever shape the node result has.
///
/// Sequences are indexed directly. Mappings are looked up by key first, and only when
/// the key is missing do we fall back to indexing the "result" payload.
pub fn get_value_at_index<T>(container: &NodeResult<T>, index: usize) -> Result<&T, OutputError> {
    match container {
        NodeResult::Sequence(values) => values.get(index).ok_or(OutputError::OutOfRange {
            index,
            len: values.len(),
        }),
        NodeResult::Mapping { entries, result } => {
            if let Some(value) = entries.get(&index) {
                return Ok(value);
            }
            let result = result.as_ref().ok_or(OutputError::MissingKey { index })?;
            result.get(index).ok_or(OutputError::OutOfRange {
                index,
                len: result.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence() {
        let s = NodeResult::Sequence(vec!["model", "clip", "vae"]);
        assert_eq!(get_value_at_index(&s, 0), Ok(&"model"));
        assert_eq!(get_value_at_index(&s, 2), Ok(&"vae"));
        assert_eq!(
            get_value_at_index(&s, 3),
            Err(OutputError::OutOfRange { index: 3, len: 3 })
        );
    }

    #[test]
    fn test_mapping_direct_key_wins() {
        let m = NodeResult::Mapping {
            entries: BTreeMap::from([(0, "direct")]),
            result: Some(vec!["wrapped", "wrapped-1"]),
        };
        assert_eq!(get_value_at_index(&m, 0), Ok(&"direct"));
        assert_eq!(get_value_at_index(&m, 1), Ok(&"wrapped-1"));
    }

    #[test]
    fn test_result_fallback() {
        let m = NodeResult::wrapped(vec![10, 20, 30]);
        assert_eq!(get_value_at_index(&m, 1), Ok(&20));
        // Too short a payload is a range error, not a key error.
        assert_eq!(
            get_value_at_index(&m, 5),
            Err(OutputError::OutOfRange { index: 5, len: 3 })
        );
    }

    #[test]
    fn test_missing_key() {
        let m: NodeResult<u32> = NodeResult::Mapping {
            entries: BTreeMap::from([(1, 7)]),
            result: None,
        };
        assert_eq!(get_value_at_index(&m, 1), Ok(&7));
        assert_eq!(
            get_value_at_index(&m, 0),
            Err(OutputError::MissingKey { index: 0 })
        );
        assert_eq!(
            OutputError::MissingKey { index: 0 }.to_string(),
            "no output with key 0, and no \"result\" fallback"
        );
    }
}
