// Identifier validation
//
// Plugin, device and entity ids double as path segments in the persisted
// layout, so they are restricted to path-safe values.

/// Validation failure for inbound documents and identifiers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{kind} id must not be empty")]
    EmptyId { kind: &'static str },

    #[error("{kind} id {id:?} contains forbidden characters")]
    UnsafeId { kind: &'static str, id: String },

    #[error("entity payload targets device {payload:?} but was addressed to {path:?}")]
    DeviceMismatch { payload: String, path: String },

    #[error("command payload must be a JSON object")]
    PayloadNotObject,

    #[error("command \"type\" must be a non-empty string")]
    InvalidCommandType,

    #[error("malformed document: {0}")]
    Malformed(String),
}

/// Check that an identifier is non-empty and safe to use as a path segment
pub fn validate_id(kind: &'static str, id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::EmptyId { kind });
    }

    let unsafe_id = id.starts_with('.')
        || id.contains("..")
        || id.chars().any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control());

    if unsafe_id {
        return Err(ValidationError::UnsafeId {
            kind,
            id: id.to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_ids() {
        assert!(validate_id("device", "dev-1").is_ok());
        assert!(validate_id("entity", "system.cpu_0").is_ok());
        assert!(validate_id("plugin", "plugin-test-clean").is_ok());
    }

    #[test]
    fn rejects_empty_and_traversal() {
        assert_eq!(
            validate_id("device", ""),
            Err(ValidationError::EmptyId { kind: "device" })
        );
        assert!(validate_id("device", "../etc").is_err());
        assert!(validate_id("device", "a/b").is_err());
        assert!(validate_id("device", ".hidden").is_err());
        assert!(validate_id("device", "a\\b").is_err());
    }
}
