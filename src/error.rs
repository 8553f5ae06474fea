use thiserror::Error;

use crate::models::RegistryId;

/// A registry call that came back with a non-success status.
///
/// `status` is the HTTP status the session observed; `0` means the call never
/// produced one (serialization failure, local session error).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("registry call failed with status {status}: {body}")]
pub struct TransportError {
    pub status: u16,
    pub body: String,
}

impl TransportError {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(404, format!("not found: {what}"))
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("cyclic dependency detected at derived feature `{entry}`")]
    CyclicDependency { entry: String },

    #[error("unknown source kind `{kind}` on entity {entity}")]
    UnknownSourceKind { kind: String, entity: String },

    #[error("unrecognized transformation shape on entity {entity}")]
    UnknownTransformationShape { entity: String },

    #[error("entity {referenced_by} references {missing}, which is not in the payload")]
    DanglingReference {
        missing: RegistryId,
        referenced_by: String,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("registration of `{entity}` failed")]
    RegistrationFailed {
        entity: String,
        #[source]
        source: TransportError,
    },

    #[error("malformed attributes on entity {entity}")]
    MalformedEntity {
        entity: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("derived feature `{derived}` consumes `{input}`, which has no registry identifier")]
    UnresolvedInput { derived: String, input: String },

    #[error("source `{entity}` has option `{key}`, which collides with a source attribute")]
    ReservedOptionKey { entity: String, key: String },

    #[error("`{entity}` is already registered and can no longer be modified")]
    AlreadyRegistered { entity: String },

    #[error("invalid registry configuration: {reason}")]
    Config { reason: String },
}

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_failed_keeps_transport_source() {
        let err = RegistryError::RegistrationFailed {
            entity: "trip_distance".into(),
            source: TransportError::new(500, "boom"),
        };
        assert_eq!(err.to_string(), "registration of `trip_distance` failed");
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(
            source.as_deref(),
            Some("registry call failed with status 500: boom")
        );
    }

    #[test]
    fn transport_converts_transparently() {
        let err: RegistryError = TransportError::not_found("projects/p").into();
        assert_eq!(
            err.to_string(),
            "registry call failed with status 404: not found: projects/p"
        );
    }
}
