use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("MetadataMissing: {0}")]
    MetadataMissing(String),

    #[error("ConfigError: {0}")]
    ConfigError(String),

    #[error("InvalidSpec: {0}")]
    InvalidSpec(String),

    #[error("AmbiguousBinding: found {count} {kind} objects in {namespace} labeled with NAC UUID {uuid}")]
    AmbiguousBinding {
        kind: String,
        namespace: String,
        uuid: String,
        count: usize,
    },

    #[error("ForeignEngineObject: {0}")]
    ForeignEngineObject(String),

    #[error("EngineObjectVanished: {0}")]
    EngineObjectVanished(String),

    #[error("SyncTargetMissing: {0}")]
    SyncTargetMissing(String),
}

impl Error {
    /// Terminal errors are not retried: the controller parks the object until
    /// its spec (or the cluster state the error points at) changes. The
    /// offending condition has already been written to the object's status by
    /// the reconciler step that returned the error.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::InvalidSpec(_)
                | Error::ForeignEngineObject(_)
                | Error::EngineObjectVanished(_)
                | Error::SyncTargetMissing(_)
        )
    }

    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError(_) => "kube",
            Error::SerializationError(_) => "serialization",
            Error::MetadataMissing(_) => "metadata_missing",
            Error::ConfigError(_) => "config",
            Error::InvalidSpec(_) => "invalid_spec",
            Error::AmbiguousBinding { .. } => "ambiguous_binding",
            Error::ForeignEngineObject(_) => "foreign_engine_object",
            Error::EngineObjectVanished(_) => "engine_object_vanished",
            Error::SyncTargetMissing(_) => "sync_target_missing",
        }
        .to_string()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(Error::InvalidSpec("bad".into()).is_terminal());
        assert!(Error::ForeignEngineObject("other".into()).is_terminal());
        assert!(Error::EngineObjectVanished("gone".into()).is_terminal());
        assert!(Error::SyncTargetMissing("none".into()).is_terminal());

        assert!(!Error::AmbiguousBinding {
            kind: "Backup".into(),
            namespace: "openshift-adp".into(),
            uuid: "abc".into(),
            count: 2,
        }
        .is_terminal());
        assert!(!Error::MetadataMissing("namespace".into()).is_terminal());
    }

    #[test]
    fn metric_labels_are_stable() {
        assert_eq!(Error::InvalidSpec("x".into()).metric_label(), "invalid_spec");
        assert_eq!(
            Error::AmbiguousBinding {
                kind: "Backup".into(),
                namespace: "ns".into(),
                uuid: "u".into(),
                count: 3,
            }
            .metric_label(),
            "ambiguous_binding"
        );
    }
}
