use thiserror::Error;

#[derive(Debug, Error)]
pub enum LatchError {
    #[error("not a latch repository (run `latch init` first)")]
    NotInitialized,

    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("registry busy: could not lock '{0}' in time")]
    RegistryBusy(String),

    #[error("registry corrupt: '{0}': {1}")]
    RegistryCorrupt(String, String),

    #[error("invalid path '{0}': {1}")]
    InvalidPath(String, String),

    #[error("invalid hook input: {0}")]
    InvalidHookInput(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl LatchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::RegistryUnavailable(_) => "registry_unavailable",
            Self::RegistryBusy(_) => "registry_busy",
            Self::RegistryCorrupt(_, _) => "registry_corrupt",
            Self::InvalidPath(_, _) => "invalid_path",
            Self::InvalidHookInput(_) => "invalid_hook_input",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, LatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_snake_case() {
        assert_eq!(LatchError::NotInitialized.code(), "not_initialized");
        assert_eq!(
            LatchError::RegistryBusy("r.lock".into()).code(),
            "registry_busy"
        );
        assert_eq!(
            LatchError::RegistryCorrupt("r.json".into(), "eof".into()).code(),
            "registry_corrupt"
        );
    }

    #[test]
    fn io_errors_convert() {
        let err: LatchError = std::io::Error::other("boom").into();
        assert_eq!(err.code(), "io_error");
        assert!(err.to_string().contains("boom"));
    }
}
