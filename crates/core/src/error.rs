use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Provider,
    Io,
    Cancelled,
    Config,
    Other,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("provider error: {0}")]
    Provider(String),
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cancelled")]
    Cancelled,
    #[error("config error: {0}")]
    Config(String),
    #[error("serde json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("serialization error: {0}")]
    Serialize(String),
}

impl PipelineError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Provider(_) => ErrorKind::Provider,
            PipelineError::Io { .. } => ErrorKind::Io,
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::Json(_) | PipelineError::Tokenizer(_) | PipelineError::Serialize(_) => {
                ErrorKind::Other
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_separate_cancellation_from_failure() {
        assert_eq!(PipelineError::Cancelled.kind(), ErrorKind::Cancelled);
        assert!(PipelineError::Cancelled.is_cancelled());
        let err = PipelineError::Provider("empty response".into());
        assert_eq!(err.kind(), ErrorKind::Provider);
        assert!(!err.is_cancelled());
        let io = PipelineError::io(
            "missing.md",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(io.kind(), ErrorKind::Io);
        assert!(io.to_string().contains("missing.md"));
        let yaml = PipelineError::Serialize("bad map key".into());
        assert_eq!(yaml.kind(), ErrorKind::Other);
    }
}
