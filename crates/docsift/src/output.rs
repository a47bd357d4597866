use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use docsift_core::{write_atomic, PipelineError, Result};
use serde::Serialize;

const FENCE: &str = "---";

/// Provenance written as YAML front matter above every output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Provenance {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    pub prompt_system: String,
    pub prompt_user: String,
    pub provider: String,
    pub model: String,
    pub prompt_hash: String,
    pub chunks: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub generated_at: String,
}

impl Provenance {
    pub fn stamp(now: DateTime<Utc>) -> String {
        now.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

pub fn render(provenance: &Provenance, body: &str) -> Result<String> {
    let header = front_matter(provenance)?;
    Ok(format!("{FENCE}\n{header}{FENCE}\n\n{}\n", body.trim_end()))
}

fn front_matter<T: Serialize>(value: &T) -> Result<String> {
    serde_yaml::to_string(value)
        .map_err(|e| PipelineError::Serialize(format!("front matter: {e}")))
}

pub fn write_output(path: &Path, provenance: &Provenance, body: &str) -> Result<()> {
    let text = render(provenance, body)?;
    write_atomic(path, text.as_bytes())
}

/// Body of a document with any leading front matter removed, so earlier
/// outputs can be fed back in without their headers.
pub fn strip_front_matter(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("---\n") else {
        return text;
    };
    match rest.find("\n---\n") {
        Some(end) => rest[end + 5..].trim_start_matches('\n'),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provenance() -> Provenance {
        Provenance {
            source: Some("docs/a.md".into()),
            sources: Vec::new(),
            prompt_system: "builtin".into(),
            prompt_user: "prompts/user.md".into(),
            provider: "local".into(),
            model: "local".into(),
            prompt_hash: "abc".into(),
            chunks: 3,
            prompt_tokens: 120,
            completion_tokens: 40,
            generated_at: "2024-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn front_matter_precedes_body_and_strips_cleanly() {
        let text = render(&provenance(), "Findings.\n\n").unwrap();
        assert!(text.starts_with("---\nsource: docs/a.md\n"));
        assert!(text.contains("chunks: 3\n"));
        assert!(!text.contains("sources:"));
        assert!(text.ends_with("---\n\nFindings.\n"));
        assert_eq!(strip_front_matter(&text), "Findings.\n");
    }

    #[test]
    fn plain_text_is_left_alone() {
        assert_eq!(strip_front_matter("no header"), "no header");
        assert_eq!(strip_front_matter("---\nunterminated"), "---\nunterminated");
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> std::result::Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("refused"))
        }
    }

    #[test]
    fn yaml_failure_is_a_serialization_error() {
        let err = front_matter(&Unserializable).unwrap_err();
        assert!(matches!(err, PipelineError::Serialize(ref msg) if msg.contains("refused")));
        assert_eq!(err.kind(), docsift_core::ErrorKind::Other);
    }

    #[test]
    fn write_output_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.md");
        write_output(&path, &provenance(), "body").unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(strip_front_matter(&written), "body\n");
    }
}
