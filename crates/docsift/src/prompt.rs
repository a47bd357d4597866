use std::collections::BTreeMap;
use std::fs;

use docsift_core::{
    Chunk, CombinePrompt, CombineStep, GenerateRequest, PipelineError, PromptHasher, Result,
};

use crate::config::{PromptConfig, TemplateRef};

/// Bumped whenever request assembly changes in a way that alters prompts.
pub const PROMPT_FORMAT_VERSION: u32 = 1;

const DEFAULT_SYSTEM: &str =
    "You are a careful analyst. Base every statement on the provided material.";
const DEFAULT_USER: &str = "Analyze the document {source}.\n\n{content}";
const DEFAULT_COMBINE: &str = "The following are partial analyses of {source}. Merge them into \
one coherent analysis. Keep every distinct fact and drop repetition.\n\n{content}";

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub provider_id: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ModelSettings {
    pub fn request(&self, system_prompt: &str, prompt: String) -> GenerateRequest {
        GenerateRequest {
            prompt,
            system_prompt: system_prompt.to_string(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptBundle {
    pub system: String,
    pub user: String,
    pub combine: String,
    pub system_ref: String,
    pub user_ref: String,
    pub extra: BTreeMap<String, String>,
}

impl PromptBundle {
    /// Reads template files; a missing template falls back to the built-in one.
    pub fn load(config: &PromptConfig) -> Result<Self> {
        let (system, system_ref) = read_template(config.system.as_ref(), DEFAULT_SYSTEM)?;
        let (user, user_ref) = read_template(config.user.as_ref(), DEFAULT_USER)?;
        let (combine, _) = read_template(config.combine.as_ref(), DEFAULT_COMBINE)?;
        Ok(Self {
            system,
            user,
            combine,
            system_ref,
            user_ref,
            extra: config.extra.clone(),
        })
    }

    /// Hash material for the templates themselves; callers add model and
    /// chunking fields.
    pub fn hasher(&self) -> PromptHasher {
        let mut hasher = PromptHasher::new()
            .field("format_version", PROMPT_FORMAT_VERSION.to_string())
            .field("system", self.system.as_str())
            .field("user", self.user.as_str())
            .field("combine", self.combine.as_str());
        for (key, value) in &self.extra {
            hasher = hasher.field(format!("extra.{key}"), value.as_str());
        }
        hasher
    }

    pub fn render_user(&self, content: &str, source: &str, chunk: Option<&Chunk>) -> String {
        let (index, total) = chunk.map(|c| (c.index + 1, c.total)).unwrap_or((1, 1));
        let body = match chunk {
            Some(chunk) if chunk.total > 1 => {
                let mut framed = format!("[{}]", chunk.label());
                if let Some(context) = chunk.context_line() {
                    framed.push_str(" Section: ");
                    framed.push_str(&context);
                }
                framed.push_str("\n\n");
                framed.push_str(content);
                framed
            }
            _ => content.to_string(),
        };
        fill(&self.user, &self.vars(body, source, index, total))
    }

    pub fn render_combine(&self, content: &str, source: &str, step: &CombineStep) -> String {
        let prompt = fill(
            &self.combine,
            &self.vars(content.to_string(), source, step.batch + 1, step.batches),
        );
        if step.is_final {
            prompt
        } else {
            format!(
                "(Intermediate merge {} of {} at level {}; the result will be merged again.)\n\n{prompt}",
                step.batch + 1,
                step.batches,
                step.level
            )
        }
    }

    fn vars<'a>(
        &'a self,
        content: String,
        source: &str,
        index: usize,
        total: usize,
    ) -> Vec<(&'a str, String)> {
        let mut vars = vec![
            ("content", content),
            ("source", source.to_string()),
            ("chunk_index", index.to_string()),
            ("chunk_total", total.to_string()),
        ];
        vars.extend(
            self.extra
                .iter()
                .map(|(key, value)| (key.as_str(), value.clone())),
        );
        vars
    }
}

/// Renders combine requests for one source label.
pub struct CombineTemplate<'a> {
    pub prompts: &'a PromptBundle,
    pub model: &'a ModelSettings,
    pub source: &'a str,
}

impl CombinePrompt for CombineTemplate<'_> {
    fn render(&self, content: &str, step: &CombineStep) -> GenerateRequest {
        self.model.request(
            &self.prompts.system,
            self.prompts.render_combine(content, self.source, step),
        )
    }
}

fn read_template(template: Option<&TemplateRef>, fallback: &str) -> Result<(String, String)> {
    match template {
        None => Ok((fallback.to_string(), "builtin".to_string())),
        Some(TemplateRef::Inline(text)) => Ok((text.clone(), template_ref(template))),
        Some(TemplateRef::File { file }) => {
            let text = fs::read_to_string(file).map_err(|e| {
                PipelineError::Config(format!("prompt template {}: {e}", file.display()))
            })?;
            Ok((text, template_ref(template)))
        }
    }
}

fn template_ref(template: Option<&TemplateRef>) -> String {
    template
        .map(TemplateRef::reference)
        .unwrap_or_else(|| "builtin".to_string())
}

/// Single-pass `{name}` substitution. Unknown placeholders are left as they
/// are and substituted values are never rescanned. Templates without
/// `{content}` get the content appended.
fn fill(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut saw_content = false;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after.find('}').and_then(|close| {
            let name = &after[..close];
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(key, value)| (close, *key, value))
        });
        match value {
            Some((close, key, value)) => {
                saw_content |= key == "content";
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    if !saw_content {
        if let Some((_, content)) = vars.iter().find(|(key, _)| *key == "content") {
            out.push_str("\n\n");
            out.push_str(content);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(user: &str) -> PromptBundle {
        let mut config = PromptConfig::default();
        config.user = Some(TemplateRef::Inline(user.to_string()));
        config.extra.insert("audience".into(), "legal".into());
        PromptBundle::load(&config).unwrap()
    }

    #[test]
    fn placeholders_are_filled_once() {
        let prompts = bundle("For {audience}: summarize {source} ({chunk_index}/{chunk_total}) {unknown}\n{content}");
        let out = prompts.render_user("body mentions {source}", "a.md", None);
        assert_eq!(
            out,
            "For legal: summarize a.md (1/1) {unknown}\nbody mentions {source}"
        );
    }

    #[test]
    fn content_is_appended_when_template_omits_it() {
        let prompts = bundle("Summarize.");
        assert_eq!(prompts.render_user("text", "a.md", None), "Summarize.\n\ntext");
    }

    #[test]
    fn chunk_prompts_carry_label_and_section() {
        let prompts = bundle("{content}");
        let chunk = Chunk {
            index: 1,
            total: 3,
            header_path: vec!["# Report".into(), "## Risks".into()],
            text: "risk text".into(),
        };
        let out = prompts.render_user(&chunk.text, "a.md", Some(&chunk));
        assert_eq!(out, "[Part 2 of 3] Section: # Report > ## Risks\n\nrisk text");
    }

    #[test]
    fn hash_tracks_templates_and_extras() {
        let a = bundle("{content}").hasher().finish();
        let b = bundle("Summarize {content}").hasher().finish();
        let mut c = bundle("{content}");
        c.extra.insert("audience".into(), "sales".into());
        assert_ne!(a, b);
        assert_ne!(a, c.hasher().finish());
        assert_eq!(a, bundle("{content}").hasher().finish());
    }

    #[test]
    fn intermediate_combine_steps_are_marked() {
        let prompts = bundle("{content}");
        let step = CombineStep {
            level: 1,
            batch: 0,
            batches: 2,
            is_final: false,
        };
        let out = prompts.render_combine("parts", "a.md", &step);
        assert!(out.starts_with("(Intermediate merge 1 of 2 at level 1"));
        let last = CombineStep {
            is_final: true,
            ..step
        };
        assert!(prompts.render_combine("parts", "a.md", &last).contains("partial analyses of a.md"));
    }

    #[test]
    fn missing_template_file_is_a_config_error() {
        let mut config = PromptConfig::default();
        config.system = Some(TemplateRef::File {
            file: "/definitely/not/here.md".into(),
        });
        assert!(matches!(
            PromptBundle::load(&config),
            Err(PipelineError::Config(_))
        ));
    }
}
