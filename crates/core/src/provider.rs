use crate::checksum::PromptHasher;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system_prompt: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerateRequest {
    /// Checksum of everything sent for this call; the checkpoint key material.
    pub fn input_checksum(&self) -> String {
        PromptHasher::new()
            .field("prompt", self.prompt.as_str())
            .field("system_prompt", self.system_prompt.as_str())
            .field("model", self.model.as_str())
            .field("temperature", format!("{:.4}", self.temperature))
            .field("max_tokens", self.max_tokens.to_string())
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub success: bool,
    pub content: String,
    pub error: Option<String>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Generation {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u32, completion_tokens: u32) -> Self {
        self.prompt_tokens = prompt_tokens;
        self.completion_tokens = completion_tokens;
        self
    }
}

/// The LLM collaborator. Implementations own their transport, timeouts and
/// retry policy; the pipeline only sees the final outcome of one call.
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    fn generate(&self, request: &GenerateRequest) -> Generation;
}

/// Calls the provider and turns `success = false` or blank content into a
/// [`PipelineError::Provider`].
pub fn generate_checked(provider: &dyn Provider, request: &GenerateRequest) -> Result<Generation> {
    let generation = provider.generate(request);
    if !generation.success {
        let reason = generation
            .error
            .unwrap_or_else(|| "provider reported failure".to_string());
        return Err(PipelineError::Provider(reason));
    }
    if generation.content.trim().is_empty() {
        return Err(PipelineError::Provider(format!(
            "{} returned an empty response",
            provider.id()
        )));
    }
    Ok(generation)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Generation);

    impl Provider for Fixed {
        fn id(&self) -> &str {
            "fixed"
        }

        fn generate(&self, _request: &GenerateRequest) -> Generation {
            self.0.clone()
        }
    }

    fn request(prompt: &str) -> GenerateRequest {
        GenerateRequest {
            prompt: prompt.to_string(),
            system_prompt: "sys".to_string(),
            model: "m".to_string(),
            temperature: 0.2,
            max_tokens: 512,
        }
    }

    #[test]
    fn failures_and_empty_content_are_provider_errors() {
        let failed = Fixed(Generation::failed("rate limited"));
        let err = generate_checked(&failed, &request("p")).unwrap_err();
        assert!(err.to_string().contains("rate limited"));

        let blank = Fixed(Generation::ok("  \n"));
        assert!(matches!(
            generate_checked(&blank, &request("p")),
            Err(PipelineError::Provider(_))
        ));

        let good = Fixed(Generation::ok("fine").with_usage(3, 4));
        let out = generate_checked(&good, &request("p")).unwrap();
        assert_eq!(out.content, "fine");
        assert_eq!(out.completion_tokens, 4);
    }

    #[test]
    fn input_checksum_covers_model_and_prompt() {
        let base = request("p");
        let mut other_model = base.clone();
        other_model.model = "m2".into();
        assert_ne!(base.input_checksum(), other_model.input_checksum());
        assert_ne!(base.input_checksum(), request("q").input_checksum());
        assert_eq!(base.input_checksum(), request("p").input_checksum());
    }
}
