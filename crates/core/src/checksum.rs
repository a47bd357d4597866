use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Builds the PromptHash: a digest over every input that can change what the
/// provider returns for a document.
///
/// Fields are hashed in name order with length prefixes, so the result does not
/// depend on the order they were added in and `("ab", "c")` never collides with
/// `("a", "bc")`.
#[derive(Debug, Clone, Default)]
pub struct PromptHasher {
    fields: BTreeMap<String, String>,
}

impl PromptHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn flag(self, name: impl Into<String>, value: bool) -> Self {
        self.field(name, if value { "1" } else { "0" })
    }

    pub fn finish(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in &self.fields {
            hasher.update((name.len() as u64).to_be_bytes());
            hasher.update(name.as_bytes());
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn prompt_hash_is_order_independent_and_sensitive() {
        let a = PromptHasher::new()
            .field("model", "gpt-4.1-mini")
            .field("system", "be brief")
            .finish();
        let b = PromptHasher::new()
            .field("system", "be brief")
            .field("model", "gpt-4.1-mini")
            .finish();
        assert_eq!(a, b);
        let c = PromptHasher::new()
            .field("system", "be brief")
            .field("model", "gpt-4.1")
            .finish();
        assert_ne!(a, c);
        let split_one = PromptHasher::new().field("ab", "c").finish();
        let split_two = PromptHasher::new().field("a", "bc").finish();
        assert_ne!(split_one, split_two);
    }
}
