//! Model name → LLM provider routing.

use std::fmt;

/// Which provider's credential a model needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    Google,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_gemini_name(model: &str) -> bool {
    model.starts_with("gemini-")
}

fn is_gemini_resource_path(model: &str) -> bool {
    model.contains("/models/gemini-")
}

/// (matcher, provider) pairs checked in order against a lowercased model name.
const PROVIDER_PATTERNS: &[(fn(&str) -> bool, ProviderKind)] = &[
    (is_gemini_name, ProviderKind::Google),
    (is_gemini_resource_path, ProviderKind::Google),
];

/// Classifies a model name. Anything unrecognised, including no model at
/// all, routes to Anthropic.
pub fn classify_model(model: Option<&str>) -> ProviderKind {
    let Some(model) = model else {
        return ProviderKind::Anthropic;
    };
    let model = model.trim().to_lowercase();
    PROVIDER_PATTERNS
        .iter()
        .find(|(matches, _)| matches(&model))
        .map(|(_, kind)| *kind)
        .unwrap_or(ProviderKind::Anthropic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemini_models_route_to_google() {
        assert_eq!(classify_model(Some("gemini-2.5-flash")), ProviderKind::Google);
        assert_eq!(classify_model(Some("  Gemini-2.0-Pro ")), ProviderKind::Google);
        assert_eq!(
            classify_model(Some("projects/p/locations/l/publishers/google/models/gemini-2.5-pro")),
            ProviderKind::Google
        );
    }

    #[test]
    fn test_everything_else_routes_to_anthropic() {
        assert_eq!(classify_model(Some("claude-haiku-4-5")), ProviderKind::Anthropic);
        assert_eq!(classify_model(Some("my-gemini-proxy")), ProviderKind::Anthropic);
        assert_eq!(classify_model(Some("")), ProviderKind::Anthropic);
        assert_eq!(classify_model(None), ProviderKind::Anthropic);
    }

    #[test]
    fn test_display() {
        assert_eq!(ProviderKind::Google.to_string(), "google");
    }
}
