use std::cmp::Reverse;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Where requests for a model family go and which secret unlocks it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderDescriptor {
    pub provider_id: String,
    pub secret_path: String,
    pub base_url: String,
}

impl ProviderDescriptor {
    pub fn new(
        provider_id: impl Into<String>,
        secret_path: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            secret_path: secret_path.into(),
            base_url: base_url.into(),
        }
    }
}

/// Pure prefix-match registry from model id to provider descriptor.
/// Longer prefixes win; equal lengths resolve lexicographically, so lookup
/// order is deterministic regardless of registration order.
#[derive(Clone, Debug)]
pub struct ProviderRouter {
    routes: Vec<(String, ProviderDescriptor)>,
}

impl ProviderRouter {
    pub fn new(mut routes: Vec<(String, ProviderDescriptor)>) -> Self {
        routes.sort_by(|(a, _), (b, _)| {
            (Reverse(a.len()), a.as_str()).cmp(&(Reverse(b.len()), b.as_str()))
        });
        Self { routes }
    }

    /// The two descriptors the gateway ships with. Base URLs are
    /// overridable for self-hosted compatible endpoints.
    pub fn with_defaults(openai_base_url: Option<&str>, anthropic_base_url: Option<&str>) -> Self {
        let openai = ProviderDescriptor::new(
            "openai",
            "secret/infrastructure/openai",
            openai_base_url.unwrap_or(OPENAI_BASE_URL),
        );
        let anthropic = ProviderDescriptor::new(
            "anthropic",
            "secret/infrastructure/anthropic",
            anthropic_base_url.unwrap_or(ANTHROPIC_BASE_URL),
        );
        Self::new(vec![
            ("gpt-".to_string(), openai.clone()),
            ("o1-".to_string(), openai),
            ("claude-".to_string(), anthropic),
        ])
    }

    pub fn resolve(&self, model: &str) -> Option<&ProviderDescriptor> {
        self.routes
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix.as_str()))
            .map(|(_, descriptor)| descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_model_families() {
        let router = ProviderRouter::with_defaults(None, None);
        assert_eq!(router.resolve("gpt-4o").unwrap().provider_id, "openai");
        assert_eq!(router.resolve("o1-preview").unwrap().provider_id, "openai");
        assert_eq!(
            router.resolve("claude-3-opus").unwrap().provider_id,
            "anthropic"
        );
    }

    #[test]
    fn unknown_model_has_no_route() {
        let router = ProviderRouter::with_defaults(None, None);
        assert!(router.resolve("foo-7").is_none());
        assert!(router.resolve("").is_none());
        // Prefix match is exact: no route for a bare family name.
        assert!(router.resolve("gpt").is_none());
    }

    #[test]
    fn longer_prefix_wins_over_catch_all() {
        let narrow = ProviderDescriptor::new("narrow", "secret/narrow", "http://narrow");
        let wide = ProviderDescriptor::new("wide", "secret/wide", "http://wide");
        let router = ProviderRouter::new(vec![
            ("o".to_string(), wide),
            ("o1-".to_string(), narrow),
        ]);
        assert_eq!(router.resolve("o1-preview").unwrap().provider_id, "narrow");
        assert_eq!(router.resolve("other").unwrap().provider_id, "wide");
    }

    #[test]
    fn equal_length_prefixes_resolve_lexicographically() {
        let a = ProviderDescriptor::new("a", "secret/a", "http://a");
        let b = ProviderDescriptor::new("b", "secret/b", "http://b");
        let router = ProviderRouter::new(vec![
            ("ab".to_string(), b.clone()),
            ("aa".to_string(), a.clone()),
        ]);
        // "aa" sorts before "ab"; a model matching both is impossible, but
        // iteration order must still be deterministic.
        assert_eq!(router.resolve("aax").unwrap().provider_id, "a");
        assert_eq!(router.resolve("abx").unwrap().provider_id, "b");
    }

    #[test]
    fn default_base_urls_are_overridable() {
        let router = ProviderRouter::with_defaults(Some("http://localhost:9000/v1"), None);
        assert_eq!(
            router.resolve("gpt-4o").unwrap().base_url,
            "http://localhost:9000/v1"
        );
        assert_eq!(
            router.resolve("claude-3-opus").unwrap().base_url,
            ANTHROPIC_BASE_URL
        );
    }
}
