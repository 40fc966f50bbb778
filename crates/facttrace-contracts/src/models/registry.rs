use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub context_window: Option<u64>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str,
                      provider: &str,
                      capabilities: &[&str],
                      context_window: Option<u64>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                context_window,
            },
        );
    };

    // The forensic protocol needs a vision-capable model with search
    // grounding; gemini-3-pro-preview is the production default and the
    // dryrun entry keeps the whole pipeline runnable offline.
    insert(
        "gemini-3-pro-preview",
        "gemini",
        &["text", "vision"],
        Some(128000),
    );
    insert("dryrun-vision-1", "dryrun", &["text", "vision"], Some(8192));

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_prefers_gemini() {
        let registry = ModelRegistry::new(None);
        let vision = registry.by_capability("vision");
        assert!(!vision.is_empty());
        assert_eq!(vision[0].name, "gemini-3-pro-preview");
        assert_eq!(vision[0].provider, "gemini");
    }

    #[test]
    fn ensure_checks_capability() {
        let registry = ModelRegistry::new(None);
        assert!(registry.ensure("gemini-3-pro-preview", "vision").is_some());
        assert!(registry.ensure("gemini-3-pro-preview", "image").is_none());
        assert!(registry.ensure("missing-model", "vision").is_none());
    }
}
