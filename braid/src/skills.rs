//! Skill registry
//!
//! Skills are named reusable prompt fragments declared in settings.
//! Attaching a skill to a step injects its text into the step's system
//! prompt. References are validated at load time.

use std::collections::HashMap;

use crate::config::SkillConfig;

#[derive(Debug, Clone, Default)]
pub struct SkillRegistry {
    skills: HashMap<String, SkillConfig>,
}

impl SkillRegistry {
    pub fn new(skills: HashMap<String, SkillConfig>) -> Self {
        Self { skills }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.skills.contains_key(name)
    }

    /// Prompt fragments for the given skill names, in order. Unknown
    /// names were rejected at load time and are skipped here.
    pub fn prompts(&self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .filter_map(|name| self.skills.get(name).map(|s| s.prompt.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompts_in_order() {
        let mut skills = HashMap::new();
        skills.insert(
            "tone".to_string(),
            SkillConfig {
                description: None,
                prompt: "Keep answers short.".to_string(),
            },
        );
        skills.insert(
            "cite".to_string(),
            SkillConfig {
                description: Some("citations".to_string()),
                prompt: "Cite sources.".to_string(),
            },
        );
        let registry = SkillRegistry::new(skills);

        let prompts = registry.prompts(&["cite".to_string(), "tone".to_string()]);
        assert_eq!(prompts, vec!["Cite sources.", "Keep answers short."]);
    }
}
