//! Assistant catalog and host detection.
//!
//! The server offers a fixed set of interactive AI coding assistants,
//! narrowed at startup to those whose binary resolves on PATH, plus an
//! optional "custom" entry built from `--shell` / `--shell-restart`.
//! The resulting catalog is immutable for the life of the process.

use which::which;

/// One launchable assistant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantConfig {
    /// Selector used in URLs and query parameters.
    pub name: String,
    /// Human-readable name shown in status messages.
    pub display_name: String,
    /// Command line for the first start of a session.
    pub command: String,
    /// Command line used when restarting after an abnormal exit.
    pub resume_command: String,
    /// Executable probed on PATH to decide availability.
    pub probe: String,
}

impl AssistantConfig {
    fn new(name: &str, display_name: &str, command: &str, resume_command: &str) -> Self {
        let probe = command
            .split_whitespace()
            .next()
            .unwrap_or(command)
            .to_string();
        AssistantConfig {
            name: name.to_string(),
            display_name: display_name.to_string(),
            command: command.to_string(),
            resume_command: resume_command.to_string(),
            probe,
        }
    }
}

/// Selector name of the custom assistant entry.
pub const CUSTOM_NAME: &str = "custom";

/// The statically enumerated assistant set, before PATH filtering.
pub fn builtin_assistants() -> Vec<AssistantConfig> {
    vec![
        AssistantConfig::new("claude", "Claude Code", "claude", "claude --continue"),
        AssistantConfig::new("codex", "Codex CLI", "codex", "codex resume --last"),
        AssistantConfig::new("gemini", "Gemini CLI", "gemini", "gemini"),
        AssistantConfig::new("aider", "Aider", "aider", "aider --restore-chat-history"),
    ]
}

/// Immutable set of assistants available on this host.
#[derive(Debug, Clone, Default)]
pub struct AssistantCatalog {
    entries: Vec<AssistantConfig>,
}

impl AssistantCatalog {
    /// Probe PATH for each builtin assistant and append the custom entry
    /// when the operator supplied one.
    pub fn detect(custom: Option<(String, String)>) -> Self {
        let mut catalog = Self::filter_available(builtin_assistants(), |probe| {
            which(probe).is_ok()
        });
        if let Some((command, resume_command)) = custom {
            catalog.entries.push(AssistantConfig {
                name: CUSTOM_NAME.to_string(),
                display_name: "Custom".to_string(),
                probe: command
                    .split_whitespace()
                    .next()
                    .unwrap_or(&command)
                    .to_string(),
                command,
                resume_command,
            });
        }
        catalog
    }

    fn filter_available(
        all: Vec<AssistantConfig>,
        probe_resolves: impl Fn(&str) -> bool,
    ) -> Self {
        let entries = all
            .into_iter()
            .filter(|a| probe_resolves(&a.probe))
            .collect();
        AssistantCatalog { entries }
    }

    pub fn get(&self, name: &str) -> Option<&AssistantConfig> {
        self.entries.iter().find(|a| a.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[AssistantConfig] {
        &self.entries
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|a| a.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_is_first_argv_word() {
        let a = AssistantConfig::new("x", "X", "claude --dangerously-skip-permissions", "claude -c");
        assert_eq!(a.probe, "claude");
    }

    #[test]
    fn filter_keeps_only_resolvable() {
        let catalog = AssistantCatalog::filter_available(builtin_assistants(), |probe| {
            probe == "claude" || probe == "aider"
        });
        assert_eq!(catalog.names(), vec!["claude", "aider"]);
        assert!(catalog.contains("claude"));
        assert!(!catalog.contains("codex"));
    }

    #[test]
    fn filter_can_empty_the_catalog() {
        let catalog = AssistantCatalog::filter_available(builtin_assistants(), |_| false);
        assert!(catalog.is_empty());
    }

    #[test]
    fn custom_entry_appended_with_own_commands() {
        let catalog = AssistantCatalog::detect(Some((
            "/bin/sh -i".to_string(),
            "/bin/sh -i".to_string(),
        )));
        let custom = catalog.get(CUSTOM_NAME).expect("custom entry");
        assert_eq!(custom.display_name, "Custom");
        assert_eq!(custom.command, "/bin/sh -i");
        assert_eq!(custom.probe, "/bin/sh");
    }
}
