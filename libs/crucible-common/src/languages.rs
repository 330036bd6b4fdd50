// Language command table
// Loads and validates languages from languages.json, falling back to the built-in table

use crate::types::Language;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// The single writable, executable mount inside every sandbox.
pub const SCRATCH_DIR: &str = "/tmp";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: Language,
    pub version: String,
    pub image: String,
    /// Bare file name inside the scratch mount.
    pub source_file: String,
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
}

impl LanguageConfig {
    pub fn source_path(&self) -> String {
        format!("{}/{}", SCRATCH_DIR, self.source_file)
    }

    pub fn has_compile_step(&self) -> bool {
        self.compile.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Built-in command table. `config/languages.json` mirrors it.
pub fn builtin_languages() -> Vec<LanguageConfig> {
    vec![
        LanguageConfig {
            name: Language::Javascript,
            version: "20".to_string(),
            image: "node:20-alpine".to_string(),
            source_file: "solution.js".to_string(),
            compile: None,
            run: argv(&["node", "/tmp/solution.js"]),
        },
        LanguageConfig {
            name: Language::Python,
            version: "3.11".to_string(),
            image: "python:3.11-alpine".to_string(),
            source_file: "solution.py".to_string(),
            compile: None,
            run: argv(&["python", "/tmp/solution.py"]),
        },
        LanguageConfig {
            name: Language::Cpp,
            version: "13".to_string(),
            image: "gcc:13".to_string(),
            source_file: "solution.cpp".to_string(),
            compile: Some(argv(&["g++", "-O2", "-o", "/tmp/solution", "/tmp/solution.cpp"])),
            run: argv(&["/tmp/solution"]),
        },
        LanguageConfig {
            name: Language::Java,
            version: "21".to_string(),
            image: "eclipse-temurin:21-jdk".to_string(),
            // The run command hard-codes the entry type `Main`.
            source_file: "Main.java".to_string(),
            compile: Some(argv(&["javac", "-d", "/tmp", "/tmp/Main.java"])),
            run: argv(&["java", "-cp", "/tmp", "Main"]),
        },
    ]
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: BTreeMap<Language, LanguageConfig>,
}

impl LanguageConfigManager {
    pub fn from_configs(configs: Vec<LanguageConfig>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for config in configs {
            if config.run.is_empty() {
                bail!("Language '{}' has an empty run command", config.name);
            }
            if matches!(&config.compile, Some(cmd) if cmd.is_empty()) {
                bail!("Language '{}' has an empty compile command", config.name);
            }
            if config.source_file.is_empty() || config.source_file.contains('/') {
                bail!(
                    "Language '{}' source file must be a bare file name, got '{}'",
                    config.name,
                    config.source_file
                );
            }
            let name = config.name;
            if map.insert(name, config).is_some() {
                bail!("Language '{}' is configured twice", name);
            }
        }
        Ok(Self { configs: map })
    }

    pub fn builtin() -> Self {
        let configs = builtin_languages()
            .into_iter()
            .map(|config| (config.name, config))
            .collect();
        Self { configs }
    }

    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let languages_json: LanguagesJson = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        Self::from_configs(languages_json.languages)
    }

    /// Load from `config_path` if it exists, else use the built-in table.
    pub fn load_or_builtin(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            Ok(Self::builtin())
        }
    }

    pub fn get(&self, language: Language) -> Option<&LanguageConfig> {
        self.configs.get(&language)
    }

    pub fn languages(&self) -> impl Iterator<Item = Language> + '_ {
        self.configs.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LanguageConfig> {
        self.configs.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table() {
        let manager = LanguageConfigManager::builtin();
        assert_eq!(manager.languages().count(), 4);

        let java = manager.get(Language::Java).unwrap();
        assert_eq!(java.source_file, "Main.java");
        assert_eq!(java.run.last().map(String::as_str), Some("Main"));
        assert!(java.has_compile_step());

        let python = manager.get(Language::Python).unwrap();
        assert!(!python.has_compile_step());
        assert_eq!(python.source_path(), "/tmp/solution.py");

        let cpp = manager.get(Language::Cpp).unwrap();
        assert!(cpp.compile.as_ref().unwrap().contains(&"-O2".to_string()));
    }

    #[test]
    fn test_shipped_config_matches_builtin() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/languages.json");
        let loaded = LanguageConfigManager::load(&path).unwrap();
        let builtin = LanguageConfigManager::builtin();
        assert_eq!(
            loaded.iter().collect::<Vec<_>>(),
            builtin.iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_rejects_duplicates_and_paths() {
        let mut configs = builtin_languages();
        configs.push(configs[0].clone());
        assert!(LanguageConfigManager::from_configs(configs).is_err());

        let mut configs = builtin_languages();
        configs[1].source_file = "../solution.py".to_string();
        assert!(LanguageConfigManager::from_configs(configs).is_err());

        let mut configs = builtin_languages();
        configs[2].run.clear();
        assert!(LanguageConfigManager::from_configs(configs).is_err());
    }

    #[test]
    fn test_missing_file_falls_back() {
        let manager =
            LanguageConfigManager::load_or_builtin(Path::new("does/not/exist.json")).unwrap();
        assert!(manager.get(Language::Cpp).is_some());
        assert!(LanguageConfigManager::load(Path::new("does/not/exist.json")).is_err());
    }
}
