use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Problems that prevent a bisection from starting at all.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Required script '{0}' is not configured")]
    MissingScript(&'static str),
    #[error("'{0}' must be greater than zero")]
    ZeroBound(&'static str),
    #[error("Pass level bisection requires pruning to be disabled")]
    PassBisectWithPrune,
    #[error("The skip exit code cannot be 0, which already means 'good'")]
    SkipCodeIsSuccess,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ScriptSettings {
    #[serde(default)]
    pub get_initial_items: Option<String>,
    #[serde(default)]
    pub switch_to_good: Option<String>,
    #[serde(default)]
    pub switch_to_bad: Option<String>,
    #[serde(default)]
    pub test_setup_script: Option<String>,
    #[serde(default)]
    pub test_script: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SearchSettings {
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default)]
    pub prune: bool,
    #[serde(default = "default_prune_iterations")]
    pub prune_iterations: u32,
    #[serde(default = "default_true")]
    pub incremental: bool,
    #[serde(default)]
    pub file_args: bool,
    #[serde(default = "default_true")]
    pub verify: bool,
    #[serde(default = "default_skip_exit_code")]
    pub skip_exit_code: i32,
    #[serde(default)]
    pub test_timeout_ms: Option<u64>,
    #[serde(default)]
    pub switch_timeout_ms: Option<u64>,
}

pub fn default_iterations() -> u32 {
    50
}

pub fn default_prune_iterations() -> u32 {
    100
}

pub fn default_skip_exit_code() -> i32 {
    125
}

fn default_true() -> bool {
    true
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            prune: false,
            prune_iterations: default_prune_iterations(),
            incremental: true,
            file_args: false,
            verify: true,
            skip_exit_code: default_skip_exit_code(),
            test_timeout_ms: None,
            switch_timeout_ms: None,
        }
    }
}

impl SearchSettings {
    pub fn test_timeout(&self) -> Option<Duration> {
        self.test_timeout_ms.map(Duration::from_millis)
    }

    pub fn switch_timeout(&self) -> Option<Duration> {
        self.switch_timeout_ms.map(Duration::from_millis)
    }
}

/// Settings for the nested pass / transformation search run on a single bad item.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PassBisectSettings {
    /// Invoked with the bad item; expected to write the build script.
    pub generator: String,
    /// Defaults to `cmd_script.sh` next to the generator.
    #[serde(default)]
    pub build_script: Option<String>,
    #[serde(default)]
    pub ir_diff: bool,
    #[serde(default)]
    pub build_timeout_ms: Option<u64>,
}

impl PassBisectSettings {
    pub fn build_script_path(&self) -> PathBuf {
        match &self.build_script {
            Some(script) => PathBuf::from(script),
            None => Path::new(&self.generator)
                .parent()
                .map_or_else(|| PathBuf::from("cmd_script.sh"), |dir| dir.join("cmd_script.sh")),
        }
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        self.build_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StateSettings {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

pub fn default_state_path() -> PathBuf {
    PathBuf::from("culprit.state")
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BisectConfig {
    #[serde(default)]
    pub scripts: ScriptSettings,
    #[serde(default)]
    pub search: SearchSettings,
    #[serde(default)]
    pub pass_bisect: Option<PassBisectSettings>,
    #[serde(default)]
    pub state: StateSettings,
}

/// Scripts that must be present before a run, borrowed out of a validated config.
#[derive(Debug, Clone, Copy)]
pub struct Scripts<'a> {
    pub get_initial_items: &'a str,
    pub switch_to_good: &'a str,
    pub switch_to_bad: &'a str,
    pub test_setup_script: Option<&'a str>,
    pub test_script: &'a str,
}

impl BisectConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;
        Self::from_toml_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scripts()?;
        if self.search.iterations == 0 {
            return Err(ConfigError::ZeroBound("iterations"));
        }
        if self.search.prune_iterations == 0 {
            return Err(ConfigError::ZeroBound("prune-iterations"));
        }
        if self.pass_bisect.is_some() && self.search.prune {
            return Err(ConfigError::PassBisectWithPrune);
        }
        if self.search.skip_exit_code == 0 {
            return Err(ConfigError::SkipCodeIsSuccess);
        }
        Ok(())
    }

    pub fn scripts(&self) -> Result<Scripts<'_>, ConfigError> {
        fn required<'a>(
            value: &'a Option<String>,
            name: &'static str,
        ) -> Result<&'a str, ConfigError> {
            value
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .ok_or(ConfigError::MissingScript(name))
        }

        Ok(Scripts {
            get_initial_items: required(&self.scripts.get_initial_items, "get-initial-items")?,
            switch_to_good: required(&self.scripts.switch_to_good, "switch-to-good")?,
            switch_to_bad: required(&self.scripts.switch_to_bad, "switch-to-bad")?,
            test_setup_script: self
                .scripts
                .test_setup_script
                .as_deref()
                .filter(|s| !s.trim().is_empty()),
            test_script: required(&self.scripts.test_script, "test-script")?,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::scripted_config;
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = BisectConfig::default();
        assert_eq!(config.search.iterations, 50);
        assert_eq!(config.search.prune_iterations, 100);
        assert!(config.search.incremental);
        assert!(config.search.verify);
        assert!(!config.search.prune);
        assert_eq!(config.search.skip_exit_code, 125);
        assert_eq!(config.state.path, PathBuf::from("culprit.state"));
        assert!(config.pass_bisect.is_none());
    }

    #[test]
    fn parses_kebab_case_toml() {
        let config = BisectConfig::from_toml_str(
            r#"
            [scripts]
            get-initial-items = "./get_initial_items.sh"
            switch-to-good = "./switch_to_good.sh"
            switch-to-bad = "./switch_to_bad.sh"
            test-script = "./test.sh"

            [search]
            prune = true
            iterations = 12
            file-args = true
            test-timeout-ms = 5000

            [state]
            path = "/tmp/run.state"
            "#,
        )
        .unwrap();
        assert_eq!(config.search.iterations, 12);
        assert!(config.search.prune);
        assert!(config.search.file_args);
        assert_eq!(config.search.test_timeout(), Some(Duration::from_millis(5000)));
        assert_eq!(config.search.prune_iterations, 100);
        assert_eq!(config.state.path, PathBuf::from("/tmp/run.state"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_fields() {
        let result = BisectConfig::from_toml_str("[search]\nprunes = true\n");
        assert!(result.is_err());
    }

    #[test]
    fn missing_scripts_are_reported_by_name() {
        let mut config = scripted_config();
        config.scripts.switch_to_bad = None;
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingScript("switch-to-bad"))
        );

        config.scripts.switch_to_bad = Some("   ".to_string());
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingScript("switch-to-bad"))
        );
    }

    #[test]
    fn pass_bisect_conflicts_with_prune() {
        let mut config = scripted_config();
        config.search.prune = true;
        config.pass_bisect = Some(PassBisectSettings {
            generator: "gen.sh".to_string(),
            build_script: None,
            ir_diff: false,
            build_timeout_ms: None,
        });
        assert_eq!(config.validate(), Err(ConfigError::PassBisectWithPrune));
    }

    #[test]
    fn zero_bounds_and_success_skip_code_are_rejected() {
        let mut config = scripted_config();
        config.search.iterations = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroBound("iterations")));

        let mut config = scripted_config();
        config.search.skip_exit_code = 0;
        assert_eq!(config.validate(), Err(ConfigError::SkipCodeIsSuccess));
    }

    #[test]
    fn build_script_defaults_next_to_generator() {
        let settings = PassBisectSettings {
            generator: "/work/pass/generate_cmd.sh".to_string(),
            build_script: None,
            ir_diff: false,
            build_timeout_ms: None,
        };
        assert_eq!(
            settings.build_script_path(),
            PathBuf::from("/work/pass/cmd_script.sh")
        );
    }

    #[test]
    fn config_survives_toml_round_trip() {
        let mut config = scripted_config();
        config.search.prune = true;
        let text = config.to_toml_string().unwrap();
        assert_eq!(BisectConfig::from_toml_str(&text).unwrap(), config);
    }
}
