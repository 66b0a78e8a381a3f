use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::core::{
    domain::QuestionRecord,
    pipeline::{running::ExecutionLimits, scoring::ScoringPolicy},
    registry::{RuntimeDescriptor, RuntimeRegistry},
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub sandbox: SandboxSettings,
    pub pool: PoolSettings,
    pub scoring: ScoringPolicy,
    pub proctoring: ProctoringSettings,
    pub languages: Languages,
    /// Questions preloaded into the in-memory record store.
    pub questions: Vec<QuestionRecord>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub listen: String,
    /// How long requests in progress may keep running after a shutdown signal.
    pub shutdown_grace_seconds: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7070".to_string(),
            shutdown_grace_seconds: 30,
        }
    }
}

impl ServerSettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Container runtime when it answers the startup probe, local otherwise.
    #[default]
    Auto,
    Container,
    Local,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub backend: BackendKind,
    pub timeout_seconds: u64,
    pub memory_limit_mb: u64,
    pub output_limit_bytes: usize,
    pub scratch_dir: PathBuf,
    pub container_binary: String,
    pub probe_timeout_ms: u64,
    pub isolate_network: bool,
    pub compile_timeout_seconds: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            timeout_seconds: 10,
            memory_limit_mb: 256,
            output_limit_bytes: 1024 * 1024,
            scratch_dir: std::env::temp_dir().join("codegrader"),
            container_binary: "docker".to_string(),
            probe_timeout_ms: 2000,
            isolate_network: true,
            compile_timeout_seconds: 30,
        }
    }
}

impl SandboxSettings {
    pub fn limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            timeout_seconds: self.timeout_seconds,
            memory_limit_mb: self.memory_limit_mb,
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_seconds)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_concurrency: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_concurrency: std::thread::available_parallelism().map_or(4, |n| n.get()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProctoringSettings {
    pub duration_seconds: u64,
}

impl Default for ProctoringSettings {
    fn default() -> Self {
        Self {
            duration_seconds: 3600,
        }
    }
}

/// `[[languages]]` entries. An absent list means the built-in runtimes.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct Languages(pub Vec<RuntimeDescriptor>);

impl Default for Languages {
    fn default() -> Self {
        Self(RuntimeRegistry::default_descriptors())
    }
}

impl Settings {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let settings: Settings = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn registry(&self) -> RuntimeRegistry {
        RuntimeRegistry::from_descriptors(self.languages.0.iter().cloned())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sandbox.timeout_seconds == 0 || self.sandbox.memory_limit_mb == 0 {
            return Err(ConfigError::Invalid(
                "sandbox limits must be positive".to_string(),
            ));
        }
        if self.pool.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_concurrency must be at least 1".to_string(),
            ));
        }
        for (name, weight) in [
            ("rule_weight", self.scoring.rule_weight),
            ("ai_weight", self.scoring.ai_weight),
        ] {
            if !(0.0..=1.0).contains(&weight) {
                return Err(ConfigError::Invalid(format!(
                    "scoring.{name} must be between 0 and 1, got {weight}"
                )));
            }
        }
        let weights = self.scoring.rule_weight + self.scoring.ai_weight;
        if (weights - 1.0).abs() > 1e-9 {
            return Err(ConfigError::Invalid(format!(
                "scoring weights must sum to 1, got {weights}"
            )));
        }
        if self.scoring.reference_avg_time_ms <= 0.0 || self.scoring.reference_avg_memory_mb <= 0.0 {
            return Err(ConfigError::Invalid(
                "scoring reference averages must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_yields_defaults() {
        let settings = Settings::from_toml("").unwrap();

        assert_eq!(settings.server.listen, "127.0.0.1:7070");
        assert_eq!(settings.server.shutdown_grace(), Duration::from_secs(30));
        assert_eq!(settings.sandbox.backend, BackendKind::Auto);
        assert_eq!(settings.sandbox.timeout_seconds, 10);
        assert_eq!(settings.sandbox.memory_limit_mb, 256);
        assert_eq!(settings.proctoring.duration_seconds, 3600);
        assert_eq!(settings.scoring, ScoringPolicy::default());
        assert_eq!(settings.registry().languages(), vec!["cpp", "python"]);
        assert!(settings.pool.max_concurrency >= 1);
    }

    #[test]
    fn test_partial_sections_and_seeds() {
        let settings = Settings::from_toml(
            r#"
            [sandbox]
            backend = "local"
            timeout_seconds = 2

            [pool]
            max_concurrency = 3

            [[languages]]
            language_id = "sh"
            file_extension = "sh"
            image_ref = "alpine:3"
            run_command_template = "sh {file}"

            [[questions]]
            question_id = "sum"
            max_points = 10.0
            testcases = [{ input = "1 2", expected_output = "3" }]
            "#,
        )
        .unwrap();

        assert_eq!(settings.sandbox.backend, BackendKind::Local);
        assert_eq!(settings.sandbox.limits().timeout_seconds, 2);
        assert_eq!(settings.sandbox.memory_limit_mb, 256);
        assert_eq!(settings.pool.max_concurrency, 3);
        assert_eq!(settings.registry().languages(), vec!["sh"]);
        assert_eq!(settings.questions[0].testcases.len(), 1);
        assert_eq!(settings.questions[0].driver_code, None);
    }

    #[test]
    fn test_shipped_config_parses() {
        let settings = Settings::from_toml(include_str!("../config/codegrader.toml")).unwrap();

        assert_eq!(settings.pool.max_concurrency, 8);
        assert_eq!(settings.registry().languages(), vec!["cpp", "python"]);
        assert_eq!(settings.questions[0].testcases.len(), 3);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            Settings::from_toml("[sandbox]\nbackend = \"vm\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Settings::from_toml("[pool]\nmax_concurrency = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Settings::from_toml("[scoring]\nrule_weight = 0.5\nai_weight = 0.3"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Settings::from_toml("[scoring]\nrule_weight = 1.5\nai_weight = -0.5"),
            Err(ConfigError::Invalid(_))
        ));
    }
}
