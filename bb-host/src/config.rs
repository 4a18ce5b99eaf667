use std::path::Path;

use vm::Settings;

pub const ENV_HEAP_SIZE: &str = "BBVM_HEAP_SIZE";
pub const ENV_STACK_SIZE: &str = "BBVM_STACK_SIZE";
pub const ENV_MAX_INSTRUCTIONS: &str = "BBVM_MAX_INSTRUCTIONS";
pub const ENV_TICK_BATCH: &str = "BBVM_TICK_BATCH";

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    Parse {
        path: String,
        source: serde_json::Error,
    },
    InvalidEnv {
        key: &'static str,
        value: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "cannot read {path}: {source}"),
            ConfigError::Parse { path, source } => write!(f, "invalid settings in {path}: {source}"),
            ConfigError::InvalidEnv { key, value } => {
                write!(f, "{key} must be a non-negative integer, got '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::InvalidEnv { .. } => None,
        }
    }
}

pub fn parse_settings(text: &str, path: &str) -> Result<Settings, ConfigError> {
    serde_json::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })
}

/// Reads settings from `path` when given, otherwise starts from the defaults,
/// then applies `BBVM_*` environment overrides.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let settings = match path {
        Some(path) => {
            let display = path.display().to_string();
            let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: display.clone(),
                source,
            })?;
            parse_settings(&text, &display)?
        }
        None => Settings::default(),
    };
    apply_env_overrides(settings, |key| std::env::var(key).ok())
}

/// Applies overrides looked up through `lookup`, so tests need not touch the
/// process environment.
pub fn apply_env_overrides(
    mut settings: Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Settings, ConfigError> {
    if let Some(value) = parse_env(&lookup, ENV_HEAP_SIZE)? {
        settings.heap_size = value as usize;
    }
    if let Some(value) = parse_env(&lookup, ENV_STACK_SIZE)? {
        settings.stack_size = value as usize;
    }
    if let Some(value) = parse_env(&lookup, ENV_MAX_INSTRUCTIONS)? {
        settings.max_instructions = (value > 0).then_some(value);
    }
    if let Some(value) = parse_env(&lookup, ENV_TICK_BATCH)? {
        settings.instructions_per_tick = value as usize;
    }
    Ok(settings)
}

fn parse_env(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_settings_fill_in_defaults() {
        let settings = parse_settings(r#"{ "heap_size": 1024 }"#, "inline").expect("settings");
        assert_eq!(settings.heap_size, 1024);
        assert_eq!(settings.stack_size, Settings::default().stack_size);
        assert_eq!(settings.max_instructions, None);
    }

    #[test]
    fn bad_json_names_the_file() {
        let err = parse_settings("{ heap_size: }", "vm.json").expect_err("invalid json");
        assert!(err.to_string().starts_with("invalid settings in vm.json"));
    }

    #[test]
    fn env_overrides_win() {
        let lookup = |key: &str| match key {
            ENV_STACK_SIZE => Some("2048".to_string()),
            ENV_MAX_INSTRUCTIONS => Some("5000".to_string()),
            _ => None,
        };
        let settings = apply_env_overrides(Settings::default(), lookup).expect("overrides");
        assert_eq!(settings.stack_size, 2048);
        assert_eq!(settings.max_instructions, Some(5000));
        assert_eq!(settings.heap_size, Settings::default().heap_size);
    }

    #[test]
    fn zero_instruction_limit_means_unlimited() {
        let base = Settings {
            max_instructions: Some(10),
            ..Settings::default()
        };
        let lookup = |key: &str| (key == ENV_MAX_INSTRUCTIONS).then(|| "0".to_string());
        let settings = apply_env_overrides(base, lookup).expect("overrides");
        assert_eq!(settings.max_instructions, None);
    }

    #[test]
    fn invalid_env_values_are_rejected() {
        let lookup = |key: &str| (key == ENV_TICK_BATCH).then(|| "lots".to_string());
        let err = apply_env_overrides(Settings::default(), lookup).expect_err("invalid");
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                key: ENV_TICK_BATCH,
                ..
            }
        ));
    }
}
