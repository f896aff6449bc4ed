use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AutotestError;
use crate::hooks::Hook;

pub const HOME_RC: &str = "~/.autotest.toml";
pub const PROJECT_RC: &str = ".autotest.toml";

/// Everything the daemon needs to know, built once at start-up and passed by reference.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub watch: WatchConfig,
    pub command: CommandConfig,
    pub run: RunConfig,
    #[serde(rename = "mapping")]
    pub mappings: Vec<MappingConfig>,
    pub extra_class_map: BTreeMap<String, String>,
    pub hooks: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub directories: Vec<String>,
    pub extra_files: Vec<String>,
    pub sleep_ms: u64,
    /// Regexes matched against root-relative paths with `/` separators and
    /// no leading `./`, e.g. `^vendor` or `\.generated\.rb$`. A matching
    /// directory is not descended into.
    pub exclude: Vec<String>,
    pub interrupt_grace_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            directories: vec![".".to_string()],
            extra_files: Vec::new(),
            sleep_ms: 1000,
            exclude: Vec::new(),
            interrupt_grace_ms: 1500,
        }
    }
}

impl WatchConfig {
    pub fn sleep(&self) -> Duration {
        Duration::from_millis(self.sleep_ms)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }
}

/// How the test interpreter is invoked
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub ruby: String,
    pub libs: Vec<String>,
    pub prefix: String,
    pub test_prefix: String,
    pub testlib: String,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            ruby: default_ruby(),
            libs: vec![".".to_string(), "lib".to_string(), "test".to_string()],
            prefix: String::new(),
            test_prefix: "gem 'minitest'".to_string(),
            testlib: "minitest/autorun".to_string(),
        }
    }
}

fn default_ruby() -> String {
    std::env::var("RUBY").unwrap_or_else(|_| "ruby".to_string())
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Treat everything on disk at start-up as already tested
    pub no_full_after_start: bool,
    /// Declare victory as soon as the failing subset passes
    pub no_full_after_failed: bool,
    pub debug: bool,
    pub verbose: bool,
    pub quiet: bool,
}

/// A user-supplied mapping rule
#[derive(Debug, Clone, Deserialize)]
pub struct MappingConfig {
    pub pattern: String,
    /// Glob templates; `{0}`..`{9}` expand to capture groups, `{basename}` to the file stem
    pub tests: Vec<String>,
    #[serde(default)]
    pub prepend: bool,
}

impl Config {
    /// Load and merge rc files in order. Missing files are skipped.
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        let mut merged = toml::Table::new();

        for path in paths {
            let path = expand_path(path);
            if !path.is_file() {
                continue;
            }

            let content = fs::read_to_string(&path).map_err(|source| AutotestError::ConfigRead {
                path: path.clone(),
                source,
            })?;
            let table: toml::Table = toml::from_str(&content).map_err(|source| AutotestError::ConfigParse {
                path: path.clone(),
                source,
            })?;

            tracing::debug!(path = %path.display(), "loaded rc file");
            merge_tables(&mut merged, table);
        }

        let mut config: Config = toml::Value::Table(merged)
            .try_into()
            .context("Failed to interpret merged configuration")?;

        config.expand_paths();
        config.validate()?;

        Ok(config)
    }

    /// The rc files consulted when `--rc` is not given
    pub fn default_rc_paths() -> Vec<PathBuf> {
        vec![PathBuf::from(HOME_RC), PathBuf::from(PROJECT_RC)]
    }

    fn expand_paths(&mut self) {
        for dir in self.watch.directories.iter_mut().chain(self.watch.extra_files.iter_mut()) {
            *dir = expand(dir);
        }
        for lib in self.command.libs.iter_mut() {
            *lib = expand(lib);
        }
        self.command.ruby = expand(&self.command.ruby);
    }

    fn validate(&self) -> Result<()> {
        for pattern in self
            .watch
            .exclude
            .iter()
            .chain(self.mappings.iter().map(|m| &m.pattern))
        {
            Regex::new(pattern).map_err(|source| AutotestError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
        }

        for name in self.hooks.keys() {
            if name.parse::<Hook>().is_err() {
                anyhow::bail!("Unknown hook '{}' in [hooks]", name);
            }
        }

        if self.watch.directories.is_empty() && self.watch.extra_files.is_empty() {
            anyhow::bail!("Nothing to watch: [watch] directories and extra_files are both empty");
        }

        Ok(())
    }

    /// `libs` joined with the platform path separator, ready for `-I`
    pub fn libs_path(&self) -> String {
        let sep = if cfg!(windows) { ";" } else { ":" };
        self.command.libs.join(sep)
    }
}

fn expand(value: &str) -> String {
    shellexpand::full(value)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(expand(&path.to_string_lossy()))
}

/// Later tables override earlier ones key by key; `mapping` rules accumulate.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        let replacement = match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
                None
            }
            (Some(toml::Value::Array(existing)), toml::Value::Array(incoming)) if key == "mapping" => {
                existing.extend(incoming);
                None
            }
            (_, value) => Some(value),
        };

        if let Some(value) = replacement {
            base.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_config() {
        let toml_content = r#"
[watch]
directories = ["lib", "test"]
sleep_ms = 250
exclude = ["^vendor"]

[command]
ruby = "/opt/ruby/bin/ruby"
libs = ["lib", "test"]

[run]
no_full_after_failed = true

[[mapping]]
pattern = "^app/(.*)\\.rb$"
tests = ["test/**/{1}_test.rb"]

[extra_class_map]
WidgetTest = "test/odd/place.rb"

[hooks]
all_good = "notify-send green"
"#;

        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.watch.directories, vec!["lib", "test"]);
        assert_eq!(config.watch.sleep(), Duration::from_millis(250));
        assert_eq!(config.watch.interrupt_grace_ms, 1500);
        assert_eq!(config.command.ruby, "/opt/ruby/bin/ruby");
        assert_eq!(config.command.testlib, "minitest/autorun");
        assert!(config.run.no_full_after_failed);
        assert!(!config.run.no_full_after_start);
        assert_eq!(config.mappings.len(), 1);
        assert!(!config.mappings[0].prepend);
        assert_eq!(config.extra_class_map["WidgetTest"], "test/odd/place.rb");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_configured_exclude_prunes_during_scan() {
        use crate::file_index::{Exclusions, FileIndex};

        let dir = TempDir::new().unwrap();
        for rel in ["lib/widget.rb", "vendor/gems/widget.rb", "test/vendor_test.rb"] {
            let path = dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, "").unwrap();
        }

        let config: Config = toml::from_str("[watch]\nexclude = [\"^vendor\"]\n").unwrap();
        let mut exclusions = Exclusions::new();
        for pattern in &config.watch.exclude {
            exclusions.add(pattern.as_str());
        }
        let mut index = FileIndex::new(dir.path(), &config.watch.directories, &[], exclusions.compile().unwrap());

        let records = index.scan();
        let paths: Vec<_> = records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["lib/widget.rb", "test/vendor_test.rb"]);
    }

    #[test]
    fn test_defaults_without_files() {
        let config = Config::load(&[PathBuf::from("/definitely/not/here.toml")]).unwrap();
        assert_eq!(config.watch.directories, vec!["."]);
        assert_eq!(config.watch.sleep_ms, 1000);
        assert_eq!(config.command.test_prefix, "gem 'minitest'");
        assert!(config.mappings.is_empty());
    }

    #[test]
    fn test_later_files_override_and_mappings_accumulate() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("home.toml");
        let project = dir.path().join("project.toml");

        fs::write(
            &home,
            r#"
[watch]
sleep_ms = 100
interrupt_grace_ms = 10

[[mapping]]
pattern = "^a"
tests = ["test/a.rb"]
"#,
        )
        .unwrap();
        fs::write(
            &project,
            r#"
[watch]
sleep_ms = 300

[[mapping]]
pattern = "^b"
tests = ["test/b.rb"]
"#,
        )
        .unwrap();

        let config = Config::load(&[home, project]).unwrap();
        assert_eq!(config.watch.sleep_ms, 300);
        assert_eq!(config.watch.interrupt_grace_ms, 10);
        assert_eq!(config.mappings.len(), 2);
    }

    #[test]
    fn test_invalid_exclude_is_rejected() {
        let dir = TempDir::new().unwrap();
        let rc = dir.path().join("rc.toml");
        fs::write(&rc, "[watch]\nexclude = [\"(\"]\n").unwrap();

        let err = Config::load(&[rc]).unwrap_err();
        assert!(err.downcast_ref::<AutotestError>().is_some());
    }

    #[test]
    fn test_unknown_hook_is_rejected() {
        let dir = TempDir::new().unwrap();
        let rc = dir.path().join("rc.toml");
        fs::write(&rc, "[hooks]\nexploded = \"true\"\n").unwrap();

        let err = Config::load(&[rc]).unwrap_err();
        assert!(err.to_string().contains("exploded"));
    }

    #[test]
    fn test_libs_path() {
        let config = Config::default();
        let expected = if cfg!(windows) { ".;lib;test" } else { ".:lib:test" };
        assert_eq!(config.libs_path(), expected);
    }
}
