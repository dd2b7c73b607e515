use std::path::{Path, PathBuf};
use std::result::Result as StdResult;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;
use tcrun_core::{ComparisonMode, RunConfig};

pub use self::glob_pattern::GlobPattern;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    #[serde(skip)]
    pub source_config_file: Option<PathBuf>,
    pub test: TestConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TestConfig {
    #[serde(default = "TestConfig::default_shell")]
    pub shell: PathBuf,

    #[serde(default = "TestConfig::default_compile_before_run")]
    pub compile_before_run: bool,

    #[serde(default = "TestConfig::default_max_parallel")]
    pub max_parallel_processes: usize,

    /// Wall-clock limit per testcase, in milliseconds. 0 disables the limit.
    #[serde(default = "TestConfig::default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "TestConfig::default_max_output_bytes")]
    pub max_output_bytes: usize,

    #[serde(default)]
    pub comparison: ComparisonConfig,

    pub command: Vec<TestCommandConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TestCommandConfig {
    pub pattern: GlobPattern,
    pub compile: Option<String>,
    pub run: String,
}

/// Command pair selected for one program file, before template expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCommand {
    pub compile: Option<String>,
    pub run: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComparisonConfig {
    #[default]
    Exact,
    TrimTrailingWs,
    IgnoreAllWs,
}

impl From<ComparisonConfig> for ComparisonMode {
    fn from(value: ComparisonConfig) -> Self {
        use ComparisonConfig::*;
        match value {
            Exact => ComparisonMode::Exact,
            TrimTrailingWs => ComparisonMode::TrimTrailingWs,
            IgnoreAllWs => ComparisonMode::IgnoreAllWs,
        }
    }
}

impl Config {
    pub const FILENAME: &'static str = "tcrun.toml";

    const EXAMPLE_TOML: &'static str = r#"[test]
shell = "/bin/sh"
compile_before_run = true
max_parallel_processes = 4
timeout_ms = 5000
max_output_bytes = 1048576
comparison = "exact"

[[test.command]]
pattern = "*.cpp"
compile = "g++ -O2 -o {dir}/{stem} {file}"
run = "{dir}/{stem}"

[[test.command]]
pattern = "*.rs"
compile = "rustc -O -o {dir}/{stem} {file}"
run = "{dir}/{stem}"

[[test.command]]
pattern = "*.py"
run = "python3 {file}"
"#;

    pub fn example_toml() -> &'static str {
        Self::EXAMPLE_TOML
    }

    pub fn from_toml(s: &str) -> StdResult<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn from_toml_file(filepath: PathBuf) -> anyhow::Result<Self> {
        let toml = std::fs::read_to_string(&filepath)
            .with_context(|| format!("Cannot read a file: {:?}", filepath))?;
        let mut cfg = Self::from_toml(&toml)
            .with_context(|| format!("Invalid config TOML: {:?}", filepath))?;
        cfg.source_config_file = Some(filepath);
        Ok(cfg)
    }

    /// Find config file in ancestor dirs, including the current dir.
    pub fn find_file_in_ancestors(cur_dir: impl AsRef<Path>) -> anyhow::Result<PathBuf> {
        let cur_dir = cur_dir.as_ref();
        cur_dir
            .ancestors()
            .map(|dir| dir.join(Self::FILENAME))
            .find(|path| path.is_file())
            .with_context(|| format!("Not in a tcrun dir: Cannot find '{}'", Self::FILENAME))
    }

    pub fn from_file_finding_in_ancestors(cur_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config_filepath = Config::find_file_in_ancestors(cur_dir)?;
        Self::from_toml_file(config_filepath)
    }
}

impl TestConfig {
    fn default_shell() -> PathBuf {
        RunConfig::DEFAULT_SHELL.into()
    }
    fn default_compile_before_run() -> bool {
        true
    }
    fn default_max_parallel() -> usize {
        RunConfig::DEFAULT_MAX_PARALLEL
    }
    fn default_timeout_ms() -> u64 {
        5000
    }
    fn default_max_output_bytes() -> usize {
        RunConfig::DEFAULT_MAX_OUTPUT
    }

    pub fn find_test_cmd_for_filename(&self, filename: impl AsRef<str>) -> Option<TestCommand> {
        self.command
            .iter()
            .find(|entry| entry.pattern.matches(filename.as_ref()))
            .map(|entry| TestCommand {
                compile: entry.compile.to_owned(),
                run: entry.run.to_owned(),
            })
    }

    /// Builds the resolved core config from an already-expanded command pair.
    pub fn to_run_config(&self, cmd: TestCommand) -> RunConfig {
        let timeout = (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms));
        let mut cfg = RunConfig::new(cmd.run)
            .shell(self.shell.clone())
            .max_parallel_processes(self.max_parallel_processes)
            .timeout(timeout)
            .max_output_size(self.max_output_bytes)
            .comparison(self.comparison.into());
        if let Some(compile) = cmd.compile {
            cfg = cfg.compile_command(compile);
        }
        cfg
    }
}

mod glob_pattern {
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    #[serde(try_from = "String")]
    pub struct GlobPattern(::glob::Pattern);

    impl GlobPattern {
        pub fn parse(pattern: &str) -> Result<Self, ::glob::PatternError> {
            ::glob::Pattern::new(pattern).map(Self)
        }

        pub fn matches(&self, s: &str) -> bool {
            self.0.matches(s)
        }

        pub fn as_str(&self) -> &str {
            self.0.as_str()
        }
    }

    impl TryFrom<String> for GlobPattern {
        type Error = ::glob::PatternError;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            Self::parse(&value)
        }
    }
}
