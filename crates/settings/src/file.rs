//! TOML config file support with live reload.
//!
//! Config location: `~/.config/pkgterm/config.toml`

use crate::constants;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Characters that make up "bare" prompt filler when no shell table overrides them.
pub const DEFAULT_PROMPT_CHARS: &str = "$#%>❯➜»";

/// Flow control watermarks, in bytes.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct FlowConfig {
    pub high_watermark: usize,
    pub low_watermark: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            high_watermark: constants::flow::HIGH_WATERMARK,
            low_watermark: constants::flow::LOW_WATERMARK,
        }
    }
}

/// Per-shell description of output lines that are shell noise rather than
/// command output.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct NoiseProfile {
    /// Regexes matched against a whole line (without its line ending).
    pub patterns: Vec<String>,
    /// Characters a line may consist of (plus whitespace) to count as prompt filler.
    pub prompt_chars: Option<String>,
}

impl NoiseProfile {
    /// Built-in table for a shell basename, `None` when the shell has no
    /// special handling.
    pub fn builtin(shell: &str) -> Option<Self> {
        let bracketed_paste = r"^(\x1b\[\?2004[hl])+\r?$".to_string();
        match shell {
            "bash" => Some(Self {
                patterns: vec![bracketed_paste],
                prompt_chars: Some("$#>".to_string()),
            }),
            "zsh" => Some(Self {
                patterns: vec![bracketed_paste],
                prompt_chars: Some("%#$>❯➜»".to_string()),
            }),
            "fish" => Some(Self {
                patterns: vec![r"^\x1b\]0;[^\x07]*\x07\r?$".to_string()],
                prompt_chars: Some(">❯⋊#".to_string()),
            }),
            _ => None,
        }
    }

    /// Prompt filler characters, falling back to [`DEFAULT_PROMPT_CHARS`].
    pub fn prompt_chars(&self) -> &str {
        self.prompt_chars.as_deref().unwrap_or(DEFAULT_PROMPT_CHARS)
    }
}

/// User-facing config parsed from TOML.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Preferred shell (basename like "zsh" or an absolute path).
    pub shell: Option<String>,
    /// Shell used when `shell` is unset or not allowed.
    pub default_shell: String,
    /// Shell basenames a session may run.
    pub allowed_shells: Vec<String>,
    /// Arguments passed to the shell.
    pub shell_args: Vec<String>,
    /// Directories prepended to `PATH`, in order.
    pub path_prefixes: Vec<String>,
    /// Starting directory for new sessions.
    pub working_directory: Option<String>,
    /// Extra environment variables for the shell.
    pub env: BTreeMap<String, String>,
    /// Seconds an exec caller waits for its result.
    pub exec_timeout_secs: u64,
    /// Flow control watermarks.
    pub flow: FlowConfig,
    /// Noise tables keyed by shell basename, plus an optional "default" entry.
    pub noise: BTreeMap<String, NoiseProfile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            default_shell: constants::shell::DEFAULT_SHELL.to_string(),
            allowed_shells: constants::shell::ALLOWED_SHELLS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            shell_args: vec!["-l".to_string()],
            path_prefixes: constants::shell::PATH_PREFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            working_directory: None,
            env: BTreeMap::new(),
            exec_timeout_secs: constants::timing::EXEC_TIMEOUT.as_secs(),
            flow: FlowConfig::default(),
            noise: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Exec timeout, never shorter than [`constants::timing::MIN_EXEC_TIMEOUT`].
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs).max(constants::timing::MIN_EXEC_TIMEOUT)
    }

    /// Noise table for a shell basename.
    ///
    /// Lookup order: user table for the shell, built-in table for the shell,
    /// user "default" table, empty table.
    pub fn noise_profile(&self, shell: &str) -> NoiseProfile {
        self.noise
            .get(shell)
            .cloned()
            .or_else(|| NoiseProfile::builtin(shell))
            .or_else(|| self.noise.get("default").cloned())
            .unwrap_or_default()
    }

    /// Whether `name` (a shell basename) may be spawned.
    pub fn is_shell_allowed(&self, name: &str) -> bool {
        self.allowed_shells.iter().any(|allowed| allowed == name)
    }

    /// Repair values that would break the session layer.
    pub fn sanitized(mut self) -> Self {
        let max = constants::settings::MAX_STRING_LENGTH;

        if self.flow.high_watermark == 0 {
            tracing::warn!("flow.high-watermark must be positive, using default");
            self.flow.high_watermark = constants::flow::HIGH_WATERMARK;
        }
        if self.flow.low_watermark >= self.flow.high_watermark {
            tracing::warn!(
                "flow.low-watermark ({}) must be below high-watermark ({}), adjusting",
                self.flow.low_watermark,
                self.flow.high_watermark
            );
            self.flow.low_watermark = self.flow.high_watermark / 4;
        }

        let before = self.path_prefixes.len();
        self.path_prefixes.retain(|p| !p.is_empty() && p.len() <= max);
        if self.path_prefixes.len() != before {
            tracing::warn!("Dropped {} invalid path prefixes", before - self.path_prefixes.len());
        }

        if self.default_shell.len() > max || self.default_shell.is_empty() {
            tracing::warn!("default-shell is invalid, using {}", constants::shell::DEFAULT_SHELL);
            self.default_shell = constants::shell::DEFAULT_SHELL.to_string();
        }
        if self.shell.as_ref().is_some_and(|s| s.len() > max) {
            tracing::warn!("shell value too long, ignoring");
            self.shell = None;
        }

        self
    }
}

/// Default config file content with comments (generated on first launch).
const DEFAULT_CONFIG: &str = r#"# pkgterm configuration
# Changes are picked up live; a changed `shell` restarts the session.

# Preferred shell: a basename ("zsh", "bash", "fish") or an absolute path.
# shell = "zsh"

# Shell used when `shell` is unset or not in the allow-list
default-shell = "SHELL_PLACEHOLDER"

# Shells that may be spawned (matched by basename)
allowed-shells = ["bash", "zsh", "sh", "dash", "ksh", "fish"]

# Arguments passed to the shell ("-l" makes it a login shell so profile
# files that set up the package manager are read)
shell-args = ["-l"]

# Package manager locations prepended to PATH, in order
path-prefixes = [
    "/opt/homebrew/bin",
    "/opt/homebrew/sbin",
    "/usr/local/bin",
    "/usr/local/sbin",
    "/home/linuxbrew/.linuxbrew/bin",
    "/home/linuxbrew/.linuxbrew/sbin",
]

# Starting directory for new sessions
# working-directory = "~/projects"

# Seconds to wait for a queued command before reporting a timeout
exec-timeout-secs = 1800

# Extra environment for the shell
# [env]
# HOMEBREW_NO_ANALYTICS = "1"

# Output buffered toward the display before the shell is paused (bytes)
[flow]
high-watermark = 524288
low-watermark = 131072

# Shell noise tables. Lines matching a pattern, or made only of prompt
# characters, are dropped from command output.
# [noise.zsh]
# patterns = ['^\x1b\[\?2004[hl]\r?$']
# prompt-chars = "%#$>❯"
"#;

/// Return the config file path.
pub fn config_path() -> PathBuf {
    pkgterm_paths::config_file()
}

/// Ensure the config file exists, creating a default if missing.
/// Returns the path to the config file.
pub fn ensure_config_file() -> Option<PathBuf> {
    let path = config_path();
    if !path.exists() {
        let parent = path.parent()?;
        std::fs::create_dir_all(parent).ok()?;
        let content = DEFAULT_CONFIG.replace("SHELL_PLACEHOLDER", constants::shell::DEFAULT_SHELL);
        std::fs::write(&path, content).ok()?;
        tracing::info!("Created default config at {:?}", path);
    }
    Some(path)
}

/// Load and parse the config file. Returns default on any error.
pub fn load_config() -> Config {
    load_config_from(&config_path())
}

/// Load and parse a config file at an explicit path. Returns default on any error.
pub fn load_config_from(path: &Path) -> Config {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to read config: {}", e);
            }
            return Config::default();
        }
    };

    // Size guard
    if content.len() > constants::settings::MAX_FILE_SIZE as usize {
        tracing::warn!(
            "Config file too large ({} bytes), using defaults",
            content.len()
        );
        return Config::default();
    }

    parse_config(&content)
}

/// Parse config text, falling back to defaults when it is not valid TOML.
pub fn parse_config(content: &str) -> Config {
    match toml::from_str::<Config>(content) {
        Ok(cfg) => cfg.sanitized(),
        Err(e) => {
            tracing::warn!("Failed to parse config.toml: {}", e);
            Config::default()
        }
    }
}

/// Guard returned by [`watch_config`]; watching stops when it is dropped.
pub type ConfigWatcher = notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>;

/// Start watching the config file for changes.
///
/// `on_change` runs on the watcher thread with the new config whenever the
/// file's parsed content differs from what was last seen. Returns a guard
/// that stops watching on drop.
pub fn watch_config(
    on_change: impl Fn(&Config) + Send + 'static,
) -> Option<ConfigWatcher> {
    watch_config_at(config_path(), on_change)
}

/// [`watch_config`] for an explicit path.
pub fn watch_config_at(
    path: PathBuf,
    on_change: impl Fn(&Config) + Send + 'static,
) -> Option<ConfigWatcher> {
    use notify_debouncer_mini::new_debouncer;

    let watch_dir = path.parent()?.to_path_buf();
    let current = parking_lot::Mutex::new(load_config_from(&path));
    let path_clone = path.clone();

    let mut debouncer = new_debouncer(
        constants::timing::CONFIG_DEBOUNCE,
        move |res: Result<Vec<notify_debouncer_mini::DebouncedEvent>, _>| {
            let Ok(events) = res else {
                return;
            };
            if !events.iter().any(|event| event.path == path_clone) {
                return;
            }
            let new_config = load_config_from(&path_clone);
            let mut prev = current.lock();
            if new_config != *prev {
                tracing::info!("Config file changed, reloading...");
                *prev = new_config.clone();
                drop(prev);
                on_change(&new_config);
            }
        },
    )
    .ok()?;

    debouncer
        .watcher()
        .watch(&watch_dir, notify::RecursiveMode::NonRecursive)
        .ok()?;

    tracing::info!("Watching config file: {:?}", path);
    Some(debouncer)
}
