//! Shell selection and the environment a session starts with.

use settings::constants::shell::{
    DEFAULT_SHELL, FALLBACK_PATH, INHERITED_VARS, SEARCH_DIRS,
};
use settings::constants::terminal::TERM;
use settings::Config;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// How a shell spells "remember the last exit status".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShellDialect {
    Posix,
    Fish,
}

impl ShellDialect {
    pub fn for_shell(name: &str) -> Self {
        match name {
            "fish" => Self::Fish,
            _ => Self::Posix,
        }
    }

    /// Statement that stores the previous command's status in `__pkgterm_ec`.
    pub fn capture_statement(self) -> &'static str {
        match self {
            Self::Posix => "__pkgterm_ec=$?",
            Self::Fish => "set __pkgterm_ec $status",
        }
    }
}

/// A resolved, allowed shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellSpec {
    pub path: PathBuf,
    /// Basename, used for noise table lookup.
    pub name: String,
    pub dialect: ShellDialect,
    pub args: Vec<String>,
}

impl ShellSpec {
    /// Resolve a shell choice against the allow-list.
    ///
    /// `choice` overrides `config.shell`. Anything not on the allow-list falls
    /// back to `config.default_shell`, and then to the built-in default.
    pub fn resolve(choice: Option<&str>, config: &Config) -> Self {
        let choice = choice
            .or(config.shell.as_deref())
            .map(str::trim)
            .filter(|c| !c.is_empty());

        if let Some(choice) = choice {
            if let Some(spec) = Self::from_choice(choice, config) {
                return spec;
            }
            tracing::warn!(
                "Shell {:?} is not allowed, falling back to {}",
                choice,
                config.default_shell
            );
        }

        Self::from_choice(&config.default_shell, config).unwrap_or_else(|| {
            let name = basename(DEFAULT_SHELL).unwrap_or("sh").to_string();
            Self::build(PathBuf::from(DEFAULT_SHELL), name, config)
        })
    }

    fn from_choice(choice: &str, config: &Config) -> Option<Self> {
        let name = basename(choice)?;
        if !config.is_shell_allowed(name) {
            return None;
        }
        let path = if choice.contains('/') {
            PathBuf::from(choice)
        } else {
            locate(name)
        };
        Some(Self::build(path, name.to_string(), config))
    }

    fn build(path: PathBuf, name: String, config: &Config) -> Self {
        Self {
            path,
            dialect: ShellDialect::for_shell(&name),
            name,
            args: config.shell_args.clone(),
        }
    }
}

fn basename(path: &str) -> Option<&str> {
    Path::new(path).file_name()?.to_str()
}

/// First existing `dir/name` among the standard directories.
fn locate(name: &str) -> PathBuf {
    SEARCH_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(name))
        .find(|candidate| candidate.is_file())
        .unwrap_or_else(|| Path::new("/bin").join(name))
}

/// Environment for a new session, built from the host process environment.
pub fn build_environment(shell: &ShellSpec, config: &Config) -> BTreeMap<String, String> {
    build_environment_from(shell, config, |key| std::env::var(key).ok())
}

/// Environment for a new session given a lookup into the host environment.
///
/// Only [`INHERITED_VARS`] and `PATH` are taken from the host; `PATH` gets the
/// configured prefixes in front, without duplicates. `config.env` wins over
/// everything else.
pub fn build_environment_from(
    shell: &ShellSpec,
    config: &Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    for key in INHERITED_VARS {
        if let Some(value) = lookup(key) {
            env.insert(key.to_string(), value);
        }
    }

    let host_path = lookup("PATH")
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| FALLBACK_PATH.to_string());
    env.insert(
        "PATH".to_string(),
        prefixed_path(&config.path_prefixes, &host_path),
    );

    env.insert("TERM".to_string(), TERM.to_string());
    env.insert("COLORTERM".to_string(), "truecolor".to_string());
    env.insert("CLICOLOR".to_string(), "1".to_string());
    env.insert("SHELL".to_string(), shell.path.display().to_string());

    for (key, value) in &config.env {
        env.insert(key.clone(), value.clone());
    }
    env
}

fn prefixed_path(prefixes: &[String], host_path: &str) -> String {
    let mut entries: Vec<&str> = Vec::new();
    for entry in prefixes
        .iter()
        .map(String::as_str)
        .chain(host_path.split(':'))
    {
        if !entry.is_empty() && !entries.contains(&entry) {
            entries.push(entry);
        }
    }
    entries.join(":")
}

/// Starting directory for a session, with a leading `~` expanded.
pub fn working_directory(config: &Config) -> Option<PathBuf> {
    let dir = config.working_directory.as_deref()?;
    match dir.strip_prefix('~') {
        Some(rest) => {
            let home = dirs::home_dir()?;
            Some(home.join(rest.trim_start_matches('/')))
        }
        None => Some(PathBuf::from(dir)),
    }
}
