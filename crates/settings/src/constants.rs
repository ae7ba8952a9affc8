//! Centralized configuration constants for pkgterm.
//!
//! Compile-time defaults and limits, grouped by component. Values that users
//! may tune live in [`crate::Config`] and fall back to these.

/// Terminal geometry and identity.
pub mod terminal {
    /// Default width of a freshly spawned PTY.
    pub const DEFAULT_COLS: u16 = 80;
    /// Default height of a freshly spawned PTY.
    pub const DEFAULT_ROWS: u16 = 24;
    /// Smallest width a resize may request.
    pub const MIN_COLS: u16 = 20;
    /// Smallest height a resize may request.
    pub const MIN_ROWS: u16 = 5;
    /// Largest width a resize may request.
    pub const MAX_COLS: u16 = 1000;
    /// Largest height a resize may request.
    pub const MAX_ROWS: u16 = 1000;
    /// Value exported as `TERM` to the shell.
    pub const TERM: &str = "xterm-256color";
}

/// Shell selection and environment.
pub mod shell {
    /// Shell used when the configured choice is missing or not allowed.
    #[cfg(target_os = "macos")]
    pub const DEFAULT_SHELL: &str = "/bin/zsh";

    /// Shell used when the configured choice is missing or not allowed.
    #[cfg(not(target_os = "macos"))]
    pub const DEFAULT_SHELL: &str = "/bin/bash";

    /// Shell basenames a session may run.
    pub const ALLOWED_SHELLS: &[&str] = &["bash", "zsh", "sh", "dash", "ksh", "fish"];

    /// Directories searched when a shell is given by bare name.
    pub const SEARCH_DIRS: &[&str] = &[
        "/bin",
        "/usr/bin",
        "/usr/local/bin",
        "/opt/homebrew/bin",
        "/home/linuxbrew/.linuxbrew/bin",
    ];

    /// Package manager install locations prepended to `PATH`.
    pub const PATH_PREFIXES: &[&str] = &[
        "/opt/homebrew/bin",
        "/opt/homebrew/sbin",
        "/usr/local/bin",
        "/usr/local/sbin",
        "/home/linuxbrew/.linuxbrew/bin",
        "/home/linuxbrew/.linuxbrew/sbin",
    ];

    /// `PATH` tail used when the host process has none.
    pub const FALLBACK_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";

    /// Variables copied from the host environment into the shell.
    pub const INHERITED_VARS: &[&str] = &[
        "HOME",
        "USER",
        "LOGNAME",
        "LANG",
        "LC_ALL",
        "LC_CTYPE",
        "TMPDIR",
        "TZ",
        "SSH_AUTH_SOCK",
        "DISPLAY",
        "XDG_RUNTIME_DIR",
    ];
}

/// Flow control watermarks (bytes buffered toward the display sink).
pub mod flow {
    /// Pause the PTY once more than this many bytes are pending.
    pub const HIGH_WATERMARK: usize = 512 * 1024;
    /// Resume the PTY once pending bytes drop to this level.
    pub const LOW_WATERMARK: usize = 128 * 1024;
}

/// PTY plumbing.
pub mod pty {
    /// Bytes read from the PTY master per syscall.
    pub const READ_BUFFER_SIZE: usize = 8192;
    /// Capacity of the reader thread -> session actor channel.
    pub const EVENT_CHANNEL_CAPACITY: usize = 64;
}

/// Timing configuration.
pub mod timing {
    use std::time::Duration;

    /// How long an exec caller waits before giving up on its result.
    /// Package installs routinely run for many minutes.
    pub const EXEC_TIMEOUT: Duration = Duration::from_secs(30 * 60);
    /// Lower bound for a configured exec timeout.
    pub const MIN_EXEC_TIMEOUT: Duration = Duration::from_secs(1);
    /// Debounce window for config file change events.
    pub const CONFIG_DEBOUNCE: Duration = Duration::from_millis(100);
}

/// Settings file validation limits.
pub mod settings {
    /// Maximum settings file size in bytes (64 KB).
    pub const MAX_FILE_SIZE: u64 = 64 * 1024;

    /// Maximum length for string fields (shell paths, prefixes, patterns).
    pub const MAX_STRING_LENGTH: usize = 256;
}

#[cfg(test)]
#[allow(clippy::assertions_on_constants, clippy::const_is_empty)]
mod tests {
    use super::*;

    #[test]
    fn test_default_size_within_bounds() {
        assert!(terminal::DEFAULT_COLS >= terminal::MIN_COLS);
        assert!(terminal::DEFAULT_ROWS >= terminal::MIN_ROWS);
        assert!(terminal::DEFAULT_COLS <= terminal::MAX_COLS);
        assert!(terminal::DEFAULT_ROWS <= terminal::MAX_ROWS);
    }

    #[test]
    fn test_watermarks_leave_hysteresis_band() {
        assert!(
            flow::LOW_WATERMARK < flow::HIGH_WATERMARK,
            "LOW_WATERMARK ({}) must be below HIGH_WATERMARK ({})",
            flow::LOW_WATERMARK,
            flow::HIGH_WATERMARK
        );
    }

    #[test]
    fn test_default_shell_is_allowed() {
        let name = shell::DEFAULT_SHELL.rsplit('/').next().unwrap_or_default();
        assert!(
            shell::ALLOWED_SHELLS.contains(&name),
            "DEFAULT_SHELL '{}' should be in ALLOWED_SHELLS",
            shell::DEFAULT_SHELL
        );
    }

    #[test]
    fn test_exec_timeout_is_tens_of_minutes() {
        assert!(timing::EXEC_TIMEOUT.as_secs() >= 10 * 60);
        assert!(timing::EXEC_TIMEOUT > timing::MIN_EXEC_TIMEOUT);
    }

    #[test]
    fn test_max_string_length_allows_long_paths() {
        let long_prefix = "/home/linuxbrew/.linuxbrew/Cellar/coreutils/9.5/libexec/gnubin";
        assert!(settings::MAX_STRING_LENGTH >= long_prefix.len());
    }

    #[test]
    fn test_read_buffer_fits_under_watermark() {
        assert!(pty::READ_BUFFER_SIZE < flow::LOW_WATERMARK);
    }
}
