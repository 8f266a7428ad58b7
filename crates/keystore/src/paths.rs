//! Platform directories for keyfiles and node configuration

use std::path::{Path, PathBuf};

const APP_DIR: &str = "tidewatch";

/// Expand a path, replacing a leading `~` with the user's home directory
///
/// ```
/// use tidewatch_keystore::expand_path;
/// use std::path::PathBuf;
///
/// let path = expand_path(&PathBuf::from("~/keys/node.key"));
/// assert!(!path.starts_with("~"));
/// ```
pub fn expand_path(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), home_dir()) {
        (Ok(stripped), Some(home)) => home.join(stripped),
        _ => path.to_path_buf(),
    }
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE").ok().map(PathBuf::from)
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}

#[derive(Clone, Copy)]
enum DirKind {
    Config,
    Data,
}

impl DirKind {
    /// (XDG variable, fallback under $HOME) on Linux
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    fn xdg(self) -> (&'static str, &'static str) {
        match self {
            DirKind::Config => ("XDG_CONFIG_HOME", ".config"),
            DirKind::Data => ("XDG_DATA_HOME", ".local/share"),
        }
    }
}

fn app_dir(kind: DirKind) -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        let (var, fallback) = kind.xdg();
        std::env::var(var)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                home_dir()
                    .map(|h| h.join(fallback))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join(APP_DIR)
    }
    #[cfg(target_os = "macos")]
    {
        let _ = kind;
        home_dir()
            .map(|h| h.join("Library/Application Support").join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from(format!(".{}", APP_DIR)))
    }
    #[cfg(target_os = "windows")]
    {
        let _ = kind;
        std::env::var("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(APP_DIR)
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        let _ = kind;
        home_dir()
            .map(|h| h.join(format!(".{}", APP_DIR)))
            .unwrap_or_else(|| PathBuf::from(format!(".{}", APP_DIR)))
    }
}

/// Directory holding node keyfiles
pub fn default_keystore_dir() -> PathBuf {
    app_dir(DirKind::Data).join("keys")
}

/// Directory holding the node's transport config file
pub fn default_config_dir() -> PathBuf {
    app_dir(DirKind::Config)
}

/// Keyfile used when no private key material is supplied
pub fn default_keyfile() -> PathBuf {
    default_keystore_dir().join("node.key")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_path_no_tilde() {
        let path = PathBuf::from("/absolute/path");
        assert_eq!(expand_path(&path), path);
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let path = PathBuf::from("~/some/path");
        let expanded = expand_path(&path);
        assert!(!expanded.starts_with("~"));
        assert!(expanded.ends_with("some/path"));
    }

    #[test]
    fn test_default_keyfile_lives_in_keystore_dir() {
        let keyfile = default_keyfile();
        assert!(keyfile.ends_with("keys/node.key"));
        assert!(keyfile.starts_with(default_keystore_dir()));
    }

    #[test]
    fn test_default_config_dir() {
        let dir = default_config_dir();
        assert!(dir.to_string_lossy().to_lowercase().contains(APP_DIR));
    }
}
