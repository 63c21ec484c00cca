//! Duffle home directory layout

use std::path::{Path, PathBuf};

const CLAIMS_DIR: &str = "claims";
const CREDENTIALS_DIR: &str = "credentials";

/// Root of duffle's local state
///
/// Resolved once in `main` and passed to every command; nothing reads it from
/// ambient state.
#[derive(Debug, Clone)]
pub struct DuffleHome {
    root: PathBuf,
}

impl DuffleHome {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `--home` / `$DUFFLE_HOME` when given, otherwise `~/.duffle`
    pub fn resolve(explicit: Option<PathBuf>) -> Self {
        let root = explicit.unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".duffle")
        });
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the file claim store keeps claims
    pub fn claims(&self) -> PathBuf {
        self.root.join(CLAIMS_DIR)
    }

    /// Where named credential sets live
    pub fn credentials(&self) -> PathBuf {
        self.root.join(CREDENTIALS_DIR)
    }

    /// Path of a credential set given either a path or a bare name
    ///
    /// Anything that looks like a path (has a separator or a YAML extension,
    /// or exists) is used as is; a bare name maps to
    /// `<home>/credentials/<name>.yaml`.
    pub fn credential_set(&self, name_or_path: &str) -> PathBuf {
        let given = Path::new(name_or_path);
        let looks_like_path = name_or_path.contains(std::path::MAIN_SEPARATOR)
            || name_or_path.contains('/')
            || given.extension().is_some_and(|e| e == "yaml" || e == "yml")
            || given.exists();
        if looks_like_path {
            given.to_path_buf()
        } else {
            self.credentials().join(format!("{name_or_path}.yaml"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let home = DuffleHome::new("/tmp/duffle-home");
        assert_eq!(home.claims(), PathBuf::from("/tmp/duffle-home/claims"));
        assert_eq!(home.credentials(), PathBuf::from("/tmp/duffle-home/credentials"));
    }

    #[test]
    fn test_credential_set_name_or_path() {
        let home = DuffleHome::new("/tmp/duffle-home");
        assert_eq!(
            home.credential_set("dev"),
            PathBuf::from("/tmp/duffle-home/credentials/dev.yaml")
        );
        assert_eq!(home.credential_set("./creds.yaml"), PathBuf::from("./creds.yaml"));
        assert_eq!(home.credential_set("/abs/creds"), PathBuf::from("/abs/creds"));
    }

    #[test]
    fn test_explicit_home_wins() {
        let home = DuffleHome::resolve(Some(PathBuf::from("/srv/duffle")));
        assert_eq!(home.root(), Path::new("/srv/duffle"));
    }
}
