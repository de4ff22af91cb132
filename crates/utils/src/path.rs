use std::path::Path;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

/// Resolve a path to its canonical, symlink-free form. The path must exist.
pub fn canonicalized(path: impl AsRef<Path>) -> Result<Utf8PathBuf> {
    let path = path.as_ref();
    let resolved = path
        .canonicalize()
        .with_context(|| format!("realpath failed: {}", path.display()))?;
    Utf8PathBuf::from_path_buf(resolved).map_err(|p| anyhow!("non UTF-8 path: {}", p.display()))
}

/// Append a trailing `/` unless one is already present. Directory paths
/// are compared in this form throughout the daemon.
pub fn with_trailing_slash(path: &Utf8Path) -> String {
    let s = path.as_str();
    if s.ends_with('/') {
        s.to_string()
    } else {
        format!("{s}/")
    }
}

/// The final component of a directory path, tolerating a trailing slash.
pub fn dir_name(path: &Utf8Path) -> Result<&str> {
    path.as_str()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("path has no final component: {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_trailing_slash() {
        assert_eq!(with_trailing_slash("/data/gsi/dsu".into()), "/data/gsi/dsu/");
        assert_eq!(with_trailing_slash("/data/gsi/dsu/".into()), "/data/gsi/dsu/");
    }

    #[test]
    fn test_dir_name() {
        assert_eq!(dir_name("/data/gsi/dsu/".into()).unwrap(), "dsu");
        assert_eq!(dir_name("/data/gsi/dsu".into()).unwrap(), "dsu");
        assert_eq!(dir_name("dsu".into()).unwrap(), "dsu");
        assert!(dir_name("/".into()).is_err());
    }

    #[test]
    fn test_canonicalized() {
        let t = std::env::temp_dir();
        let c = canonicalized(&t).unwrap();
        assert!(c.is_absolute());
        assert!(canonicalized(t.join("no/such/path/here")).is_err());
    }
}
