use crate::error::Error;
use crate::uri::file_uri_to_path;

/// Maps paths between the host filesystem and the container filesystem the
/// language server sees. When no host root is configured the mapper runs in
/// pass-through mode.
#[derive(Debug, Clone)]
pub struct PathMapper {
    host_root: String,
    container_root: String,
    enabled: bool,
}

/// True for Windows absolute paths (`C:\...` or `C:/...`), regardless of the
/// OS the bridge itself runs on.
pub fn is_windows_abs_path(p: &str) -> bool {
    let bytes = p.as_bytes();
    if bytes.len() < 2 {
        return false;
    }
    bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Converts backslashes to forward slashes and resolves `.`/`..` segments.
/// Works on the string form so Windows paths survive a POSIX host.
pub(crate) fn clean_slash_path(p: &str) -> String {
    let normalized = p.replace('\\', "/");
    let absolute = normalized.starts_with('/');

    // Preserve the drive prefix through cleaning: "D:/a/.." must not
    // collapse past "D:".
    let (prefix, rest) = if is_windows_abs_path(&normalized) {
        let (drive, tail) = normalized.split_at(2);
        (drive.to_string(), tail.to_string())
    } else {
        (String::new(), normalized)
    };

    let mut parts: Vec<&str> = Vec::new();
    for seg in rest.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|s| *s != "..") {
                    parts.pop();
                } else if !absolute && prefix.is_empty() {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if !prefix.is_empty() {
        if joined.is_empty() {
            prefix
        } else {
            format!("{prefix}/{joined}")
        }
    } else if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

fn has_prefix_fold(p: &str, prefix: &str) -> bool {
    p.len() >= prefix.len() && p[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Whether `prefix` covers `p` on a whole-segment boundary.
fn is_path_prefix(p: &str, prefix: &str, fold: bool) -> bool {
    let matches = if fold {
        has_prefix_fold(p, prefix)
    } else {
        p.starts_with(prefix)
    };
    if !matches {
        return false;
    }
    p.len() == prefix.len() || prefix.ends_with('/') || p.as_bytes()[prefix.len()] == b'/'
}

/// Checks that `path` resolves inside `base_dir`. Both are cleaned and
/// absolutized first, so `..` escape attempts fail after resolution.
/// Case-insensitive only when a Windows drive path is involved.
pub fn is_within_allowed_directory(path: &str, base_dir: &str) -> bool {
    let path = clean_abs_slash_path(path);
    let base = clean_abs_slash_path(base_dir);
    let fold = is_windows_abs_path(&path) || is_windows_abs_path(&base);
    is_path_prefix(&path, &base, fold)
}

fn clean_abs_slash_path(p: &str) -> String {
    let normalized = p.replace('\\', "/");
    if normalized.starts_with('/') || is_windows_abs_path(&normalized) {
        return clean_slash_path(&normalized);
    }
    let cwd = std::env::current_dir().unwrap_or_default();
    clean_slash_path(&format!("{}/{normalized}", cwd.to_string_lossy()))
}

impl PathMapper {
    pub fn new(host_root: &str, container_root: &str) -> Result<Self, Error> {
        if host_root.is_empty() {
            return Err(Error::Config("host root path cannot be empty".into()));
        }
        if container_root.is_empty() {
            return Err(Error::Config("container root path cannot be empty".into()));
        }

        let clean_host_root = clean_slash_path(host_root);
        let clean_container_root = container_root.trim_end_matches('/');
        if !clean_container_root.starts_with('/') {
            return Err(Error::Config(
                "container root must be an absolute path starting with /".into(),
            ));
        }

        Ok(Self {
            host_root: clean_host_root,
            container_root: clean_container_root.to_string(),
            enabled: true,
        })
    }

    /// Reads `HOST_PROJECTS_ROOT` (or `PROJECTS_HOST_ROOT`) and
    /// `PROJECTS_ROOT` (default `/projects`). Without a host root the mapper
    /// is disabled and passes paths through unchanged.
    pub fn from_env() -> Result<Self, Error> {
        let host_root = std::env::var("HOST_PROJECTS_ROOT")
            .or_else(|_| std::env::var("PROJECTS_HOST_ROOT"))
            .unwrap_or_default();
        let container_root =
            std::env::var("PROJECTS_ROOT").unwrap_or_else(|_| "/projects".to_string());

        if host_root.is_empty() {
            return Ok(Self {
                host_root: String::new(),
                container_root,
                enabled: false,
            });
        }

        Self::new(&host_root, &container_root)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn host_root(&self) -> &str {
        &self.host_root
    }

    pub fn container_root(&self) -> &str {
        &self.container_root
    }

    /// Converts a host path (or `file://` URI) to its container form,
    /// returning the same form as the input. Windows host paths are handled
    /// even when running on Linux.
    pub fn host_to_container(&self, host_path: &str) -> Result<String, Error> {
        if !self.enabled {
            return Ok(host_path.to_string());
        }
        if host_path.is_empty() {
            return Err(Error::Path("host path cannot be empty".into()));
        }

        let is_uri = host_path.starts_with("file://");
        let file_path = if is_uri {
            file_uri_to_path(host_path)?
        } else {
            host_path.to_string()
        };

        let clean_path = clean_slash_path(&file_path);

        // Case-insensitive for Windows roots; the relative portion keeps its
        // original case.
        if !is_path_prefix(&clean_path, &self.host_root, true) {
            return Err(Error::Path(format!(
                "path {clean_path} is outside mounted directory {}",
                self.host_root
            )));
        }

        let relative = clean_path[self.host_root.len()..].trim_start_matches('/');
        let container_path = if relative.is_empty() {
            self.container_root.clone()
        } else {
            clean_slash_path(&format!("{}/{relative}", self.container_root))
        };

        if is_uri {
            return Ok(format!("file://{container_path}"));
        }
        Ok(container_path)
    }

    /// Symmetric inverse of [`host_to_container`](Self::host_to_container).
    pub fn container_to_host(&self, container_path: &str) -> Result<String, Error> {
        if !self.enabled {
            return Ok(container_path.to_string());
        }
        if container_path.is_empty() {
            return Err(Error::Path("container path cannot be empty".into()));
        }

        let is_uri = container_path.starts_with("file://");
        let file_path = if is_uri {
            file_uri_to_path(container_path)?
        } else {
            container_path.to_string()
        };

        let clean_path = clean_slash_path(&file_path);

        if !is_path_prefix(&clean_path, &self.container_root, false) {
            return Err(Error::Path(format!(
                "path {clean_path} is outside container root {}",
                self.container_root
            )));
        }

        let relative = clean_path[self.container_root.len()..].trim_start_matches('/');
        let host_path = if relative.is_empty() {
            self.host_root.clone()
        } else {
            clean_slash_path(&format!("{}/{relative}", self.host_root))
        };

        if is_uri {
            return Ok(format!("file://{host_path}"));
        }
        Ok(host_path)
    }

    /// Validates that a host path stays inside the host root. Relative paths
    /// are resolved against the host root.
    pub fn validate_path(&self, host_path: &str) -> Result<(), Error> {
        if !self.enabled {
            return Ok(());
        }

        let mut clean_path = clean_slash_path(host_path);
        let is_absolute = clean_path.starts_with('/') || is_windows_abs_path(&clean_path);
        if !is_absolute {
            clean_path = clean_slash_path(&format!("{}/{clean_path}", self.host_root));
        }

        if !is_path_prefix(&clean_path, &self.host_root, true) {
            return Err(Error::Path(format!(
                "path is outside mounted directory: {host_path}"
            )));
        }
        Ok(())
    }

    /// Rewrites a host `file://` URI (or plain path) into a container URI.
    pub fn normalize_uri(&self, uri: &str) -> Result<String, Error> {
        if !self.enabled {
            return Ok(uri.to_string());
        }

        let file_path = if uri.starts_with("file://") {
            file_uri_to_path(uri)?
        } else {
            uri.to_string()
        };

        let container_path = self.host_to_container(&file_path)?;
        if container_path.starts_with("file://") {
            return Ok(container_path);
        }
        Ok(format!("file://{container_path}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> PathMapper {
        PathMapper::new("D:/My Projects/Projects 1C", "/projects").unwrap()
    }

    #[test]
    fn new_rejects_empty_roots() {
        assert!(matches!(
            PathMapper::new("", "/projects"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            PathMapper::new("D:/Projects", ""),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            PathMapper::new("D:/Projects", "projects"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn host_to_container_handles_windows_backslash_paths() {
        let m = mapper();
        let got = m
            .host_to_container("D:\\My Projects\\Projects 1C\\temp\\file.bsl")
            .unwrap();
        assert_eq!(got, "/projects/temp/file.bsl");
    }

    #[test]
    fn host_to_container_is_case_insensitive_on_the_root_only() {
        let m = mapper();
        let got = m
            .host_to_container("d:/my projects/projects 1c/Src/Module.bsl")
            .unwrap();
        // Relative portion keeps its case.
        assert_eq!(got, "/projects/Src/Module.bsl");
    }

    #[test]
    fn host_to_container_rejects_outside_paths() {
        let m = mapper();
        let err = m.host_to_container("D:/Other/file.bsl").unwrap_err();
        assert!(matches!(err, Error::Path(_)));
    }

    #[test]
    fn host_to_container_preserves_uri_form() {
        let m = mapper();
        let got = m
            .host_to_container("file:///D:/My%20Projects/Projects%201C/temp/file.bsl")
            .unwrap();
        assert_eq!(got, "file:///projects/temp/file.bsl");
    }

    #[test]
    fn container_to_host_round_trips() {
        let m = mapper();
        let container = m
            .host_to_container("D:/My Projects/Projects 1C/temp/file.bsl")
            .unwrap();
        let host = m.container_to_host(&container).unwrap();
        assert_eq!(host, "D:/My Projects/Projects 1C/temp/file.bsl");
    }

    #[test]
    fn container_to_host_rejects_outside_paths() {
        let m = mapper();
        assert!(m.container_to_host("/etc/passwd").is_err());
        // Sibling directory sharing the prefix string is still outside.
        assert!(m.container_to_host("/projects-other/file.bsl").is_err());
    }

    #[test]
    fn disabled_mapper_passes_through() {
        let m = PathMapper {
            host_root: String::new(),
            container_root: "/projects".to_string(),
            enabled: false,
        };
        assert_eq!(m.host_to_container("/anything").unwrap(), "/anything");
        assert_eq!(m.container_to_host("/anything").unwrap(), "/anything");
        assert!(m.validate_path("/anything").is_ok());
    }

    #[test]
    fn validate_path_resolves_relative_against_host_root() {
        let m = mapper();
        assert!(m.validate_path("temp/file.bsl").is_ok());
        assert!(m.validate_path("../outside").is_err());
    }

    #[test]
    fn within_allowed_directory_basics() {
        assert!(is_within_allowed_directory(
            "/path/to/mcp-lsp-bridge/lsp",
            "/path/to/mcp-lsp-bridge"
        ));
        assert!(!is_within_allowed_directory("/etc/config", "/path/to"));
        // Case sensitive on POSIX paths.
        assert!(!is_within_allowed_directory("/PATH/TO", "/path/to"));
        assert!(!is_within_allowed_directory("/", "/home"));
        assert!(is_within_allowed_directory(
            "/tmp/project/subdir",
            "/tmp/project"
        ));
    }

    #[test]
    fn within_allowed_directory_rejects_dotdot_escape() {
        assert!(!is_within_allowed_directory(
            "/path/to/mcp-lsp-bridge/../..",
            "/path/to/mcp-lsp-bridge"
        ));
        assert!(!is_within_allowed_directory(
            "/path/to/../../../etc",
            "/path/to"
        ));
        assert!(is_within_allowed_directory(
            "/path/to/mcp-lsp-bridge/./lsp",
            "/path/to/mcp-lsp-bridge"
        ));
    }

    #[test]
    fn within_allowed_directory_is_fold_for_windows_roots() {
        assert!(is_within_allowed_directory(
            "d:/projects/src/module.bsl",
            "D:/Projects"
        ));
        assert!(!is_within_allowed_directory("d:/other", "D:/Projects"));
    }

    #[test]
    fn within_allowed_directory_requires_segment_boundary() {
        assert!(!is_within_allowed_directory(
            "/tmp/project-sibling",
            "/tmp/project"
        ));
    }

    #[test]
    fn clean_slash_path_resolves_segments() {
        assert_eq!(clean_slash_path("/a/b/../c/./d"), "/a/c/d");
        assert_eq!(clean_slash_path("/a/b/../.."), "/");
        assert_eq!(clean_slash_path("D:\\a\\..\\b"), "D:/b");
        assert_eq!(clean_slash_path("D:/a/../../.."), "D:");
        assert_eq!(clean_slash_path("a//b///c"), "a/b/c");
    }
}
