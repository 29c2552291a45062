use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use url::Url;

use crate::error::Error;
use crate::pathmap::{clean_slash_path, is_windows_abs_path};

/// Characters percent-encoded inside the path component of a file URI
/// (RFC 3986 path rules; `/`, `:` and `@` stay literal).
const PATH_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'[')
    .add(b']')
    .add(b'^')
    .add(b'|');

/// Normalizes input into a valid URI.
///
/// File URIs are returned unchanged: some language servers match opened
/// documents by exact URI string equality, so re-encoding here would break
/// them. Other schemes pass through; everything else is treated as a local
/// path.
pub fn normalize_uri(uri: &str) -> String {
    let uri = uri.trim();
    if uri.is_empty() {
        return uri.to_string();
    }

    if uri.starts_with("file://") || uri.starts_with("file:") {
        return uri.to_string();
    }

    if uri.contains("://") {
        return uri.to_string();
    }

    match path_to_file_uri(uri) {
        Ok(u) => u,
        // Fallback: preserve the original input with a file:// prefix.
        Err(_) => format!("file://{}", uri.replace('\\', "/")),
    }
}

/// Converts a file URI or local path to a local path. Non-file inputs are
/// returned unchanged.
pub fn uri_to_file_path(uri: &str) -> String {
    let uri = uri.trim();
    if uri.starts_with("file://") || uri.starts_with("file:") {
        if let Ok(p) = file_uri_to_path(uri) {
            return p;
        }
        return uri
            .trim_start_matches("file://")
            .trim_start_matches("file:")
            .to_string();
    }
    uri.to_string()
}

/// Converts a local path to a file URI. Inputs that already look like URIs
/// are returned unchanged.
pub fn file_path_to_uri(path: &str) -> String {
    let path = path.trim();
    if path.is_empty() || path.contains("://") {
        return path.to_string();
    }
    match path_to_file_uri(path) {
        Ok(u) => u,
        Err(_) => format!("file://{}", path.replace('\\', "/")),
    }
}

/// Converts a `file://` URI into a local path, decoding percent escapes.
///
/// UNC URIs (`file://server/share/...`) keep their `//server/share` form.
/// Windows drive-letter URIs (`file:///C:/...`) lose the leading slash so
/// the result starts at the drive letter — handled regardless of the
/// runtime OS, because the bridge may run in a Linux container against a
/// Windows host.
pub fn file_uri_to_path(uri: &str) -> Result<String, Error> {
    let url = Url::parse(uri).map_err(|e| Error::Path(format!("invalid uri {uri}: {e}")))?;
    if url.scheme() != "file" {
        return Err(Error::Path(format!("not a file uri: {}", url.scheme())));
    }

    if let Some(host) = url.host_str().filter(|h| !h.is_empty()) {
        let p = decode_path(url.path())?;
        return Ok(format!("//{host}{p}"));
    }

    let mut p = decode_path(url.path())?;
    if p.starts_with('/') && p.len() >= 3 && p.as_bytes()[2] == b':' {
        p.remove(0);
    }
    Ok(p)
}

/// Converts a local path into a `file://` URI.
///
/// Windows absolute paths are detected before any absolutization: calling
/// the equivalent of `abs()` on `D:/...` under Linux would prepend the
/// current working directory and corrupt the path.
pub fn path_to_file_uri(path: &str) -> Result<String, Error> {
    let path = path.trim();
    if path.is_empty() {
        return Err(Error::Path("path is empty".into()));
    }

    let is_windows_abs = is_windows_abs_path(path);

    let slash_path = if is_windows_abs {
        let mut s = path.replace('\\', "/");
        while s.contains("//") {
            s = s.replace("//", "/");
        }
        s
    } else if path.starts_with('/') || path.starts_with('\\') {
        clean_slash_path(path)
    } else {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::Path(format!("cannot resolve relative path {path}: {e}")))?;
        clean_slash_path(&format!("{}/{path}", cwd.to_string_lossy()))
    };

    // Drive-letter paths need a leading "/" in the URI path component.
    let uri_path = if slash_path.len() >= 2 && slash_path.as_bytes()[1] == b':' {
        format!("/{slash_path}")
    } else {
        slash_path
    };

    Ok(format!(
        "file://{}",
        utf8_percent_encode(&uri_path, PATH_SET)
    ))
}

fn decode_path(path: &str) -> Result<String, Error> {
    validate_percent_escapes(path)?;
    percent_decode_str(path)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| Error::Path(format!("invalid uri path escape: {e}")))
}

fn validate_percent_escapes(path: &str) -> Result<(), Error> {
    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len()
                || !bytes[i + 1].is_ascii_hexdigit()
                || !bytes[i + 2].is_ascii_hexdigit()
            {
                return Err(Error::Path(format!("invalid percent escape in {path}")));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(())
}
