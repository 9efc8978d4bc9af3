//! Plugin binary resolution.
//!
//! The configured plugin path may be a local file or an http(s) URL.
//! URLs are downloaded into the output directory first. Whatever we
//! end up with must look like a native executable (checked by magic
//! bytes) and is chmod'd executable and resolved to an absolute path.

use std::path::{Path, PathBuf};
use tracing::info;

use super::ConfigError;

/// ELF, Mach-O, and PE magic prefixes.
const EXECUTABLE_MAGICS: &[&[u8]] = &[
    b"\x7fELF",
    // Mach-O 32/64-bit, both endiannesses, and universal binaries.
    &[0xfe, 0xed, 0xfa, 0xce],
    &[0xfe, 0xed, 0xfa, 0xcf],
    &[0xce, 0xfa, 0xed, 0xfe],
    &[0xcf, 0xfa, 0xed, 0xfe],
    &[0xca, 0xfe, 0xba, 0xbe],
    b"MZ",
];

/// Resolves the configured plugin path to a validated absolute path.
pub async fn resolve_plugin(
    plugin_path: &str,
    output_dir: &str,
) -> Result<PathBuf, ConfigError> {
    let local = if Path::new(plugin_path).exists() {
        PathBuf::from(plugin_path)
    } else {
        fetch_over_http(plugin_path, output_dir).await?
    };
    let absolute = check_binary(&local)?;
    info!(path = %absolute.display(), "using shoes plugin");
    Ok(absolute)
}

/// Downloads the plugin binary into `output_dir`, named after the last
/// URL path segment.
async fn fetch_over_http(raw_url: &str, output_dir: &str) -> Result<PathBuf, ConfigError> {
    let url = reqwest::Url::parse(raw_url)
        .map_err(|e| ConfigError::PluginFetch(format!("{raw_url:?} is not a path or URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::PluginFetch(format!(
            "unsupported fetch scheme {:?}",
            url.scheme()
        )));
    }

    let file_name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            ConfigError::PluginFetch(format!("{raw_url:?} has no file name component"))
        })?;

    info!(url = raw_url, "fetching shoes plugin binary");
    let response = reqwest::get(url.clone())
        .await
        .map_err(|e| ConfigError::PluginFetch(e.to_string()))?;
    if !response.status().is_success() {
        return Err(ConfigError::PluginFetch(format!(
            "HTTP {} fetching {raw_url}",
            response.status()
        )));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| ConfigError::PluginFetch(e.to_string()))?;

    let destination = Path::new(output_dir).join(file_name);
    tokio::fs::write(&destination, &body)
        .await
        .map_err(|e| ConfigError::PluginFetch(format!("writing {}: {e}", destination.display())))?;
    Ok(destination)
}

/// Validates the file as a native executable, marks it executable, and
/// returns its absolute path.
fn check_binary(path: &Path) -> Result<PathBuf, ConfigError> {
    let head = std::fs::read(path)
        .map_err(|e| ConfigError::PluginInvalid(format!("reading {}: {e}", path.display())))?;

    if !EXECUTABLE_MAGICS
        .iter()
        .any(|magic| head.starts_with(magic))
    {
        return Err(ConfigError::PluginInvalid(format!(
            "{} is not a native executable",
            path.display()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| ConfigError::PluginInvalid(format!("chmod: {e}")))?;
    }

    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        std::fs::canonicalize(path)
            .map_err(|e| ConfigError::PluginInvalid(format!("resolving absolute path: {e}")))
    }
}
