//! Read-time URL rewriting.
//!
//! Rows store artifact locations relative to the server root (`images/...`,
//! `uploads/...`). Responses prefix them with the base URL of the port the
//! listener actually bound, so a port change between runs does not break old
//! history. Legacy rows holding absolute URLs with a stale authority are
//! re-rooted the same way.

/// Rewrites stored artifact paths against the live base URL.
#[derive(Debug, Clone)]
pub struct UrlRewriter {
    base: String,
}

impl UrlRewriter {
    /// `override_base` (the `BASE_URL` setting) wins over the bound port.
    pub fn new(live_port: u16, override_base: Option<&str>) -> Self {
        let base = match override_base.map(str::trim).filter(|b| !b.is_empty()) {
            Some(b) => b.trim_end_matches('/').to_string(),
            None => format!("http://localhost:{}", live_port),
        };
        UrlRewriter { base }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn to_absolute(&self, path: &str) -> String {
        if path.is_empty() {
            return String::new();
        }
        if is_absolute(path) {
            let rel = to_relative(path);
            if rel == path {
                return path.to_string();
            }
            return format!("{}/{}", self.base, rel);
        }
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    pub fn to_absolute_all(&self, paths: &[String]) -> Vec<String> {
        paths.iter().map(|p| self.to_absolute(p)).collect()
    }

    /// Rewrites every entry of a JSON string array. Empty, `null` and `[]`
    /// pass through untouched, as does anything that is not a string array.
    pub fn ref_images_json(&self, raw: &str) -> String {
        if raw.is_empty() || raw == "null" || raw == "[]" {
            return raw.to_string();
        }
        match serde_json::from_str::<Vec<String>>(raw) {
            Ok(list) => serde_json::to_string(&self.to_absolute_all(&list))
                .unwrap_or_else(|_| raw.to_string()),
            Err(_) => raw.to_string(),
        }
    }
}

fn is_absolute(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Strips scheme and authority from an absolute URL. Relative input, and
/// absolute URLs without a path, come back unchanged.
pub fn to_relative(url: &str) -> &str {
    let Some(rest) = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
    else {
        return url;
    };
    match rest.find('/') {
        Some(slash) if slash > 0 && slash + 1 < rest.len() => &rest[slash + 1..],
        _ => url,
    }
}

/// Last path segment of a stored URL.
pub fn file_name(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}
