use url::Url;

use crate::config::CaptureConfig;

#[derive(Debug)]
pub enum CaptureError {
    InvalidUrl(String),
    BlockedDomain(String),
    Disabled,
    Failed(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUrl(reason) => write!(f, "invalid capture URL: {reason}"),
            Self::BlockedDomain(domain) => {
                write!(f, "domain `{domain}` is blocked for URL conversion")
            }
            Self::Disabled => f.write_str("URL conversion is disabled"),
            Self::Failed(reason) => write!(f, "capture failed: {reason}"),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Produces archive text for a live URL, typically by driving a headless
/// browser. Kept as a seam so the conversion path is testable without a
/// browser runtime.
pub trait UrlCapture {
    async fn capture(&self, url: &str) -> Result<String, CaptureError>;
}

/// Scheme, host, and blocklist checks applied before any browser work.
pub fn validate_capture_url(config: &CaptureConfig, raw_url: &str) -> Result<Url, CaptureError> {
    if !config.enabled {
        return Err(CaptureError::Disabled);
    }

    let url = Url::parse(raw_url).map_err(|err| {
        CaptureError::InvalidUrl(format!(
            "must include protocol (http/https) and domain: {err}"
        ))
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(CaptureError::InvalidUrl(
            "only HTTP and HTTPS protocols are allowed".to_owned(),
        ));
    }

    let Some(host) = url.host_str() else {
        return Err(CaptureError::InvalidUrl("URL has no host".to_owned()));
    };
    let mut domain = host.to_lowercase();
    if let Some(port) = url.port() {
        domain = format!("{domain}:{port}");
    }

    for blocked in &config.blocked_domains {
        let blocked = blocked.trim().to_lowercase();
        if !blocked.is_empty() && domain.contains(&blocked) {
            return Err(CaptureError::BlockedDomain(domain));
        }
    }

    Ok(url)
}

/// Derives the stored filename for a converted URL from its host, with any
/// port separator made filesystem-safe.
pub fn filename_for(url: &Url) -> String {
    let mut host = url.host_str().unwrap_or("capture").to_owned();
    if let Some(port) = url.port() {
        host = format!("{host}:{port}");
    }
    format!("{}.har", host.replace(':', "_"))
}
