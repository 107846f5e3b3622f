use crate::error::StreamError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_tungstenite::tungstenite::http::Uri;

/// Role of the tracking device, used to derive its mDNS fallback address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    #[default]
    Unknown,
    Face,
    LeftEye,
    RightEye,
}

impl DeviceType {
    /// Well-known mDNS stream address advertised by this device role
    pub fn mdns_url(&self) -> Option<&'static str> {
        match self {
            DeviceType::Unknown => None,
            DeviceType::Face => Some("ws://paper1.local:80/ws"),
            DeviceType::LeftEye => Some("ws://paper2.local:80/ws"),
            DeviceType::RightEye => Some("ws://paper3.local:80/ws"),
        }
    }
}

/// One candidate stream URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEndpoint {
    url: String,
}

impl StreamEndpoint {
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for StreamEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Turn a free-form device address into the ordered list of URLs to try.
///
/// `ws://` and `wss://` are kept, `http://` and `https://` become their
/// stream equivalents and anything else gets `ws://` prepended. A path-less
/// address yields the bare URL followed by the URL with `default_path`
/// appended, with any query kept after the path. The device role's mDNS
/// address, if any, is tried last.
pub fn normalize_address(
    address: &str,
    default_path: &str,
    device_type: DeviceType,
) -> Result<Vec<StreamEndpoint>, StreamError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(invalid(address, "address is empty"));
    }

    let url = with_stream_scheme(trimmed);
    let uri = url
        .parse::<Uri>()
        .map_err(|e| invalid(address, &e.to_string()))?;
    if uri.host().map_or(true, str::is_empty) {
        return Err(invalid(address, "missing host"));
    }

    let default_path = default_path.trim_matches('/');
    let mut urls = vec![url.clone()];
    if matches!(uri.path(), "" | "/") && !default_path.is_empty() {
        let scheme = uri.scheme_str().unwrap_or("ws");
        let authority = uri.authority().map_or("", |authority| authority.as_str());
        let query = uri.query().map(|query| format!("?{}", query)).unwrap_or_default();
        urls.push(format!("{}://{}/{}{}", scheme, authority, default_path, query));
    }

    if let Some(mdns) = device_type.mdns_url() {
        if !urls.iter().any(|candidate| candidate == mdns) {
            urls.push(mdns.to_string());
        }
    }

    Ok(urls.into_iter().map(|url| StreamEndpoint { url }).collect())
}

fn with_stream_scheme(address: &str) -> String {
    let lower = address.to_ascii_lowercase();
    if lower.starts_with("ws://") || lower.starts_with("wss://") {
        address.to_string()
    } else if lower.starts_with("http://") {
        format!("ws://{}", &address["http://".len()..])
    } else if lower.starts_with("https://") {
        format!("wss://{}", &address["https://".len()..])
    } else {
        format!("ws://{}", address)
    }
}

fn invalid(address: &str, details: &str) -> StreamError {
    StreamError::InvalidAddress {
        address: address.to_string(),
        details: details.to_string(),
    }
}
