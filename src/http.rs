use crate::config::SessionConfig;
use reqwest::blocking::Client;

/// Blocking client for image downloads; must be built off the async runtime.
pub fn build_download_client(config: &SessionConfig) -> Client {
    Client::builder()
        .timeout(config.http_timeout)
        .connect_timeout(config.http_connect_timeout)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Partner image links are often protocol-relative (`//avatars...`).
pub fn normalize_image_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.starts_with("//") {
        format!("https:{trimmed}")
    } else {
        trimmed.to_string()
    }
}
