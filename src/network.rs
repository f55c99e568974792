use reqwest::Client;
use std::time::Duration;

/// Upgrade HTTP URLs to HTTPS (Cover Art Archive still hands out http:// links)
pub fn upgrade_to_https(url: &str) -> String {
    if url.starts_with("http://") {
        url.replacen("http://", "https://", 1)
    } else {
        url.to_string()
    }
}

/// Build the HTTP client shared by the catalog and art services.
///
/// The timeout bounds the whole request so a stalled service degrades to
/// "no match" instead of hanging the pipeline.
pub fn build_http_client(user_agent: &str, timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_to_https() {
        assert_eq!(
            upgrade_to_https("http://coverartarchive.org/release/x/1.jpg"),
            "https://coverartarchive.org/release/x/1.jpg"
        );
        assert_eq!(upgrade_to_https("https://a/b"), "https://a/b");
    }
}
