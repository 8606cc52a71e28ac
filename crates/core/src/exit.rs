use async_trait::async_trait;
use std::time::Duration;

/// The HTTP GET an exit node performs on behalf of the circuit, abstracted
/// behind a trait so tests can substitute a mock server/website (spec.md
/// §8, scenarios S3/S4) without touching the network. Ported from
/// `get_request.py`'s `web_request`.
#[async_trait]
pub trait ExitFetch: Send + Sync {
    /// Fetch `target` and return the raw response bytes, or `None` on any
    /// failure (DNS, connect, timeout, bad status, encoding — the original
    /// collapses all of these into a single empty-result case; we keep
    /// that behavior rather than threading error detail back through the
    /// circuit, since the wire protocol has no slot for it).
    async fn fetch(&self, target: &str) -> Option<Vec<u8>>;
}

/// Production exit implementation backed by `reqwest`.
pub struct HttpExitFetch {
    client: reqwest::Client,
}

impl HttpExitFetch {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builder should never fail with no custom TLS config");
        Self { client }
    }
}

impl Default for HttpExitFetch {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl ExitFetch for HttpExitFetch {
    async fn fetch(&self, target: &str) -> Option<Vec<u8>> {
        let url = if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            format!("http://{target}")
        };
        let response = self.client.get(&url).send().await.ok()?;
        response.bytes().await.ok().map(|b| b.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticFetch(&'static [u8]);

    #[async_trait]
    impl ExitFetch for StaticFetch {
        async fn fetch(&self, _target: &str) -> Option<Vec<u8>> {
            Some(self.0.to_vec())
        }
    }

    #[tokio::test]
    async fn mock_fetch_returns_fixed_bytes() {
        let fetch = StaticFetch(b"hello world");
        assert_eq!(fetch.fetch("example.com").await.unwrap(), b"hello world");
    }
}
