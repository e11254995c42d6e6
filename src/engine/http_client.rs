use std::time::Duration;

use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

/// Pooled hyper client shared by all workers. Keep-alive is load-bearing:
/// response bodies must be read to completion or connections are not reused.
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    pub fn new() -> Self {
        Self::with_pool_size(500)
    }

    /// Create a client with a custom connection pool size.
    /// pool_size: maximum idle connections per host.
    // Must be called inside a Tokio runtime
    pub fn with_pool_size(pool_size: usize) -> Self {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(pool_size)
            .build(https);

        Self { client }
    }

    /// Send a request and collect the full response body.
    pub async fn request(
        &self,
        req: Request<String>,
    ) -> Result<Response<Bytes>, Box<dyn std::error::Error + Send + Sync>> {
        let (parts, body) = req.into_parts();
        let req = Request::from_parts(parts, Full::new(Bytes::from(body)));

        let response = self.client.request(req).await?;
        let (parts, body_stream) = response.into_parts();

        // Read the body stream to completion (required for keep-alive/reuse)
        let body = body_stream.collect().await?.to_bytes();

        Ok(Response::from_parts(parts, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_client_defaults() {
        // Just verify we can instantiate without panic
        let _client = HttpClient::new();
    }

    #[tokio::test]
    async fn test_http_client_custom_pool() {
        let _client = HttpClient::with_pool_size(50);
    }
}
