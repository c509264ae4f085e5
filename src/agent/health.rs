use std::time::Duration;

use async_trait::async_trait;
use log::debug;

/// Local self-check: can this node serve traffic right now?
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Probes the local proxy's admin endpoint. Any 2xx answer is healthy.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                let healthy = response.status().is_success();
                if !healthy {
                    debug!("Health probe {} returned {}", self.url, response.status());
                }
                healthy
            }
            Err(e) => {
                debug!("Health probe {} failed: {}", self.url, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn respond_with(status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let response = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\n\r\n");
            let _ = stream.write_all(response.as_bytes()).await;
        });
        format!("http://{addr}/config/")
    }

    #[tokio::test]
    async fn test_http_probe() {
        let timeout = Duration::from_secs(2);

        let healthy = HttpHealthProbe::new(respond_with("200 OK").await, timeout).unwrap();
        assert!(healthy.check().await);

        let failing =
            HttpHealthProbe::new(respond_with("502 Bad Gateway").await, timeout).unwrap();
        assert!(!failing.check().await);

        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            format!("http://{}/config/", listener.local_addr().unwrap())
        };
        let down = HttpHealthProbe::new(closed, timeout).unwrap();
        assert!(!down.check().await);
    }
}
