//! HTTP transport. Artifacts are streamed zstd-compressed with `PUT` and
//! fetched back with `GET` on the returned URL.

use async_compression::tokio::bufread::ZstdEncoder;
use async_compression::tokio::write::ZstdDecoder;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio_util::io::ReaderStream;

use super::RemoteTransport;
use crate::utils::{BackupError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpTransport {
    base_url: String,
    token: Option<String>,
    host: String,
    client: reqwest::Client,
}

impl HttpTransport {
    /// `timeout` bounds each whole request, body included, so a stalled
    /// remote turns into an upload failure instead of hanging the caller.
    pub fn new(base_url: String, token: Option<String>, timeout: Duration) -> Result<Self> {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "store".to_string());
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            base_url,
            token,
            host,
            client,
        })
    }

    fn object_url(&self, name: &str) -> String {
        format!(
            "{}/backups/{}/{}.zst",
            self.base_url.trim_end_matches('/'),
            self.host,
            name
        )
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) if !token.is_empty() => req.bearer_auth(token),
            _ => req,
        }
    }
}

impl RemoteTransport for HttpTransport {
    fn upload<'a>(&'a self, local: &'a Path, name: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let url = self.object_url(name);
            let file = tokio::fs::File::open(local).await?;
            let size = file.metadata().await?.len();

            let compressed = ZstdEncoder::new(BufReader::new(file));
            let body = reqwest::Body::wrap_stream(ReaderStream::new(compressed));

            let resp = self
                .authorize(self.client.put(&url))
                .header("content-encoding", "zstd")
                .header("x-original-size", size.to_string())
                .body(body)
                .send()
                .await?;

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                return Err(BackupError::Transport(format!("upload {url}: {status} {text}")));
            }

            tracing::info!(url = %url, bytes = size, "[Remote] Uploaded artifact");
            Ok(url)
        })
    }

    fn download<'a>(&'a self, remote_ref: &'a str, dest: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let resp = self.authorize(self.client.get(remote_ref)).send().await?;
            if !resp.status().is_success() {
                return Err(BackupError::Transport(format!(
                    "download {remote_ref}: {}",
                    resp.status()
                )));
            }

            let file = tokio::fs::File::create(dest).await?;
            let mut decoder = ZstdDecoder::new(file);
            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                decoder.write_all(&chunk?).await?;
            }
            decoder.shutdown().await?;
            decoder.into_inner().sync_all().await?;

            tracing::info!(url = %remote_ref, "[Remote] Downloaded artifact");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_url_layout() {
        let transport = HttpTransport {
            base_url: "https://sync.example.com/".into(),
            token: None,
            host: "till-01".into(),
            client: reqwest::Client::new(),
        };
        assert_eq!(
            transport.object_url("20240101T000000000Z-abcd1234.db"),
            "https://sync.example.com/backups/till-01/20240101T000000000Z-abcd1234.db.zst"
        );
    }

    #[tokio::test]
    async fn test_stalled_remote_times_out() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("b1.db");
        std::fs::write(&local, b"artifact").unwrap();
        let transport = HttpTransport::new(
            format!("http://{addr}"),
            None,
            Duration::from_millis(300),
        )
        .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), transport.upload(&local, "b1.db"))
            .await
            .expect("upload should give up on its own");
        assert!(result.is_err());
        server.abort();
    }
}
