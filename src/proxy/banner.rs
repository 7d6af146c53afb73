//! Downstream version-banner capture
//!
//! Routing needs the client's SSH version line before authentication so
//! identity decoding can use `(user, ClientVersion)`. The SSH library
//! consumes the banner during the handshake without exposing it, so the
//! accepted socket is wrapped in a reader that records the first line as
//! it passes through, untouched.
//!
//! Per RFC 4253 §4.2 the first line a client sends is its identification
//! string, CR LF terminated and at most 255 bytes.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::OnceLock;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const MAX_BANNER_LEN: usize = 255;

/// Shared slot the captured banner lands in.
pub type CapturedBanner = Arc<OnceLock<String>>;

/// Transparent stream wrapper that records the peer's first line.
pub struct BannerCapture<S> {
    inner: S,
    banner: CapturedBanner,
    partial: Vec<u8>,
    done: bool,
}

impl<S> BannerCapture<S> {
    pub fn new(inner: S) -> (Self, CapturedBanner) {
        let banner: CapturedBanner = Arc::new(OnceLock::new());
        (
            Self {
                inner,
                banner: banner.clone(),
                partial: Vec::new(),
                done: false,
            },
            banner,
        )
    }

    fn scan(&mut self, bytes: &[u8]) {
        if self.done {
            return;
        }
        match bytes.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                self.partial.extend_from_slice(&bytes[..pos]);
                if self.partial.last() == Some(&b'\r') {
                    self.partial.pop();
                }
                let line = String::from_utf8_lossy(&self.partial).into_owned();
                let _ = self.banner.set(line);
                self.partial = Vec::new();
                self.done = true;
            }
            None => {
                self.partial.extend_from_slice(bytes);
                if self.partial.len() > MAX_BANNER_LEN {
                    // Not an SSH identification string; record what we
                    // have so decoding fails closed instead of hanging.
                    let line = String::from_utf8_lossy(&self.partial).into_owned();
                    let _ = self.banner.set(line);
                    self.partial = Vec::new();
                    self.done = true;
                }
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BannerCapture<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let fresh = buf.filled()[before..].to_vec();
                this.scan(&fresh);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BannerCapture<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn drain<S: AsyncRead + Unpin>(mut stream: S) {
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink).await;
    }

    #[tokio::test]
    async fn test_captures_crlf_banner() {
        let input: &[u8] = b"SSH-2.0-OpenSSH_9.6\r\nrest of the stream";
        let (wrapped, banner) = BannerCapture::new(input);
        drain(wrapped).await;
        assert_eq!(banner.get().map(String::as_str), Some("SSH-2.0-OpenSSH_9.6"));
    }

    #[tokio::test]
    async fn test_captures_lf_only_banner() {
        let input: &[u8] = b"SSH-2.0-termshare-host-client\npayload";
        let (wrapped, banner) = BannerCapture::new(input);
        drain(wrapped).await;
        assert_eq!(
            banner.get().map(String::as_str),
            Some("SSH-2.0-termshare-host-client")
        );
    }

    #[tokio::test]
    async fn test_banner_split_across_reads() {
        let (client, server) = tokio::io::duplex(8);
        let (wrapped, banner) = BannerCapture::new(server);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut client = client;
            client.write_all(b"SSH-2.0-termsh").await.unwrap();
            client.flush().await.unwrap();
            client.write_all(b"are-client\r\n").await.unwrap();
        });
        drain(wrapped).await;
        writer.await.unwrap();
        assert_eq!(
            banner.get().map(String::as_str),
            Some("SSH-2.0-termshare-client")
        );
    }

    #[tokio::test]
    async fn test_oversized_first_line_still_recorded() {
        let long = vec![b'x'; 400];
        let (wrapped, banner) = BannerCapture::new(&long[..]);
        drain(wrapped).await;
        let captured = banner.get().unwrap();
        assert!(captured.len() > MAX_BANNER_LEN);
        assert!(!captured.starts_with("SSH-"));
    }

    #[tokio::test]
    async fn test_passes_bytes_through_unchanged() {
        let input: &[u8] = b"SSH-2.0-x\r\nabc";
        let (mut wrapped, _) = BannerCapture::new(input);
        let mut out = Vec::new();
        wrapped.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"SSH-2.0-x\r\nabc");
    }
}
