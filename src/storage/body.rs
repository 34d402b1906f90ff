//! Response body draining and listing pagination.
//!
//! Every adapter hands its native body type to [`ByteSource::drain`] once,
//! at the boundary, and drives listing through [`collect_pages`] so callers
//! always see whole objects and complete listings.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

/// Something that can be drained into one owned buffer.
pub trait ByteSource: Send {
    fn drain(self) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send>>;
}

impl ByteSource for Bytes {
    fn drain(self) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send>> {
        Box::pin(async move { Ok(self) })
    }
}

impl ByteSource for Vec<u8> {
    fn drain(self) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send>> {
        Box::pin(async move { Ok(Bytes::from(self)) })
    }
}

impl ByteSource for String {
    fn drain(self) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send>> {
        Box::pin(async move { Ok(Bytes::from(self)) })
    }
}

impl ByteSource for reqwest::Response {
    fn drain(self) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send>> {
        Box::pin(async move {
            self.bytes()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to read response body: {e}"))
        })
    }
}

impl ByteSource for aws_sdk_s3::primitives::ByteStream {
    fn drain(self) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send>> {
        Box::pin(async move {
            let aggregated = self
                .collect()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to read object stream: {e}"))?;
            Ok(aggregated.into_bytes())
        })
    }
}

/// One page of a provider listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    /// Raw provider object names on this page.
    pub names: Vec<String>,
    /// Continuation token, marker, or cursor for the next page.
    pub next: Option<String>,
}

/// Fetch pages until the provider stops returning a continuation token.
///
/// `fetch` receives `None` for the first page. An empty token ends the
/// listing; a token seen twice is an error rather than an endless loop.
pub async fn collect_pages<F, Fut>(mut fetch: F) -> anyhow::Result<Vec<String>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = anyhow::Result<Page>>,
{
    let mut names = Vec::new();
    let mut seen = HashSet::new();
    let mut token = None;

    loop {
        let page = fetch(token.take()).await?;
        names.extend(page.names);

        match page.next.filter(|next| !next.is_empty()) {
            Some(next) => {
                if !seen.insert(next.clone()) {
                    anyhow::bail!("Listing returned continuation token {next:?} twice");
                }
                token = Some(next);
            }
            None => return Ok(names),
        }
    }
}
