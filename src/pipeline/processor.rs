use async_trait::async_trait;
use bytes::Bytes;

use crate::util::content_hash;

/// Consumes payloads of changed feeds.
///
/// Called from the feed's pipeline worker, one payload at a time. An
/// `Err` or a panic is recorded and logged; the worker moves on to the
/// next payload either way.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, feed: &str, payload: Bytes) -> anyhow::Result<()>;
}

/// Logs each delivered payload's size and digest.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProcessor;

#[async_trait]
impl Processor for LogProcessor {
    async fn process(&self, feed: &str, payload: Bytes) -> anyhow::Result<()> {
        let digest = content_hash(&payload);
        tracing::info!(
            feed = %feed,
            bytes = payload.len(),
            sha256 = %&digest[..16],
            "Feed updated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_processor_accepts_any_payload() {
        let processor = LogProcessor;
        processor.process("feed", Bytes::new()).await.unwrap();
        processor
            .process("feed", Bytes::from_static(b"<rss/>"))
            .await
            .unwrap();
    }
}
