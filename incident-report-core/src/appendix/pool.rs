use super::engines::{EngineImpl, RenderEngine, RenderRequest};
use crate::config::RenderConfig;
use crate::error::RenderError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Render engine shared by all jobs of a process.
///
/// Bounds the number of simultaneous sessions across jobs and enforces the
/// per-page timeout. Every call opens its own session, so nothing rendered for
/// one section is visible to another.
pub struct RendererPool {
    engine: Arc<dyn RenderEngine>,
    permits: Arc<Semaphore>,
    capacity: usize,
    page_timeout: Duration,
}

impl RendererPool {
    pub fn new(engine: Arc<dyn RenderEngine>, max_concurrent: usize, page_timeout: Duration) -> Self {
        let capacity = max_concurrent.max(1);
        Self {
            engine,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            page_timeout,
        }
    }

    pub fn from_config(config: &RenderConfig) -> Result<Self, RenderError> {
        let engine = EngineImpl::from_config(config)?;
        log::info!(
            "🖨️  Render pool: engine={}, max_concurrent={}, page_timeout={}ms",
            engine.name(),
            config.max_concurrent_renders,
            config.page_timeout_ms
        );
        Ok(Self::new(
            Arc::new(engine),
            config.max_concurrent_renders,
            config.page_timeout(),
        ))
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    pub fn is_healthy(&self) -> bool {
        self.engine.is_healthy()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sessions currently rendering
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn page_timeout(&self) -> Duration {
        self.page_timeout
    }

    /// Render one section in a fresh session. Waiting for a free slot does not
    /// count against the page timeout.
    pub async fn render_page(&self, request: &RenderRequest) -> Result<Vec<u8>, RenderError> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RenderError::EngineUnavailable {
                engine: self.engine.name().to_string(),
                reason: "render pool is closed".to_string(),
            })?;

        let work = async {
            let mut session = self.engine.open_session().await?;
            session.render(request).await
        };

        match tokio::time::timeout(self.page_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(RenderError::Timeout {
                section: request.title.clone(),
                timeout_ms: self.page_timeout.as_millis() as u64,
            }),
        }
    }
}

impl std::fmt::Debug for RendererPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendererPool")
            .field("engine", &self.engine.name())
            .field("capacity", &self.capacity)
            .field("page_timeout", &self.page_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appendix::engines::{BuiltinEngine, RenderSession};
    use crate::config::PageSize;
    use async_trait::async_trait;

    struct StallingEngine;

    struct StallingSession;

    #[async_trait]
    impl RenderEngine for StallingEngine {
        fn name(&self) -> &str {
            "stalling"
        }

        fn is_healthy(&self) -> bool {
            true
        }

        async fn open_session(&self) -> Result<Box<dyn RenderSession>, RenderError> {
            Ok(Box::new(StallingSession))
        }
    }

    #[async_trait]
    impl RenderSession for StallingSession {
        async fn render(&mut self, _request: &RenderRequest) -> Result<Vec<u8>, RenderError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    fn request(title: &str) -> RenderRequest {
        RenderRequest {
            section_index: 0,
            title: title.to_string(),
            header: "Appendix A".to_string(),
            body: "Body".to_string(),
            html: String::new(),
            page_size: PageSize::A4,
        }
    }

    #[tokio::test]
    async fn test_page_timeout() {
        let pool = RendererPool::new(Arc::new(StallingEngine), 2, Duration::from_millis(50));
        let err = pool.render_page(&request("Slow")).await.unwrap_err();
        assert_eq!(
            err,
            RenderError::Timeout {
                section: "Slow".to_string(),
                timeout_ms: 50
            }
        );
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_builtin_render_through_pool() {
        let pool = RendererPool::new(Arc::new(BuiltinEngine::new()), 1, Duration::from_secs(10));
        let bytes = pool.render_page(&request("Summary")).await.unwrap();
        assert!(bytes.starts_with(b"%PDF-"));
        assert_eq!(pool.capacity(), 1);
    }
}
