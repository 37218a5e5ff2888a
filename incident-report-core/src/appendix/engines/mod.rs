//! Render engine trait and engine enum
//!
//! An engine hands out isolated sessions; each session renders exactly one
//! section and is dropped afterwards. Engines, and whatever browser process
//! they keep, are shared across jobs through the
//! [`RendererPool`](super::pool::RendererPool); sessions never are.

pub mod builtin;
pub mod chromium;
mod devtools;

pub use builtin::BuiltinEngine;
pub use chromium::ChromiumEngine;

use crate::config::{EngineKind, PageSize, RenderConfig};
use crate::error::RenderError;
use async_trait::async_trait;

/// Everything a session needs to render one section
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub section_index: usize,
    pub title: String,
    /// Running header, e.g. "Appendix A"
    pub header: String,
    pub body: String,
    /// Self-contained HTML document for HTML-capable engines
    pub html: String,
    pub page_size: PageSize,
}

#[async_trait]
pub trait RenderEngine: Send + Sync {
    /// Engine identifier for logging
    fn name(&self) -> &str;

    /// Whether the engine can currently open sessions
    fn is_healthy(&self) -> bool;

    /// Open a fresh session with no state carried over from earlier renders
    async fn open_session(&self) -> Result<Box<dyn RenderSession>, RenderError>;
}

#[async_trait]
pub trait RenderSession: Send {
    /// Render the request to PDF bytes
    async fn render(&mut self, request: &RenderRequest) -> Result<Vec<u8>, RenderError>;
}

/// Engine enum for runtime selection from config
pub enum EngineImpl {
    Builtin(BuiltinEngine),
    Chromium(ChromiumEngine),
}

impl EngineImpl {
    pub fn from_config(config: &RenderConfig) -> Result<Self, RenderError> {
        if config.engine == EngineKind::Auto && config.resolved_engine() == EngineKind::Builtin {
            log::warn!("⚠️  No Chromium binary configured; appendix pages use the builtin text layout");
        }
        match config.resolved_engine() {
            EngineKind::Chromium => {
                let path = config.chromium_path.as_deref().ok_or_else(|| RenderError::EngineUnavailable {
                    engine: "chromium".to_string(),
                    reason: "no chromium_path configured".to_string(),
                })?;
                Ok(EngineImpl::Chromium(ChromiumEngine::new(path)?))
            }
            EngineKind::Builtin | EngineKind::Auto => Ok(EngineImpl::Builtin(BuiltinEngine::new())),
        }
    }
}

#[async_trait]
impl RenderEngine for EngineImpl {
    fn name(&self) -> &str {
        match self {
            EngineImpl::Builtin(engine) => engine.name(),
            EngineImpl::Chromium(engine) => engine.name(),
        }
    }

    fn is_healthy(&self) -> bool {
        match self {
            EngineImpl::Builtin(engine) => engine.is_healthy(),
            EngineImpl::Chromium(engine) => engine.is_healthy(),
        }
    }

    async fn open_session(&self) -> Result<Box<dyn RenderSession>, RenderError> {
        match self {
            EngineImpl::Builtin(engine) => engine.open_session().await,
            EngineImpl::Chromium(engine) => engine.open_session().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_without_browser_is_builtin() {
        let engine = EngineImpl::from_config(&RenderConfig::default()).unwrap();
        assert_eq!(engine.name(), "builtin");
    }

    #[test]
    fn test_explicit_chromium_needs_a_binary() {
        let config = RenderConfig {
            engine: EngineKind::Chromium,
            chromium_path: Some("/nonexistent/chromium".to_string()),
            ..RenderConfig::default()
        };
        assert!(matches!(
            EngineImpl::from_config(&config),
            Err(RenderError::EngineUnavailable { .. })
        ));
    }

    #[test]
    fn test_auto_with_binary_is_chromium() {
        let binary = tempfile::NamedTempFile::new().unwrap();
        let config = RenderConfig {
            chromium_path: Some(binary.path().to_string_lossy().into_owned()),
            ..RenderConfig::default()
        };
        let engine = EngineImpl::from_config(&config).unwrap();
        assert_eq!(engine.name(), "chromium");
    }
}
