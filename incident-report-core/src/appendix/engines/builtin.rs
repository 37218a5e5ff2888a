use super::{RenderEngine, RenderRequest, RenderSession};
use crate::appendix::layout::text_document;
use crate::error::RenderError;
use async_trait::async_trait;

/// In-process engine: lays the section text out with the standard Helvetica
/// fonts. Ignores the HTML and renders title and body directly.
#[derive(Debug, Default, Clone)]
pub struct BuiltinEngine;

impl BuiltinEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RenderEngine for BuiltinEngine {
    fn name(&self) -> &str {
        "builtin"
    }

    fn is_healthy(&self) -> bool {
        true
    }

    async fn open_session(&self) -> Result<Box<dyn RenderSession>, RenderError> {
        Ok(Box::new(BuiltinSession))
    }
}

struct BuiltinSession;

#[async_trait]
impl RenderSession for BuiltinSession {
    async fn render(&mut self, request: &RenderRequest) -> Result<Vec<u8>, RenderError> {
        let request = request.clone();
        tokio::task::spawn_blocking(move || {
            text_document(&request.header, &request.title, &request.body, request.page_size).map_err(|e| {
                RenderError::Failed {
                    section: request.title.clone(),
                    reason: e.to_string(),
                }
            })
        })
        .await
        .map_err(|e| RenderError::Failed {
            section: String::new(),
            reason: format!("layout task failed: {e}"),
        })?
    }
}
