//! Appendix Page Renderer
//!
//! Turns narrative sections into one-page PDFs, one per section, in input
//! order. Sections render concurrently through the shared [`RendererPool`],
//! each in its own session. A section that fails or times out is replaced by
//! a "content unavailable" page unless fallback is disabled.

pub mod engines;
pub mod html;
pub mod layout;
pub mod pool;

pub use engines::{BuiltinEngine, ChromiumEngine, EngineImpl, RenderEngine, RenderRequest, RenderSession};
pub use pool::RendererPool;

use crate::config::{PageSize, RenderConfig};
use crate::error::{RenderError, ReportError};
use crate::pdf_text::sha256_hex;
use crate::types::{DiagnosticKind, Diagnostics, NarrativeKind, NarrativeSection};
use lopdf::Document;
use std::sync::Arc;
use tokio::task::JoinSet;

/// A narrative section accepted for rendering
#[derive(Debug, Clone, PartialEq)]
pub struct AppendixSection {
    /// Position in the appendix block
    pub section_index: usize,
    pub kind: NarrativeKind,
    pub title: String,
    pub body: String,
}

impl AppendixSection {
    pub fn header(&self) -> String {
        format!("Appendix {}", appendix_label(self.section_index))
    }
}

/// A, B, ..., Z, AA, AB, ...
pub fn appendix_label(index: usize) -> String {
    let mut label = Vec::new();
    let mut n = index + 1;
    while n > 0 {
        let rem = (n - 1) % 26;
        label.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    label.reverse();
    String::from_utf8_lossy(&label).into_owned()
}

/// Body printed for a section that arrived without text
pub const EMPTY_SECTION_TEXT: &str = "No text was recorded for this section.";

/// One appendix section per narrative entry, in order. Blank sections keep
/// their page with a placeholder body and are reported.
pub fn prepare_sections(narrative: &[NarrativeSection], diagnostics: &mut Diagnostics) -> Vec<AppendixSection> {
    narrative
        .iter()
        .enumerate()
        .map(|(section_index, section)| {
            let body = section.body.trim();
            let body = if body.is_empty() {
                diagnostics.record(
                    DiagnosticKind::EmptySection,
                    section.display_title(),
                    "section has no text; placeholder page rendered",
                );
                EMPTY_SECTION_TEXT
            } else {
                body
            };
            AppendixSection {
                section_index,
                kind: section.kind,
                title: section.display_title().to_string(),
                body: body.to_string(),
            }
        })
        .collect()
}

/// One rendered, single-page PDF
#[derive(Debug, Clone)]
pub struct AppendixPage {
    pub section_index: usize,
    pub title: String,
    pub bytes: Vec<u8>,
    /// True when the page is the "content unavailable" stand-in
    pub fallback: bool,
}

impl AppendixPage {
    pub fn sha256(&self) -> String {
        sha256_hex(&self.bytes)
    }
}

pub struct AppendixRenderer {
    pool: Arc<RendererPool>,
    page_size: PageSize,
    fallback_on_failure: bool,
}

impl AppendixRenderer {
    pub fn new(pool: Arc<RendererPool>, config: &RenderConfig) -> Self {
        Self {
            pool,
            page_size: config.page_size,
            fallback_on_failure: config.fallback_on_failure,
        }
    }

    fn request_for(&self, section: &AppendixSection) -> RenderRequest {
        RenderRequest {
            section_index: section.section_index,
            title: section.title.clone(),
            header: section.header(),
            body: section.body.clone(),
            html: html::section_html(section, self.page_size),
            page_size: self.page_size,
        }
    }

    pub async fn render(
        &self,
        sections: &[AppendixSection],
        diagnostics: &mut Diagnostics,
    ) -> Result<Vec<AppendixPage>, ReportError> {
        if sections.is_empty() {
            return Ok(Vec::new());
        }

        // Dropping the set aborts whatever is still running
        let mut tasks = JoinSet::new();
        for (position, section) in sections.iter().enumerate() {
            let pool = Arc::clone(&self.pool);
            let request = self.request_for(section);
            tasks.spawn(async move {
                let result = pool.render_page(&request).await;
                (position, result)
            });
        }

        let mut results: Vec<Option<Result<Vec<u8>, RenderError>>> = sections.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, result)) => {
                    if let Some(slot) = results.get_mut(position) {
                        *slot = Some(result);
                    }
                }
                Err(e) => log::error!("❌ Render task ended abnormally: {}", e),
            }
        }

        let mut pages = Vec::with_capacity(sections.len());
        for (section, result) in sections.iter().zip(results) {
            let outcome = result
                .unwrap_or_else(|| {
                    Err(RenderError::Failed {
                        section: section.title.clone(),
                        reason: "render task did not complete".to_string(),
                    })
                })
                .and_then(|bytes| keep_first_page(bytes, &section.title));

            match outcome {
                Ok((bytes, rendered_pages)) => {
                    if rendered_pages > 1 {
                        diagnostics.record(
                            DiagnosticKind::RenderOverflow,
                            &section.title,
                            format!("section rendered to {rendered_pages} pages; only the first is kept"),
                        );
                    }
                    pages.push(AppendixPage {
                        section_index: section.section_index,
                        title: section.title.clone(),
                        bytes,
                        fallback: false,
                    });
                }
                Err(err) => {
                    if !self.fallback_on_failure {
                        return Err(err.into());
                    }
                    diagnostics.record(
                        DiagnosticKind::RenderFallback,
                        &section.title,
                        format!("{err}; replaced with a content-unavailable page"),
                    );
                    let bytes = layout::fallback_page(&section.header(), &section.title, self.page_size).map_err(|e| {
                        ReportError::Render(RenderError::Failed {
                            section: section.title.clone(),
                            reason: format!("fallback page failed: {e}"),
                        })
                    })?;
                    pages.push(AppendixPage {
                        section_index: section.section_index,
                        title: section.title.clone(),
                        bytes,
                        fallback: true,
                    });
                }
            }
        }

        log::info!(
            "📄 Rendered {} appendix page(s) with {} ({} fallback)",
            pages.len(),
            self.pool.engine_name(),
            pages.iter().filter(|p| p.fallback).count()
        );
        Ok(pages)
    }
}

/// Check the render output parses and trim it to its first page.
/// Returns the bytes and the number of pages originally rendered.
fn keep_first_page(bytes: Vec<u8>, section: &str) -> Result<(Vec<u8>, usize), RenderError> {
    let invalid = |reason: String| RenderError::InvalidOutput {
        section: section.to_string(),
        reason,
    };
    let mut doc = Document::load_mem(&bytes).map_err(|e| invalid(e.to_string()))?;
    let page_count = doc.get_pages().len();
    match page_count {
        0 => Err(invalid("no pages".to_string())),
        1 => Ok((bytes, 1)),
        n => {
            let extra: Vec<u32> = (2..=n as u32).collect();
            doc.delete_pages(&extra);
            doc.prune_objects();
            let mut trimmed = Vec::new();
            doc.save_to(&mut trimmed).map_err(|e| invalid(e.to_string()))?;
            Ok((trimmed, n))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn renderer(fallback: bool) -> AppendixRenderer {
        let pool = RendererPool::new(Arc::new(BuiltinEngine::new()), 2, Duration::from_secs(10));
        let config = RenderConfig {
            fallback_on_failure: fallback,
            ..RenderConfig::default()
        };
        AppendixRenderer::new(Arc::new(pool), &config)
    }

    #[test]
    fn test_appendix_labels() {
        assert_eq!(appendix_label(0), "A");
        assert_eq!(appendix_label(25), "Z");
        assert_eq!(appendix_label(26), "AA");
    }

    #[test]
    fn test_blank_sections_keep_their_page() {
        let narrative = vec![
            NarrativeSection::new(NarrativeKind::Transcription, "I was driving north."),
            NarrativeSection::new(NarrativeKind::AiSummary, "   "),
            NarrativeSection::new(NarrativeKind::ClosingStatement, "That is all."),
        ];
        let mut diagnostics = Diagnostics::new();
        let sections = prepare_sections(&narrative, &mut diagnostics);

        assert_eq!(sections.len(), 3);
        assert_eq!(sections[1].section_index, 1);
        assert_eq!(sections[1].kind, NarrativeKind::AiSummary);
        assert_eq!(sections[1].body, EMPTY_SECTION_TEXT);
        assert_eq!(sections[2].section_index, 2);
        assert_eq!(diagnostics.of_kind(DiagnosticKind::EmptySection).count(), 1);
    }

    #[tokio::test]
    async fn test_render_preserves_order() {
        let narrative: Vec<_> = ["one", "two", "three"]
            .iter()
            .map(|body| NarrativeSection::new(NarrativeKind::Other, *body))
            .collect();
        let mut diagnostics = Diagnostics::new();
        let sections = prepare_sections(&narrative, &mut diagnostics);
        let pages = renderer(true).render(&sections, &mut diagnostics).await.unwrap();

        assert_eq!(pages.len(), 3);
        for (i, page) in pages.iter().enumerate() {
            assert_eq!(page.section_index, i);
            assert!(!page.fallback);
            assert_eq!(Document::load_mem(&page.bytes).unwrap().get_pages().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_long_section_is_trimmed_to_one_page() {
        let narrative = vec![NarrativeSection::new(NarrativeKind::Transcription, "word ".repeat(5000))];
        let mut diagnostics = Diagnostics::new();
        let sections = prepare_sections(&narrative, &mut diagnostics);
        let pages = renderer(true).render(&sections, &mut diagnostics).await.unwrap();

        assert_eq!(Document::load_mem(&pages[0].bytes).unwrap().get_pages().len(), 1);
        assert_eq!(diagnostics.of_kind(DiagnosticKind::RenderOverflow).count(), 1);
    }

    #[test]
    fn test_invalid_output_is_rejected() {
        assert!(matches!(
            keep_first_page(b"garbage".to_vec(), "S"),
            Err(RenderError::InvalidOutput { .. })
        ));
    }
}
