//! Document Assembler
//!
//! Builds a brand-new output document from the filled template and the
//! rendered appendix pages: base pages `1..=k`, the appendix block, then base
//! pages `k+1..=n`. The two base ranges are separate copy operations against
//! the same, immutably borrowed source; each resolves everything it touches
//! before the next one starts.

mod copier;
mod form;

use crate::appendix::AppendixPage;
use crate::error::AssemblyError;
use crate::filler::FilledDocument;
use crate::pdf_text::{page_content_digest, sha256_hex};
use crate::template::acro_form;
use copier::{CopiedPage, PageCopier};
use form::FormBuilder;
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId};

/// Where a page of the output comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedPage {
    /// 1-indexed page of the filled template
    Base { number: usize },
    Appendix { section_index: usize, title: String },
}

/// Page order of one assembled document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyPlan {
    pages: Vec<PlannedPage>,
    split: usize,
    base_page_count: usize,
    appendix_page_count: usize,
}

impl AssemblyPlan {
    pub fn new(base_page_count: usize, split: usize, appendix: &[AppendixPage]) -> Result<Self, AssemblyError> {
        if split > base_page_count {
            return Err(AssemblyError::InsertionPoint {
                split,
                page_count: base_page_count,
            });
        }
        let mut pages: Vec<PlannedPage> = (1..=split).map(|number| PlannedPage::Base { number }).collect();
        pages.extend(appendix.iter().map(|page| PlannedPage::Appendix {
            section_index: page.section_index,
            title: page.title.clone(),
        }));
        pages.extend((split + 1..=base_page_count).map(|number| PlannedPage::Base { number }));

        Ok(Self {
            pages,
            split,
            base_page_count,
            appendix_page_count: appendix.len(),
        })
    }

    pub fn pages(&self) -> &[PlannedPage] {
        &self.pages
    }

    /// Base pages placed before the appendix block
    pub fn split(&self) -> usize {
        self.split
    }

    pub fn base_page_count(&self) -> usize {
        self.base_page_count
    }

    pub fn appendix_page_count(&self) -> usize {
        self.appendix_page_count
    }

    pub fn expected_page_count(&self) -> usize {
        self.base_page_count + self.appendix_page_count
    }
}

/// Serialized output plus what the guard needs to verify it
#[derive(Debug, Clone)]
pub struct AssembledDocument {
    pub bytes: Vec<u8>,
    pub plan: AssemblyPlan,
    /// Content digest of every planned page, in output order
    pub page_digests: Vec<String>,
    pub form_fields: usize,
}

impl AssembledDocument {
    pub fn page_count(&self) -> usize {
        self.plan.expected_page_count()
    }

    pub fn sha256(&self) -> String {
        sha256_hex(&self.bytes)
    }
}

/// Pages written so far, in output order
struct OutputPages {
    parent: ObjectId,
    kids: Vec<Object>,
    digests: Vec<String>,
}

impl OutputPages {
    fn copy(
        &mut self,
        copier: &mut PageCopier<'_>,
        out: &mut Document,
        source: &Document,
        page_id: ObjectId,
    ) -> Result<CopiedPage, AssemblyError> {
        let page_index = self.kids.len() + 1;
        let digest = page_content_digest(source, page_id).map_err(|e| AssemblyError::PageCopy {
            page_index,
            reason: format!("content unreadable: {e}"),
        })?;
        let copied = copier
            .copy_page(out, page_id, self.parent)
            .map_err(|reason| AssemblyError::PageCopy { page_index, reason })?;
        self.kids.push(Object::Reference(copied.page_id));
        self.digests.push(digest);
        Ok(copied)
    }
}

#[derive(Debug, Clone)]
pub struct DocumentAssembler {
    compress: bool,
}

impl DocumentAssembler {
    pub fn new(compress: bool) -> Self {
        Self { compress }
    }

    /// Assemble the output. `split` is the number of base pages before the
    /// appendix block. Nothing in the result refers back to `filled`.
    pub fn assemble(
        &self,
        filled: &FilledDocument,
        appendix: &[AppendixPage],
        split: usize,
    ) -> Result<AssembledDocument, AssemblyError> {
        let source = filled.document();
        let base_pages: Vec<ObjectId> = source.get_pages().into_values().collect();
        let plan = AssemblyPlan::new(base_pages.len(), split, appendix)?;

        // Each appendix page comes from its own freshly loaded document
        let appendix_docs = appendix
            .iter()
            .map(|page| {
                Document::load_mem(&page.bytes).map_err(|e| AssemblyError::AppendixLoad {
                    section: page.title.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Document::with_version("1.7");
        let mut pages = OutputPages {
            parent: out.new_object_id(),
            kids: Vec::with_capacity(plan.expected_page_count()),
            digests: Vec::with_capacity(plan.expected_page_count()),
        };
        let mut form = FormBuilder::new();

        let mut leading = PageCopier::new(source);
        for page_id in &base_pages[..split] {
            let copied = pages.copy(&mut leading, &mut out, source, *page_id)?;
            for widget in copied.widgets {
                form.register(widget)?;
            }
        }

        for (page, doc) in appendix.iter().zip(&appendix_docs) {
            let Some(page_id) = doc.get_pages().into_values().next() else {
                return Err(AssemblyError::AppendixLoad {
                    section: page.title.clone(),
                    reason: "document has no pages".to_string(),
                });
            };
            // Rendered pages carry no form fields of the report
            pages.copy(&mut PageCopier::new(doc), &mut out, doc, page_id)?;
        }

        let mut trailing = PageCopier::new(source);
        for page_id in &base_pages[split..] {
            let copied = pages.copy(&mut trailing, &mut out, source, *page_id)?;
            for widget in copied.widgets {
                form.register(widget)?;
            }
        }

        let page_total = pages.kids.len();
        out.objects.insert(
            pages.parent,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => pages.kids,
                "Count" => page_total as i64,
            }),
        );

        let mut catalog = dictionary! {
            "Type" => "Catalog",
            "Pages" => pages.parent,
        };
        let form_fields = form.len();
        if let Some(source_form) = acro_form(source) {
            let form_dict = self.build_acro_form(&mut out, source, source_form, form);
            let form_id = out.add_object(form_dict);
            catalog.set("AcroForm", form_id);
        }
        let catalog_id = out.add_object(catalog);
        out.trailer.set("Root", catalog_id);

        let actual = out.get_pages().len();
        if actual != plan.expected_page_count() {
            return Err(AssemblyError::PageCountMismatch {
                expected: plan.expected_page_count(),
                actual,
            });
        }

        if self.compress {
            out.compress();
        }
        let mut bytes = Vec::new();
        out.save_to(&mut bytes)
            .map_err(|e| AssemblyError::Serialize(e.to_string()))?;

        log::info!(
            "📚 Assembled {} page(s): {} base + {} appendix after page {} ({} form fields)",
            actual,
            plan.base_page_count(),
            plan.appendix_page_count(),
            split,
            form_fields
        );

        Ok(AssembledDocument {
            bytes,
            plan,
            page_digests: pages.digests,
            form_fields,
        })
    }

    fn build_acro_form(
        &self,
        out: &mut Document,
        source: &Document,
        source_form: &Dictionary,
        form: FormBuilder,
    ) -> Dictionary {
        let mut form_dict = Dictionary::new();
        form_dict.set("Fields", form.finish(out));
        form_dict.set("NeedAppearances", true);

        let mut resources = PageCopier::new(source);
        for key in [b"DA".as_slice(), b"DR".as_slice(), b"Q".as_slice()] {
            if let Ok(value) = source_form.get(key) {
                let value = resources.copy_object(out, value);
                form_dict.set(key.to_vec(), value);
            }
        }
        form_dict
    }
}
