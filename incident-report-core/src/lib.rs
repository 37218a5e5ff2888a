// Incident Report Core Library
//
// Turns one aggregated incident record into a filled, appendix-extended and
// validated PDF report. Main interface is `ReportGenerator`.

pub mod appendix;
pub mod assembler;
pub mod cache;
pub mod coercion;
pub mod config;
pub mod error;
pub mod filler;
pub mod guard;
pub mod mapping;
pub mod pdf_text;
pub mod processor;
pub mod storage;
pub mod template;
pub mod types;

// Re-export main types and functions for easy use
pub use types::*;
pub use appendix::{AppendixRenderer, BuiltinEngine, ChromiumEngine, EngineImpl, RenderEngine, RendererPool};
pub use assembler::{AssembledDocument, DocumentAssembler};
pub use config::GeneratorConfig;
pub use error::{AssemblyError, CorruptionError, MappingError, RenderError, ReportError, TemplateError};
pub use guard::CorruptionGuard;
pub use mapping::{FieldMappingTable, ValidatedMapping};
pub use processor::{PipelineStages, ReportGenerator};
pub use template::{sample_template, SampleTemplateSpec, TemplateInfo};
