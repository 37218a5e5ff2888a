//! End-to-end pipeline tests.
//!
//! Every test builds the sample template in memory and runs full jobs through
//! `ReportGenerator` with the builtin render engine, then re-opens the output
//! with lopdf and checks page order, form contents and the corruption guard.
//!
//! No browser or fixture files required to run these tests.

use async_trait::async_trait;
use incident_report_core::appendix::{RenderRequest, RenderSession};
use incident_report_core::config::{GuardConfig, InsertionPoint, MappingConfig};
use incident_report_core::error::{CorruptionError, MappingError, RenderError, ReportError};
use incident_report_core::pdf_text::{object_text, page_content_digest};
use incident_report_core::*;
use lopdf::{Document, Object};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

fn builtin_pool() -> Arc<RendererPool> {
    Arc::new(RendererPool::new(Arc::new(BuiltinEngine::new()), 4, Duration::from_secs(10)))
}

fn template() -> Vec<u8> {
    sample_template(&SampleTemplateSpec::builtin()).unwrap()
}

fn generator() -> ReportGenerator {
    ReportGenerator::new(template(), GeneratorConfig::default(), builtin_pool()).unwrap()
}

fn fields(value: serde_json::Value) -> FieldSet {
    serde_json::from_value(value).unwrap()
}

/// Only the values the template marks as required
fn minimal_record() -> AggregatedIncidentRecord {
    AggregatedIncidentRecord {
        profile: fields(json!({
            "first_name": "Ada",
            "last_name": "Lovelace",
            "car_registration": "AB12 CDE",
        })),
        incident: fields(json!({
            "claim_reference": "CLM-0001",
            "accident_date": "2024-03-05T08:15:00Z",
            "location": "A40 westbound, junction 3",
        })),
        ..Default::default()
    }
}

fn narrative(count: usize) -> Vec<NarrativeSection> {
    let kinds = [
        NarrativeKind::Transcription,
        NarrativeKind::AiSummary,
        NarrativeKind::LiabilityAssessment,
        NarrativeKind::ClosingStatement,
    ];
    (0..count)
        .map(|i| NarrativeSection::new(kinds[i % kinds.len()], format!("Narrative paragraph number {i}.")))
        .collect()
}

/// Top-level form fields of the output: name → value
fn form_values(bytes: &[u8]) -> BTreeMap<String, Object> {
    let doc = Document::load_mem(bytes).unwrap();
    let root_id = doc.trailer.get(b"Root").unwrap().as_reference().unwrap();
    let catalog = doc.get_dictionary(root_id).unwrap();
    let acro_form = match catalog.get(b"AcroForm").unwrap() {
        Object::Reference(id) => doc.get_dictionary(*id).unwrap(),
        Object::Dictionary(dict) => dict,
        other => panic!("unexpected AcroForm object {other:?}"),
    };

    let mut values = BTreeMap::new();
    for field in acro_form.get(b"Fields").unwrap().as_array().unwrap() {
        let field = doc.get_dictionary(field.as_reference().unwrap()).unwrap();
        let name = object_text(field.get(b"T").unwrap()).unwrap();
        let value = field.get(b"V").cloned().unwrap_or(Object::Null);
        assert!(values.insert(name.clone(), value).is_none(), "field {name} appears twice");
    }
    values
}

fn text_value(values: &BTreeMap<String, Object>, name: &str) -> String {
    object_text(values.get(name).unwrap_or_else(|| panic!("no field {name}"))).unwrap_or_default()
}

fn is_checked(values: &BTreeMap<String, Object>, name: &str) -> bool {
    matches!(values.get(name), Some(Object::Name(state)) if state != b"Off")
}

/// Decoded content of each output page, in document order
fn page_texts(bytes: &[u8]) -> Vec<String> {
    let doc = Document::load_mem(bytes).unwrap();
    doc.get_pages()
        .values()
        .map(|id| String::from_utf8_lossy(&doc.get_page_content(*id).unwrap()).into_owned())
        .collect()
}

fn need_appearances(bytes: &[u8]) -> bool {
    let doc = Document::load_mem(bytes).unwrap();
    let root_id = doc.trailer.get(b"Root").unwrap().as_reference().unwrap();
    let catalog = doc.get_dictionary(root_id).unwrap();
    let acro_form = match catalog.get(b"AcroForm").unwrap() {
        Object::Reference(id) => doc.get_dictionary(*id).unwrap(),
        Object::Dictionary(dict) => dict,
        other => panic!("unexpected AcroForm object {other:?}"),
    };
    matches!(acro_form.get(b"NeedAppearances"), Ok(Object::Boolean(true)))
}

/// Engine whose sessions never finish
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
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }
}

// ============================================================================
// Page layout
// ============================================================================

#[tokio::test]
async fn test_minimal_record_produces_base_pages_only() {
    let report = generator().generate(&minimal_record()).await.unwrap();

    assert_eq!(report.page_count(), 6);
    assert_eq!(report.metadata.base_page_count, 6);
    assert_eq!(report.metadata.appendix_page_count, 0);
    assert!(report.bytes.starts_with(b"%PDF-"));

    let texts = page_texts(&report.bytes);
    for (index, text) in texts.iter().enumerate() {
        assert!(text.contains(&format!("page {} of 6", index + 1)), "page {} out of order", index + 1);
    }
}

#[tokio::test]
async fn test_appendix_goes_before_declaration_page() {
    let record = AggregatedIncidentRecord {
        narrative: narrative(4),
        ..minimal_record()
    };
    let report = generator().generate(&record).await.unwrap();

    assert_eq!(report.page_count(), 10);
    assert_eq!(report.metadata.appendix_page_count, 4);

    let texts = page_texts(&report.bytes);
    for page in 0..5 {
        assert!(texts[page].contains(&format!("page {} of 6", page + 1)));
    }
    for (offset, label) in ["A", "B", "C", "D"].iter().enumerate() {
        assert!(texts[5 + offset].contains(&format!("Appendix {label}")));
    }
    assert!(texts[9].contains("page 6 of 6"));
}

#[tokio::test]
async fn test_insertion_after_first_page() {
    let config = GeneratorConfig {
        insertion_point: InsertionPoint::AfterPage(1),
        ..GeneratorConfig::default()
    };
    let generator = ReportGenerator::new(template(), config, builtin_pool()).unwrap();
    let record = AggregatedIncidentRecord {
        narrative: narrative(2),
        ..minimal_record()
    };
    let report = generator.generate(&record).await.unwrap();

    let texts = page_texts(&report.bytes);
    assert_eq!(texts.len(), 8);
    assert!(texts[0].contains("page 1 of 6"));
    assert!(texts[1].contains("Appendix A"));
    assert!(texts[2].contains("Appendix B"));
    assert!(texts[3].contains("page 2 of 6"));
    assert!(texts[7].contains("page 6 of 6"));
}

#[tokio::test]
async fn test_blank_sections_get_a_placeholder_page() {
    let mut sections = narrative(2);
    sections.insert(1, NarrativeSection::new(NarrativeKind::Other, "   "));
    let record = AggregatedIncidentRecord {
        narrative: sections,
        ..minimal_record()
    };
    let report = generator().generate(&record).await.unwrap();

    assert_eq!(report.metadata.appendix_page_count, 3);
    assert_eq!(report.page_count(), 9);
    assert!(report.diagnostics.iter().any(|d| d.kind == DiagnosticKind::EmptySection));

    let texts = page_texts(&report.bytes);
    assert!(texts[6].contains("Appendix B"));
    assert!(texts[6].contains("No text was recorded"));
}

// ============================================================================
// Form contents
// ============================================================================

#[tokio::test]
async fn test_form_survives_assembly() {
    let generator = generator();
    let record = AggregatedIncidentRecord {
        narrative: narrative(3),
        ..minimal_record()
    };
    let report = generator.generate(&record).await.unwrap();
    let values = form_values(&report.bytes);

    assert_eq!(text_value(&values, "driver_first_name"), "Ada");
    assert_eq!(text_value(&values, "vehicle_registration"), "AB12 CDE");
    assert_eq!(text_value(&values, "accident_date"), "05/03/2024");
    assert_eq!(text_value(&values, "claim_reference"), "CLM-0001");
    assert!(need_appearances(&report.bytes));

    // Every template field exists exactly once, with all of its widgets
    let output = TemplateInfo::inspect(&report.bytes).unwrap();
    let expected: Vec<&str> = generator.template().field_names().collect();
    let actual: Vec<&str> = output.field_names().collect();
    assert_eq!(actual, expected);
    for (name, field) in &generator.template().fields {
        assert_eq!(output.field(name).unwrap().widget_count, field.widget_count, "{name}");
    }

    // Fields on the last base page moved behind the appendix
    assert_eq!(output.field("declaration_name").unwrap().pages, vec![9]);
    assert_eq!(output.field("claim_reference").unwrap().pages, vec![1, 2, 3, 4, 5, 9]);
}

#[tokio::test]
async fn test_witnesses_land_in_numbered_slots() {
    let mut record = minimal_record();
    record.witnesses = vec![
        WitnessRecord {
            index: Some(0),
            fields: fields(json!({ "name": "First Witness", "phone": "07700 900001" })),
        },
        WitnessRecord {
            index: Some(1),
            fields: fields(json!({ "name": "Second Witness" })),
        },
    ];
    let report = generator().generate(&record).await.unwrap();
    let values = form_values(&report.bytes);

    assert_eq!(text_value(&values, "witness_name"), "First Witness");
    assert_eq!(text_value(&values, "witness_phone_number"), "07700 900001");
    assert_eq!(text_value(&values, "witness_name_2"), "Second Witness");
    assert_eq!(text_value(&values, "witness_name_3"), "");
}

#[tokio::test]
async fn test_sparse_witness_index_keeps_its_slot() {
    let mut record = minimal_record();
    record.witnesses = vec![WitnessRecord {
        index: Some(2),
        fields: fields(json!({ "name": "Third Witness" })),
    }];
    let report = generator().generate(&record).await.unwrap();
    let values = form_values(&report.bytes);

    assert_eq!(text_value(&values, "witness_name"), "");
    assert_eq!(text_value(&values, "witness_name_2"), "");
    assert_eq!(text_value(&values, "witness_name_3"), "Third Witness");
}

#[tokio::test]
async fn test_weather_tags_round_trip() {
    let mut record = minimal_record();
    record
        .incident
        .insert("weather_conditions".to_string(), json!(["rain", "fog"]));
    let report = generator().generate(&record).await.unwrap();
    let values = form_values(&report.bytes);

    assert!(is_checked(&values, "weather_rain"));
    assert!(is_checked(&values, "weather_fog"));
    assert!(!is_checked(&values, "weather_clear"));
    assert!(!is_checked(&values, "weather_cloudy"));
}

#[tokio::test]
async fn test_exclusive_group_keeps_one_member() {
    let mut record = minimal_record();
    record.incident.insert("road_surface_wet".to_string(), json!(true));
    record.incident.insert("road_surface_icy".to_string(), json!(true));
    let report = generator().generate(&record).await.unwrap();
    let values = form_values(&report.bytes);

    let checked: Vec<&str> = ["dry", "wet", "icy", "snow", "loose"]
        .iter()
        .copied()
        .filter(|surface| is_checked(&values, &format!("road_surface_{surface}")))
        .collect();
    assert_eq!(checked, vec!["icy"]);
    assert!(report
        .diagnostics
        .iter()
        .any(|d| d.kind == DiagnosticKind::ExclusiveGroupViolation));
}

#[tokio::test]
async fn test_missing_required_values_are_diagnostics() {
    let report = generator().generate(&AggregatedIncidentRecord::default()).await.unwrap();

    assert_eq!(report.page_count(), 6);
    let missing = report
        .diagnostics
        .iter()
        .filter(|d| d.kind == DiagnosticKind::MissingRequiredValue)
        .count();
    assert_eq!(missing, 5);
}

// ============================================================================
// Determinism and capture
// ============================================================================

#[tokio::test]
async fn test_same_record_same_bytes() {
    let generator = generator();
    let record = AggregatedIncidentRecord {
        narrative: narrative(2),
        ..minimal_record()
    };
    let first = generator.generate(&record).await.unwrap();
    let second = generator.generate(&record).await.unwrap();

    assert_eq!(first.metadata.output_sha256, second.metadata.output_sha256);
    assert!(first.bytes == second.bytes);
    assert_ne!(first.metadata.job_id, second.metadata.job_id);
}

#[tokio::test]
async fn test_capture_stages() {
    let record = AggregatedIncidentRecord {
        narrative: narrative(1),
        ..minimal_record()
    };
    let stages = generator().generate_capture_stages(&record).await.unwrap();

    assert!(stages.values.len() > 50);
    assert!(stages.filled_template.starts_with(b"%PDF-"));
    assert_eq!(stages.appendix_pages.len(), 1);
    assert_eq!(stages.guard.page_count, 7);
    assert_eq!(stages.report.page_count(), 7);

    let stage_names: Vec<&str> = stages.report.metadata.timings.iter().map(|t| t.stage.as_str()).collect();
    assert_eq!(
        stage_names,
        vec!["1. Coerce", "2. Fill", "3. Render appendix", "4. Assemble", "5. Validate"]
    );
}

// ============================================================================
// Corruption guard on real output
// ============================================================================

#[tokio::test]
async fn test_guard_rejects_tampered_output() {
    let record = AggregatedIncidentRecord {
        narrative: narrative(2),
        ..minimal_record()
    };
    let report = generator().generate(&record).await.unwrap();
    let guard = CorruptionGuard::new(GuardConfig::default());

    let doc = Document::load_mem(&report.bytes).unwrap();
    let digests: Vec<String> = doc
        .get_pages()
        .values()
        .map(|id| page_content_digest(&doc, *id).unwrap())
        .collect();
    assert!(guard.validate(&report.bytes, 8, &digests).is_ok());

    // Truncated file
    let truncated = &report.bytes[..report.bytes.len() / 2];
    assert!(guard.validate(truncated, 8, &digests).is_err());

    // Wrong page count expectation
    assert!(matches!(
        guard.validate(&report.bytes, 9, &digests),
        Err(CorruptionError::PageCount { expected: 9, actual: 8 })
    ));

    // Swap the first two pages and re-save
    let mut swapped = Document::load_mem(&report.bytes).unwrap();
    let root_id = swapped.trailer.get(b"Root").unwrap().as_reference().unwrap();
    let pages_id = swapped
        .get_dictionary(root_id)
        .unwrap()
        .get(b"Pages")
        .unwrap()
        .as_reference()
        .unwrap();
    let pages = swapped.get_dictionary_mut(pages_id).unwrap();
    let mut kids = pages.get(b"Kids").unwrap().as_array().unwrap().clone();
    kids.swap(0, 1);
    pages.set("Kids", kids);
    let mut bytes = Vec::new();
    swapped.save_to(&mut bytes).unwrap();

    assert!(matches!(
        guard.validate(&bytes, 8, &digests),
        Err(CorruptionError::PageOrder { page_index: 1, .. })
    ));
}

#[tokio::test]
async fn test_guard_checks_every_xref_stream_offset() {
    let record = AggregatedIncidentRecord {
        narrative: narrative(2),
        ..minimal_record()
    };
    let report = generator().generate(&record).await.unwrap();
    let guard = CorruptionGuard::new(GuardConfig::default());
    let clean = guard.validate(&report.bytes, 8, &[]).unwrap();
    assert!(clean.xref_entries >= report.page_count());

    // Rows are [type u8, offset u32, generation u16]; nudge the last in-use row
    let bytes = &report.bytes;
    let marker = bytes.windows(9).rposition(|w| w == b"startxref").unwrap();
    let digits: String = bytes[marker + 9..]
        .iter()
        .map(|b| *b as char)
        .skip_while(|c| c.is_whitespace())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let xref_at: usize = digits.parse().unwrap();
    let rows = xref_at + bytes[xref_at..].windows(7).position(|w| w == b"stream\n").unwrap() + 7;
    let end = rows + bytes[rows..].windows(9).position(|w| w == b"endstream").unwrap();
    let row = (rows..end - 7)
        .step_by(7)
        .filter(|at| bytes[*at] == 1)
        .last()
        .unwrap();

    let mut tampered = bytes.clone();
    let offset = u32::from_be_bytes(tampered[row + 1..row + 5].try_into().unwrap());
    tampered[row + 1..row + 5].copy_from_slice(&(offset + 1).to_be_bytes());
    assert!(matches!(
        guard.validate(&tampered, 8, &[]),
        Err(CorruptionError::CrossReference(_))
    ));
}

// ============================================================================
// Failure modes
// ============================================================================

#[tokio::test]
async fn test_strict_drift_fails_at_startup() {
    let template = sample_template(&SampleTemplateSpec::builtin().without_field("road_marking_visible")).unwrap();
    let err = ReportGenerator::new(template, GeneratorConfig::default(), builtin_pool())
        .err()
        .unwrap();

    assert_eq!(
        err,
        ReportError::Mapping(MappingError::TemplateDrift {
            fields: vec!["road_marking_visible".to_string()]
        })
    );
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_lenient_drift_still_generates() {
    let template = sample_template(&SampleTemplateSpec::builtin().without_field("road_marking_visible")).unwrap();
    let config = GeneratorConfig {
        mapping: MappingConfig {
            strict_validation: false,
            ..MappingConfig::default()
        },
        ..GeneratorConfig::default()
    };
    let generator = ReportGenerator::new(template, config, builtin_pool()).unwrap();
    let report = generator.generate(&minimal_record()).await.unwrap();

    assert_eq!(report.page_count(), 6);
    assert!(!form_values(&report.bytes).contains_key("road_marking_visible"));
}

#[tokio::test]
async fn test_stalled_render_gets_fallback_page() {
    let pool = Arc::new(RendererPool::new(Arc::new(StallingEngine), 2, Duration::from_millis(100)));
    let generator = ReportGenerator::new(template(), GeneratorConfig::default(), pool).unwrap();
    let record = AggregatedIncidentRecord {
        narrative: narrative(2),
        ..minimal_record()
    };
    let report = generator.generate(&record).await.unwrap();

    assert_eq!(report.page_count(), 8);
    let fallbacks = report
        .diagnostics
        .iter()
        .filter(|d| d.kind == DiagnosticKind::RenderFallback)
        .count();
    assert_eq!(fallbacks, 2);
}

#[tokio::test]
async fn test_stalled_render_without_fallback_fails() {
    let pool = Arc::new(RendererPool::new(Arc::new(StallingEngine), 2, Duration::from_millis(100)));
    let mut config = GeneratorConfig::default();
    config.render.fallback_on_failure = false;
    let generator = ReportGenerator::new(template(), config, pool).unwrap();
    let record = AggregatedIncidentRecord {
        narrative: narrative(1),
        ..minimal_record()
    };
    let err = generator.generate(&record).await.unwrap_err();

    assert!(matches!(err, ReportError::RenderTimeout { timeout_ms: 100, .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_job_timeout_names_the_stage() {
    let pool = Arc::new(RendererPool::new(Arc::new(StallingEngine), 2, Duration::from_secs(60)));
    let config = GeneratorConfig {
        job_timeout_ms: 300,
        ..GeneratorConfig::default()
    };
    let generator = ReportGenerator::new(template(), config, pool).unwrap();
    let record = AggregatedIncidentRecord {
        narrative: narrative(1),
        ..minimal_record()
    };
    let err = generator.generate(&record).await.unwrap_err();

    assert_eq!(
        err,
        ReportError::JobTimeout {
            stage: "render".to_string(),
            budget_ms: 300
        }
    );
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_jobs_share_one_pool() {
    let pool = builtin_pool();
    let generator = Arc::new(ReportGenerator::new(template(), GeneratorConfig::default(), Arc::clone(&pool)).unwrap());

    let mut handles = Vec::new();
    for job in 0..8 {
        let generator = Arc::clone(&generator);
        handles.push(tokio::spawn(async move {
            let mut record = minimal_record();
            record
                .incident
                .insert("claim_reference".to_string(), json!(format!("CLM-{job:04}")));
            record.narrative = narrative(job % 3 + 1);
            let report = generator.generate(&record).await.unwrap();
            (job, report)
        }));
    }

    for handle in handles {
        let (job, report) = handle.await.unwrap();
        assert_eq!(report.page_count(), 6 + job % 3 + 1);
        let values = form_values(&report.bytes);
        assert_eq!(text_value(&values, "claim_reference"), format!("CLM-{job:04}"));
    }
    assert_eq!(pool.in_flight(), 0);
}
