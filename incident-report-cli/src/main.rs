use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;

// Import from incident-report-core
use incident_report_core::cache::ReportCacheKey;
use incident_report_core::config::{EngineKind, MappingConfig};
use incident_report_core::storage::{
    calculate_json_hash, calculate_template_hash, FileStorage, NoOpStorage, ReportStorage,
};
use incident_report_core::{
    sample_template, AggregatedIncidentRecord, FieldMappingTable, GeneratedReport, GeneratorConfig, MappingError,
    PipelineStages, RendererPool, ReportError, ReportGenerator, SampleTemplateSpec, TemplateInfo, ValidatedMapping,
};

// Import CLI utilities
use incident_report_cli::{ChromiumLocator, FieldSearch};

#[derive(Parser)]
#[command(name = "incident-report")]
#[command(about = "Generate a filled car-incident report PDF from an aggregated intake record")]
struct Args {
    /// Path to the aggregated incident record (JSON)
    #[arg(short, long)]
    record: Option<String>,

    /// Path to the fillable report template (PDF)
    #[arg(short, long)]
    template: Option<String>,

    /// Path to custom config file (YAML format)
    #[arg(short, long)]
    config: Option<String>,

    /// Output file path (if not specified, auto-generated from the record name)
    #[arg(short, long)]
    output: Option<String>,

    /// List the template's form fields and exit
    #[arg(long)]
    list_fields: bool,

    /// Propose template field names for mapping targets missing from the template, then exit
    #[arg(long)]
    suggest_fields: bool,

    /// Write a synthetic template with every built-in mapping field to this path and exit
    #[arg(long)]
    write_sample_template: Option<String>,

    /// Path to a Chromium binary; selects the chromium render engine
    #[arg(long)]
    chromium_path: Option<String>,

    /// Enable detailed profiling of all pipeline stages
    #[arg(long)]
    profile: bool,

    /// Skip cache and force fresh generation (useful for development/testing)
    #[arg(long)]
    skip_cache: bool,

    /// Directory for cached reports
    #[arg(long, default_value = ".incident-report-cache")]
    cache_dir: String,

    /// Dump all intermediate pipeline stage outputs to a directory
    /// Captures: field values, filled template, appendix pages, and the final report
    #[arg(long)]
    dump_stages: bool,

    /// Directory for stage dump output (default: test_outputs/stages)
    #[arg(long, default_value = "test_outputs/stages")]
    stages_dir: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    println!("🚗 Incident Report Generator");

    if let Some(path) = &args.write_sample_template {
        let bytes = sample_template(&SampleTemplateSpec::builtin())?;
        std::fs::write(path, &bytes).with_context(|| format!("Failed to write sample template to {path}"))?;
        println!("💾 Sample template saved to: {} ({} bytes)", path, bytes.len());
        return Ok(());
    }

    let template_path = args
        .template
        .as_deref()
        .ok_or_else(|| anyhow!("--template is required (or use --write-sample-template)"))?;
    let template_bytes =
        std::fs::read(template_path).with_context(|| format!("Failed to read template {template_path}"))?;

    // Load config using the functional pattern
    let mut config = GeneratorConfig::load_with_fallback(args.config.as_deref());
    if let Some(config_path) = &args.config {
        println!("📋 Loaded config from: {}", config_path);
    } else {
        println!("📋 Using default config");
    }

    if args.list_fields {
        return list_fields(&template_bytes);
    }
    if args.suggest_fields {
        return suggest_fields(&template_bytes, &config.mapping);
    }

    // Apply CLI overrides to config
    let requested = args.chromium_path.clone().or_else(|| config.render.chromium_path.clone());
    if args.chromium_path.is_some() || config.render.engine == EngineKind::Chromium {
        let binary = ChromiumLocator::new().locate(requested.as_deref())?;
        config.render.engine = EngineKind::Chromium;
        config.render.chromium_path = Some(binary.to_string_lossy().into_owned());
    } else if config.render.engine == EngineKind::Auto {
        match ChromiumLocator::new().locate(requested.as_deref()) {
            Ok(binary) => config.render.chromium_path = Some(binary.to_string_lossy().into_owned()),
            Err(_) => println!("📝 No Chromium found; appendix pages use the builtin text layout"),
        }
    }

    let record_path = args.record.as_deref().ok_or_else(|| anyhow!("--record is required"))?;
    let record = load_record(record_path)?;
    println!("📄 Processing: {}", record_path);

    let pool = Arc::new(RendererPool::from_config(&config.render)?);
    let generator = match ReportGenerator::new(template_bytes.clone(), config.clone(), pool) {
        Ok(generator) => generator.with_profiling(args.profile),
        Err(ReportError::Mapping(MappingError::TemplateDrift { fields })) => {
            eprintln!("❌ Template is missing {} mapped field(s):", fields.len());
            for field in &fields {
                eprintln!("   - {}", field);
            }
            eprintln!("   Run with --suggest-fields to find likely renames");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("❌ Template rejected: {e}");
            std::process::exit(1);
        }
    };

    // Stage dump mode: capture and save all intermediates
    if args.dump_stages {
        println!("\n🔬 Pipeline stage dump mode");
        match generator.generate_capture_stages(&record).await {
            Ok(stages) => {
                save_stages(&stages, &args.stages_dir)?;
                println!("\n✅ All stages dumped to: {}", args.stages_dir);
            }
            Err(e) => {
                eprintln!("❌ Stage dump failed: {e}");
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let storage: Box<dyn ReportStorage> = if args.skip_cache {
        Box::new(NoOpStorage::new())
    } else {
        Box::new(FileStorage::new(&args.cache_dir)?)
    };
    let cache_key = ReportCacheKey::new(
        calculate_json_hash(&record)?,
        calculate_template_hash(&template_bytes),
        calculate_json_hash(&config)?,
    );

    let cached = match storage.get_report(&cache_key) {
        Ok(cached) => cached,
        Err(e) => {
            log::warn!("⚠️  Cache read failed: {}", e);
            None
        }
    };

    let report = match cached {
        Some(cached) => {
            println!("⚡ Cache hit: {}", cache_key.to_cache_hash());
            cached.into_report()
        }
        None => match generator.generate(&record).await {
            Ok(report) => {
                if let Err(e) = storage.store_report(&cache_key, &report) {
                    log::warn!("⚠️  Failed to cache report: {}", e);
                }
                report
            }
            Err(e) => {
                eprintln!("❌ Generation failed: {e}");
                if e.is_retryable() {
                    eprintln!("   This failure may not recur; retrying the same record is safe");
                }
                std::process::exit(1);
            }
        },
    };

    let output_path = args.output.clone().unwrap_or_else(|| default_output_path(record_path));
    save_report(&report, &output_path)?;
    Ok(())
}

fn load_record(path: &str) -> Result<AggregatedIncidentRecord> {
    let json = std::fs::read_to_string(path).with_context(|| format!("Failed to read record {path}"))?;
    serde_json::from_str(&json).with_context(|| format!("Failed to parse record {path}"))
}

fn default_output_path(record_path: &str) -> String {
    let record_name = Path::new(record_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("incident");
    format!("{record_name}_report.pdf")
}

fn list_fields(template_bytes: &[u8]) -> Result<()> {
    let template = TemplateInfo::inspect(template_bytes)?;
    println!(
        "\n📋 Template: {} page(s), {} field(s), sha256 {}",
        template.page_count,
        template.fields.len(),
        template.sha256
    );
    for field in template.fields.values() {
        let pages: Vec<String> = field.pages.iter().map(|p| p.to_string()).collect();
        let max_len = field.max_len.map(|n| format!(" max_len={n}")).unwrap_or_default();
        let on_state = field
            .on_state
            .as_ref()
            .map(|s| format!(" on={s}"))
            .unwrap_or_default();
        println!(
            "  {:<45} {:<10} pages=[{}]{}{}",
            field.name,
            format!("{:?}", field.kind).to_lowercase(),
            pages.join(","),
            max_len,
            on_state
        );
    }
    Ok(())
}

fn suggest_fields(template_bytes: &[u8], mapping_config: &MappingConfig) -> Result<()> {
    let template = TemplateInfo::inspect(template_bytes)?;
    let lenient = MappingConfig {
        strict_validation: false,
        ..mapping_config.clone()
    };
    let mapping = ValidatedMapping::validate(FieldMappingTable::builtin(), &template, &lenient)?;

    if mapping.missing_fields().is_empty() {
        println!("✅ Every mapped field exists in the template");
        return Ok(());
    }

    let candidates: Vec<&str> = template.field_names().collect();
    let mut search = FieldSearch::new();
    println!("\n🔍 {} mapped field(s) not found in the template:", mapping.missing_fields().len());
    for missing in mapping.missing_fields() {
        println!("  {}", missing);
        let suggestions = search.suggest(missing, &candidates, 3);
        if suggestions.is_empty() {
            println!("     (no similar field names)");
        }
        for (name, score) in suggestions {
            println!("     → {:<45} {:.2}", name, score);
        }
    }
    println!("\n   Add confirmed renames under mapping.overrides in the config");
    Ok(())
}

fn save_report(report: &GeneratedReport, output_path: &str) -> Result<()> {
    std::fs::write(output_path, &report.bytes).with_context(|| format!("Failed to write {output_path}"))?;

    println!("✅ Successfully generated report");
    println!("📊 Report metrics:");
    println!("   - Pages: {}", report.metadata.page_count);
    println!("   - Base pages: {}", report.metadata.base_page_count);
    println!("   - Appendix pages: {}", report.metadata.appendix_page_count);
    println!("   - Diagnostics: {}", report.diagnostics.len());
    for diagnostic in &report.diagnostics {
        println!("     ⚠️  {}", diagnostic);
    }
    println!("💾 Report saved to: {}", output_path);
    Ok(())
}

fn save_stages(stages: &PipelineStages, output_dir: &str) -> Result<()> {
    use std::fs;
    fs::create_dir_all(output_dir)?;

    // Stage 1: coerced field values
    let values_path = format!("{}/stage1_values.json", output_dir);
    fs::write(&values_path, serde_json::to_string_pretty(&stages.values)?)?;
    println!("  💾 {} ({} fields)", values_path, stages.values.len());

    // Stage 2: filled template, before assembly
    let filled_path = format!("{}/stage2_filled_template.pdf", output_dir);
    fs::write(&filled_path, &stages.filled_template)?;
    println!("  💾 {}", filled_path);

    // Stage 3: one file per appendix page
    for page in &stages.appendix_pages {
        let page_path = format!("{}/stage3_appendix_{:02}.pdf", output_dir, page.section_index + 1);
        fs::write(&page_path, &page.bytes)?;
        let marker = if page.fallback { " (fallback)" } else { "" };
        println!("  💾 {} - {}{}", page_path, page.title, marker);
    }

    // Stage 4: final report
    let report_path = format!("{}/stage4_report.pdf", output_dir);
    fs::write(&report_path, &stages.report.bytes)?;
    println!("  💾 {} ({} pages)", report_path, stages.report.page_count());

    // Summary file: quick reference for validation scripts
    let summary = serde_json::json!({
        "captured_at": chrono::Utc::now().to_rfc3339(),
        "metadata": stages.report.metadata,
        "diagnostics": stages.report.diagnostics,
        "guard": {
            "page_count": stages.guard.page_count,
            "object_count": stages.guard.object_count,
            "xref_sections": stages.guard.xref_sections,
            "xref_entries": stages.guard.xref_entries,
            "references_checked": stages.guard.references_checked,
        },
        "stage_counts": {
            "values": stages.values.len(),
            "filled_template_bytes": stages.filled_template.len(),
            "appendix_pages": stages.appendix_pages.len(),
            "report_pages": stages.report.page_count(),
        }
    });
    let summary_path = format!("{}/summary.json", output_dir);
    fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;
    println!("  💾 {}", summary_path);

    Ok(())
}
