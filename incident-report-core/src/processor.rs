use crate::appendix::{prepare_sections, AppendixPage, AppendixRenderer, RendererPool};
use crate::assembler::{AssembledDocument, DocumentAssembler};
use crate::coercion::Coercer;
use crate::config::GeneratorConfig;
use crate::error::{ReportError, TemplateError};
use crate::filler::{FilledDocument, FormFiller};
use crate::guard::{CorruptionGuard, GuardReport};
use crate::mapping::{FieldMappingTable, ValidatedMapping};
use crate::template::TemplateInfo;
use crate::types::*;
use chrono::format::{Item, StrftimeItems};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

/// Captured intermediate outputs from each pipeline stage
/// Used for testing and diagnostics: lets you inspect and compare each boundary
#[derive(Debug, Clone)]
pub struct PipelineStages {
    pub values: ValueMap,
    pub filled_template: Vec<u8>,
    pub appendix_pages: Vec<AppendixPage>,
    pub guard: GuardReport,
    pub report: GeneratedReport,
}

/// Collects timings for pipeline stages. Timings are always kept for the
/// report metadata; `verbose` additionally prints them as they happen.
pub struct StageProfiler {
    verbose: bool,
    timings: Vec<(String, Duration)>,
}

impl StageProfiler {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            timings: Vec::new(),
        }
    }

    pub fn time_step<F, R>(&mut self, step_name: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let result = f();
        self.record(step_name, start.elapsed());
        result
    }

    pub fn record(&mut self, step_name: &str, elapsed: Duration) {
        if self.verbose {
            println!("⏱️  {}: {:.0}ms", step_name, elapsed.as_millis());
        } else {
            log::debug!("{} took {}ms", step_name, elapsed.as_millis());
        }
        self.timings.push((step_name.to_string(), elapsed));
    }

    pub fn timings(&self) -> Vec<StageTiming> {
        self.timings
            .iter()
            .map(|(stage, elapsed)| StageTiming {
                stage: stage.clone(),
                elapsed_ms: elapsed.as_millis() as u64,
            })
            .collect()
    }

    pub fn print_summary(&self) {
        if !self.verbose || self.timings.is_empty() {
            return;
        }

        println!("\n📊 Performance Summary:");
        let total: Duration = self.timings.iter().map(|(_, d)| *d).sum();

        for (step, duration) in &self.timings {
            let percentage = if total.is_zero() {
                0.0
            } else {
                (duration.as_secs_f64() / total.as_secs_f64()) * 100.0
            };
            println!(
                "   {:.<35} {:.0}ms ({:.1}%)",
                step,
                duration.as_millis(),
                percentage
            );
        }
        println!("   {:.<35} {:.0}ms", "Total", total.as_millis());
    }
}

/// State owned by exactly one generation job
struct JobContext {
    job_id: JobId,
    diagnostics: Diagnostics,
    profiler: StageProfiler,
    stage: watch::Sender<&'static str>,
}

impl JobContext {
    fn enter(&self, stage: &'static str) {
        self.stage.send_replace(stage);
        log::debug!("Job {} entering {}", self.job_id, stage);
    }
}

/// Intermediate results kept only when stages are captured
struct Captured {
    values: ValueMap,
    filled_template: Vec<u8>,
    appendix_pages: Vec<AppendixPage>,
    guard: GuardReport,
}

/// Run CPU-bound PDF work off the async workers
async fn blocking<T, F>(stage: &str, f: F) -> Result<T, ReportError>
where
    F: FnOnce() -> Result<T, ReportError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ReportError::Internal(format!("{stage} task failed: {e}")))?
}

/// Validate a chrono format string up front instead of per field
fn check_date_format(format: &str) -> Result<(), ReportError> {
    if format.trim().is_empty() || StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(ReportError::Config(format!("invalid date_format '{format}'")));
    }
    Ok(())
}

/// Generates incident reports against one template revision.
///
/// Construction does all the fail-fast work: the template is inspected, the
/// mapping table validated against it and the insertion point resolved. The
/// generator is then shared read-only by any number of concurrent jobs.
pub struct ReportGenerator {
    template_bytes: Arc<[u8]>,
    template: TemplateInfo,
    mapping: Arc<ValidatedMapping>,
    config: GeneratorConfig,
    pool: Arc<RendererPool>,
    split: usize,
    verbose_timings: bool,
}

impl ReportGenerator {
    pub fn new(template_bytes: Vec<u8>, config: GeneratorConfig, pool: Arc<RendererPool>) -> Result<Self, ReportError> {
        Self::with_mapping_table(template_bytes, config, pool, FieldMappingTable::builtin())
    }

    pub fn with_mapping_table(
        template_bytes: Vec<u8>,
        config: GeneratorConfig,
        pool: Arc<RendererPool>,
        table: FieldMappingTable,
    ) -> Result<Self, ReportError> {
        check_date_format(&config.date_format)?;
        if config.job_timeout_ms == 0 {
            return Err(ReportError::Config("job_timeout_ms must be positive".to_string()));
        }

        let template = TemplateInfo::inspect(&template_bytes)?;
        let mapping = ValidatedMapping::validate(table, &template, &config.mapping)?;
        let split = config
            .insertion_point
            .resolve(template.page_count)
            .ok_or(TemplateError::InsertionPoint {
                requested: config.insertion_point.requested(),
                page_count: template.page_count,
            })?;

        log::info!(
            "✅ Template ready: {} page(s), {} field(s), appendix after page {}, engine {}",
            template.page_count,
            template.fields.len(),
            split,
            pool.engine_name()
        );

        Ok(Self {
            template_bytes: Arc::from(template_bytes),
            template,
            mapping: Arc::new(mapping),
            config,
            pool,
            split,
            verbose_timings: false,
        })
    }

    /// Print stage timings as they happen
    pub fn with_profiling(mut self, enabled: bool) -> Self {
        self.verbose_timings = enabled;
        self
    }

    pub fn template(&self) -> &TemplateInfo {
        &self.template
    }

    pub fn mapping(&self) -> &ValidatedMapping {
        &self.mapping
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<RendererPool> {
        &self.pool
    }

    /// Base pages placed before the appendix block
    pub fn split(&self) -> usize {
        self.split
    }

    /// Generate one report. Fails as a whole: no bytes are returned unless the
    /// output passed validation.
    pub async fn generate(&self, record: &AggregatedIncidentRecord) -> Result<GeneratedReport, ReportError> {
        self.run_with_timeout(record, false).await.map(|(report, _)| report)
    }

    /// Generate one report and keep every intermediate output
    pub async fn generate_capture_stages(&self, record: &AggregatedIncidentRecord) -> Result<PipelineStages, ReportError> {
        let (report, captured) = self.run_with_timeout(record, true).await?;
        let captured = captured.ok_or_else(|| ReportError::Internal("stages were not captured".to_string()))?;
        println!("📋 Stage 1: {} field value(s) captured", captured.values.len());
        println!("📋 Stage 2: filled template captured ({} bytes)", captured.filled_template.len());
        println!("📋 Stage 3: {} appendix page(s) captured", captured.appendix_pages.len());
        println!("📋 Stage 4: report captured ({} pages)", report.page_count());
        Ok(PipelineStages {
            values: captured.values,
            filled_template: captured.filled_template,
            appendix_pages: captured.appendix_pages,
            guard: captured.guard,
            report,
        })
    }

    async fn run_with_timeout(
        &self,
        record: &AggregatedIncidentRecord,
        capture: bool,
    ) -> Result<(GeneratedReport, Option<Captured>), ReportError> {
        let (stage_tx, stage_rx) = watch::channel("coerce");
        let ctx = JobContext {
            job_id: Uuid::new_v4(),
            diagnostics: Diagnostics::new(),
            profiler: StageProfiler::new(self.verbose_timings),
            stage: stage_tx,
        };
        let job_id = ctx.job_id;
        let budget = self.config.job_timeout();

        log::info!("🚗 Job {}: generating incident report", job_id);
        // Dropping the job future cancels outstanding renders
        match tokio::time::timeout(budget, self.run(record, ctx, capture)).await {
            Ok(result) => {
                if let Err(e) = &result {
                    log::error!("❌ Job {} failed: {}", job_id, e);
                }
                result
            }
            Err(_) => {
                let stage = *stage_rx.borrow();
                log::error!("❌ Job {} exceeded {}ms during {}", job_id, budget.as_millis(), stage);
                Err(ReportError::JobTimeout {
                    stage: stage.to_string(),
                    budget_ms: budget.as_millis() as u64,
                })
            }
        }
    }

    async fn run(
        &self,
        record: &AggregatedIncidentRecord,
        mut ctx: JobContext,
        capture: bool,
    ) -> Result<(GeneratedReport, Option<Captured>), ReportError> {
        let started = Instant::now();

        // Stage 1: record → field values
        ctx.enter("coerce");
        let coercer = Coercer::new(&self.mapping, &self.config.date_format);
        let values = {
            let diagnostics = &mut ctx.diagnostics;
            ctx.profiler.time_step("1. Coerce", || coercer.coerce(record, diagnostics))
        };

        // Stage 2: fill a fresh copy of the template
        ctx.enter("fill");
        let stage_start = Instant::now();
        let filled = {
            let template = Arc::clone(&self.template_bytes);
            let sanitize = self.config.sanitize.clone();
            let fill_values = values.clone();
            let (filled, fill_diagnostics) = blocking("fill", move || {
                let mut diagnostics = Diagnostics::new();
                let filled = FormFiller::new(&sanitize).fill(&template, &fill_values, &mut diagnostics)?;
                Ok((filled, diagnostics))
            })
            .await?;
            ctx.diagnostics.extend(fill_diagnostics);
            filled
        };
        ctx.profiler.record("2. Fill", stage_start.elapsed());
        log::info!("📝 Filled {} template field(s)", filled.filled_fields());
        let filled_template = if capture { filled.to_bytes()? } else { Vec::new() };

        // Stage 3: narrative → appendix pages
        ctx.enter("render");
        let stage_start = Instant::now();
        let sections = prepare_sections(&record.narrative, &mut ctx.diagnostics);
        let renderer = AppendixRenderer::new(Arc::clone(&self.pool), &self.config.render);
        let appendix_pages = renderer.render(&sections, &mut ctx.diagnostics).await?;
        ctx.profiler.record("3. Render appendix", stage_start.elapsed());

        // Stage 4: base + appendix → new document
        ctx.enter("assemble");
        let stage_start = Instant::now();
        let assembled = self.assemble(filled, &appendix_pages).await?;
        ctx.profiler.record("4. Assemble", stage_start.elapsed());

        // Stage 5: cold re-parse of the output
        ctx.enter("validate");
        let stage_start = Instant::now();
        let guard = CorruptionGuard::new(self.config.guard.clone());
        let (assembled, guard_report) = blocking("validate", move || {
            let report = guard.validate_assembled(&assembled)?;
            Ok((assembled, report))
        })
        .await?;
        ctx.profiler.record("5. Validate", stage_start.elapsed());

        ctx.profiler.print_summary();
        let metadata = ReportMetadata {
            job_id: ctx.job_id,
            page_count: assembled.page_count(),
            base_page_count: assembled.plan.base_page_count(),
            appendix_page_count: assembled.plan.appendix_page_count(),
            generated_at: Utc::now(),
            template_sha256: self.template.sha256.clone(),
            output_sha256: assembled.sha256(),
            timings: ctx.profiler.timings(),
        };

        log::info!(
            "✅ Job {}: {} page(s), {} diagnostic(s), {}ms",
            ctx.job_id,
            metadata.page_count,
            ctx.diagnostics.len(),
            started.elapsed().as_millis()
        );

        let captured = capture.then(|| Captured {
            values,
            filled_template,
            appendix_pages,
            guard: guard_report,
        });
        let report = GeneratedReport {
            bytes: assembled.bytes,
            metadata,
            diagnostics: ctx.diagnostics.into_vec(),
        };
        Ok((report, captured))
    }

    async fn assemble(&self, filled: FilledDocument, appendix_pages: &[AppendixPage]) -> Result<AssembledDocument, ReportError> {
        let assembler = DocumentAssembler::new(self.config.compress_output);
        let pages = appendix_pages.to_vec();
        let split = self.split;
        blocking("assemble", move || Ok(assembler.assemble(&filled, &pages, split)?)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appendix::BuiltinEngine;
    use crate::config::InsertionPoint;
    use crate::template::{sample_template, SampleTemplateSpec};

    fn pool() -> Arc<RendererPool> {
        Arc::new(RendererPool::new(Arc::new(BuiltinEngine::new()), 2, Duration::from_secs(10)))
    }

    #[test]
    fn test_date_format_validation() {
        assert!(check_date_format("%d/%m/%Y").is_ok());
        assert!(matches!(check_date_format("%d/%m/%"), Err(ReportError::Config(_))));
        assert!(matches!(check_date_format(" "), Err(ReportError::Config(_))));
    }

    #[test]
    fn test_insertion_point_outside_template_fails_fast() {
        let template = sample_template(&SampleTemplateSpec::builtin()).unwrap();
        let config = GeneratorConfig {
            insertion_point: InsertionPoint::AfterPage(40),
            ..GeneratorConfig::default()
        };
        let err = ReportGenerator::new(template, config, pool()).err().unwrap();
        assert!(matches!(
            err,
            ReportError::Template(TemplateError::InsertionPoint { requested: 40, .. })
        ));
    }

    #[test]
    fn test_profiler_keeps_timings() {
        let mut profiler = StageProfiler::new(false);
        let value = profiler.time_step("step", || 42);
        profiler.record("other", Duration::from_millis(5));
        assert_eq!(value, 42);
        let timings = profiler.timings();
        assert_eq!(timings.len(), 2);
        assert_eq!(timings[1].elapsed_ms, 5);
    }
}
