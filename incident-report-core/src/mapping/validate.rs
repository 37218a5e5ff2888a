use super::{FieldMapping, FieldMappingTable, FieldNameOverrides, SlotGroup};
use crate::config::MappingConfig;
use crate::error::MappingError;
use crate::template::{FieldKind, TemplateInfo};
use crate::types::{Diagnostic, DiagnosticKind};
use std::collections::HashSet;

/// A concrete template field the mapping expects, after overrides and slot expansion
#[derive(Debug, Clone, PartialEq)]
pub struct RequiredField {
    pub name: String,
    pub kind: FieldKind,
    pub page_hint: Option<u32>,
    pub multiline: bool,
}

/// Mapping table checked against one template revision.
///
/// Built once at startup and shared read-only by every job.
#[derive(Debug, Clone)]
pub struct ValidatedMapping {
    table: FieldMappingTable,
    overrides: FieldNameOverrides,
    witness_slots: usize,
    vehicle_slots: usize,
    /// Fields absent from the template (only possible with strict validation off)
    missing: Vec<String>,
    warnings: Vec<Diagnostic>,
}

fn expected_kind(entry: &FieldMapping) -> FieldKind {
    if entry.kind.is_boolean() {
        FieldKind::Checkbox
    } else {
        FieldKind::Text
    }
}

impl ValidatedMapping {
    /// Validate `table` against the loaded template.
    ///
    /// Fails on structural problems, kind mismatches and, in strict mode, on
    /// any mapped field the template does not have.
    pub fn validate(
        table: FieldMappingTable,
        template: &TemplateInfo,
        config: &MappingConfig,
    ) -> Result<Self, MappingError> {
        table.check_consistency()?;
        let overrides = FieldNameOverrides::builtin().with_overrides(&config.overrides);

        let witness_slots = detect_slots(&table, &overrides, template, SlotGroup::Witness, config.max_witness_slots);
        let vehicle_slots = detect_slots(
            &table,
            &overrides,
            template,
            SlotGroup::OtherVehicle,
            config.max_vehicle_slots,
        );

        let required = Self::required_fields(&table, &overrides, witness_slots, vehicle_slots);
        check_unique(&required)?;

        let mut missing = Vec::new();
        let mut warnings = Vec::new();
        for field in &required {
            let Some(actual) = template.field(&field.name) else {
                missing.push(field.name.clone());
                continue;
            };
            if !actual.kind.accepts(field.kind) {
                return Err(MappingError::KindMismatch {
                    field: field.name.clone(),
                    expected: field.kind.to_string(),
                    actual: actual.kind.to_string(),
                });
            }
            if let Some(hint) = field.page_hint {
                if !actual.pages.is_empty() && !actual.pages.contains(&hint) {
                    warnings.push(Diagnostic {
                        kind: DiagnosticKind::PageHintMismatch,
                        subject: field.name.clone(),
                        message: format!("expected on page {}, found on {:?}", hint, actual.pages),
                    });
                }
            }
        }

        if !missing.is_empty() {
            if config.strict_validation {
                return Err(MappingError::TemplateDrift { fields: missing });
            }
            for name in &missing {
                log::warn!("⚠️  Mapped field '{}' is not in the template and will be skipped", name);
            }
        }
        for warning in &warnings {
            log::warn!("⚠️  {}", warning);
        }

        log::info!(
            "✅ Mapping validated: {} field(s), {} witness slot(s), {} vehicle slot(s)",
            required.len() - missing.len(),
            witness_slots,
            vehicle_slots
        );

        Ok(Self {
            table,
            overrides,
            witness_slots,
            vehicle_slots,
            missing,
            warnings,
        })
    }

    /// Trust the table without a template, with fixed slot counts.
    /// Used for offline tooling and when the template is generated from the table.
    pub fn without_template(
        table: FieldMappingTable,
        overrides: FieldNameOverrides,
        witness_slots: usize,
        vehicle_slots: usize,
    ) -> Result<Self, MappingError> {
        table.check_consistency()?;
        check_unique(&Self::required_fields(&table, &overrides, witness_slots, vehicle_slots))?;
        Ok(Self {
            table,
            overrides,
            witness_slots,
            vehicle_slots,
            missing: Vec::new(),
            warnings: Vec::new(),
        })
    }

    /// Expand the table into the concrete field names a template must carry
    pub fn required_fields(
        table: &FieldMappingTable,
        overrides: &FieldNameOverrides,
        witness_slots: usize,
        vehicle_slots: usize,
    ) -> Vec<RequiredField> {
        let mut required = Vec::new();
        for entry in table.entries() {
            let slots = match entry.source.slot_group() {
                Some(SlotGroup::Witness) => witness_slots,
                Some(SlotGroup::OtherVehicle) => vehicle_slots,
                None => 1,
            };
            for slot in 0..slots {
                for intended in entry.target_fields() {
                    required.push(RequiredField {
                        name: resolve_target(overrides, entry, intended, slot),
                        kind: expected_kind(entry),
                        page_hint: entry.page_hint,
                        multiline: entry.multiline,
                    });
                }
            }
        }
        required
    }

    pub fn table(&self) -> &FieldMappingTable {
        &self.table
    }

    pub fn overrides(&self) -> &FieldNameOverrides {
        &self.overrides
    }

    pub fn slots(&self, group: SlotGroup) -> usize {
        match group {
            SlotGroup::Witness => self.witness_slots,
            SlotGroup::OtherVehicle => self.vehicle_slots,
        }
    }

    /// Actual template name for `intended` of `entry` at `slot`
    pub fn target_name(&self, entry: &FieldMapping, intended: &str, slot: usize) -> String {
        resolve_target(&self.overrides, entry, intended, slot)
    }

    pub fn missing_fields(&self) -> &[String] {
        &self.missing
    }

    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }

    pub fn expanded_fields(&self) -> Vec<RequiredField> {
        Self::required_fields(&self.table, &self.overrides, self.witness_slots, self.vehicle_slots)
    }
}

fn resolve_target(overrides: &FieldNameOverrides, entry: &FieldMapping, intended: &str, slot: usize) -> String {
    if entry.source.slot_group().is_some() {
        overrides.resolve_slot(intended, slot)
    } else {
        overrides.resolve(intended).to_string()
    }
}

fn check_unique(required: &[RequiredField]) -> Result<(), MappingError> {
    let mut seen = HashSet::new();
    for field in required {
        if !seen.insert(field.name.as_str()) {
            return Err(MappingError::DuplicateTarget {
                field: field.name.clone(),
            });
        }
    }
    Ok(())
}

/// Number of consecutive positional groups present in the template.
/// Slot 0 is always expected so a template without the group shows up as drift.
fn detect_slots(
    table: &FieldMappingTable,
    overrides: &FieldNameOverrides,
    template: &TemplateInfo,
    group: SlotGroup,
    cap: Option<usize>,
) -> usize {
    let bases: Vec<&str> = table
        .entries()
        .iter()
        .filter(|e| e.source.slot_group() == Some(group))
        .flat_map(|e| e.target_fields())
        .collect();
    if bases.is_empty() {
        return 0;
    }

    let mut slots = 0;
    while bases
        .iter()
        .any(|base| template.has_field(&overrides.resolve_slot(base, slots)))
    {
        slots += 1;
    }
    let slots = slots.max(1);
    cap.map_or(slots, |cap| slots.min(cap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{sample_template, SampleField, SampleTemplateSpec};

    fn inspect(spec: &SampleTemplateSpec) -> TemplateInfo {
        TemplateInfo::inspect(&sample_template(spec).unwrap()).unwrap()
    }

    #[test]
    fn test_builtin_mapping_validates_against_sample() {
        let info = inspect(&SampleTemplateSpec::builtin());
        let mapping =
            ValidatedMapping::validate(FieldMappingTable::builtin(), &info, &MappingConfig::default()).unwrap();
        assert_eq!(mapping.slots(SlotGroup::Witness), 3);
        assert_eq!(mapping.slots(SlotGroup::OtherVehicle), 2);
        assert!(mapping.missing_fields().is_empty());
        assert!(mapping.warnings().is_empty());
    }

    #[test]
    fn test_slot_cap_applies() {
        let info = inspect(&SampleTemplateSpec::builtin());
        let config = MappingConfig {
            max_witness_slots: Some(2),
            ..MappingConfig::default()
        };
        let mapping = ValidatedMapping::validate(FieldMappingTable::builtin(), &info, &config).unwrap();
        assert_eq!(mapping.slots(SlotGroup::Witness), 2);
    }

    #[test]
    fn test_strict_mode_reports_drift() {
        let info = inspect(&SampleTemplateSpec::builtin().without_field("road_marking_visible"));
        let err = ValidatedMapping::validate(FieldMappingTable::builtin(), &info, &MappingConfig::default())
            .unwrap_err();
        assert_eq!(
            err,
            MappingError::TemplateDrift {
                fields: vec!["road_marking_visible".to_string()]
            }
        );
    }

    #[test]
    fn test_lenient_mode_records_missing_fields() {
        let info = inspect(&SampleTemplateSpec::builtin().without_field("driver_mobile"));
        let config = MappingConfig {
            strict_validation: false,
            ..MappingConfig::default()
        };
        let mapping = ValidatedMapping::validate(FieldMappingTable::builtin(), &info, &config).unwrap();
        assert_eq!(mapping.missing_fields(), ["driver_mobile".to_string()]);
    }

    #[test]
    fn test_kind_mismatch_is_fatal() {
        let spec = SampleTemplateSpec::builtin()
            .without_field("police_attended")
            .with_field(SampleField::text("police_attended", vec![2]));
        let err = ValidatedMapping::validate(FieldMappingTable::builtin(), &inspect(&spec), &MappingConfig::default())
            .unwrap_err();
        assert!(matches!(err, MappingError::KindMismatch { ref field, .. } if field == "police_attended"));
    }

    #[test]
    fn test_page_hint_mismatch_is_a_warning() {
        let spec = SampleTemplateSpec::builtin()
            .without_field("what3words")
            .with_field(SampleField::text("what3words", vec![4]));
        let mapping =
            ValidatedMapping::validate(FieldMappingTable::builtin(), &inspect(&spec), &MappingConfig::default())
                .unwrap();
        assert_eq!(mapping.warnings().len(), 1);
        assert_eq!(mapping.warnings()[0].kind, DiagnosticKind::PageHintMismatch);
    }

    #[test]
    fn test_override_collision_is_rejected() {
        let mut config = MappingConfig::default();
        config
            .overrides
            .insert("driver_mobile".to_string(), "driver_email".to_string());
        let info = inspect(&SampleTemplateSpec::builtin());
        let err = ValidatedMapping::validate(FieldMappingTable::builtin(), &info, &config).unwrap_err();
        assert!(matches!(err, MappingError::DuplicateTarget { .. }));
    }
}
