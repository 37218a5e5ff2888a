use super::slot_field_name;
use std::collections::BTreeMap;

/// Template field names that differ from the name the mapping intends.
///
/// Each entry was found against a real template revision. Keys are the
/// intended logical names, values the names actually present in the form.
const BUILTIN_OVERRIDES: &[(&str, &str)] = &[
    ("visibility_severely_restricted", "visability_severely_restricted"),
    ("impact_point_rear_passenger_side", "impact_point_rear_passanger_side"),
    ("seatbelts_worn", "seat_belts_worn"),
    ("road_markings_visible", "road_marking_visible"),
    ("witness_phone", "witness_phone_number"),
    ("doc_dashcam_url", "dash_cam_footage_url"),
    ("other_insurance_company", "other_insurance_companies"),
];

/// Explicit intended → actual field-name table, resolved once at startup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldNameOverrides {
    entries: BTreeMap<String, String>,
}

impl FieldNameOverrides {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        Self {
            entries: BUILTIN_OVERRIDES
                .iter()
                .map(|(intended, actual)| (intended.to_string(), actual.to_string()))
                .collect(),
        }
    }

    /// Layer additional overrides (e.g. from config) on top; later entries win
    pub fn with_overrides<'a, I>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (intended, actual) in extra {
            self.entries.insert(intended.clone(), actual.clone());
        }
        self
    }

    pub fn resolve<'a>(&'a self, intended: &'a str) -> &'a str {
        self.entries
            .get(intended)
            .map(String::as_str)
            .unwrap_or(intended)
    }

    /// Resolve a positional slot name. An override for the suffixed name wins,
    /// otherwise the base override is applied before suffixing.
    pub fn resolve_slot(&self, base: &str, slot: usize) -> String {
        let intended = slot_field_name(base, slot);
        match self.entries.get(&intended) {
            Some(actual) => actual.clone(),
            None => slot_field_name(self.resolve(base), slot),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_falls_back_to_intended_name() {
        let overrides = FieldNameOverrides::builtin();
        assert_eq!(overrides.resolve("driver_first_name"), "driver_first_name");
        assert_eq!(
            overrides.resolve("visibility_severely_restricted"),
            "visability_severely_restricted"
        );
    }

    #[test]
    fn test_resolve_slot_applies_base_override() {
        let overrides = FieldNameOverrides::builtin();
        assert_eq!(overrides.resolve_slot("witness_phone", 0), "witness_phone_number");
        assert_eq!(overrides.resolve_slot("witness_phone", 1), "witness_phone_number_2");
        assert_eq!(overrides.resolve_slot("witness_name", 2), "witness_name_3");
    }

    #[test]
    fn test_suffixed_override_wins() {
        let extra: BTreeMap<String, String> =
            [("witness_name_2".to_string(), "second_witness_name".to_string())].into();
        let overrides = FieldNameOverrides::builtin().with_overrides(&extra);
        assert_eq!(overrides.resolve_slot("witness_name", 1), "second_witness_name");
        assert_eq!(overrides.resolve_slot("witness_name", 2), "witness_name_3");
    }
}
