use super::{FieldMapping, SourcePath, TagField, TextFormat, ValueKind};
use crate::error::MappingError;
use std::collections::{BTreeMap, HashSet};

// Template page layout:
// 1 driver, vehicle, insurance
// 2 accident facts, injuries, police
// 3 conditions, road type, impact points
// 4 other vehicles
// 5 witnesses, evidence links
// 6 declaration

const IMPACT_POINT_TAGS: &[&str] = &[
    "front",
    "front_driver_side",
    "front_passenger_side",
    "driver_side",
    "passenger_side",
    "rear",
    "rear_driver_side",
    "rear_passenger_side",
    "roof",
    "undercarriage",
];

const WEATHER_TAGS: &[&str] = &[
    "clear",
    "bright_sunlight",
    "cloudy",
    "rain",
    "heavy_rain",
    "fog",
    "snow",
    "ice",
    "windy",
    "hail",
];

fn profile(column: &str) -> SourcePath {
    SourcePath::Profile(column.to_string())
}

fn incident(column: &str) -> SourcePath {
    SourcePath::Incident(column.to_string())
}

fn vehicle(column: &str) -> SourcePath {
    SourcePath::OtherVehicle(column.to_string())
}

fn witness(column: &str) -> SourcePath {
    SourcePath::Witness(column.to_string())
}

fn document(document_type: &str) -> SourcePath {
    SourcePath::Document(document_type.to_string())
}

fn text(source: SourcePath, target: &str, page: u32) -> FieldMapping {
    FieldMapping::new(source, target, ValueKind::Text(TextFormat::Plain)).on_page(page)
}

fn date(source: SourcePath, target: &str, page: u32) -> FieldMapping {
    FieldMapping::new(source, target, ValueKind::Text(TextFormat::Date)).on_page(page)
}

fn time(source: SourcePath, target: &str, page: u32) -> FieldMapping {
    FieldMapping::new(source, target, ValueKind::Text(TextFormat::Time)).on_page(page)
}

fn checkbox(source: SourcePath, target: &str, page: u32) -> FieldMapping {
    FieldMapping::new(source, target, ValueKind::BooleanCheckbox).on_page(page)
}

fn exclusive(source: SourcePath, target: &str, group: &str, precedence: u8, page: u32) -> FieldMapping {
    FieldMapping::new(
        source,
        target,
        ValueKind::ExclusiveGroupMember {
            group: group.to_string(),
            precedence,
        },
    )
    .on_page(page)
}

fn tag_set(source: SourcePath, label: &str, prefix: &str, tags: &[&str], page: u32) -> FieldMapping {
    let tags = tags
        .iter()
        .map(|tag| TagField {
            tag: tag.to_string(),
            target: format!("{prefix}{tag}"),
        })
        .collect();
    FieldMapping::new(source, label, ValueKind::ArrayToBooleanSet(tags)).on_page(page)
}

/// Immutable set of field mappings shared read-only by every job
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMappingTable {
    entries: Vec<FieldMapping>,
}

impl FieldMappingTable {
    pub fn new(entries: Vec<FieldMapping>) -> Self {
        Self { entries }
    }

    /// The mapping for the current incident report template revision
    pub fn builtin() -> Self {
        let entries = vec![
            // ---- Page 1: driver, vehicle, insurance ----
            text(profile("first_name"), "driver_first_name", 1).required(),
            text(profile("last_name"), "driver_last_name", 1).required(),
            text(profile("email"), "driver_email", 1),
            text(profile("mobile"), "driver_mobile", 1),
            text(profile("address_line_1"), "driver_address_1", 1),
            text(profile("address_line_2"), "driver_address_2", 1),
            text(profile("town"), "driver_town", 1),
            text(profile("postcode"), "driver_postcode", 1),
            date(profile("date_of_birth"), "driver_dob", 1),
            text(profile("driving_licence_number"), "driver_licence_number", 1),
            text(profile("car_registration"), "vehicle_registration", 1).required(),
            text(profile("car_make"), "vehicle_make", 1),
            text(profile("car_model"), "vehicle_model", 1),
            text(profile("car_colour"), "vehicle_colour", 1),
            text(profile("car_year"), "vehicle_year", 1),
            text(profile("insurance_company"), "insurance_company", 1),
            text(profile("policy_number"), "policy_number", 1),
            text(profile("policy_holder"), "policy_holder_name", 1),
            text(profile("policy_cover"), "policy_cover_type", 1),
            text(profile("recovery_company"), "recovery_company", 1),
            text(profile("recovery_phone"), "recovery_phone", 1),
            text(profile("emergency_contact_name"), "emergency_contact_name", 1),
            text(profile("emergency_contact_phone"), "emergency_contact_phone", 1),
            // Printed in the header of every page
            FieldMapping::new(incident("claim_reference"), "claim_reference", ValueKind::Text(TextFormat::Plain)),
            // ---- Page 2: accident facts ----
            date(incident("accident_date"), "accident_date", 2).required(),
            time(incident("accident_time"), "accident_time", 2),
            text(incident("location"), "accident_location", 2).required(),
            text(incident("what3words"), "what3words", 2),
            text(incident("nearest_landmark"), "nearest_landmark", 2),
            text(incident("journey_purpose"), "journey_purpose", 2),
            text(incident("number_of_passengers"), "number_of_passengers", 2),
            checkbox(incident("police_attended"), "police_attended", 2),
            text(incident("police_reference"), "police_reference_number", 2),
            text(incident("police_officer_name"), "police_officer_name", 2),
            text(incident("police_officer_badge"), "police_officer_badge", 2),
            text(incident("police_station"), "police_station", 2),
            checkbox(incident("breath_test_taken"), "breath_test_taken", 2),
            checkbox(incident("ambulance_called"), "ambulance_called", 2),
            checkbox(incident("driver_injured"), "driver_injured", 2),
            text(incident("injury_details"), "injury_details", 2).multiline(),
            checkbox(incident("hospital_attended"), "hospital_attended", 2),
            text(incident("hospital_name"), "hospital_name", 2),
            checkbox(incident("seatbelts_worn"), "seatbelts_worn", 2),
            text(incident("seatbelt_reason"), "seatbelt_reason", 2),
            checkbox(incident("airbags_deployed"), "airbags_deployed", 2),
            checkbox(incident("vehicle_driveable"), "vehicle_driveable", 2),
            text(incident("damage_description"), "damage_description", 2).multiline(),
            text(incident("damage_estimate"), "estimated_damage_cost", 2),
            FieldMapping::new(incident("dashcam_available"), "dashcam_available", ValueKind::Text(TextFormat::YesNo))
                .on_page(2),
            // ---- Page 3: conditions ----
            tag_set(incident("weather_conditions"), "weather_conditions", "weather_", WEATHER_TAGS, 3),
            exclusive(incident("visibility_good"), "visibility_good", "visibility", 4, 3),
            exclusive(incident("visibility_reduced"), "visibility_reduced", "visibility", 3, 3),
            exclusive(incident("visibility_poor"), "visibility_poor", "visibility", 2, 3),
            exclusive(
                incident("visibility_severely_restricted"),
                "visibility_severely_restricted",
                "visibility",
                1,
                3,
            ),
            exclusive(incident("road_type_motorway"), "road_type_motorway", "road_type", 1, 3),
            exclusive(incident("road_type_a_road"), "road_type_a_road", "road_type", 2, 3),
            exclusive(incident("road_type_b_road"), "road_type_b_road", "road_type", 3, 3),
            exclusive(incident("road_type_urban"), "road_type_urban", "road_type", 4, 3),
            exclusive(incident("road_type_rural"), "road_type_rural", "road_type", 5, 3),
            exclusive(incident("road_type_car_park"), "road_type_car_park", "road_type", 6, 3),
            exclusive(incident("road_surface_dry"), "road_surface_dry", "road_surface", 5, 3),
            exclusive(incident("road_surface_wet"), "road_surface_wet", "road_surface", 4, 3),
            exclusive(incident("road_surface_icy"), "road_surface_icy", "road_surface", 1, 3),
            exclusive(incident("road_surface_snow"), "road_surface_snow", "road_surface", 2, 3),
            exclusive(incident("road_surface_loose"), "road_surface_loose", "road_surface", 3, 3),
            text(incident("speed_limit"), "speed_limit", 3),
            text(incident("driver_speed"), "driver_estimated_speed", 3),
            checkbox(incident("road_markings_visible"), "road_markings_visible", 3),
            checkbox(incident("street_lights_on"), "street_lights_on", 3),
            text(incident("traffic_conditions"), "traffic_conditions", 3),
            text(incident("special_conditions"), "special_conditions", 3).multiline(),
            tag_set(incident("impact_points"), "impact_points", "impact_point_", IMPACT_POINT_TAGS, 3),
            // ---- Page 4: other vehicles (positional) ----
            text(vehicle("driver_name"), "other_driver_name", 4),
            text(vehicle("driver_phone"), "other_driver_phone", 4),
            text(vehicle("driver_address"), "other_driver_address", 4),
            text(vehicle("registration"), "other_vehicle_registration", 4),
            text(vehicle("make"), "other_vehicle_make", 4),
            text(vehicle("model"), "other_vehicle_model", 4),
            text(vehicle("colour"), "other_vehicle_colour", 4),
            text(vehicle("insurance_company"), "other_insurance_company", 4),
            text(vehicle("policy_number"), "other_policy_number", 4),
            text(vehicle("damage_description"), "other_vehicle_damage", 4).multiline(),
            checkbox(vehicle("driver_injured"), "other_driver_injured", 4),
            // ---- Page 5: witnesses (positional) and evidence ----
            text(witness("name"), "witness_name", 5),
            text(witness("phone"), "witness_phone", 5),
            text(witness("email"), "witness_email", 5),
            text(witness("address"), "witness_address", 5).multiline(),
            text(witness("statement"), "witness_statement", 5).multiline(),
            text(document("driving_licence_picture"), "doc_driving_licence_url", 5),
            text(document("vehicle_front"), "doc_vehicle_front_url", 5),
            text(document("vehicle_damage"), "doc_vehicle_damage_url", 5),
            text(document("scene_overview"), "doc_scene_photo_url", 5),
            text(document("other_vehicle"), "doc_other_vehicle_url", 5),
            text(document("dashcam_footage"), "doc_dashcam_url", 5),
            text(document("audio_statement"), "doc_audio_statement_url", 5),
            // ---- Page 6: declaration ----
            text(incident("declaration_name"), "declaration_name", 6),
            date(incident("declaration_date"), "declaration_date", 6),
            checkbox(incident("declaration_agreed"), "declaration_agreed", 6),
        ];
        Self { entries }
    }

    pub fn entries(&self) -> &[FieldMapping] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest page hint in the table
    pub fn page_span(&self) -> u32 {
        self.entries.iter().filter_map(|e| e.page_hint).max().unwrap_or(1)
    }

    /// Structural checks that do not need a template: unique intended targets,
    /// well-formed exclusive groups, non-empty tag sets.
    pub fn check_consistency(&self) -> Result<(), MappingError> {
        let mut seen = HashSet::new();
        for entry in &self.entries {
            for target in entry.target_fields() {
                if !seen.insert(target) {
                    return Err(MappingError::DuplicateTarget {
                        field: target.to_string(),
                    });
                }
            }
        }

        let mut groups: BTreeMap<&str, Vec<u8>> = BTreeMap::new();
        for entry in &self.entries {
            match &entry.kind {
                ValueKind::ExclusiveGroupMember { group, precedence } => {
                    if entry.source.slot_group().is_some() {
                        return Err(MappingError::InvalidGroup {
                            group: group.clone(),
                            reason: "positional sources cannot join exclusive groups".to_string(),
                        });
                    }
                    groups.entry(group.as_str()).or_default().push(*precedence);
                }
                ValueKind::ArrayToBooleanSet(tags) => {
                    if tags.is_empty() {
                        return Err(MappingError::InvalidGroup {
                            group: entry.target.clone(),
                            reason: "tag set has no tags".to_string(),
                        });
                    }
                    let mut tag_names = HashSet::new();
                    if let Some(dup) = tags.iter().find(|t| !tag_names.insert(t.tag.as_str())) {
                        return Err(MappingError::InvalidGroup {
                            group: entry.target.clone(),
                            reason: format!("tag '{}' listed twice", dup.tag),
                        });
                    }
                }
                _ => {}
            }
        }

        for (group, mut precedences) in groups {
            if precedences.len() < 2 {
                return Err(MappingError::InvalidGroup {
                    group: group.to_string(),
                    reason: "an exclusive group needs at least two members".to_string(),
                });
            }
            precedences.sort_unstable();
            if precedences.windows(2).any(|w| w[0] == w[1]) {
                return Err(MappingError::InvalidGroup {
                    group: group.to_string(),
                    reason: "members share a precedence".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl Default for FieldMappingTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table_is_consistent() {
        FieldMappingTable::builtin().check_consistency().unwrap();
    }

    #[test]
    fn test_builtin_table_spans_six_pages() {
        assert_eq!(FieldMappingTable::builtin().page_span(), 6);
    }

    #[test]
    fn test_duplicate_target_is_rejected() {
        let table = FieldMappingTable::new(vec![
            text(profile("first_name"), "driver_first_name", 1),
            text(profile("given_name"), "driver_first_name", 1),
        ]);
        assert_eq!(
            table.check_consistency(),
            Err(MappingError::DuplicateTarget {
                field: "driver_first_name".to_string()
            })
        );
    }

    #[test]
    fn test_group_precedence_collision_is_rejected() {
        let table = FieldMappingTable::new(vec![
            exclusive(incident("a"), "a", "g", 1, 1),
            exclusive(incident("b"), "b", "g", 1, 1),
        ]);
        assert!(matches!(
            table.check_consistency(),
            Err(MappingError::InvalidGroup { .. })
        ));
    }
}
