//! Application patient model and its FHIR R4 `Patient` mapping.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::emr::EmrError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientIdentifier {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub value: String,
}

/// Patient as the clinic application sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientRecord {
    /// Provider-assigned id; absent until created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub identifiers: Vec<PatientIdentifier>,
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<NaiveDate>,
    /// Lower-case FHIR administrative gender code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Demographic search criteria
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientSearch {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    /// `YYYY-MM-DD`
    #[serde(default)]
    pub date_of_birth: Option<String>,
}

/// Validated search criteria, blanks removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
}

impl PatientSearch {
    /// At least one criterion is required; the birth date must be a full date
    pub fn validate(&self) -> Result<SearchCriteria, EmrError> {
        fn clean(value: &Option<String>) -> Option<String> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        }

        let date_of_birth = match clean(&self.date_of_birth) {
            Some(raw) => Some(NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|_| {
                EmrError::MappingError("dateOfBirth must be YYYY-MM-DD".to_string())
            })?),
            None => None,
        };
        let criteria = SearchCriteria {
            first_name: clean(&self.first_name),
            last_name: clean(&self.last_name),
            date_of_birth,
        };

        if criteria.first_name.is_none() && criteria.last_name.is_none() && criteria.date_of_birth.is_none() {
            return Err(EmrError::MappingError(
                "search requires firstName, lastName or dateOfBirth".to_string(),
            ));
        }
        Ok(criteria)
    }
}

/// Name `use` values in order of preference
pub(crate) const OFFICIAL_FIRST: &[&str] = &["official"];

impl PatientRecord {
    /// Map a FHIR `Patient` resource, preferring an `official` name
    pub fn from_resource(resource: &Value) -> Result<Self, EmrError> {
        Self::from_resource_with(resource, OFFICIAL_FIRST)
    }

    /// Map a FHIR `Patient` resource, choosing the first name whose `use` is
    /// listed in `name_preference`, else the first name present
    pub(crate) fn from_resource_with(resource: &Value, name_preference: &[&str]) -> Result<Self, EmrError> {
        let resource_type = resource.get("resourceType").and_then(Value::as_str);
        if resource_type != Some("Patient") {
            return Err(EmrError::MappingError(format!(
                "expected Patient resource, got {}",
                resource_type.unwrap_or("none")
            )));
        }

        // `name` is optional in FHIR; a nameless patient maps to empty names
        let name = select_name(resource, name_preference);
        let last_name = name
            .and_then(|n| n.get("family"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let first_name = name
            .and_then(|n| n.get("given"))
            .and_then(Value::as_array)
            .map(|given| given.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(" "))
            .unwrap_or_default();

        let date_of_birth = match resource.get("birthDate").and_then(Value::as_str) {
            Some(raw) => Some(NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
                EmrError::MappingError("birthDate is not a full date".to_string())
            })?),
            None => None,
        };

        let identifiers = resource
            .get("identifier")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| {
                        let value = id.get("value").and_then(Value::as_str)?;
                        Some(PatientIdentifier {
                            system: id.get("system").and_then(Value::as_str).map(str::to_string),
                            value: value.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            id: resource.get("id").and_then(Value::as_str).map(str::to_string),
            identifiers,
            first_name,
            last_name,
            date_of_birth,
            gender: resource
                .get("gender")
                .and_then(Value::as_str)
                .map(|g| g.to_ascii_lowercase()),
            phone: telecom_value(resource, "phone"),
            email: telecom_value(resource, "email"),
            active: resource.get("active").and_then(Value::as_bool).unwrap_or(true),
        })
    }

    /// Standard R4 `Patient` JSON
    pub fn to_resource(&self) -> Value {
        let mut resource = Map::new();
        resource.insert("resourceType".into(), json!("Patient"));
        if let Some(id) = &self.id {
            resource.insert("id".into(), json!(id));
        }
        if !self.identifiers.is_empty() {
            let identifiers: Vec<Value> = self
                .identifiers
                .iter()
                .map(|id| match &id.system {
                    Some(system) => json!({ "system": system, "value": id.value }),
                    None => json!({ "value": id.value }),
                })
                .collect();
            resource.insert("identifier".into(), Value::Array(identifiers));
        }
        resource.insert("active".into(), json!(self.active));

        let mut name = Map::new();
        name.insert("use".into(), json!("official"));
        if !self.last_name.is_empty() {
            name.insert("family".into(), json!(self.last_name));
        }
        let given: Vec<&str> = self.first_name.split_whitespace().collect();
        if !given.is_empty() {
            name.insert("given".into(), json!(given));
        }
        resource.insert("name".into(), json!([name]));

        if let Some(gender) = &self.gender {
            resource.insert("gender".into(), json!(gender));
        }
        if let Some(dob) = &self.date_of_birth {
            resource.insert("birthDate".into(), json!(dob.format("%Y-%m-%d").to_string()));
        }

        let mut telecom = Vec::new();
        if let Some(phone) = &self.phone {
            telecom.push(json!({ "system": "phone", "value": phone }));
        }
        if let Some(email) = &self.email {
            telecom.push(json!({ "system": "email", "value": email }));
        }
        if !telecom.is_empty() {
            resource.insert("telecom".into(), Value::Array(telecom));
        }

        Value::Object(resource)
    }
}

fn select_name<'a>(resource: &'a Value, preference: &[&str]) -> Option<&'a Value> {
    let names = resource.get("name")?.as_array()?;
    preference
        .iter()
        .find_map(|wanted| {
            names
                .iter()
                .find(|name| name.get("use").and_then(Value::as_str) == Some(*wanted))
        })
        .or_else(|| names.first())
}

fn telecom_value(resource: &Value, system: &str) -> Option<String> {
    resource
        .get("telecom")?
        .as_array()?
        .iter()
        .find(|t| t.get("system").and_then(Value::as_str) == Some(system))
        .and_then(|t| t.get("value").and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> PatientRecord {
        PatientRecord {
            id: Some("pat-1".to_string()),
            identifiers: vec![PatientIdentifier {
                system: Some("urn:oid:2.16.840.1.113883.4.1".to_string()),
                value: "MRN-001".to_string(),
            }],
            first_name: "Mary Ann".to_string(),
            last_name: "Doe".to_string(),
            date_of_birth: NaiveDate::from_ymd_opt(1980, 1, 1),
            gender: Some("female".to_string()),
            phone: Some("555-0100".to_string()),
            email: Some("mary@example.org".to_string()),
            active: true,
        }
    }

    #[test]
    fn test_resource_mapping_is_lossless() {
        let record = sample_record();
        let resource = record.to_resource();
        assert_eq!(resource["name"][0]["given"], json!(["Mary", "Ann"]));
        assert_eq!(resource["birthDate"], "1980-01-01");
        assert_eq!(PatientRecord::from_resource(&resource).unwrap(), record);
    }

    #[test]
    fn test_prefers_official_name() {
        let resource = json!({
            "resourceType": "Patient",
            "id": "p",
            "name": [
                { "use": "nickname", "given": ["Jo"] },
                { "use": "official", "family": "Smith", "given": ["Joanne"] }
            ]
        });
        let record = PatientRecord::from_resource(&resource).unwrap();
        assert_eq!(record.first_name, "Joanne");
        assert_eq!(record.last_name, "Smith");
        assert!(record.active);
    }

    #[test]
    fn test_rejects_unusable_resources() {
        let not_patient = json!({ "resourceType": "Observation" });
        assert!(matches!(
            PatientRecord::from_resource(&not_patient),
            Err(EmrError::MappingError(_))
        ));

        let partial_date = json!({
            "resourceType": "Patient",
            "name": [{ "family": "Doe" }],
            "birthDate": "1980-01"
        });
        assert!(PatientRecord::from_resource(&partial_date).is_err());
    }

    #[test]
    fn test_nameless_patient_maps_to_empty_names() {
        for resource in [
            json!({ "resourceType": "Patient", "id": "p-1", "birthDate": "1990-04-12" }),
            json!({ "resourceType": "Patient", "id": "p-1", "name": [] }),
            json!({ "resourceType": "Patient", "id": "p-1", "name": [{ "use": "official" }] }),
        ] {
            let record = PatientRecord::from_resource(&resource).unwrap();
            assert_eq!(record.id.as_deref(), Some("p-1"));
            assert_eq!(record.first_name, "");
            assert_eq!(record.last_name, "");
        }
    }

    #[test]
    fn test_gender_is_lower_cased() {
        let resource = json!({
            "resourceType": "Patient",
            "name": [{ "family": "Doe" }],
            "gender": "Male"
        });
        let record = PatientRecord::from_resource(&resource).unwrap();
        assert_eq!(record.gender.as_deref(), Some("male"));
    }

    #[test]
    fn test_search_validation() {
        let empty = PatientSearch {
            first_name: Some("  ".to_string()),
            ..PatientSearch::default()
        };
        assert!(matches!(empty.validate(), Err(EmrError::MappingError(_))));

        let bad_date = PatientSearch {
            date_of_birth: Some("01/01/1980".to_string()),
            ..PatientSearch::default()
        };
        assert!(bad_date.validate().is_err());

        let search = PatientSearch {
            first_name: Some(" Jane ".to_string()),
            last_name: Some("Doe".to_string()),
            date_of_birth: Some("1980-01-01".to_string()),
        };
        let criteria = search.validate().unwrap();
        assert_eq!(criteria.first_name.as_deref(), Some("Jane"));
        assert_eq!(criteria.date_of_birth, NaiveDate::from_ymd_opt(1980, 1, 1));
    }

    #[test]
    fn test_record_json_is_camel_case() {
        let json = serde_json::to_value(sample_record()).unwrap();
        assert_eq!(json["firstName"], "Mary Ann");
        assert_eq!(json["dateOfBirth"], "1980-01-01");

        let minimal: PatientRecord =
            serde_json::from_value(json!({ "firstName": "A", "lastName": "B" })).unwrap();
        assert!(minimal.active);
        assert!(minimal.id.is_none());
    }
}
