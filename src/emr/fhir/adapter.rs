//! Per-dialect Patient operations.
//!
//! [`PatientAdapter`] supplies the standard R4 search, read and create flow;
//! each dialect overrides only the query parameters or resource parsing that
//! its provider gets wrong.

use async_trait::async_trait;
use reqwest::header::LOCATION;
use reqwest::StatusCode;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use super::patient::{PatientRecord, SearchCriteria, OFFICIAL_FIRST};
use super::{error_for_status, read_json, FhirClient, RequestContext};
use crate::emr::registry::{FhirDialect, ProviderConfig};
use crate::emr::EmrError;

/// Bundle pages followed for one search
pub const MAX_SEARCH_PAGES: usize = 5;

const OFFICIAL_THEN_USUAL: &[&str] = &["official", "usual"];

#[async_trait]
pub trait PatientAdapter: Send + Sync {
    fn dialect(&self) -> FhirDialect;

    /// Query parameters for a `Patient` search
    fn search_params(&self, provider: &ProviderConfig, criteria: &SearchCriteria) -> Vec<(String, String)>;

    fn parse_patient(&self, resource: &Value) -> Result<PatientRecord, EmrError> {
        PatientRecord::from_resource(resource)
    }

    fn build_patient(&self, record: &PatientRecord) -> Value {
        record.to_resource()
    }

    /// Search, following same-origin `next` links up to [`MAX_SEARCH_PAGES`]
    async fn search(
        &self,
        client: &FhirClient,
        ctx: &RequestContext<'_>,
        criteria: &SearchCriteria,
    ) -> Result<Vec<PatientRecord>, EmrError> {
        let provider = ctx.provider;
        let mut url = provider.fhir_url("Patient");
        let mut query = self.search_params(provider, criteria);
        let mut records = Vec::new();

        for page in 1..=MAX_SEARCH_PAGES {
            let response = client.get(ctx, &url, &query).await?;
            let response = error_for_status(ctx, response).await?;
            let bundle = read_json(ctx, response).await?;
            records.extend(self.parse_bundle(&bundle)?);

            match next_page(&bundle, provider) {
                Some(next) if page < MAX_SEARCH_PAGES => {
                    url = next;
                    // The next link already carries the query
                    query.clear();
                }
                Some(_) => {
                    warn!(system = %provider.system, pages = page, "Search results truncated");
                    break;
                }
                None => break,
            }
        }

        debug!(system = %provider.system, count = records.len(), "Patient search complete");
        Ok(records)
    }

    fn parse_bundle(&self, bundle: &Value) -> Result<Vec<PatientRecord>, EmrError> {
        if bundle.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
            return Err(EmrError::MappingError("search response is not a Bundle".to_string()));
        }
        let Some(entries) = bundle.get("entry").and_then(Value::as_array) else {
            return Ok(Vec::new());
        };

        entries
            .iter()
            .filter(|entry| {
                let mode = entry.pointer("/search/mode").and_then(Value::as_str);
                let kind = entry.pointer("/resource/resourceType").and_then(Value::as_str);
                mode != Some("outcome") && kind != Some("OperationOutcome")
            })
            .map(|entry| {
                let resource = entry
                    .get("resource")
                    .ok_or_else(|| EmrError::MappingError("Bundle entry has no resource".to_string()))?;
                self.parse_patient(resource)
            })
            .collect()
    }

    async fn read(
        &self,
        client: &FhirClient,
        ctx: &RequestContext<'_>,
        patient_id: &str,
    ) -> Result<PatientRecord, EmrError> {
        if patient_id.trim().is_empty() {
            return Err(EmrError::PatientNotFound(patient_id.to_string()));
        }
        let url = ctx
            .provider
            .fhir_url(&format!("Patient/{}", urlencoding::encode(patient_id)));

        let response = client.get(ctx, &url, &[]).await?;
        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::GONE) {
            return Err(EmrError::PatientNotFound(patient_id.to_string()));
        }
        let response = error_for_status(ctx, response).await?;
        let resource = read_json(ctx, response).await?;

        let mut record = self.parse_patient(&resource)?;
        if record.id.is_none() {
            record.id = Some(patient_id.to_string());
        }
        Ok(record)
    }

    /// Create a patient and return it with the provider-assigned id, taken
    /// from the response body or else the `Location` header
    async fn create(
        &self,
        client: &FhirClient,
        ctx: &RequestContext<'_>,
        record: &PatientRecord,
    ) -> Result<PatientRecord, EmrError> {
        let submitted = PatientRecord {
            id: None,
            ..record.clone()
        };
        let body = self.build_patient(&submitted);

        let response = client.post(ctx, &ctx.provider.fhir_url("Patient"), &body).await?;
        let response = error_for_status(ctx, response).await?;
        let location_id = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .and_then(id_from_location);

        let bytes = response.bytes().await.map_err(|e| EmrError::ProviderRequestFailed {
            system: ctx.provider.system,
            status: None,
            message: format!("create: {}", e.without_url()),
        })?;
        let returned = serde_json::from_slice::<Value>(&bytes)
            .ok()
            .filter(|resource| resource.get("resourceType").and_then(Value::as_str) == Some("Patient"));

        let mut created = match returned {
            Some(resource) => self.parse_patient(&resource)?,
            None => submitted,
        };
        if created.id.is_none() {
            created.id = location_id;
        }

        match created.id.as_deref() {
            Some(id) if !id.is_empty() => Ok(created),
            _ => Err(EmrError::MappingError(
                "provider did not return the new patient id".to_string(),
            )),
        }
    }
}

/// `.../Patient/<id>/_history/<v>` → `<id>`
pub(crate) fn id_from_location(location: &str) -> Option<String> {
    let path = location.split(['?', '#']).next()?;
    let mut segments = path.split('/');
    segments.find(|segment| *segment == "Patient")?;
    segments
        .next()
        .filter(|id| !id.is_empty())
        .map(|id| urlencoding::decode(id).map(|d| d.into_owned()).unwrap_or_else(|_| id.to_string()))
}

/// `next` link of a search Bundle, if it points back at the provider's FHIR origin
fn next_page(bundle: &Value, provider: &ProviderConfig) -> Option<String> {
    let next = bundle
        .get("link")?
        .as_array()?
        .iter()
        .find(|link| link.get("relation").and_then(Value::as_str) == Some("next"))?
        .get("url")?
        .as_str()?;

    let url = Url::parse(next).ok()?;
    let base = &provider.fhir_base_url;
    if url.scheme() == base.scheme()
        && url.host_str() == base.host_str()
        && url.port_or_known_default() == base.port_or_known_default()
    {
        Some(url.to_string())
    } else {
        warn!(system = %provider.system, "Ignoring next link to a foreign origin");
        None
    }
}

fn standard_params(criteria: &SearchCriteria) -> Vec<(String, String)> {
    let mut params = Vec::new();
    if let Some(last) = &criteria.last_name {
        params.push(("family".to_string(), last.clone()));
    }
    if let Some(first) = &criteria.first_name {
        params.push(("given".to_string(), first.clone()));
    }
    if let Some(dob) = &criteria.date_of_birth {
        params.push(("birthdate".to_string(), dob.format("%Y-%m-%d").to_string()));
    }
    params
}

/// Epic and Allscripts
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardR4Adapter;

impl PatientAdapter for StandardR4Adapter {
    fn dialect(&self) -> FhirDialect {
        FhirDialect::StandardR4
    }

    fn search_params(&self, _provider: &ProviderConfig, criteria: &SearchCriteria) -> Vec<(String, String)> {
        standard_params(criteria)
    }
}

/// Cerner: explicit `eq` date prefix, and patients often carry only a `usual` name
#[derive(Debug, Default, Clone, Copy)]
pub struct CernerAdapter;

impl PatientAdapter for CernerAdapter {
    fn dialect(&self) -> FhirDialect {
        FhirDialect::Cerner
    }

    fn search_params(&self, _provider: &ProviderConfig, criteria: &SearchCriteria) -> Vec<(String, String)> {
        standard_params(criteria)
            .into_iter()
            .map(|(key, value)| match key.as_str() {
                "birthdate" => (key, format!("eq{}", value)),
                _ => (key, value),
            })
            .collect()
    }

    fn parse_patient(&self, resource: &Value) -> Result<PatientRecord, EmrError> {
        PatientRecord::from_resource_with(resource, OFFICIAL_THEN_USUAL)
    }
}

/// Athenahealth scopes every search to a practice
#[derive(Debug, Default, Clone, Copy)]
pub struct AthenaAdapter;

impl PatientAdapter for AthenaAdapter {
    fn dialect(&self) -> FhirDialect {
        FhirDialect::Athena
    }

    fn search_params(&self, provider: &ProviderConfig, criteria: &SearchCriteria) -> Vec<(String, String)> {
        let mut params = standard_params(criteria);
        if let Some(practice) = &provider.practice_id {
            params.push((
                "ah-practice".to_string(),
                format!("Organization/a-1.Practice-{}", practice),
            ));
        }
        params
    }
}

/// eClinicalWorks: `name` search, loose key casing and text-only names
#[derive(Debug, Default, Clone, Copy)]
pub struct EclinicalworksAdapter;

impl PatientAdapter for EclinicalworksAdapter {
    fn dialect(&self) -> FhirDialect {
        FhirDialect::Eclinicalworks
    }

    fn search_params(&self, _provider: &ProviderConfig, criteria: &SearchCriteria) -> Vec<(String, String)> {
        let mut params = Vec::new();
        match (&criteria.last_name, &criteria.first_name) {
            (Some(last), Some(first)) => {
                params.push(("name".to_string(), last.clone()));
                params.push(("given".to_string(), first.clone()));
            }
            (Some(only), None) | (None, Some(only)) => params.push(("name".to_string(), only.clone())),
            (None, None) => {}
        }
        if let Some(dob) = &criteria.date_of_birth {
            params.push(("birthdate".to_string(), dob.format("%Y-%m-%d").to_string()));
        }
        params
    }

    fn parse_patient(&self, resource: &Value) -> Result<PatientRecord, EmrError> {
        let mut normalized = normalize_keys(resource);
        if let Some(kind) = normalized.get_mut("resourceType") {
            if kind.as_str().is_some_and(|k| k.eq_ignore_ascii_case("patient")) {
                *kind = Value::String("Patient".to_string());
            }
        }
        fill_names_from_text(&mut normalized);
        PatientRecord::from_resource_with(&normalized, OFFICIAL_THEN_USUAL)
    }
}

const CANONICAL_KEYS: &[&str] = &[
    "resourceType",
    "id",
    "identifier",
    "active",
    "name",
    "use",
    "text",
    "family",
    "given",
    "gender",
    "birthDate",
    "telecom",
    "system",
    "value",
];

/// Rewrite object keys to their canonical FHIR casing, recursively.
/// String values of `use` and `system` are lower-cased.
fn normalize_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                let canonical = CANONICAL_KEYS
                    .iter()
                    .find(|k| k.eq_ignore_ascii_case(key))
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| key.clone());
                let child = match (canonical.as_str(), child) {
                    ("use" | "system", Value::String(s)) if !s.contains(':') => Value::String(s.to_ascii_lowercase()),
                    _ => normalize_keys(child),
                };
                out.insert(canonical, child);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize_keys).collect()),
        other => other.clone(),
    }
}

/// Give `family`/`given` to names that only have `text`.
/// "Doe, Jane" and "Jane Doe" are both understood.
fn fill_names_from_text(resource: &mut Value) {
    let Some(names) = resource.get_mut("name").and_then(Value::as_array_mut) else {
        return;
    };
    for name in names.iter_mut() {
        let Some(obj) = name.as_object_mut() else {
            continue;
        };
        if obj.contains_key("family") || obj.contains_key("given") {
            continue;
        }
        let Some(text) = obj.get("text").and_then(Value::as_str).map(str::trim) else {
            continue;
        };

        let (family, given): (String, Vec<String>) = match text.split_once(',') {
            Some((family, given)) => (
                family.trim().to_string(),
                given.split_whitespace().map(str::to_string).collect(),
            ),
            None => {
                let mut parts: Vec<String> = text.split_whitespace().map(str::to_string).collect();
                let family = parts.pop().unwrap_or_default();
                (family, parts)
            }
        };
        if !family.is_empty() {
            obj.insert("family".to_string(), Value::String(family));
        }
        if !given.is_empty() {
            obj.insert(
                "given".to_string(),
                Value::Array(given.into_iter().map(Value::String).collect()),
            );
        }
    }
}

static STANDARD_R4: StandardR4Adapter = StandardR4Adapter;
static CERNER: CernerAdapter = CernerAdapter;
static ATHENA: AthenaAdapter = AthenaAdapter;
static ECLINICALWORKS: EclinicalworksAdapter = EclinicalworksAdapter;

/// Adapter implementing `dialect`
pub fn adapter_for(dialect: FhirDialect) -> &'static dyn PatientAdapter {
    match dialect {
        FhirDialect::StandardR4 => &STANDARD_R4,
        FhirDialect::Cerner => &CERNER,
        FhirDialect::Athena => &ATHENA,
        FhirDialect::Eclinicalworks => &ECLINICALWORKS,
    }
}
