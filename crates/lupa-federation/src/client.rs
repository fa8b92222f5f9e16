use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use lupa_resilience::FailureClass;
use lupa_sources::{Capability, Source};

use crate::types::{RecordFilters, SourceRecord};

#[derive(Debug, Error)]
/// Typed failure of one source fetch. Escalation carries the classified
/// cause, never the raw wire error.
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("source returned status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("source payload was not understood: {0}")]
    InvalidPayload(String),
}

impl FetchError {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::Network(inner) if inner.is_timeout() => FailureClass::Timeout,
            Self::Network(_) => FailureClass::Network,
            Self::HttpStatus { status, .. } => FailureClass::from_status(*status),
            Self::InvalidPayload(_) => FailureClass::Invalid,
        }
    }
}

#[async_trait]
/// Port for fetching records from one source. The executor owns timeouts,
/// breaker gating, and retries; implementations only speak the wire format.
pub trait SourceClient: Send + Sync {
    async fn fetch(
        &self,
        source: &Source,
        capability: Capability,
        filters: &RecordFilters,
    ) -> Result<Vec<SourceRecord>, FetchError>;
}

#[derive(Debug, Clone)]
/// Real adapter over the government HTTP APIs. The federal portal expects
/// its key in the `chave-api-dados` header; other portals ignore it.
pub struct HttpSourceClient {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpSourceClient {
    pub fn new(api_key: Option<String>, request_timeout_ms: u64) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(request_timeout_ms.max(1)))
            .build()?;
        Ok(Self { client, api_key })
    }

    fn fetch_url(source: &Source, capability: Capability) -> String {
        let base = source.base_endpoint.trim_end_matches('/');
        format!("{base}/{}", capability.as_str())
    }

    fn query_params(filters: &RecordFilters) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(organization) = &filters.organization {
            params.push(("orgao", organization.clone()));
        }
        if let Some(date_from) = &filters.date_from {
            params.push(("dataInicial", date_from.clone()));
        }
        if let Some(date_to) = &filters.date_to {
            params.push(("dataFinal", date_to.clone()));
        }
        if let Some(value_min) = filters.value_min_centavos {
            params.push(("valorMinimo", value_min.to_string()));
        }
        if let Some(value_max) = filters.value_max_centavos {
            params.push(("valorMaximo", value_max.to_string()));
        }
        if let Some(region) = &filters.region {
            params.push(("uf", region.clone()));
        }
        params
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn fetch(
        &self,
        source: &Source,
        capability: Capability,
        filters: &RecordFilters,
    ) -> Result<Vec<SourceRecord>, FetchError> {
        let url = Self::fetch_url(source, capability);
        let mut request = self.client.get(&url).query(&Self::query_params(filters));
        if let Some(api_key) = &self.api_key {
            request = request.header("chave-api-dados", api_key);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        if !(200..300).contains(&status) {
            return Err(FetchError::HttpStatus { status, body });
        }

        let parsed: Value = serde_json::from_str(&body)
            .map_err(|error| FetchError::InvalidPayload(format!("invalid JSON: {error}")))?;
        let items = extract_item_list(&parsed).ok_or_else(|| {
            FetchError::InvalidPayload("payload carried no recognizable record list".to_string())
        })?;

        Ok(items
            .iter()
            .map(|item| normalize_record(item, &source.id))
            .collect())
    }
}

/// Accepts both bare-array payloads and the envelope keys the portals use.
fn extract_item_list(payload: &Value) -> Option<&Vec<Value>> {
    if let Value::Array(items) = payload {
        return Some(items);
    }
    for key in ["data", "items", "resultado", "registros", "result"] {
        if let Some(Value::Array(items)) = payload.get(key) {
            return Some(items);
        }
    }
    None
}

fn string_field(item: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        match item.get(key) {
            Some(Value::String(text)) if !text.trim().is_empty() => {
                return Some(text.trim().to_string())
            }
            Some(Value::Number(number)) => return Some(number.to_string()),
            _ => {}
        }
    }
    None
}

fn value_centavos_field(item: &Value) -> Option<i64> {
    for key in ["valorCentavos", "valor", "valorContrato", "value", "amount"] {
        match item.get(key) {
            Some(Value::Number(number)) => {
                if key == "valorCentavos" {
                    return number.as_i64();
                }
                // Real values arrive in reais; store centavos.
                return number.as_f64().map(|reais| (reais * 100.0).round() as i64);
            }
            Some(Value::String(text)) => {
                if let Ok(reais) = text.trim().replace(',', ".").parse::<f64>() {
                    return Some((reais * 100.0).round() as i64);
                }
            }
            _ => {}
        }
    }
    None
}

/// Maps one upstream item onto the normalized record shape the dedupe hash
/// and the analysis agents expect.
pub fn normalize_record(item: &Value, source_id: &str) -> SourceRecord {
    SourceRecord {
        contract_id: string_field(item, &["numeroContrato", "numero_contrato", "contractId", "id"]),
        document_number: string_field(item, &["numeroDocumento", "numero_documento", "documento"]),
        organization: string_field(
            item,
            &["orgao", "nomeOrgao", "organization", "unidadeGestora"],
        )
        .unwrap_or_default(),
        date: string_field(
            item,
            &["dataAssinatura", "data", "dataDocumento", "date"],
        )
        .unwrap_or_default(),
        value_centavos: value_centavos_field(item),
        description: string_field(item, &["objeto", "descricao", "description"])
            .unwrap_or_default(),
        payload: item.clone(),
        provenance: vec![source_id.to_string()],
    }
}

#[derive(Debug, Clone, Default)]
/// Deterministic synthetic source used when no `TRANSPARENCY_API_KEY` is
/// configured. Record identity is derived from (source, capability, filter)
/// so overlapping catalogs produce genuine cross-source duplicates.
pub struct DemoSourceClient;

impl DemoSourceClient {
    fn record_count(source: &Source) -> usize {
        // Higher-priority sources return more rows to make merges interesting.
        match source.priority {
            0 | 1 => 8,
            2 => 6,
            3 => 4,
            _ => 3,
        }
    }
}

#[async_trait]
impl SourceClient for DemoSourceClient {
    async fn fetch(
        &self,
        source: &Source,
        capability: Capability,
        filters: &RecordFilters,
    ) -> Result<Vec<SourceRecord>, FetchError> {
        let organization = filters
            .organization
            .clone()
            .unwrap_or_else(|| "Ministério da Saúde".to_string());
        let year = filters
            .date_from
            .as_deref()
            .and_then(|date| date.get(0..4))
            .unwrap_or("2024")
            .to_string();

        let records = (0..Self::record_count(source))
            .map(|index| {
                let item = serde_json::json!({
                    "numeroContrato": format!("{}-{}-{:03}", capability.as_str(), year, index),
                    "orgao": organization,
                    "dataAssinatura": format!("{year}-0{}-15", (index % 9) + 1),
                    "valor": 125_000.0 + (index as f64) * 37_500.0,
                    "objeto": format!(
                        "Registro de {} nº {index} ({})",
                        capability.as_str(),
                        source.id
                    ),
                });
                normalize_record(&item, &source.id)
            })
            .collect();
        Ok(records)
    }
}
