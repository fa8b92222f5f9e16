use async_trait::async_trait;
use serde_json::{json, Value};

use lupa_federation::SourceRecord;

use crate::contract::{AgentContext, AgentError, AgentMessage, AgentResponse, QualityScore};
use crate::runtime::Agent;

fn records_from_payload(payload: &Value) -> Vec<SourceRecord> {
    payload
        .get("records")
        .cloned()
        .and_then(|records| serde_json::from_value(records).ok())
        .unwrap_or_default()
}

/// Conversational fast path: greetings, help, clarification prompts, and the
/// intent-conditioned failure texts. A chat reply is never empty.
#[derive(Debug, Clone, Default)]
pub struct CommunicatorAgent;

impl CommunicatorAgent {
    fn reply_for(action: &str, payload: &Value) -> (String, Vec<String>) {
        match action {
            "greet" => (
                "Olá! Sou o assistente de transparência pública. Posso investigar contratos, \
                 despesas, licitações e convênios de órgãos federais, estaduais e municipais."
                    .to_string(),
                vec![
                    "investigar contratos do Ministério da Saúde em 2024".to_string(),
                    "analisar despesas da Prefeitura de Recife".to_string(),
                ],
            ),
            "help" => (
                "Você pode me pedir, por exemplo: \"investigar contratos do Ministério da \
                 Educação em 2023\" ou \"analisar padrões de gastos acima de R$ 1 milhão\". \
                 Eu consulto as fontes oficiais e aponto anomalias."
                    .to_string(),
                vec!["investigar licitações em SP".to_string()],
            ),
            "clarify" => {
                let prompt = payload
                    .get("prompt")
                    .and_then(Value::as_str)
                    .unwrap_or("Pode detalhar o que você quer investigar?");
                (prompt.to_string(), Vec::new())
            }
            "fallback" => (
                "Não consegui consultar as fontes agora; tente em instantes.".to_string(),
                Vec::new(),
            ),
            _ => (
                "Não entendi o pedido, mas posso investigar dados públicos. Diga o órgão e o \
                 tipo de dado."
                    .to_string(),
                Vec::new(),
            ),
        }
    }
}

#[async_trait]
impl Agent for CommunicatorAgent {
    fn id(&self) -> &str {
        "communicator"
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["greeting".to_string(), "help".to_string(), "clarification".to_string()]
    }

    async fn process(
        &self,
        message: AgentMessage,
        _context: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        let (reply, suggestions) = Self::reply_for(&message.action, &message.payload);
        Ok(AgentResponse::completed(
            self.id(),
            json!({
                "message": reply,
                "suggested_actions": suggestions,
            }),
            0.95,
        ))
    }
}

/// Anomaly heuristics over federated records: statistical value outliers,
/// suspiciously round amounts, and repeated (organization, value) pairs.
#[derive(Debug, Clone, Default)]
pub struct DetectiveAgent;

impl DetectiveAgent {
    fn find_anomalies(records: &[SourceRecord]) -> Vec<Value> {
        let mut anomalies = Vec::new();
        let mut values: Vec<i64> = records
            .iter()
            .filter_map(|record| record.value_centavos)
            .collect();
        values.sort_unstable();

        // Median-based outlier rule: robust on the small samples a single
        // fetch returns, where mean/stddev is dominated by the outlier itself.
        if values.len() >= 3 {
            let median = values[values.len() / 2];
            if median > 0 {
                for record in records {
                    let Some(value) = record.value_centavos else {
                        continue;
                    };
                    if value > median.saturating_mul(5) {
                        anomalies.push(json!({
                            "kind": "valor_atipico",
                            "description": format!(
                                "Valor muito acima da mediana dos registros ({} centavos)",
                                value
                            ),
                            "contract_id": record.contract_id,
                            "organization": record.organization,
                            "value_centavos": value,
                        }));
                    }
                }
            }
        }

        // Round amounts at or above R$ 100.000,00 draw a flag.
        for record in records {
            let Some(value) = record.value_centavos else {
                continue;
            };
            if value >= 10_000_000 && value % 10_000_000 == 0 {
                anomalies.push(json!({
                    "kind": "valor_redondo",
                    "description": "Valor exatamente redondo, padrão raro em contratações reais",
                    "contract_id": record.contract_id,
                    "organization": record.organization,
                    "value_centavos": value,
                }));
            }
        }

        let mut seen: Vec<(&str, i64)> = Vec::new();
        for record in records {
            let Some(value) = record.value_centavos else {
                continue;
            };
            let key = (record.organization.as_str(), value);
            if seen.contains(&key) {
                anomalies.push(json!({
                    "kind": "pagamento_repetido",
                    "description": "Mesmo órgão e mesmo valor em registros distintos",
                    "organization": record.organization,
                    "value_centavos": value,
                }));
            } else {
                seen.push(key);
            }
        }

        anomalies
    }
}

#[async_trait]
impl Agent for DetectiveAgent {
    fn id(&self) -> &str {
        "detective"
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["anomaly_detection".to_string(), "fraud_signals".to_string()]
    }

    async fn process(
        &self,
        message: AgentMessage,
        _context: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        let records = records_from_payload(&message.payload);
        let anomalies = Self::find_anomalies(&records);
        let confidence = if records.len() >= 5 { 0.85 } else { 0.65 };
        Ok(AgentResponse::completed(
            self.id(),
            json!({
                "anomalies": anomalies,
                "anomalies_found": anomalies.len(),
                "total_records_analyzed": records.len(),
            }),
            confidence,
        ))
    }
}

/// Pattern analysis over the record set: totals per organization, monthly
/// distribution, concentration. The first pass looks only at the most recent
/// year; reflection widens to the full window.
#[derive(Debug, Clone, Default)]
pub struct AnalystAgent;

impl AnalystAgent {
    fn summarize(records: &[SourceRecord]) -> Value {
        let mut by_organization: std::collections::BTreeMap<String, i64> =
            std::collections::BTreeMap::new();
        let mut by_month: std::collections::BTreeMap<String, i64> =
            std::collections::BTreeMap::new();
        let mut total = 0i64;
        for record in records {
            let value = record.value_centavos.unwrap_or(0);
            total += value;
            *by_organization
                .entry(record.organization.clone())
                .or_insert(0) += value;
            if record.date.len() >= 7 {
                *by_month.entry(record.date[0..7].to_string()).or_insert(0) += value;
            }
        }
        json!({
            "total_value_centavos": total,
            "by_organization": by_organization,
            "by_month": by_month,
            "records_considered": records.len(),
        })
    }

    fn latest_year(records: &[SourceRecord]) -> Option<String> {
        records
            .iter()
            .filter(|record| record.date.len() >= 4)
            .map(|record| record.date[0..4].to_string())
            .max()
    }
}

#[async_trait]
impl Agent for AnalystAgent {
    fn id(&self) -> &str {
        "analyst"
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["pattern_analysis".to_string(), "spending_statistics".to_string()]
    }

    async fn process(
        &self,
        message: AgentMessage,
        _context: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        let records = records_from_payload(&message.payload);
        let expanded_window = message.context.contains_key("reflection_cycle");

        let (considered, window): (Vec<SourceRecord>, &str) = if expanded_window {
            (records.clone(), "completa")
        } else {
            match Self::latest_year(&records) {
                Some(year) => (
                    records
                        .iter()
                        .filter(|record| record.date.starts_with(&year))
                        .cloned()
                        .collect(),
                    "ano mais recente",
                ),
                None => (records.clone(), "completa"),
            }
        };

        let mut summary = Self::summarize(&considered);
        summary["window"] = Value::from(window);
        let confidence = if expanded_window || considered.len() >= 10 {
            0.85
        } else {
            0.55
        };
        Ok(AgentResponse::completed(self.id(), summary, confidence))
    }

    async fn reflect(&self, response: &AgentResponse) -> QualityScore {
        QualityScore {
            score: response.confidence(),
            needs_retry: true,
            feedback: "expandir a janela de análise para todos os períodos".to_string(),
        }
    }
}

/// Synthesizes the final Portuguese report out of the collected artifacts.
#[derive(Debug, Clone, Default)]
pub struct ReporterAgent;

impl ReporterAgent {
    fn render_summary(payload: &Value) -> String {
        let organization = payload
            .get("organization")
            .and_then(Value::as_str)
            .unwrap_or("os órgãos consultados");
        let total_records = payload
            .get("total_records_analyzed")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let anomalies_found = payload
            .get("anomalies_found")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let missing: Vec<&str> = payload
            .get("missing_sources")
            .and_then(Value::as_array)
            .map(|sources| sources.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let mut summary = format!(
            "Análise concluída para {organization}: {total_records} registros examinados, \
             {anomalies_found} possíveis anomalias encontradas."
        );
        if anomalies_found == 0 && total_records == 0 {
            summary = format!(
                "Nenhum registro foi localizado para {organization} no período consultado. \
                 Isso pode indicar ausência de dados publicados, não necessariamente ausência \
                 de gastos."
            );
        }
        if !missing.is_empty() {
            summary.push_str(&format!(
                " Atenção: as fontes {} não responderam a tempo e ficaram fora desta análise.",
                missing.join(", ")
            ));
        }
        summary
    }
}

#[async_trait]
impl Agent for ReporterAgent {
    fn id(&self) -> &str {
        "reporter"
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["report_synthesis".to_string()]
    }

    async fn process(
        &self,
        message: AgentMessage,
        _context: &AgentContext,
    ) -> Result<AgentResponse, AgentError> {
        let summary = Self::render_summary(&message.payload);
        Ok(AgentResponse::completed(
            self.id(),
            json!({
                "summary": summary,
                "message": summary,
            }),
            0.9,
        ))
    }
}
