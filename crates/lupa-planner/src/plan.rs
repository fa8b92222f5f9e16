use std::collections::BTreeMap;
use std::sync::Arc;

use aho_corasick::{AhoCorasick, MatchKind};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

use lupa_federation::{FetchStrategy, RecordFilters};
use lupa_sources::{Capability, SourceFilters, SourceRegistry};

use crate::entities::{parse_value_bounds, EntityKind};
use crate::intent::{Intent, IntentClassifier, IntentKind};

pub const DEFAULT_STEP_DEADLINE_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One federated fetch the coordinator will run during `collecting`.
pub struct PlanStep {
    pub capability: Capability,
    /// Source ids resolved against the registry snapshot at plan time.
    pub sources: Vec<String>,
    pub strategy: FetchStrategy,
    pub source_filters: SourceFilters,
    pub record_filters: RecordFilters,
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Ordered steps for one query. Empty for conversational intents.
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    pub fn empty() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn requires_collection(&self) -> bool {
        !self.steps.is_empty()
    }
}

#[derive(Debug, Error)]
/// Planning failures. Surfaced to the user as a clarifying prompt, never as
/// an error page.
pub enum PlanError {
    #[error("query needs clarification: {prompt}")]
    NeedsClarification { prompt: String },
}

impl PlanError {
    pub fn clarifying_prompt(&self) -> &str {
        match self {
            Self::NeedsClarification { prompt } => prompt,
        }
    }
}

struct CapabilityEntry {
    capability: Capability,
    patterns: &'static [&'static str],
}

const CAPABILITY_LEXICON: &[CapabilityEntry] = &[
    CapabilityEntry {
        capability: Capability::Contracts,
        patterns: &["contrato", "contratos", "contratação", "contratacoes", "contratações"],
    },
    CapabilityEntry {
        capability: Capability::Servants,
        patterns: &["servidor", "servidores", "folha de pagamento", "salário", "salarios", "salários"],
    },
    CapabilityEntry {
        capability: Capability::Expenses,
        patterns: &["despesa", "despesas", "gasto", "gastos", "pagamento", "pagamentos", "empenho", "empenhos"],
    },
    CapabilityEntry {
        capability: Capability::Biddings,
        patterns: &["licitação", "licitacao", "licitações", "licitacoes", "pregão", "pregao", "edital", "editais"],
    },
    CapabilityEntry {
        capability: Capability::Agreements,
        patterns: &["convênio", "convenio", "convênios", "convenios", "transferência voluntária", "transferencia voluntaria"],
    },
    CapabilityEntry {
        capability: Capability::Sanctions,
        patterns: &["sanção", "sancao", "sanções", "sancoes", "empresa inidônea", "empresa inidonea", "punição", "punicoes", "punições"],
    },
    CapabilityEntry {
        capability: Capability::HealthData,
        patterns: &["dados de saúde", "dados de saude", "internações", "internacoes", "leitos", "atendimentos do sus"],
    },
    CapabilityEntry {
        capability: Capability::EducationData,
        patterns: &["dados de educação", "dados de educacao", "escolas", "matrículas", "matriculas", "ideb"],
    },
    CapabilityEntry {
        capability: Capability::Geographic,
        patterns: &["municípios", "municipios", "malha municipal", "dados geográficos", "dados geograficos"],
    },
];

const TIME_CRITICAL_TERMS: &[&str] = &["urgente", "urgência", "urgencia", "agora mesmo", "imediatamente", "rápido", "rapido"];

fn capability_matcher() -> &'static (AhoCorasick, Vec<Capability>) {
    static MATCHER: OnceLock<(AhoCorasick, Vec<Capability>)> = OnceLock::new();
    MATCHER.get_or_init(|| {
        let mut patterns = Vec::new();
        let mut capabilities = Vec::new();
        for entry in CAPABILITY_LEXICON {
            for pattern in entry.patterns {
                patterns.push(*pattern);
                capabilities.push(entry.capability);
            }
        }
        let matcher = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::LeftmostLongest)
            .build(&patterns)
            .unwrap_or_else(|error| panic!("capability lexicon failed to compile: {error}"));
        (matcher, capabilities)
    })
}

/// Capabilities the query text asks for, in declaration order, deduplicated.
pub fn detect_capabilities(text: &str) -> Vec<Capability> {
    let normalized = text.to_lowercase();
    let (matcher, capabilities) = capability_matcher();
    let mut detected = Vec::new();
    for matched in matcher.find_iter(&normalized) {
        let capability = capabilities[matched.pattern().as_usize()];
        if !detected.contains(&capability) {
            detected.push(capability);
        }
    }
    detected
}

fn is_time_critical(text: &str) -> bool {
    let normalized = text.to_lowercase();
    TIME_CRITICAL_TERMS
        .iter()
        .any(|term| normalized.contains(term))
}

fn date_bounds(entities: &BTreeMap<EntityKind, Vec<String>>) -> (Option<String>, Option<String>) {
    let Some(ranges) = entities.get(&EntityKind::DateRange) else {
        return (None, None);
    };
    let Some(first) = ranges.first() else {
        return (None, None);
    };
    match first.split_once('-') {
        Some((from, to)) => (
            Some(format!("{from}-01-01")),
            Some(format!("{to}-12-31")),
        ),
        None => (
            Some(format!("{first}-01-01")),
            Some(format!("{first}-12-31")),
        ),
    }
}

fn record_filters_from(entities: &BTreeMap<EntityKind, Vec<String>>) -> RecordFilters {
    let (date_from, date_to) = date_bounds(entities);
    let (value_min_centavos, value_max_centavos) = entities
        .get(&EntityKind::ValueRange)
        .and_then(|values| values.first())
        .map(|expression| parse_value_bounds(expression))
        .unwrap_or((None, None));
    RecordFilters {
        organization: entities
            .get(&EntityKind::Organization)
            .and_then(|organizations| organizations.first().cloned()),
        date_from,
        date_to,
        value_min_centavos,
        value_max_centavos,
        region: entities
            .get(&EntityKind::GeographicRegion)
            .and_then(|regions| regions.first().cloned()),
    }
}

/// Builds the execution plan for a classified query. Investigation-style
/// intents need at least one capability mapping; without one the planner
/// asks for clarification instead of guessing.
pub fn build_plan(
    intent: &Intent,
    query_text: &str,
    registry: &SourceRegistry,
) -> Result<ExecutionPlan, PlanError> {
    match intent.kind {
        IntentKind::Greeting | IntentKind::HelpRequest | IntentKind::ReportRequest => {
            return Ok(ExecutionPlan::empty())
        }
        IntentKind::Unknown => {
            return Err(PlanError::NeedsClarification {
                prompt: "Não entendi o que você quer investigar. Pode me dizer o órgão e o \
                         tipo de dado (contratos, despesas, licitações...)?"
                    .to_string(),
            })
        }
        IntentKind::Investigate | IntentKind::Analyze => {}
    }

    let capabilities = detect_capabilities(query_text);
    if capabilities.is_empty() {
        return Err(PlanError::NeedsClarification {
            prompt: "Que tipo de dado devo consultar? Por exemplo: contratos, despesas, \
                     licitações, convênios ou servidores."
                .to_string(),
        });
    }

    let record_filters = record_filters_from(&intent.entities);
    let source_filters = SourceFilters {
        families: Vec::new(),
        region: record_filters.region.clone(),
    };
    let strategy = if is_time_critical(query_text) {
        FetchStrategy::Fastest
    } else {
        FetchStrategy::Aggregate
    };

    let steps = capabilities
        .into_iter()
        .map(|capability| {
            let sources = registry
                .resolve(capability, &source_filters)
                .into_iter()
                .map(|source| source.id)
                .collect();
            PlanStep {
                capability,
                sources,
                strategy,
                source_filters: source_filters.clone(),
                record_filters: record_filters.clone(),
                deadline_ms: DEFAULT_STEP_DEADLINE_MS,
            }
        })
        .collect();

    Ok(ExecutionPlan { steps })
}

/// Planner facade: classify, extract, plan.
pub struct QueryPlanner {
    classifier: Arc<dyn IntentClassifier>,
    registry: Arc<SourceRegistry>,
}

impl QueryPlanner {
    pub fn new(classifier: Arc<dyn IntentClassifier>, registry: Arc<SourceRegistry>) -> Self {
        Self {
            classifier,
            registry,
        }
    }

    pub async fn plan(&self, query_text: &str) -> (Intent, Result<ExecutionPlan, PlanError>) {
        let intent = self.classifier.classify(query_text).await;
        tracing::debug!(
            intent = intent.kind.as_str(),
            confidence = intent.confidence,
            "query classified"
        );
        let plan = build_plan(&intent, query_text, &self.registry);
        (intent, plan)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lupa_federation::FetchStrategy;
    use lupa_resilience::CircuitBreakerConfig;
    use lupa_sources::{builtin_catalog, Capability, SourceRegistry};

    use super::{build_plan, detect_capabilities, PlanError, QueryPlanner};
    use crate::intent::{IntentKind, LexiconIntentClassifier};

    fn registry() -> Arc<SourceRegistry> {
        Arc::new(SourceRegistry::new(
            builtin_catalog(),
            CircuitBreakerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn functional_investigation_plan_has_one_aggregate_contracts_step() {
        let planner = QueryPlanner::new(Arc::new(LexiconIntentClassifier::new()), registry());
        let (intent, plan) = planner
            .plan("investigar contratos do Ministério da Saúde em 2024")
            .await;
        let plan = plan.expect("plan");

        assert_eq!(intent.kind, IntentKind::Investigate);
        assert_eq!(plan.steps.len(), 1);
        let step = &plan.steps[0];
        assert_eq!(step.capability, Capability::Contracts);
        assert_eq!(step.strategy, FetchStrategy::Aggregate);
        assert_eq!(
            step.record_filters.organization.as_deref(),
            Some("Ministério da Saúde")
        );
        assert_eq!(step.record_filters.date_from.as_deref(), Some("2024-01-01"));
        assert_eq!(step.record_filters.date_to.as_deref(), Some("2024-12-31"));
        assert!(!step.sources.is_empty());
    }

    #[tokio::test]
    async fn functional_time_critical_queries_use_fastest_strategy() {
        let planner = QueryPlanner::new(Arc::new(LexiconIntentClassifier::new()), registry());
        let (_, plan) = planner
            .plan("urgente: investigar despesas da Prefeitura de Recife")
            .await;
        let plan = plan.expect("plan");
        assert_eq!(plan.steps[0].strategy, FetchStrategy::Fastest);
    }

    #[tokio::test]
    async fn functional_greeting_plan_is_empty() {
        let planner = QueryPlanner::new(Arc::new(LexiconIntentClassifier::new()), registry());
        let (intent, plan) = planner.plan("olá").await;
        assert_eq!(intent.kind, IntentKind::Greeting);
        assert!(!plan.expect("plan").requires_collection());
    }

    #[tokio::test]
    async fn functional_investigation_without_capability_asks_for_clarification() {
        let planner = QueryPlanner::new(Arc::new(LexiconIntentClassifier::new()), registry());
        let (intent, plan) = planner.plan("investigar o Ministério da Saúde").await;
        assert_eq!(intent.kind, IntentKind::Investigate);
        let error = plan.expect_err("no capability should need clarification");
        let PlanError::NeedsClarification { prompt } = error;
        assert!(prompt.contains("contratos"));
    }

    #[test]
    fn unit_capability_detection_ignores_org_names() {
        // "Ministério da Saúde" must not read as a health-data request.
        let capabilities = detect_capabilities("contratos do Ministério da Saúde");
        assert_eq!(capabilities, vec![Capability::Contracts]);
    }

    #[test]
    fn unit_capability_detection_supports_multiple_steps() {
        let capabilities = detect_capabilities("contratos e licitações de 2024");
        assert_eq!(
            capabilities,
            vec![Capability::Contracts, Capability::Biddings]
        );
    }

    #[tokio::test]
    async fn regression_plan_is_deterministic_for_identical_snapshot() {
        let registry = registry();
        let classifier = Arc::new(LexiconIntentClassifier::new());
        let planner = QueryPlanner::new(classifier.clone(), registry.clone());
        let text = "investigar contratos e convênios do Ministério da Educação em 2023";
        let (first_intent, first_plan) = planner.plan(text).await;
        let (second_intent, second_plan) = planner.plan(text).await;
        assert_eq!(first_intent, second_intent);
        assert_eq!(first_plan.expect("first"), second_plan.expect("second"));
    }

    #[test]
    fn regression_unknown_intent_yields_clarifying_prompt() {
        let registry = registry();
        let intent = crate::intent::Intent::unknown();
        let error = build_plan(&intent, "???", &registry).expect_err("unknown must clarify");
        assert!(!error.clarifying_prompt().is_empty());
    }
}
