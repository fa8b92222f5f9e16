use std::collections::BTreeMap;
use std::sync::Arc;

use aho_corasick::{AhoCorasick, MatchKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use lupa_ai::{ChatRequest, LlmClient, Message};

use crate::entities::EntityKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
/// Typed classification of a user query.
pub enum IntentKind {
    Greeting,
    HelpRequest,
    Investigate,
    Analyze,
    ReportRequest,
    Unknown,
}

impl IntentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::HelpRequest => "help_request",
            Self::Investigate => "investigate",
            Self::Analyze => "analyze",
            Self::ReportRequest => "report_request",
            Self::Unknown => "unknown",
        }
    }

    /// Default specialist for this intent; the router may override when the
    /// suggestion is unhealthy.
    pub fn default_agent_id(self) -> &'static str {
        match self {
            Self::Greeting | Self::HelpRequest | Self::Unknown => "communicator",
            Self::Investigate => "detective",
            Self::Analyze => "analyst",
            Self::ReportRequest => "reporter",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Classified query: kind, extracted entities, confidence, suggested agent.
pub struct Intent {
    pub kind: IntentKind,
    pub entities: BTreeMap<EntityKind, Vec<String>>,
    /// Always in [0, 1].
    pub confidence: f64,
    pub suggested_agent_id: String,
}

impl Intent {
    pub fn unknown() -> Self {
        Self {
            kind: IntentKind::Unknown,
            entities: BTreeMap::new(),
            confidence: 0.0,
            suggested_agent_id: IntentKind::Unknown.default_agent_id().to_string(),
        }
    }
}

#[async_trait]
/// Pluggable classifier backend. Must return within a bounded time; the
/// caller maps a timeout to `unknown` with confidence 0.
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Intent;
}

struct LexiconEntry {
    kind: IntentKind,
    patterns: &'static [&'static str],
}

const LEXICON: &[LexiconEntry] = &[
    LexiconEntry {
        kind: IntentKind::Greeting,
        patterns: &[
            "ola", "olá", "oi", "bom dia", "boa tarde", "boa noite", "e aí", "tudo bem",
        ],
    },
    LexiconEntry {
        kind: IntentKind::HelpRequest,
        patterns: &[
            "ajuda",
            "como funciona",
            "o que voce faz",
            "o que você faz",
            "me ajude",
            "help",
        ],
    },
    LexiconEntry {
        kind: IntentKind::Investigate,
        patterns: &[
            "investigar",
            "investigue",
            "investigacao",
            "investigação",
            "apurar",
            "fiscalizar",
            "auditar",
            "verificar contratos",
            "consultar contratos",
            "buscar contratos",
        ],
    },
    LexiconEntry {
        kind: IntentKind::Analyze,
        patterns: &[
            "analisar",
            "analise",
            "análise",
            "comparar",
            "padrão de gastos",
            "padrao de gastos",
            "anomalia",
            "anomalias",
            "tendência",
            "tendencia",
        ],
    },
    LexiconEntry {
        kind: IntentKind::ReportRequest,
        patterns: &[
            "relatório",
            "relatorio",
            "resumo",
            "sumário executivo",
            "sumario executivo",
            "gerar relatório",
            "gere um relatório",
        ],
    },
];

/// Deterministic rule-based classifier over a Portuguese keyword lexicon.
/// Leftmost-longest matching; the intent with the most matched terms wins,
/// action intents beating conversational ones on a tie.
pub struct LexiconIntentClassifier {
    matcher: AhoCorasick,
    kinds: Vec<IntentKind>,
}

impl Default for LexiconIntentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl LexiconIntentClassifier {
    pub fn new() -> Self {
        let mut patterns = Vec::new();
        let mut kinds = Vec::new();
        for entry in LEXICON {
            for pattern in entry.patterns {
                patterns.push(*pattern);
                kinds.push(entry.kind);
            }
        }
        let matcher = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .match_kind(MatchKind::LeftmostLongest)
            .build(&patterns)
            .unwrap_or_else(|error| panic!("intent lexicon failed to compile: {error}"));
        Self { matcher, kinds }
    }

    fn classify_sync(&self, text: &str) -> Intent {
        let normalized = text.trim().to_lowercase();
        if normalized.is_empty() {
            return Intent::unknown();
        }

        let mut votes: BTreeMap<IntentKind, usize> = BTreeMap::new();
        for matched in self.matcher.find_iter(&normalized) {
            let kind = self.kinds[matched.pattern().as_usize()];
            *votes.entry(kind).or_insert(0) += 1;
        }

        let Some((kind, hits)) = votes.into_iter().max_by_key(|(kind, hits)| {
            // Action intents outrank conversational ones on equal votes.
            let rank = match kind {
                IntentKind::Investigate => 3,
                IntentKind::Analyze | IntentKind::ReportRequest => 2,
                IntentKind::Greeting | IntentKind::HelpRequest => 1,
                IntentKind::Unknown => 0,
            };
            (*hits, rank)
        }) else {
            return Intent::unknown();
        };

        let entities = crate::entities::extract_entities(text);
        let confidence = match hits {
            0 => 0.0,
            1 => 0.75,
            _ => 0.9,
        };
        Intent {
            kind,
            entities,
            confidence,
            suggested_agent_id: kind.default_agent_id().to_string(),
        }
    }
}

#[async_trait]
impl IntentClassifier for LexiconIntentClassifier {
    async fn classify(&self, text: &str) -> Intent {
        self.classify_sync(text)
    }
}

/// LLM-backed classifier with the lexicon as its safety net: any provider
/// failure, timeout, or unparseable reply degrades to the lexicon verdict.
pub struct LlmIntentClassifier {
    client: Arc<dyn LlmClient>,
    model: String,
    timeout_ms: u64,
    lexicon: LexiconIntentClassifier,
}

impl LlmIntentClassifier {
    pub fn new(client: Arc<dyn LlmClient>, model: String, timeout_ms: u64) -> Self {
        Self {
            client,
            model,
            timeout_ms,
            lexicon: LexiconIntentClassifier::new(),
        }
    }

    fn classifier_prompt(text: &str) -> Vec<Message> {
        vec![
            Message::system(
                "Classifique a consulta de transparência pública. Responda apenas JSON: \
                 {\"intent\": greeting|help_request|investigate|analyze|report_request|unknown, \
                 \"confidence\": 0.0-1.0}",
            ),
            Message::user(text),
        ]
    }

    fn parse_reply(reply: &str) -> Option<(IntentKind, f64)> {
        let parsed: serde_json::Value = serde_json::from_str(reply.trim()).ok()?;
        let kind = match parsed.get("intent")?.as_str()? {
            "greeting" => IntentKind::Greeting,
            "help_request" => IntentKind::HelpRequest,
            "investigate" => IntentKind::Investigate,
            "analyze" => IntentKind::Analyze,
            "report_request" => IntentKind::ReportRequest,
            _ => IntentKind::Unknown,
        };
        let confidence = parsed
            .get("confidence")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        Some((kind, confidence))
    }
}

#[async_trait]
impl IntentClassifier for LlmIntentClassifier {
    async fn classify(&self, text: &str) -> Intent {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: Self::classifier_prompt(text),
            json_mode: true,
            max_tokens: Some(64),
            temperature: Some(0.0),
        };

        let completion = tokio::time::timeout(
            std::time::Duration::from_millis(self.timeout_ms.max(1)),
            self.client.complete(request),
        )
        .await;

        match completion {
            Ok(Ok(response)) => match Self::parse_reply(&response.message.text) {
                Some((kind, confidence)) => {
                    let entities = crate::entities::extract_entities(text);
                    Intent {
                        kind,
                        entities,
                        confidence,
                        suggested_agent_id: kind.default_agent_id().to_string(),
                    }
                }
                None => {
                    tracing::warn!("classifier reply was not valid JSON, using lexicon");
                    self.lexicon.classify_sync(text)
                }
            },
            Ok(Err(error)) => {
                tracing::warn!(error = %error, "classifier backend failed, using lexicon");
                self.lexicon.classify_sync(text)
            }
            Err(_) => {
                tracing::warn!(timeout_ms = self.timeout_ms, "classifier timed out");
                Intent::unknown()
            }
        }
    }
}
