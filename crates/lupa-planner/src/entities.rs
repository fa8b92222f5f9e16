use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
/// Kinds of named entity the extractor groups by.
pub enum EntityKind {
    Organization,
    DateRange,
    ValueRange,
    Person,
    GeographicRegion,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Organization => "organization",
            Self::DateRange => "date_range",
            Self::ValueRange => "value_range",
            Self::Person => "person",
            Self::GeographicRegion => "geographic_region",
        }
    }
}

fn organization_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b((?:minist[ée]rio|secretaria|prefeitura|governo|tribunal|funda[çc][ãa]o|instituto|departamento|fundo)(?:\s+\p{L}+){1,4})",
        )
        .unwrap_or_else(|error| panic!("organization regex failed to compile: {error}"))
    })
}

fn year_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b((?:19|20)\d{2})\b")
            .unwrap_or_else(|error| panic!("year regex failed to compile: {error}"))
    })
}

fn year_span_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:entre|de)\s+((?:19|20)\d{2})\s+(?:e|a|até)\s+((?:19|20)\d{2})\b")
            .unwrap_or_else(|error| panic!("year span regex failed to compile: {error}"))
    })
}

fn value_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)((?:acima\s+de|abaixo\s+de|superior(?:es)?\s+a|inferior(?:es)?\s+a|mais\s+de|menos\s+de|at[ée])\s+)?r\$\s*([\d.]+(?:,\d+)?)\s*(mil|milh[ãa]o|milh[õo]es|bilh[ãa]o|bilh[õo]es)?",
        )
        .unwrap_or_else(|error| panic!("value regex failed to compile: {error}"))
    })
}

fn uf_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(AC|AL|AP|AM|BA|CE|DF|ES|GO|MA|MT|MS|MG|PA|PB|PR|PE|PI|RJ|RN|RS|RO|RR|SC|SP|SE|TO)\b",
        )
        .unwrap_or_else(|error| panic!("uf regex failed to compile: {error}"))
    })
}

fn state_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(s[ãa]o paulo|rio de janeiro|minas gerais|rio grande do sul|bahia|pernambuco|paran[áa]|cear[áa])\b",
        )
        .unwrap_or_else(|error| panic!("state name regex failed to compile: {error}"))
    })
}

fn person_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?:servidor(?:a)?|deputad[oa]|senador(?:a)?|vereador(?:a)?|prefeit[oa]|ministr[oa]|sr\.?|sra\.?)\s+(\p{Lu}\p{L}+(?:\s+(?:d[aeo]s?\s+)?\p{Lu}\p{L}+){0,3})",
        )
        .unwrap_or_else(|error| panic!("person regex failed to compile: {error}"))
    })
}

const ORG_TRAILING_STOPWORDS: &[&str] = &[
    "em", "no", "na", "nos", "nas", "de", "do", "da", "dos", "das", "durante", "entre", "para",
    "por", "com", "e",
];

fn trim_trailing_stopwords(raw: &str) -> String {
    let mut words: Vec<&str> = raw.split_whitespace().collect();
    while let Some(last) = words.last() {
        if ORG_TRAILING_STOPWORDS.contains(&last.to_lowercase().as_str()) {
            words.pop();
        } else {
            break;
        }
    }
    words.join(" ")
}

fn state_name_to_code(name: &str) -> &'static str {
    match name.to_lowercase().replace('ã', "a").replace('á', "a").as_str() {
        "sao paulo" => "SP",
        "rio de janeiro" => "RJ",
        "minas gerais" => "MG",
        "rio grande do sul" => "RS",
        "bahia" => "BA",
        "pernambuco" => "PE",
        "parana" => "PR",
        "ceara" => "CE",
        _ => "",
    }
}

fn push_unique(bucket: &mut Vec<String>, value: String) {
    if !value.is_empty() && !bucket.contains(&value) {
        bucket.push(value);
    }
}

/// Extracts named entities grouped by kind. An empty map is a legitimate
/// result; the plan builder decides whether that blocks the intent.
pub fn extract_entities(text: &str) -> BTreeMap<EntityKind, Vec<String>> {
    let mut entities: BTreeMap<EntityKind, Vec<String>> = BTreeMap::new();

    for capture in organization_regex().captures_iter(text) {
        if let Some(matched) = capture.get(1) {
            let organization = trim_trailing_stopwords(matched.as_str());
            // A bare head noun ("ministério") identifies nothing.
            if organization.split_whitespace().count() >= 2 {
                push_unique(
                    entities.entry(EntityKind::Organization).or_default(),
                    organization,
                );
            }
        }
    }

    let mut span_years = Vec::new();
    for capture in year_span_regex().captures_iter(text) {
        if let (Some(from), Some(to)) = (capture.get(1), capture.get(2)) {
            span_years.push(from.as_str().to_string());
            span_years.push(to.as_str().to_string());
            push_unique(
                entities.entry(EntityKind::DateRange).or_default(),
                format!("{}-{}", from.as_str(), to.as_str()),
            );
        }
    }
    for capture in year_regex().captures_iter(text) {
        if let Some(year) = capture.get(1) {
            if !span_years.contains(&year.as_str().to_string()) {
                push_unique(
                    entities.entry(EntityKind::DateRange).or_default(),
                    year.as_str().to_string(),
                );
            }
        }
    }

    for capture in value_regex().captures_iter(text) {
        if let Some(full) = capture.get(0) {
            push_unique(
                entities.entry(EntityKind::ValueRange).or_default(),
                full.as_str().trim().to_string(),
            );
        }
    }

    for capture in person_regex().captures_iter(text) {
        if let Some(name) = capture.get(1) {
            push_unique(
                entities.entry(EntityKind::Person).or_default(),
                name.as_str().to_string(),
            );
        }
    }

    for capture in uf_code_regex().captures_iter(text) {
        if let Some(code) = capture.get(1) {
            push_unique(
                entities.entry(EntityKind::GeographicRegion).or_default(),
                code.as_str().to_string(),
            );
        }
    }
    for capture in state_name_regex().captures_iter(text) {
        if let Some(name) = capture.get(1) {
            let code = state_name_to_code(name.as_str());
            if !code.is_empty() {
                push_unique(
                    entities.entry(EntityKind::GeographicRegion).or_default(),
                    code.to_string(),
                );
            }
        }
    }

    entities
}

/// Parses a matched value expression ("acima de R$ 1,5 milhão") into
/// (min, max) bounds in centavos.
pub fn parse_value_bounds(expression: &str) -> (Option<i64>, Option<i64>) {
    let Some(capture) = value_regex().captures(expression) else {
        return (None, None);
    };
    let qualifier = capture
        .get(1)
        .map(|m| m.as_str().trim().to_lowercase())
        .unwrap_or_default();
    let Some(number) = capture.get(2) else {
        return (None, None);
    };
    let normalized = number.as_str().replace('.', "").replace(',', ".");
    let Ok(mut value) = normalized.parse::<f64>() else {
        return (None, None);
    };
    match capture.get(3).map(|m| m.as_str().to_lowercase()) {
        Some(unit) if unit.starts_with("mil") && !unit.starts_with("milh") => value *= 1_000.0,
        Some(unit) if unit.starts_with("milh") => value *= 1_000_000.0,
        Some(unit) if unit.starts_with("bilh") => value *= 1_000_000_000.0,
        _ => {}
    }
    let centavos = (value * 100.0).round() as i64;

    if qualifier.starts_with("acima")
        || qualifier.starts_with("superior")
        || qualifier.starts_with("mais")
    {
        (Some(centavos), None)
    } else if qualifier.starts_with("abaixo")
        || qualifier.starts_with("inferior")
        || qualifier.starts_with("menos")
        || qualifier.starts_with("at")
    {
        (None, Some(centavos))
    } else {
        (Some(centavos), Some(centavos))
    }
}
