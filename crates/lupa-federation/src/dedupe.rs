use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::types::SourceRecord;

/// Stable content fingerprint for cross-source deduplication.
///
/// Key precedence: contract id when present, else document number, else the
/// (organization, date, value) tuple. Each component is trimmed and
/// lowercased before hashing so cosmetic differences between portals do not
/// defeat the merge.
pub fn content_fingerprint(record: &SourceRecord) -> String {
    let mut hasher = Sha256::new();
    if let Some(contract_id) = normalized(record.contract_id.as_deref()) {
        hasher.update(b"contract:");
        hasher.update(contract_id.as_bytes());
    } else if let Some(document_number) = normalized(record.document_number.as_deref()) {
        hasher.update(b"document:");
        hasher.update(document_number.as_bytes());
    } else {
        hasher.update(b"tuple:");
        hasher.update(record.organization.trim().to_lowercase().as_bytes());
        hasher.update(b"|");
        hasher.update(record.date.trim().as_bytes());
        hasher.update(b"|");
        hasher.update(
            record
                .value_centavos
                .map(|value| value.to_string())
                .unwrap_or_default()
                .as_bytes(),
        );
    }
    format!("{:x}", hasher.finalize())
}

fn normalized(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_lowercase())
}

/// Merges per-source record lists into one content-distinct list.
///
/// `ranked_sources` lists source ids in priority order (best first); on a
/// fingerprint collision the record from the better-ranked source wins, and
/// the loser's source id is appended to the winner's provenance. Returns the
/// merged records and the number of duplicates dropped.
pub fn merge_records(
    per_source: Vec<(String, Vec<SourceRecord>)>,
    ranked_sources: &[String],
) -> (Vec<SourceRecord>, usize) {
    let rank_of = |source_id: &str| -> usize {
        ranked_sources
            .iter()
            .position(|candidate| candidate == source_id)
            .unwrap_or(usize::MAX)
    };

    let mut merged: BTreeMap<String, SourceRecord> = BTreeMap::new();
    let mut duplicates_dropped = 0usize;

    for (source_id, records) in per_source {
        for mut record in records {
            if record.provenance.is_empty() {
                record.provenance.push(source_id.clone());
            }
            let fingerprint = content_fingerprint(&record);
            match merged.get_mut(&fingerprint) {
                None => {
                    merged.insert(fingerprint, record);
                }
                Some(existing) => {
                    duplicates_dropped += 1;
                    let existing_rank = existing
                        .provenance
                        .first()
                        .map(|id| rank_of(id))
                        .unwrap_or(usize::MAX);
                    if rank_of(&source_id) < existing_rank {
                        // Higher-priority source wins; keep the loser's ids.
                        let mut provenance = record.provenance.clone();
                        for id in &existing.provenance {
                            if !provenance.contains(id) {
                                provenance.push(id.clone());
                            }
                        }
                        record.provenance = provenance;
                        *existing = record;
                    } else if !existing.provenance.contains(&source_id) {
                        existing.provenance.push(source_id.clone());
                    }
                }
            }
        }
    }

    (merged.into_values().collect(), duplicates_dropped)
}
