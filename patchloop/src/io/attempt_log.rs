//! Append-only attempt history under `.patchloop/attempts/`.
//!
//! Every provider attempt leaves three artifacts keyed by a monotonically
//! increasing sequence number: `NNN.json` (the record), `NNN.prompt.txt`, and
//! `NNN.response.txt`. Nothing here is ever rewritten or deleted.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{AttemptOutcome, AttemptPurpose, ProviderId};

/// One recorded provider attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub seq: u32,
    pub provider: ProviderId,
    pub purpose: AttemptPurpose,
    pub outcome: AttemptOutcome,
    /// Human-readable rejection or failure reason, when the attempt was not
    /// accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub response_bytes: usize,
}

/// Next free sequence number, scanning existing records.
pub fn next_attempt_seq(attempts_dir: &Path) -> Result<u32> {
    if !attempts_dir.exists() {
        return Ok(1);
    }
    let mut max = 0u32;
    let entries = fs::read_dir(attempts_dir)
        .with_context(|| format!("read attempts dir {}", attempts_dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", attempts_dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(stem) = name.strip_suffix(".json") {
            if let Ok(seq) = stem.parse::<u32>() {
                max = max.max(seq);
            }
        }
    }
    Ok(max + 1)
}

/// Persist one attempt's record, prompt, and raw response.
pub fn write_attempt(
    attempts_dir: &Path,
    record: &AttemptRecord,
    prompt: &str,
    response: &str,
) -> Result<()> {
    fs::create_dir_all(attempts_dir)
        .with_context(|| format!("create attempts dir {}", attempts_dir.display()))?;
    let stem = format!("{:03}", record.seq);

    let json = serde_json::to_string_pretty(record).context("serialize attempt record")?;
    fs::write(attempts_dir.join(format!("{stem}.json")), json)
        .with_context(|| format!("write attempt record {stem}"))?;
    fs::write(attempts_dir.join(format!("{stem}.prompt.txt")), prompt)
        .with_context(|| format!("write attempt prompt {stem}"))?;
    fs::write(attempts_dir.join(format!("{stem}.response.txt")), response)
        .with_context(|| format!("write attempt response {stem}"))?;

    debug!(seq = record.seq, outcome = ?record.outcome, "attempt recorded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_starts_at_one_and_skips_past_existing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("attempts");
        assert_eq!(next_attempt_seq(&dir).expect("seq"), 1);

        let record = AttemptRecord {
            seq: 1,
            provider: ProviderId::Ollama,
            purpose: AttemptPurpose::Repair,
            outcome: AttemptOutcome::RejectedInvalid,
            reason: Some("invalid syntax in main.py".to_string()),
            response_bytes: 42,
        };
        write_attempt(&dir, &record, "prompt", "response").expect("write");
        assert_eq!(next_attempt_seq(&dir).expect("seq"), 2);
    }

    #[test]
    fn record_round_trips_through_json() {
        let record = AttemptRecord {
            seq: 7,
            provider: ProviderId::Xai,
            purpose: AttemptPurpose::Rescue,
            outcome: AttemptOutcome::Accepted,
            reason: None,
            response_bytes: 1000,
        };
        let json = serde_json::to_string(&record).expect("serialize");
        assert!(json.contains("\"xai\""));
        assert!(json.contains("\"rescue\""));
        assert!(!json.contains("reason"));
        let parsed: AttemptRecord = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed.seq, 7);
    }
}
