use std::io::Write;
use std::path::PathBuf;

use super::record::CallRecord;

/// Append-only JSONL log of terminal calls. One record per line.
///
/// Readers tolerate a truncated trailing line (a crash mid-append) by
/// skipping anything that does not parse.
pub struct CallHistory {
    path: PathBuf,
}

impl CallHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, record: &CallRecord) {
        let line = match serde_json::to_string(record) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(call_id = %record.call_id, "Failed to serialize history record: {e}");
                return;
            }
        };

        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::error!("Failed to create history directory: {e}");
                return;
            }
        }

        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));

        match result {
            Ok(()) => tracing::debug!(call_id = %record.call_id, "Call appended to history"),
            Err(e) => tracing::error!("Failed to append call history: {e}"),
        }
    }

    /// Last `limit` records, newest first by endedAt (startedAt when a
    /// record somehow has no end timestamp).
    pub fn read_last(&self, limit: usize) -> Vec<CallRecord> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        let mut records: Vec<CallRecord> = contents
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() {
                    return None;
                }
                match serde_json::from_str(line) {
                    Ok(r) => Some(r),
                    Err(_) => {
                        // Truncated or corrupt line; skip it.
                        None
                    }
                }
            })
            .collect();

        records.sort_by_key(|r| std::cmp::Reverse(r.ended_at.unwrap_or(r.started_at)));
        records.truncate(limit);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::record::{CallMetadata, CallState};
    use crate::providers::CallDirection;

    fn record(call_id: &str, ended_at: i64) -> CallRecord {
        let mut r = CallRecord::new(
            call_id.into(),
            "+15550001111".into(),
            "+15550002222".into(),
            CallDirection::Outbound,
            CallMetadata::default(),
            ended_at - 60_000,
        );
        r.state = CallState::Completed;
        r.ended_at = Some(ended_at);
        r
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("voice-bridge-test-{name}-{}.jsonl", std::process::id()))
    }

    #[test]
    fn append_and_read_back_sorted() {
        let path = temp_path("sorted");
        let _ = std::fs::remove_file(&path);
        let history = CallHistory::new(&path);

        history.append(&record("call-old", 1_000));
        history.append(&record("call-new", 3_000));
        history.append(&record("call-mid", 2_000));

        let back = history.read_last(10);
        let ids: Vec<&str> = back.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["call-new", "call-mid", "call-old"]);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn limit_is_respected() {
        let path = temp_path("limit");
        let _ = std::fs::remove_file(&path);
        let history = CallHistory::new(&path);

        for i in 0..5 {
            history.append(&record(&format!("call-{i}"), i * 100 + 100));
        }
        assert_eq!(history.read_last(2).len(), 2);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn truncated_trailing_line_is_skipped() {
        let path = temp_path("truncated");
        let _ = std::fs::remove_file(&path);
        let history = CallHistory::new(&path);

        history.append(&record("call-ok", 500));
        // Simulate a crash mid-append.
        {
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .unwrap();
            write!(f, "{{\"callId\":\"call-broken\",\"fr").unwrap();
        }

        let back = history.read_last(10);
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].call_id, "call-ok");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_reads_empty() {
        let history = CallHistory::new(temp_path("missing-never-created"));
        assert!(history.read_last(5).is_empty());
    }
}
