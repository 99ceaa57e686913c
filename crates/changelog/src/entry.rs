use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// §3 "Data-change entry". `key` is `BucketShard::key()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChange {
    pub entity_type: EntityType,
    pub key: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityType {
    Bucket,
    Unknown,
}

/// §3 "Log entry (as stored)". `log_id` is the backend-specific marker
/// assigned when the entry was pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub log_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub log_timestamp: OffsetDateTime,
    pub entry: DataChange,
}

/// A backend-native batched record produced by `LogBackend::prepare`
/// (§4.1: "no I/O; constructs a backend-native batched record"). The
/// marker is not yet assigned — that happens inside `push`, since markers
/// must be monotonic across concurrent pushers.
#[derive(Debug, Clone)]
pub struct PreparedEntry {
    pub change: DataChange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_change_round_trips() {
        let dc = DataChange {
            entity_type: EntityType::Bucket,
            key: "t/n:bid:3".to_string(),
            timestamp: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        };
        let encoded = serde_json::to_vec(&dc).unwrap();
        let decoded: DataChange = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(dc, decoded);
    }

    #[test]
    fn log_entry_round_trips() {
        let le = LogEntry {
            log_id: "0000000001".to_string(),
            log_timestamp: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            entry: DataChange {
                entity_type: EntityType::Bucket,
                key: "b:0".to_string(),
                timestamp: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
            },
        };
        let encoded = serde_json::to_vec(&le).unwrap();
        let decoded: LogEntry = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(le, decoded);
    }
}
