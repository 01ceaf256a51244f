use std::fmt;

use anyhow::{bail, Context, Result};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    #[serde(alias = "botId")]
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub session_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "workers")]
    pub bots: Vec<WorkerRecord>,
}

impl StartSessionResponse {
    pub fn worker_count(&self) -> u32 {
        self.bots.len().min(u32::MAX as usize) as u32
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(alias = "sessionId")]
    pub id: String,
    #[serde(default)]
    pub wallet_address: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default, alias = "numBots")]
    pub worker_count: Option<u32>,
    #[serde(default)]
    pub started_at: Option<String>,
}

impl SessionRecord {
    pub fn is_active(&self) -> bool {
        matches!(
            self.status.trim().to_ascii_lowercase().as_str(),
            "active" | "running" | "starting"
        )
    }

    pub fn belongs_to(&self, wallet: &str) -> bool {
        self.wallet_address
            .as_deref()
            .is_some_and(|owner| owner.trim().eq_ignore_ascii_case(wallet.trim()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StatusPayload {
    List { sessions: Vec<SessionRecord> },
    Single(SessionRecord),
}

/// Backend status responses come back either as `{sessions: [...]}` or as a bare session
/// object when a session id was supplied.
pub fn decode_status_payload(value: serde_json::Value) -> Result<Vec<SessionRecord>> {
    let payload: StatusPayload =
        serde_json::from_value(value).context("failed to decode status response JSON")?;
    Ok(match payload {
        StatusPayload::List { sessions } => sessions,
        StatusPayload::Single(session) => vec![session],
    })
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    #[serde(default)]
    pub total_sessions: u64,
    #[serde(default)]
    pub active_sessions: u64,
    #[serde(default, alias = "totalWorkers")]
    pub total_bots: u64,
    #[serde(default, deserialize_with = "deserialize_u64_flexible")]
    pub estimated_total_minted: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DepositRecord {
    #[serde(alias = "hash")]
    pub tx_hash: String,
    #[serde(deserialize_with = "deserialize_u64_flexible")]
    pub amount: u64,
    #[serde(deserialize_with = "deserialize_u64_flexible")]
    pub version: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DepositsPayload {
    #[serde(default)]
    pub deposits: Vec<DepositRecord>,
}

/// Ledger versions and amounts exceed the 2^53 range some backends serialize safely, so
/// they may arrive as decimal strings.
pub fn parse_u64_field(input: &str, field_name: &str) -> Result<u64> {
    let clean = input.trim();
    if clean.is_empty() {
        bail!("{field_name} is empty");
    }
    clean
        .parse::<u64>()
        .with_context(|| format!("{field_name} '{clean}' is not an unsigned 64-bit integer"))
}

fn deserialize_u64_flexible<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct FlexibleU64;

    impl Visitor<'_> for FlexibleU64 {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an unsigned integer or a decimal string")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<u64, E> {
            Ok(value)
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<u64, E> {
            u64::try_from(value).map_err(|_| E::custom(format!("negative value {value}")))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<u64, E> {
            parse_u64_field(value, "value").map_err(|err| E::custom(format!("{err:#}")))
        }
    }

    deserializer.deserialize_any(FlexibleU64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deposit_record_accepts_string_and_number_versions() {
        let records: Vec<DepositRecord> = serde_json::from_value(json!([
            {"txHash": "0xaa", "amount": "100000000", "version": "18446744073709551615"},
            {"txHash": "0xbb", "amount": 5, "version": 42}
        ]))
        .expect("deposit records should deserialize");

        assert_eq!(records[0].version, u64::MAX);
        assert_eq!(records[0].amount, 100_000_000);
        assert_eq!(records[1].version, 42);
    }

    #[test]
    fn deposit_record_rejects_negative_amount() {
        let err = serde_json::from_value::<DepositRecord>(json!({
            "txHash": "0xaa", "amount": -1, "version": 1
        }))
        .expect_err("negative amount should fail");
        assert!(err.to_string().contains("negative value"));
    }

    #[test]
    fn status_payload_decodes_list_and_single_shapes() {
        let list = decode_status_payload(json!({
            "sessions": [
                {"id": "s-1", "walletAddress": "0xAB", "status": "active", "numBots": 3},
                {"id": "s-2", "walletAddress": "0xcd", "status": "stopped"}
            ]
        }))
        .expect("list payload should decode");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].worker_count, Some(3));
        assert!(list[0].is_active());
        assert!(!list[1].is_active());

        let single = decode_status_payload(json!({
            "sessionId": "s-3", "walletAddress": "0xab", "status": "running"
        }))
        .expect("single payload should decode");
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].id, "s-3");
    }

    #[test]
    fn session_record_wallet_match_ignores_case() {
        let record = SessionRecord {
            id: "s-1".to_string(),
            wallet_address: Some("0xABcd".to_string()),
            status: "active".to_string(),
            worker_count: None,
            started_at: None,
        };
        assert!(record.belongs_to("0xabcd"));
        assert!(!record.belongs_to("0xabce"));
    }

    #[test]
    fn start_response_counts_returned_workers() {
        let resp: StartSessionResponse = serde_json::from_value(json!({
            "sessionId": "s-9",
            "status": "active",
            "bots": [{"id": "b1"}, {"botId": "b2", "status": "running"}, {"id": "b3"}]
        }))
        .expect("start response should deserialize");
        assert_eq!(resp.worker_count(), 3);
    }

    #[test]
    fn parse_u64_field_reports_field_name() {
        let err = parse_u64_field("12x", "version").expect_err("garbage should fail");
        assert!(format!("{err:#}").contains("version '12x'"));
    }
}
