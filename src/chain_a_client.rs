//! HTTP client for the chain A node.
//!
//! Chain A exposes a REST surface: block height and contents, the bridge
//! dApp's data rows, and transaction broadcast/lookup. Invoke-script
//! transactions (type 16) are serialized to their binary body in-crate and
//! signed with ed25519, since no SDK covers this chain.

use base64::Engine as _;
use eyre::{eyre, Result, WrapErr};
use serde::{de, Deserialize, Deserializer};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

/// Invoke-script transaction type on chain A.
const INVOKE_TX_TYPE: u8 = 16;
const INVOKE_TX_VERSION: u8 = 1;
/// Fixed network fee for release invokes, in the chain's smallest unit.
pub const RELEASE_INVOKE_FEE: u64 = 900_000;

#[derive(Debug, Deserialize)]
struct HeightResponse {
    height: u64,
}

/// A block as returned by `/blocks/at/{h}`, trimmed to what the watcher needs.
#[derive(Debug, Deserialize)]
pub struct ABlock {
    pub height: u64,
    #[serde(default)]
    pub transactions: Vec<ATransaction>,
}

/// A transaction inside a block. Only invoke-script fields are modeled;
/// other transaction types deserialize with everything defaulted.
#[derive(Debug, Deserialize)]
pub struct ATransaction {
    #[serde(rename = "type")]
    pub tx_type: u32,
    pub id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default, rename = "dApp")]
    pub dapp: Option<String>,
    #[serde(default)]
    pub call: Option<InvokeCall>,
    #[serde(default)]
    pub payment: Vec<InvokePayment>,
}

impl ATransaction {
    pub fn is_invoke(&self) -> bool {
        self.tx_type == INVOKE_TX_TYPE as u32
    }
}

#[derive(Debug, Deserialize)]
pub struct InvokeCall {
    pub function: String,
    #[serde(default)]
    pub args: Vec<InvokeCallArg>,
}

#[derive(Debug, Deserialize)]
pub struct InvokeCallArg {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct InvokePayment {
    #[serde(deserialize_with = "string_or_u128")]
    pub amount: u128,
    #[serde(default, rename = "assetId")]
    pub asset_id: Option<String>,
}

/// One entry of a dApp's data storage.
#[derive(Debug, Clone, Deserialize)]
pub struct DataEntry {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: serde_json::Value,
}

impl DataEntry {
    pub fn as_string(&self) -> Option<&str> {
        self.value.as_str()
    }

    pub fn as_u64(&self) -> Option<u64> {
        match &self.value {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match &self.value {
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::Number(n) => n.as_u64().unwrap_or(0) != 0,
            serde_json::Value::String(s) => s == "true" || s == "1",
            _ => false,
        }
    }
}

/// Arguments of an invoke call, mirrored in both the binary body and the
/// broadcast JSON.
#[derive(Debug, Clone)]
pub enum InvokeArg {
    Int(i64),
    Str(String),
    Bin(Vec<u8>),
    Bool(bool),
    List(Vec<InvokeArg>),
}

impl InvokeArg {
    fn write_binary(&self, buf: &mut Vec<u8>) {
        match self {
            InvokeArg::Int(v) => {
                buf.push(0x00);
                buf.extend_from_slice(&v.to_be_bytes());
            }
            InvokeArg::Bin(bytes) => {
                buf.push(0x01);
                buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                buf.extend_from_slice(bytes);
            }
            InvokeArg::Str(s) => {
                buf.push(0x02);
                buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            InvokeArg::Bool(true) => buf.push(0x06),
            InvokeArg::Bool(false) => buf.push(0x07),
            InvokeArg::List(items) => {
                buf.push(0x0b);
                buf.extend_from_slice(&(items.len() as u32).to_be_bytes());
                for item in items {
                    item.write_binary(buf);
                }
            }
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            InvokeArg::Int(v) => json!({ "type": "integer", "value": v }),
            InvokeArg::Str(s) => json!({ "type": "string", "value": s }),
            InvokeArg::Bin(bytes) => json!({
                "type": "binary",
                "value": format!("base64:{}", base64::engine::general_purpose::STANDARD.encode(bytes)),
            }),
            InvokeArg::Bool(b) => json!({ "type": "boolean", "value": b }),
            InvokeArg::List(items) => json!({
                "type": "list",
                "value": items.iter().map(|i| i.to_json()).collect::<Vec<_>>(),
            }),
        }
    }
}

/// REST client for one chain A node.
#[derive(Debug, Clone)]
pub struct ChainAClient {
    node_url: String,
    network_tag: char,
    client: reqwest::Client,
}

impl ChainAClient {
    pub fn new(node_url: &str, network_tag: char) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .wrap_err("Failed to create HTTP client")?;
        Ok(Self {
            node_url: node_url.trim_end_matches('/').to_string(),
            network_tag,
            client,
        })
    }

    pub async fn get_height(&self) -> Result<u64> {
        let url = format!("{}/blocks/height", self.node_url);
        let response: HeightResponse = self.get_json(&url).await?;
        Ok(response.height)
    }

    pub async fn get_block_at(&self, height: u64) -> Result<ABlock> {
        let url = format!("{}/blocks/at/{}", self.node_url, height);
        self.get_json(&url).await
    }

    /// Data rows of a dApp, optionally filtered by a key regex.
    pub async fn get_data_entries(
        &self,
        address: &str,
        matches: Option<&str>,
    ) -> Result<Vec<DataEntry>> {
        let url = match matches {
            Some(pattern) => format!(
                "{}/addresses/data/{}?matches={}",
                self.node_url, address, pattern
            ),
            None => format!("{}/addresses/data/{}", self.node_url, address),
        };
        self.get_json(&url).await
    }

    /// A single data row, or None when the key is absent.
    pub async fn get_data_entry(&self, address: &str, key: &str) -> Result<Option<DataEntry>> {
        let url = format!("{}/addresses/data/{}/{}", self.node_url, address, key);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .wrap_err("Chain A data request failed")?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(eyre!(
                "Chain A data request failed: {} {}",
                response.status(),
                response.text().await.unwrap_or_default()
            ));
        }
        Ok(Some(response.json().await.wrap_err("Corrupt data entry")?))
    }

    /// Whether a transaction is in the chain already.
    pub async fn transaction_exists(&self, tx_id: &str) -> Result<bool> {
        let url = format!("{}/transactions/info/{}", self.node_url, tx_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .wrap_err("Chain A transaction lookup failed")?;
        Ok(response.status().is_success())
    }

    /// Build, sign, and broadcast an invoke of the bridge dApp. Returns the
    /// transaction id. Confirmation is the caller's concern.
    pub async fn broadcast_invoke(
        &self,
        key: &ed25519_dalek::SigningKey,
        dapp_address: &str,
        function: &str,
        args: &[InvokeArg],
        fee: u64,
    ) -> Result<String> {
        use ed25519_dalek::Signer as _;

        let timestamp = chrono::Utc::now().timestamp_millis() as u64;
        let sender_pk = key.verifying_key().to_bytes();
        let body = invoke_body_bytes(
            self.network_tag,
            &sender_pk,
            dapp_address,
            function,
            args,
            fee,
            timestamp,
        )?;
        let proof = key.sign(&body);

        let tx = json!({
            "type": INVOKE_TX_TYPE,
            "version": INVOKE_TX_VERSION,
            "chainId": self.network_tag as u8,
            "senderPublicKey": bs58::encode(sender_pk).into_string(),
            "dApp": dapp_address,
            "call": {
                "function": function,
                "args": args.iter().map(|a| a.to_json()).collect::<Vec<_>>(),
            },
            "payment": [],
            "fee": fee,
            "feeAssetId": null,
            "timestamp": timestamp,
            "proofs": [bs58::encode(proof.to_bytes()).into_string()],
        });

        let url = format!("{}/transactions/broadcast", self.node_url);
        debug!(url = %url, function = function, "Broadcasting chain A invoke");

        let response = self
            .client
            .post(&url)
            .json(&tx)
            .send()
            .await
            .wrap_err("Chain A broadcast failed")?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .unwrap_or_else(|_| json!({ "message": "unparseable broadcast response" }));

        if !status.is_success() {
            return Err(eyre!(
                "Chain A broadcast rejected ({}): {}",
                status,
                body.get("message").and_then(|m| m.as_str()).unwrap_or("unknown")
            ));
        }

        let tx_id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| eyre!("Chain A broadcast response missing id: {}", body))?
            .to_string();

        info!(tx_id = %tx_id, function = function, "Chain A invoke broadcast");
        Ok(tx_id)
    }

    /// Poll until the transaction appears in the chain, or the timeout lapses.
    pub async fn wait_for_confirmation(&self, tx_id: &str, timeout: Duration) -> Result<()> {
        let started = std::time::Instant::now();
        loop {
            if self.transaction_exists(tx_id).await? {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(eyre!(
                    "Timed out waiting for chain A transaction {}",
                    tx_id
                ));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .wrap_err("Chain A request failed")?;
        if !response.status().is_success() {
            return Err(eyre!(
                "Chain A request failed: {} {}",
                response.status(),
                response.text().await.unwrap_or_default()
            ));
        }
        response.json().await.wrap_err("Corrupt chain A response")
    }
}

/// Decode a Base58 chain A address into its 26 raw bytes.
pub fn address_bytes(address: &str) -> Result<Vec<u8>> {
    let bytes = bs58::decode(address)
        .into_vec()
        .map_err(|e| eyre!("Invalid Base58 address {}: {}", address, e))?;
    if bytes.len() != 26 {
        return Err(eyre!(
            "Chain A address must decode to 26 bytes, got {}",
            bytes.len()
        ));
    }
    Ok(bytes)
}

/// Binary body of an invoke-script transaction (type 16, version 1). This is
/// the byte string the sender's ed25519 proof covers.
fn invoke_body_bytes(
    network_tag: char,
    sender_public_key: &[u8; 32],
    dapp_address: &str,
    function: &str,
    args: &[InvokeArg],
    fee: u64,
    timestamp: u64,
) -> Result<Vec<u8>> {
    let dapp = address_bytes(dapp_address)?;

    let mut buf = Vec::with_capacity(128);
    buf.push(INVOKE_TX_TYPE);
    buf.push(INVOKE_TX_VERSION);
    buf.push(network_tag as u8);
    buf.extend_from_slice(sender_public_key);
    buf.extend_from_slice(&dapp);

    // Function call: present flag, expression tag, user-function header.
    buf.push(0x01);
    buf.push(0x09);
    buf.push(0x01);
    buf.extend_from_slice(&(function.len() as u32).to_be_bytes());
    buf.extend_from_slice(function.as_bytes());
    buf.extend_from_slice(&(args.len() as u32).to_be_bytes());
    for arg in args {
        arg.write_binary(&mut buf);
    }

    // No payments on release invokes.
    buf.extend_from_slice(&0u16.to_be_bytes());

    buf.extend_from_slice(&fee.to_be_bytes());
    buf.push(0x00); // fee in the native coin
    buf.extend_from_slice(&timestamp.to_be_bytes());
    Ok(buf)
}

fn string_or_u128<'de, D>(deserializer: D) -> std::result::Result<u128, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;

    impl de::Visitor<'_> for Visitor {
        type Value = u128;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or unsigned integer")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<u128, E> {
            Ok(value as u128)
        }

        fn visit_u128<E: de::Error>(self, value: u128) -> std::result::Result<u128, E> {
            Ok(value)
        }

        fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<u128, E> {
            value.parse().map_err(E::custom)
        }
    }

    deserializer.deserialize_any(Visitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_arg_binary_layout() {
        let mut buf = Vec::new();
        InvokeArg::Int(258).write_binary(&mut buf);
        assert_eq!(buf[0], 0x00);
        assert_eq!(&buf[1..9], &258i64.to_be_bytes());

        let mut buf = Vec::new();
        InvokeArg::Str("abc".to_string()).write_binary(&mut buf);
        assert_eq!(buf, vec![0x02, 0, 0, 0, 3, b'a', b'b', b'c']);

        let mut buf = Vec::new();
        InvokeArg::Bin(vec![0xde, 0xad]).write_binary(&mut buf);
        assert_eq!(buf, vec![0x01, 0, 0, 0, 2, 0xde, 0xad]);

        let mut buf = Vec::new();
        InvokeArg::List(vec![InvokeArg::Bool(true), InvokeArg::Bool(false)]).write_binary(&mut buf);
        assert_eq!(buf, vec![0x0b, 0, 0, 0, 2, 0x06, 0x07]);
    }

    #[test]
    fn test_invoke_arg_json_rendering() {
        let rendered = InvokeArg::Bin(vec![1, 2, 3]).to_json();
        assert_eq!(rendered["type"], "binary");
        assert_eq!(rendered["value"], "base64:AQID");

        let rendered = InvokeArg::List(vec![InvokeArg::Int(7)]).to_json();
        assert_eq!(rendered["type"], "list");
        assert_eq!(rendered["value"][0]["value"], 7);
    }

    #[test]
    fn test_invoke_body_layout() {
        // 26-byte payload encodes to a valid Base58 address string.
        let dapp = bs58::encode([1u8; 26]).into_string();
        let pk = [7u8; 32];
        let body = invoke_body_bytes('W', &pk, &dapp, "releaseTokens", &[], 900_000, 1234).unwrap();

        assert_eq!(body[0], 16);
        assert_eq!(body[1], 1);
        assert_eq!(body[2], b'W');
        assert_eq!(&body[3..35], &pk);
        assert_eq!(&body[35..61], &[1u8; 26]);
        // function-call header
        assert_eq!(&body[61..64], &[0x01, 0x09, 0x01]);
        let name_len = u32::from_be_bytes(body[64..68].try_into().unwrap()) as usize;
        assert_eq!(name_len, "releaseTokens".len());
        let tail = &body[body.len() - 19..];
        assert_eq!(&tail[0..2], &0u16.to_be_bytes()); // no payments
        assert_eq!(&tail[2..10], &900_000u64.to_be_bytes());
        assert_eq!(tail[10], 0x00);
        assert_eq!(&tail[11..19], &1234u64.to_be_bytes());
    }

    #[test]
    fn test_address_bytes_validates_length() {
        let good = bs58::encode([9u8; 26]).into_string();
        assert_eq!(address_bytes(&good).unwrap().len(), 26);

        let bad = bs58::encode([9u8; 20]).into_string();
        assert!(address_bytes(&bad).is_err());
        assert!(address_bytes("0OIl").is_err());
    }

    #[test]
    fn test_payment_amount_accepts_string_and_number() {
        let p: InvokePayment = serde_json::from_str(r#"{"amount": "100000000", "assetId": null}"#).unwrap();
        assert_eq!(p.amount, 100_000_000);
        assert!(p.asset_id.is_none());

        let p: InvokePayment =
            serde_json::from_str(r#"{"amount": 42, "assetId": "AbcAsset"}"#).unwrap();
        assert_eq!(p.amount, 42);
        assert_eq!(p.asset_id.as_deref(), Some("AbcAsset"));
    }

    #[test]
    fn test_data_entry_accessors() {
        let entry: DataEntry = serde_json::from_str(
            r#"{"key": "validator_threshold", "type": "integer", "value": 3}"#,
        )
        .unwrap();
        assert_eq!(entry.as_u64(), Some(3));

        let entry: DataEntry =
            serde_json::from_str(r#"{"key": "processed_x", "type": "boolean", "value": true}"#)
                .unwrap();
        assert!(entry.is_truthy());
    }
}
