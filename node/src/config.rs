//! YAML node configuration.

use std::{fs, io, path::Path, path::PathBuf, str::FromStr};

use guardian_vaa::{GuardianAddress, GuardianSet};
use k256::ecdsa::SigningKey;
use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::processor::Settings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config")]
    Io(#[from] io::Error),

    #[error("failed to parse config")]
    Yaml(#[from] serde_yaml::Error),

    #[error("guardian_key is not a valid secp256k1 secret key")]
    InvalidKey,

    #[error("guardian set {0} has no members")]
    EmptyGuardianSet(u32),
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
pub struct NodeConfig {
    /// Hex encoded secp256k1 secret key this guardian signs with.
    #[serde(deserialize_with = "hex_bytes_de", serialize_with = "hex_bytes_ser")]
    pub guardian_key: Vec<u8>,

    /// The guardian set active at start-up.
    pub guardian_set: GuardianSetConfig,

    /// How long a replaced guardian set keeps being accepted.
    #[serde(default = "default_expiry_grace")]
    pub expiry_grace_secs: u32,

    /// Age after which a pending observation is retransmitted or reobserved.
    #[serde(default = "default_observation_timeout")]
    pub observation_timeout_secs: u32,

    /// Age after which a pending observation is given up on.
    #[serde(default = "default_pending_expiry")]
    pub pending_expiry_secs: u32,

    #[serde(default = "default_reporter_capacity")]
    pub reporter_capacity: usize,

    #[serde(default)]
    pub sink: SinkConfig,

    /// Directory signed VAAs are written to. Kept in memory only when unset.
    #[serde(default)]
    pub vaa_dir: Option<PathBuf>,

    #[serde(default)]
    pub near: Option<NearConfig>,

    /// Governance messages to inject at start-up.
    #[serde(default)]
    pub governance: Vec<GovernanceInjection>,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
pub struct GuardianSetConfig {
    pub index: u32,
    #[serde(
        deserialize_with = "guardian_addresses_de",
        serialize_with = "guardian_addresses_ser"
    )]
    pub addresses: Vec<GuardianAddress>,
}

#[derive(Debug, Default, Deserialize, Serialize, PartialEq, Eq, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    #[default]
    Log,
    JsonFile {
        path: PathBuf,
    },
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
pub struct NearConfig {
    pub rpc: String,
    /// Account id of the core bridge contract.
    pub contract: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone)]
pub struct GovernanceInjection {
    pub sequence: u64,
    pub nonce: u32,
    /// Body timestamp. Every guardian injecting the same message must use the same value, or
    /// the bodies hash differently and never reach quorum.
    #[serde(default)]
    pub timestamp: u32,
    #[serde(deserialize_with = "hex_bytes_de", serialize_with = "hex_bytes_ser")]
    pub payload: Vec<u8>,
}

fn default_expiry_grace() -> u32 {
    86400
}

fn default_observation_timeout() -> u32 {
    300
}

fn default_pending_expiry() -> u32 {
    86400
}

fn default_reporter_capacity() -> usize {
    256
}

fn default_poll_interval() -> u64 {
    1000
}

impl NodeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<NodeConfig, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let cfg: NodeConfig = serde_yaml::from_str(&raw)?;
        if cfg.guardian_set.addresses.is_empty() {
            return Err(ConfigError::EmptyGuardianSet(cfg.guardian_set.index));
        }
        Ok(cfg)
    }

    pub fn signing_key(&self) -> Result<SigningKey, ConfigError> {
        SigningKey::from_slice(&self.guardian_key).map_err(|_| ConfigError::InvalidKey)
    }

    pub fn guardian_set(&self) -> GuardianSet {
        GuardianSet::new(
            self.guardian_set.index,
            self.guardian_set.addresses.clone(),
        )
    }

    pub fn processor_settings(&self) -> Settings {
        Settings {
            observation_timeout: self.observation_timeout_secs,
            pending_expiry: self.pending_expiry_secs,
        }
    }
}

// Hex helpers, a leading 0x is accepted.

fn hex_bytes_ser<S>(b: &[u8], ser: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    ser.serialize_str(&hex::encode(b))
}

fn hex_bytes_de<'de, D>(de: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(de)?;
    hex::decode(s.trim_start_matches("0x")).map_err(D::Error::custom)
}

fn guardian_addresses_ser<S>(addrs: &[GuardianAddress], ser: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    ser.collect_seq(addrs.iter().map(|a| a.to_string()))
}

fn guardian_addresses_de<'de, D>(de: D) -> Result<Vec<GuardianAddress>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<String>::deserialize(de)?
        .iter()
        .map(|s| GuardianAddress::from_str(s).map_err(D::Error::custom))
        .collect()
}
