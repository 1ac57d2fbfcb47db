// In-memory registry of tracked contracts keyed by (index, environment, address).
//
// The orchestrator owns one registry and hands it to the scanner and the scan
// state store; there is no global instance.

use crate::blockchain::read::{ReadError, ReadService};
use crate::config::ContractEntry;
use crate::projection::{self, Projection};
use crate::validation::{address_key, normalize_address};
use alloy::dyn_abi::DynSolValue;
use alloy::eips::BlockId;
use alloy::json_abi::{Event, JsonAbi};
use alloy::primitives::{keccak256, Address, B256, U256};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to load ABI from {path}: {reason}")]
    AbiLoad { path: String, reason: String },

    #[error("Event {event} not found in ABI of {address}")]
    EventNotFound { event: String, address: String },

    #[error("No event with topic {topic} in ABI of {address}")]
    TopicNotFound { topic: B256, address: String },
}

/// Keccak-256 of a canonical event signature such as `Transfer(address,address,uint256)`.
pub fn event_topic(signature: &str) -> B256 {
    keccak256(signature.as_bytes())
}

/// What a contract is registered with.
#[derive(Default)]
pub struct Registration {
    pub abi: Option<JsonAbi>,
    /// Event names whose topics are scanned; all ABI events when empty.
    pub events_to_scan: Vec<String>,
    /// Event name to the projection applied when that event is persisted.
    pub callbacks: HashMap<String, Arc<dyn Projection>>,
}

pub struct ContractHandle {
    environment: String,
    address: Address,
    abi: Option<JsonAbi>,
    events_to_scan: Vec<String>,
    callbacks: HashMap<String, Arc<dyn Projection>>,
    reader: Arc<ReadService>,
    topics: OnceLock<HashMap<B256, Event>>,
}

impl ContractHandle {
    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Lower-case address, the form stored in the `contract` table.
    pub fn address_key(&self) -> String {
        address_key(&self.address)
    }

    /// A handle registered without an ABI. It can't decode or read anything.
    pub fn is_placeholder(&self) -> bool {
        self.abi.is_none()
    }

    fn require_abi(&self) -> Result<&JsonAbi, RegistryError> {
        self.abi.as_ref().ok_or_else(|| {
            RegistryError::Configuration(format!("no ABI registered for {} on {}", self.address, self.environment))
        })
    }

    /// Log topic of the named event.
    pub fn topic_for_event(&self, name: &str) -> Result<B256, RegistryError> {
        self.require_abi()?
            .event(name)
            .and_then(|overloads| overloads.first())
            .map(|event| event_topic(&event.signature()))
            .ok_or_else(|| RegistryError::EventNotFound {
                event: name.to_string(),
                address: self.address.to_string(),
            })
    }

    /// ABI event that decodes logs with `topic0`.
    pub fn abi_for_topic(&self, topic0: &B256) -> Result<&Event, RegistryError> {
        let topics = self.topics.get_or_init(|| {
            self.abi
                .iter()
                .flat_map(|abi| abi.events())
                .filter(|event| !event.anonymous)
                .map(|event| (event_topic(&event.signature()), event.clone()))
                .collect()
        });

        topics.get(topic0).ok_or_else(|| RegistryError::TopicNotFound {
            topic: *topic0,
            address: self.address.to_string(),
        })
    }

    /// Topics this contract contributes to a scan.
    pub fn scan_topics(&self) -> Vec<B256> {
        let Some(abi) = &self.abi else {
            return Vec::new();
        };

        if self.events_to_scan.is_empty() {
            return abi
                .events()
                .filter(|event| !event.anonymous)
                .map(|event| event_topic(&event.signature()))
                .collect();
        }

        self.events_to_scan
            .iter()
            .filter_map(|name| match self.topic_for_event(name) {
                Ok(topic) => Some(topic),
                Err(e) => {
                    warn!("Not scanning {}: {}", name, e);
                    None
                }
            })
            .collect()
    }

    pub fn callback(&self, event_name: &str) -> Option<&Arc<dyn Projection>> {
        self.callbacks.get(event_name)
    }

    /// Distinct projections wired to this contract.
    pub fn projections(&self) -> Vec<Arc<dyn Projection>> {
        let mut projections: Vec<Arc<dyn Projection>> = Vec::new();
        for projection in self.callbacks.values() {
            if !projections.iter().any(|p| p.name() == projection.name()) {
                projections.push(projection.clone());
            }
        }
        projections
    }

    /// Reads `function(args)` from this contract through the read layer.
    pub async fn read(&self, function: &str, args: &[DynSolValue], block: BlockId) -> Result<Vec<DynSolValue>, ReadError> {
        let abi = self
            .abi
            .as_ref()
            .ok_or_else(|| ReadError::FunctionNotFound(function.to_string()))?;
        self.reader
            .read(&self.address.to_string(), &self.environment, abi, function, args, block)
            .await
    }

    /// Native balance held by the contract.
    pub async fn balance(&self, block: BlockId) -> Result<U256, ReadError> {
        self.reader
            .read_balance(&self.address.to_string(), &self.environment, block)
            .await
    }
}

type RegistryKey = (String, String, String);

pub struct ContractRegistry {
    reader: Arc<ReadService>,
    abi_dir: PathBuf,
    contracts: RwLock<HashMap<RegistryKey, Arc<ContractHandle>>>,
}

impl ContractRegistry {
    pub fn new(reader: Arc<ReadService>, abi_dir: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            abi_dir: abi_dir.into(),
            contracts: RwLock::new(HashMap::new()),
        }
    }

    /// Registers (or replaces) a contract handle.
    pub fn register(
        &self,
        index: &str,
        environment: &str,
        address: &str,
        registration: Registration,
    ) -> Result<Arc<ContractHandle>, RegistryError> {
        let address = normalize_address(address).map_err(|e| RegistryError::Configuration(e.to_string()))?;

        let handle = Arc::new(ContractHandle {
            environment: environment.to_string(),
            address,
            abi: registration.abi,
            events_to_scan: registration.events_to_scan,
            callbacks: registration.callbacks,
            reader: self.reader.clone(),
            topics: OnceLock::new(),
        });

        let key = (index.to_string(), environment.to_string(), address_key(&address));
        self.contracts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, handle.clone());

        info!("Registered {} on {} for index {}", address, environment, index);
        Ok(handle)
    }

    /// Registers a contract from its descriptor entry: loads the ABI file and
    /// wires the named projection to the events it consumes.
    pub fn register_entry(&self, index: &str, entry: &ContractEntry) -> Result<Arc<ContractHandle>, RegistryError> {
        let abi_path = entry.abi_path.as_deref().ok_or_else(|| {
            RegistryError::Configuration(format!("no abi_path for {} on {}", entry.address, entry.environment))
        })?;
        let abi = load_abi(&self.abi_dir.join(abi_path))?;

        let mut callbacks = HashMap::new();
        if let Some(name) = &entry.projection {
            let projection = projection::by_name(name)
                .ok_or_else(|| RegistryError::Configuration(format!("unknown projection {}", name)))?;
            for event in projection.events() {
                callbacks.insert(event.to_string(), projection.clone());
            }
        }

        self.register(
            index,
            &entry.environment,
            &entry.address,
            Registration {
                abi: Some(abi),
                events_to_scan: entry.events_to_scan.clone(),
                callbacks,
            },
        )
    }

    /// Returns the handle, registering an ABI-less placeholder when missing.
    pub fn get(&self, index: &str, environment: &str, address: &str) -> Result<Arc<ContractHandle>, RegistryError> {
        if let Some(handle) = self.lookup(index, environment, address) {
            return Ok(handle);
        }

        warn!(
            "{} on {} is not registered for index {}, using a placeholder without ABI",
            address, environment, index
        );
        self.register(index, environment, address, Registration::default())
    }

    pub fn lookup(&self, index: &str, environment: &str, address: &str) -> Option<Arc<ContractHandle>> {
        let address = normalize_address(address).ok()?;
        let key = (index.to_string(), environment.to_string(), address_key(&address));
        self.contracts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    /// Handles of one index on one environment, ordered by address.
    pub fn contracts(&self, index: &str, environment: &str) -> Vec<Arc<ContractHandle>> {
        let mut handles: Vec<Arc<ContractHandle>> = self
            .contracts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((i, e, _), _)| i == index && e == environment)
            .map(|(_, handle)| handle.clone())
            .collect();
        handles.sort_by_key(|handle| handle.address());
        handles
    }

    /// Handles of one index across all environments.
    pub fn index_contracts(&self, index: &str) -> Vec<Arc<ContractHandle>> {
        self.contracts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((i, _, _), _)| i == index)
            .map(|(_, handle)| handle.clone())
            .collect()
    }

    /// Distinct (index, environment) pairs, sorted.
    pub fn units(&self) -> Vec<(String, String)> {
        let mut units: Vec<(String, String)> = self
            .contracts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(|(index, environment, _)| (index.clone(), environment.clone()))
            .collect();
        units.sort();
        units.dedup();
        units
    }
}

/// Loads a JSON ABI, either a bare ABI array or a build artifact with an `abi` field.
pub fn load_abi(path: &Path) -> Result<JsonAbi, RegistryError> {
    let load_error = |reason: String| RegistryError::AbiLoad {
        path: path.display().to_string(),
        reason,
    };

    let raw = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
    if let Ok(abi) = serde_json::from_str::<JsonAbi>(&raw) {
        return Ok(abi);
    }

    let artifact: Value = serde_json::from_str(&raw).map_err(|e| load_error(e.to_string()))?;
    let abi = artifact
        .get("abi")
        .cloned()
        .ok_or_else(|| load_error("no abi field".to_string()))?;
    serde_json::from_value(abi).map_err(|e| load_error(e.to_string()))
}
