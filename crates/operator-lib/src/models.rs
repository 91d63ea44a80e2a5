//! Core data models for the VNF operator
//!
//! A `VnfIntent` is the declarative object held by the external object
//! store: metadata, the desired `VnfSpec`, and the last observed `VnfStatus`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Namespace used when a key is given without one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Finalizer that keeps an intent alive until cleanup has finished
pub const VNF_FINALIZER: &str = "vnf.mano.oran.io/finalizer";

/// Identity of a VNF intent (namespace + name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VnfKey {
    pub namespace: String,
    pub name: String,
}

impl VnfKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for VnfKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for VnfKey {
    type Err = String;

    /// Parses `namespace/name`, or a bare `name` in the default namespace
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            None if !s.is_empty() => Ok(Self::new(DEFAULT_NAMESPACE, s)),
            _ => Err(format!("invalid VNF key: {:?}", s)),
        }
    }
}

/// Network function type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VnfType {
    #[serde(rename = "RAN")]
    Ran,
    #[serde(rename = "CN")]
    Cn,
    #[serde(rename = "TN")]
    Tn,
    #[serde(rename = "UPF")]
    Upf,
    #[serde(rename = "AMF")]
    Amf,
    #[serde(rename = "SMF")]
    Smf,
    #[serde(rename = "PCF")]
    Pcf,
    #[serde(rename = "UDM")]
    Udm,
    #[serde(rename = "AUSF")]
    Ausf,
    #[serde(rename = "NSSF")]
    Nssf,
    #[serde(rename = "NEF")]
    Nef,
    #[serde(rename = "NRF")]
    Nrf,
    #[serde(rename = "gNB")]
    GNb,
    #[serde(rename = "CU")]
    Cu,
    #[serde(rename = "DU")]
    Du,
    #[serde(rename = "RU")]
    Ru,
}

impl VnfType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VnfType::Ran => "RAN",
            VnfType::Cn => "CN",
            VnfType::Tn => "TN",
            VnfType::Upf => "UPF",
            VnfType::Amf => "AMF",
            VnfType::Smf => "SMF",
            VnfType::Pcf => "PCF",
            VnfType::Udm => "UDM",
            VnfType::Ausf => "AUSF",
            VnfType::Nssf => "NSSF",
            VnfType::Nef => "NEF",
            VnfType::Nrf => "NRF",
            VnfType::GNb => "gNB",
            VnfType::Cu => "CU",
            VnfType::Du => "DU",
            VnfType::Ru => "RU",
        }
    }
}

impl fmt::Display for VnfType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container image reference
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

/// Compute resources requested by a VNF
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu_cores: u32,
    pub memory_gb: u32,
}

/// QoS targets requested by a VNF
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QosRequest {
    pub bandwidth_mbps: f64,
    pub latency_ms: f64,
    #[serde(default)]
    pub jitter_ms: f64,
    #[serde(default)]
    pub slice_type: String,
}

/// Desired state of a VNF
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VnfSpec {
    #[serde(rename = "type", default)]
    pub vnf_type: Option<VnfType>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub image: ImageRef,
    #[serde(default)]
    pub resources: ResourceRequest,
    #[serde(default)]
    pub qos: QosRequest,
    #[serde(default)]
    pub target_sites: Vec<String>,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Object metadata maintained by the object store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    /// Incremented by the store on every spec change
    pub generation: i64,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub deletion_requested: bool,
}

impl ObjectMeta {
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }
}

/// Observed status written back by the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VnfStatus {
    #[serde(default)]
    pub phase: String,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub remote_deployment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deployed_sites: Vec<String>,
    /// Human-readable reason, set when the VNF is failing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    /// Retries exhausted; only a spec change restarts the lifecycle
    #[serde(default)]
    pub permanent_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// A declared VNF as held by the object store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VnfIntent {
    pub metadata: ObjectMeta,
    pub spec: VnfSpec,
    #[serde(default)]
    pub status: VnfStatus,
}

impl VnfIntent {
    pub fn new(key: &VnfKey, spec: VnfSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: key.name.clone(),
                namespace: key.namespace.clone(),
                generation: 1,
                ..Default::default()
            },
            spec,
            status: VnfStatus::default(),
        }
    }

    pub fn key(&self) -> VnfKey {
        VnfKey::new(&self.metadata.namespace, &self.metadata.name)
    }
}
