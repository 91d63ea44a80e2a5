//! Package generation
//!
//! Turns a VNF intent into a kpt package: a Kptfile, the workload
//! resources and a Kustomization listing them. Documents are rendered as
//! JSON with sorted keys so the same intent always yields the same bytes
//! and the same digests.

use crate::error::{LifecycleError, LifecycleResult};
use crate::models::{VnfIntent, VnfType};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

const KPTFILE: &str = "Kptfile";
const KUSTOMIZATION: &str = "kustomization.json";

/// Label stamped on every generated resource
pub const PACKAGE_LABEL: &str = "vnf.mano.oran.io/package";

/// One generated document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    /// File name inside the package
    pub name: String,
    pub kind: String,
    pub content: String,
    /// Hex SHA-256 of `content`
    pub digest: String,
}

impl Artifact {
    fn render(name: impl Into<String>, document: &Value) -> LifecycleResult<Self> {
        let content = serde_json::to_string_pretty(document)?;
        let kind = document
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            name: name.into(),
            kind,
            digest: sha256_hex(content.as_bytes()),
            content,
        })
    }

    /// Identifier used in events: `<name>@<short digest>`
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, &self.digest[..self.digest.len().min(12)])
    }
}

/// Deployable package for one VNF
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactSet {
    pub package_name: String,
    pub namespace: String,
    pub artifacts: Vec<Artifact>,
}

impl ArtifactSet {
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.artifacts.iter().map(Artifact::id).collect()
    }

    /// Digest over all artifact digests, in package order
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for artifact in &self.artifacts {
            hasher.update(artifact.name.as_bytes());
            hasher.update(b"\0");
            hasher.update(artifact.digest.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }
}

/// Produces and checks deployable artifacts
#[async_trait]
pub trait PackageGenerator: Send + Sync {
    async fn generate(&self, intent: &VnfIntent) -> LifecycleResult<ArtifactSet>;

    async fn validate(&self, artifacts: &ArtifactSet) -> LifecycleResult<()>;
}

/// Generator for kpt packages
#[derive(Debug, Clone, Default)]
pub struct KptPackageGenerator;

impl KptPackageGenerator {
    pub fn new() -> Self {
        Self
    }

    fn package_name(intent: &VnfIntent, vnf_type: VnfType) -> String {
        format!(
            "{}-{}",
            intent.metadata.name,
            vnf_type.as_str().to_ascii_lowercase()
        )
    }

    fn kptfile(intent: &VnfIntent, package: &str, vnf_type: VnfType) -> Value {
        let ns = &intent.metadata.namespace;
        json!({
            "apiVersion": "kpt.dev/v1",
            "kind": "Kptfile",
            "metadata": {
                "name": package,
                "namespace": ns,
                "annotations": {"config.kubernetes.io/local-config": "true"},
            },
            "info": {
                "description": format!("Package for {} VNF {}", vnf_type, intent.metadata.name),
                "keywords": ["oran", "vnf", vnf_type.as_str().to_ascii_lowercase()],
            },
            "pipeline": {
                "mutators": [
                    {
                        "image": "gcr.io/kpt-fn/apply-setters:v0.2",
                        "configMap": {
                            "vnf-name": intent.metadata.name,
                            "vnf-type": vnf_type.as_str(),
                            "vnf-version": intent.spec.version,
                        },
                    },
                    {
                        "image": "gcr.io/kpt-fn/set-namespace:v0.4",
                        "configMap": {"namespace": ns},
                    },
                ],
            },
            "inventory": {
                "namespace": ns,
                "name": format!("{}-inventory", package),
                "inventoryID": package,
            },
        })
    }

    fn labels(intent: &VnfIntent, package: &str, vnf_type: VnfType) -> Value {
        json!({
            "app": package,
            "vnf-name": intent.metadata.name,
            "vnf-type": vnf_type.as_str(),
            PACKAGE_LABEL: package,
        })
    }

    fn deployment(intent: &VnfIntent, package: &str, vnf_type: VnfType) -> Value {
        let spec = &intent.spec;
        let env: Vec<Value> = spec
            .config
            .iter()
            .map(|(k, v)| json!({"name": env_name(k), "value": v}))
            .collect();
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": package,
                "namespace": intent.metadata.namespace,
                "labels": Self::labels(intent, package, vnf_type),
                "annotations": {"vnf.mano.oran.io/target-sites": spec.target_sites.join(",")},
            },
            "spec": {
                "replicas": 1,
                "selector": {"matchLabels": {"app": package}},
                "template": {
                    "metadata": {"labels": {"app": package}},
                    "spec": {
                        "containers": [{
                            "name": vnf_type.as_str().to_ascii_lowercase(),
                            "image": spec.image.reference(),
                            "resources": {
                                "requests": {
                                    "cpu": spec.resources.cpu_cores.to_string(),
                                    "memory": format!("{}Gi", spec.resources.memory_gb),
                                },
                                "limits": {
                                    "cpu": spec.resources.cpu_cores.to_string(),
                                    "memory": format!("{}Gi", spec.resources.memory_gb),
                                },
                            },
                            "env": env,
                        }],
                    },
                },
            },
        })
    }

    fn service(intent: &VnfIntent, package: &str, vnf_type: VnfType) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": format!("{}-svc", package),
                "namespace": intent.metadata.namespace,
                "labels": Self::labels(intent, package, vnf_type),
            },
            "spec": {
                "selector": {"app": package},
                "ports": service_ports(vnf_type),
            },
        })
    }

    fn qos_config(intent: &VnfIntent, package: &str, vnf_type: VnfType) -> Value {
        let qos = &intent.spec.qos;
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": format!("{}-qos", package),
                "namespace": intent.metadata.namespace,
                "labels": Self::labels(intent, package, vnf_type),
            },
            "data": {
                "bandwidth": format!("{:.2}", qos.bandwidth_mbps),
                "latency": format!("{:.2}", qos.latency_ms),
                "jitter": format!("{:.2}", qos.jitter_ms),
                "sliceType": qos.slice_type,
            },
        })
    }

    fn kustomization(intent: &VnfIntent, resources: &[String]) -> Value {
        json!({
            "apiVersion": "kustomize.config.k8s.io/v1beta1",
            "kind": "Kustomization",
            "metadata": {"name": intent.metadata.name},
            "namespace": intent.metadata.namespace,
            "resources": resources,
            "images": [{
                "name": intent.spec.image.repository,
                "newTag": intent.spec.image.tag,
            }],
        })
    }
}

#[async_trait]
impl PackageGenerator for KptPackageGenerator {
    async fn generate(&self, intent: &VnfIntent) -> LifecycleResult<ArtifactSet> {
        let vnf_type = intent
            .spec
            .vnf_type
            .ok_or_else(|| LifecycleError::packaging("VNF type is required to build a package"))?;
        let package = Self::package_name(intent, vnf_type);

        let mut artifacts = vec![Artifact::render(
            KPTFILE,
            &Self::kptfile(intent, &package, vnf_type),
        )?];

        let resources = [
            ("deployment", Self::deployment(intent, &package, vnf_type)),
            ("service", Self::service(intent, &package, vnf_type)),
            ("configmap", Self::qos_config(intent, &package, vnf_type)),
        ];
        let mut files = Vec::with_capacity(resources.len());
        for (prefix, document) in &resources {
            let file = format!("{}-{}.json", prefix, package);
            artifacts.push(Artifact::render(file.clone(), document)?);
            files.push(file);
        }

        artifacts.push(Artifact::render(
            KUSTOMIZATION,
            &Self::kustomization(intent, &files),
        )?);

        Ok(ArtifactSet {
            package_name: package,
            namespace: intent.metadata.namespace.clone(),
            artifacts,
        })
    }

    async fn validate(&self, set: &ArtifactSet) -> LifecycleResult<()> {
        if set.is_empty() {
            return Err(LifecycleError::packaging("package has no artifacts"));
        }

        let mut names = BTreeSet::new();
        for artifact in &set.artifacts {
            if !names.insert(artifact.name.as_str()) {
                return Err(LifecycleError::packaging(format!(
                    "duplicate artifact {}",
                    artifact.name
                )));
            }
            if sha256_hex(artifact.content.as_bytes()) != artifact.digest {
                return Err(LifecycleError::packaging(format!(
                    "digest mismatch for {}",
                    artifact.name
                )));
            }

            let document: Value = serde_json::from_str(&artifact.content).map_err(|e| {
                LifecycleError::packaging(format!("{} is not valid JSON: {}", artifact.name, e))
            })?;
            for field in ["apiVersion", "kind"] {
                if document.get(field).and_then(Value::as_str).unwrap_or("").is_empty() {
                    return Err(LifecycleError::packaging(format!(
                        "{} missing {}",
                        artifact.name, field
                    )));
                }
            }
            let name = document
                .pointer("/metadata/name")
                .and_then(Value::as_str)
                .unwrap_or("");
            if name.is_empty() {
                return Err(LifecycleError::packaging(format!(
                    "{} missing metadata.name",
                    artifact.name
                )));
            }
            if artifact.name == KPTFILE && name != set.package_name {
                return Err(LifecycleError::packaging(format!(
                    "Kptfile names package {} but set is {}",
                    name, set.package_name
                )));
            }
            if let Some(label) = document
                .pointer("/metadata/labels")
                .and_then(|l| l.get(PACKAGE_LABEL))
                .and_then(Value::as_str)
            {
                if label != set.package_name {
                    return Err(LifecycleError::packaging(format!(
                        "{} belongs to package {}",
                        artifact.name, label
                    )));
                }
            }
        }

        if set.get(KPTFILE).is_none() {
            return Err(LifecycleError::packaging("package has no Kptfile"));
        }
        let kustomization = set
            .get(KUSTOMIZATION)
            .ok_or_else(|| LifecycleError::packaging("package has no kustomization"))?;
        let listed: BTreeSet<String> = serde_json::from_str::<Value>(&kustomization.content)?
            .get("resources")
            .and_then(Value::as_array)
            .map(|r| {
                r.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let expected: BTreeSet<String> = set
            .artifacts
            .iter()
            .map(|a| a.name.clone())
            .filter(|n| n != KPTFILE && n != KUSTOMIZATION)
            .collect();
        if expected.is_empty() {
            return Err(LifecycleError::packaging("package has no resources"));
        }
        if listed != expected {
            return Err(LifecycleError::packaging(format!(
                "kustomization lists {:?} but package holds {:?}",
                listed, expected
            )));
        }

        Ok(())
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn env_name(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

fn service_ports(vnf_type: VnfType) -> Value {
    match vnf_type {
        VnfType::Ran | VnfType::GNb | VnfType::Cu | VnfType::Du | VnfType::Ru => json!([
            {"name": "ngap", "port": 38412, "targetPort": 38412, "protocol": "SCTP"},
            {"name": "gtpu", "port": 2152, "targetPort": 2152, "protocol": "UDP"},
        ]),
        VnfType::Upf => json!([
            {"name": "gtpu", "port": 2152, "targetPort": 2152, "protocol": "UDP"},
            {"name": "pfcp", "port": 8805, "targetPort": 8805, "protocol": "UDP"},
        ]),
        VnfType::Tn => json!([
            {"name": "agent", "port": 8080, "targetPort": 8080, "protocol": "TCP"},
        ]),
        VnfType::Cn
        | VnfType::Amf
        | VnfType::Smf
        | VnfType::Pcf
        | VnfType::Udm
        | VnfType::Ausf
        | VnfType::Nssf
        | VnfType::Nef
        | VnfType::Nrf => json!([
            {"name": "sbi", "port": 80, "targetPort": 8080, "protocol": "TCP"},
        ]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImageRef, QosRequest, ResourceRequest, VnfKey, VnfSpec};

    fn intent() -> VnfIntent {
        let mut spec = VnfSpec {
            vnf_type: Some(VnfType::Ran),
            version: "1.2.0".into(),
            image: ImageRef {
                repository: "registry.local/ran".into(),
                tag: "1.2.0".into(),
            },
            resources: ResourceRequest {
                cpu_cores: 2,
                memory_gb: 4,
            },
            qos: QosRequest {
                bandwidth_mbps: 4.5,
                latency_ms: 10.0,
                jitter_ms: 1.0,
                slice_type: "eMBB".into(),
            },
            target_sites: vec!["edge-01".into(), "edge-02".into()],
            ..Default::default()
        };
        spec.config.insert("log-level".into(), "debug".into());
        VnfIntent::new(&VnfKey::new("ran", "gnb-a"), spec)
    }

    #[tokio::test]
    async fn test_generate_produces_valid_package() {
        let generator = KptPackageGenerator::new();
        let set = generator.generate(&intent()).await.unwrap();

        assert_eq!(set.package_name, "gnb-a-ran");
        assert_eq!(set.artifacts.len(), 5);
        assert_eq!(set.artifacts[0].name, "Kptfile");
        assert_eq!(set.artifacts[4].name, "kustomization.json");
        generator.validate(&set).await.unwrap();
    }

    #[tokio::test]
    async fn test_generation_is_deterministic() {
        let generator = KptPackageGenerator::new();
        let a = generator.generate(&intent()).await.unwrap();
        let b = generator.generate(&intent()).await.unwrap();
        assert_eq!(a.digest(), b.digest());

        let mut changed = intent();
        changed.spec.image.tag = "1.3.0".into();
        let c = generator.generate(&changed).await.unwrap();
        assert_ne!(a.digest(), c.digest());
    }

    #[tokio::test]
    async fn test_deployment_carries_spec() {
        let set = KptPackageGenerator::new().generate(&intent()).await.unwrap();
        let deployment = set.get("deployment-gnb-a-ran.json").unwrap();
        let doc: Value = serde_json::from_str(&deployment.content).unwrap();

        assert_eq!(
            doc.pointer("/spec/template/spec/containers/0/image").unwrap(),
            "registry.local/ran:1.2.0"
        );
        assert_eq!(
            doc.pointer("/spec/template/spec/containers/0/resources/requests/memory")
                .unwrap(),
            "4Gi"
        );
        assert_eq!(
            doc.pointer("/spec/template/spec/containers/0/env/0/name").unwrap(),
            "LOG_LEVEL"
        );
    }

    #[tokio::test]
    async fn test_missing_type_fails() {
        let mut bad = intent();
        bad.spec.vnf_type = None;
        let err = KptPackageGenerator::new().generate(&bad).await.unwrap_err();
        assert_eq!(err.code(), "packaging");
    }

    #[tokio::test]
    async fn test_validate_rejects_tampering() {
        let generator = KptPackageGenerator::new();
        let mut set = generator.generate(&intent()).await.unwrap();
        set.artifacts[1].content.push(' ');
        let err = generator.validate(&set).await.unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
    }

    #[tokio::test]
    async fn test_validate_rejects_unlisted_resource() {
        let generator = KptPackageGenerator::new();
        let mut set = generator.generate(&intent()).await.unwrap();
        set.artifacts.remove(2);
        let err = generator.validate(&set).await.unwrap_err();
        assert!(err.to_string().contains("kustomization lists"));
    }

    #[tokio::test]
    async fn test_validate_rejects_empty_set() {
        let set = ArtifactSet {
            package_name: "x".into(),
            namespace: "default".into(),
            artifacts: Vec::new(),
        };
        assert!(KptPackageGenerator::new().validate(&set).await.is_err());
    }
}
