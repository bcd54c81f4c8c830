use std::{collections::HashMap, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::data_model::{EndpointAddress, FunctionRef, TargetRef};

/// Deployment environment variable naming the per-replica in-flight ceiling.
pub const MAX_INFLIGHT_ENV: &str = "max_inflight";

/// The orchestrator operations the router consumes: the endpoint snapshot
/// for a function, the deployment environment the ceiling is read from, and
/// the identity token of a single replica.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn endpoints(&self, function: &FunctionRef) -> Result<Vec<EndpointAddress>>;

    async fn deployment_env(&self, function: &FunctionRef) -> Result<HashMap<String, String>>;

    async fn replica_uid(&self, namespace: &str, name: &str) -> Result<Option<String>>;
}

// Wire shapes for the slices of the orchestrator REST API we traverse.
// Everything not read is left out; unknown fields are ignored.

#[derive(Debug, Default, Deserialize)]
struct EndpointsObject {
    #[serde(default)]
    subsets: Vec<EndpointSubset>,
}

#[derive(Debug, Default, Deserialize)]
struct EndpointSubset {
    #[serde(default)]
    addresses: Vec<SubsetAddress>,
}

#[derive(Debug, Deserialize)]
struct SubsetAddress {
    ip: String,
    #[serde(rename = "targetRef")]
    target_ref: Option<ObjectReference>,
}

#[derive(Debug, Deserialize)]
struct ObjectReference {
    #[serde(default)]
    name: String,
    #[serde(default)]
    uid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeploymentObject {
    spec: DeploymentSpec,
}

#[derive(Debug, Deserialize)]
struct DeploymentSpec {
    template: PodTemplate,
}

#[derive(Debug, Deserialize)]
struct PodTemplate {
    spec: PodSpec,
}

#[derive(Debug, Default, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct Container {
    #[serde(default)]
    env: Vec<EnvVar>,
}

#[derive(Debug, Deserialize)]
struct EnvVar {
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct PodObject {
    metadata: ObjectMeta,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    uid: Option<String>,
}

/// Orchestrator client speaking the REST API of the cluster control plane.
pub struct HttpOrchestrator {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpOrchestrator {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid orchestrator base url")?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("error building orchestrator http client")?;
        Ok(Self { client, base_url })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("orchestrator request failed: {}", url))?;
        if !response.status().is_success() {
            anyhow::bail!("orchestrator returned {} for {}", response.status(), url);
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("error decoding orchestrator response for {}", url))
    }
}

#[async_trait]
impl Orchestrator for HttpOrchestrator {
    async fn endpoints(&self, function: &FunctionRef) -> Result<Vec<EndpointAddress>> {
        let object: EndpointsObject = self
            .get_json(&format!(
                "api/v1/namespaces/{}/endpoints/{}",
                function.namespace, function.name
            ))
            .await?;

        let addresses = object
            .subsets
            .into_iter()
            .flat_map(|subset| subset.addresses)
            .map(|address| EndpointAddress {
                ip: address.ip,
                target_ref: address.target_ref.map(|r| TargetRef {
                    name: r.name,
                    uid: r.uid,
                }),
            })
            .collect();
        Ok(addresses)
    }

    async fn deployment_env(&self, function: &FunctionRef) -> Result<HashMap<String, String>> {
        let object: DeploymentObject = self
            .get_json(&format!(
                "apis/apps/v1/namespaces/{}/deployments/{}",
                function.namespace, function.name
            ))
            .await?;

        let mut env = HashMap::new();
        for container in object.spec.template.spec.containers {
            for var in container.env {
                env.entry(var.name).or_insert(var.value);
            }
        }
        Ok(env)
    }

    async fn replica_uid(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let object: PodObject = self
            .get_json(&format!("api/v1/namespaces/{}/pods/{}", namespace, name))
            .await?;
        Ok(object.metadata.uid)
    }
}
