//! kdisc kubehub: list reads against the cluster API server.
//!
//! Reads go through the [`ClusterApi`] trait so the tree builder and discovery
//! loop can run against the live API server ([`KubeCluster`]) or an in-memory
//! replay ([`StaticCluster`]).

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, ListParams},
    Client, Config, ResourceExt,
};
use metrics::histogram;
use tracing::{debug, info};

use kdisc_core::ResourceInstance;

mod decode;
mod fixture;

pub use decode::{derive_status, parse_instances, parse_item, parse_namespaces};
pub use fixture::StaticCluster;

/// Read-only view of the cluster used by one discovery cycle.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    /// Names of all namespaces.
    async fn list_namespaces(&self) -> Result<Vec<String>>;

    /// All instances of one kind in `namespace`, or across the cluster when
    /// `endpoint` already names the plural resource.
    async fn list_instances(&self, endpoint: &str, plural: &str, namespace: &str) -> Result<Vec<ResourceInstance>>;
}

/// Build the list path for a kind.
///
/// An endpoint that already contains the plural name (e.g. `api/v1/persistentvolumes`)
/// is used verbatim, which lets cluster-scoped kinds skip the namespace segment.
pub fn resource_path(endpoint: &str, plural: &str, namespace: &str) -> String {
    let endpoint = endpoint.trim_matches('/');
    if endpoint.contains(plural) {
        format!("/{}", endpoint)
    } else if namespace.is_empty() {
        format!("/{}/{}", endpoint, plural)
    } else {
        format!("/{}/namespaces/{}/{}", endpoint, namespace, plural)
    }
}

/// How to reach and authenticate against the API server.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Infer credentials from kubeconfig instead of the pod's service account.
    pub out_of_cluster: bool,
    /// Connect and read timeout applied to every request.
    pub timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self { out_of_cluster: false, timeout: Duration::from_secs(30) }
    }
}

/// Live cluster reads through a kube client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Load credentials and build a client.
    ///
    /// In-cluster mode reads `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT` plus the
    /// service-account token and CA bundle; a missing piece is an error the caller treats as fatal.
    pub async fn connect(opts: &ConnectOptions) -> Result<Self> {
        let mut config = if opts.out_of_cluster {
            Config::infer().await.context("inferring kube config from environment")?
        } else {
            Config::incluster().context("loading in-cluster service account credentials")?
        };
        config.connect_timeout = Some(opts.timeout);
        config.read_timeout = Some(opts.timeout);
        info!(url = %config.cluster_url, out_of_cluster = opts.out_of_cluster, timeout_s = opts.timeout.as_secs(), "cluster client configured");
        let client = Client::try_from(config).context("building kube client")?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let started = Instant::now();
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await.context("listing namespaces")?;
        let names: Vec<String> = list.items.iter().map(|ns| ns.name_any()).collect();
        histogram!("cluster_request_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(count = names.len(), "namespaces listed");
        Ok(names)
    }

    async fn list_instances(&self, endpoint: &str, plural: &str, namespace: &str) -> Result<Vec<ResourceInstance>> {
        let started = Instant::now();
        let path = resource_path(endpoint, plural, namespace);
        let request = kube::core::Request::new(path.as_str())
            .list(&ListParams::default())
            .with_context(|| format!("building list request for {}", path))?;
        let body: serde_json::Value = self
            .client
            .request(request)
            .await
            .with_context(|| format!("GET {}", path))?;
        let items = parse_instances(&body);
        histogram!("cluster_request_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path = %path, count = items.len(), "instances listed");
        Ok(items)
    }
}
