//! Kinds published by operators into an etcd v2 key-value registry.
//!
//! The root key (default `/operators`) holds a JSON array naming custom
//! resources; each name has a detail blob at `/<name>` describing its kind,
//! plural, endpoint and composition.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use kdisc_core::KindSchema;

use crate::{validate, SchemaError, SchemaSource};

pub const DEFAULT_REGISTRY_URL: &str = "http://localhost:2379";
pub const DEFAULT_REGISTRY_ROOT: &str = "/operators";

#[derive(Debug, Clone)]
pub struct RegistrySource {
    client: reqwest::Client,
    endpoint: String,
    root: String,
}

impl RegistrySource {
    pub fn new(endpoint: &str, root: &str, timeout: Duration) -> Result<Self, SchemaError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            root: normalize_key(root),
        })
    }

    /// Value stored at `key`, or `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>, SchemaError> {
        let url = format!("{}/v2/keys{}", self.endpoint, key);
        let resp = self.client.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(key = %key, "registry key absent");
            return Ok(None);
        }
        let body: Value = resp.error_for_status()?.json().await?;
        let value = body
            .get("node")
            .and_then(|n| n.get("value"))
            .and_then(Value::as_str)
            .ok_or_else(|| SchemaError::RegistryDecode {
                key: key.to_string(),
                reason: "response has no node.value".to_string(),
            })?;
        Ok(Some(value.to_string()))
    }
}

#[async_trait::async_trait]
impl SchemaSource for RegistrySource {
    fn describe(&self) -> String {
        format!("registry:{}{}", self.endpoint, self.root)
    }

    async fn load(&self) -> Result<Vec<KindSchema>, SchemaError> {
        let Some(root) = self.get(&self.root).await? else {
            return Ok(Vec::new());
        };
        let names = parse_registry_names(&root, &self.root)?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let key = normalize_key(&name);
            let detail = self.get(&key).await?.ok_or_else(|| SchemaError::RegistryDecode {
                key: key.clone(),
                reason: "detail key missing".to_string(),
            })?;
            let entry = parse_registry_detail(&detail, &key)?;
            validate(&entry)?;
            out.push(entry);
        }
        Ok(out)
    }
}

fn normalize_key(key: &str) -> String {
    format!("/{}", key.trim_matches('/'))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RootEntry {
    Name(String),
    Operator {
        #[serde(rename = "customResources")]
        custom_resources: Vec<String>,
    },
    ByOperator(std::collections::BTreeMap<String, OperatorEntry>),
}

#[derive(Deserialize)]
struct OperatorEntry {
    #[serde(rename = "customResources", default)]
    custom_resources: Vec<String>,
}

/// Custom-resource names listed under the registry root, in order, without duplicates.
///
/// Array entries may be bare names, `{"customResources": [...]}` objects, or
/// maps from operator name to such objects.
pub fn parse_registry_names(text: &str, key: &str) -> Result<Vec<String>, SchemaError> {
    let entries: Vec<RootEntry> = serde_json::from_str(text).map_err(|e| SchemaError::RegistryDecode {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    let mut names: Vec<String> = Vec::new();
    let mut push = |n: String| {
        if !n.is_empty() && !names.contains(&n) {
            names.push(n);
        }
    };
    for entry in entries {
        match entry {
            RootEntry::Name(n) => push(n),
            RootEntry::Operator { custom_resources } => custom_resources.into_iter().for_each(&mut push),
            RootEntry::ByOperator(ops) => ops.into_values().flat_map(|o| o.custom_resources).for_each(&mut push),
        }
    }
    Ok(names)
}

#[derive(Deserialize)]
struct Detail {
    kind: String,
    plural: String,
    endpoint: String,
    #[serde(default)]
    composition: Composition,
}

#[derive(Deserialize, Default)]
#[serde(untagged)]
enum Composition {
    #[default]
    None,
    List(Vec<String>),
    Csv(String),
}

impl Composition {
    fn into_kinds(self) -> Vec<String> {
        match self {
            Composition::None => Vec::new(),
            Composition::List(v) => v.into_iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
            Composition::Csv(s) => s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect(),
        }
    }
}

/// Decode one detail blob. `composition` may be a list or a comma-separated string.
pub fn parse_registry_detail(text: &str, key: &str) -> Result<KindSchema, SchemaError> {
    let d: Detail = serde_json::from_str(text).map_err(|e| SchemaError::RegistryDecode {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    Ok(KindSchema {
        kind: d.kind,
        plural: d.plural,
        endpoint: d.endpoint,
        composition: d.composition.into_kinds(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SchemaHandle;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal etcd v2 keys endpoint: known keys answer 200 with `node.value`, the rest 404.
    async fn serve_keys(keys: Vec<(&'static str, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let keys = keys.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        let n = sock.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }
                    let head = String::from_utf8_lossy(&buf).to_string();
                    let path = head.split_whitespace().nth(1).unwrap_or_default().to_string();
                    let hit = keys.iter().find(|(k, _)| format!("/v2/keys{}", k) == path);
                    let (status, body) = match hit {
                        Some((key, value)) => (
                            "200 OK",
                            serde_json::json!({ "action": "get", "node": { "key": key, "value": value } }).to_string(),
                        ),
                        None => ("404 Not Found", r#"{"errorCode":100,"message":"Key not found"}"#.to_string()),
                    };
                    let resp = format!(
                        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    const POSTGRES: &str = r#"{"kind":"Postgres","plural":"postgreses","endpoint":"apis/postgrescontroller.kubeplus/v1","composition":"Deployment, Service"}"#;

    fn source(endpoint: &str) -> RegistrySource {
        RegistrySource::new(endpoint, DEFAULT_REGISTRY_ROOT, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn loads_kinds_from_registry() {
        let url = serve_keys(vec![("/operators", r#"["postgreses.kubeplus"]"#), ("/postgreses.kubeplus", POSTGRES)]).await;
        let src = source(&url);
        let kinds = src.load().await.unwrap();
        assert_eq!(kinds.len(), 1);
        assert_eq!(kinds[0].kind, "Postgres");
        assert_eq!(kinds[0].composition, vec!["Deployment", "Service"]);

        let handle = SchemaHandle::default();
        let snap = handle.refresh(&src).await.unwrap();
        assert_eq!(snap.len(), 8);
        assert_eq!(snap.resolve_kind("postgreses"), Some("Postgres"));
    }

    #[tokio::test]
    async fn absent_root_key_means_no_kinds() {
        let url = serve_keys(vec![]).await;
        assert!(source(&url).load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_detail_key_fails_the_load() {
        let url = serve_keys(vec![("/operators", r#"["postgreses.kubeplus"]"#)]).await;
        let err = source(&url).load().await.unwrap_err();
        assert!(matches!(err, SchemaError::RegistryDecode { ref key, .. } if key == "/postgreses.kubeplus"), "{err}");
    }

    #[tokio::test]
    async fn unreachable_registry_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = source(&format!("http://{}", addr)).load().await.unwrap_err();
        assert!(matches!(err, SchemaError::Registry(_)), "{err}");
    }

    #[test]
    fn root_accepts_all_entry_shapes() {
        let text = r#"["postgreses.kubeplus",
            {"customResources": ["etcdclusters.coreos", "postgreses.kubeplus"]},
            {"moodle-operator": {"customResources": ["moodles.moodlecontroller"]}}]"#;
        let names = parse_registry_names(text, "/operators").unwrap();
        assert_eq!(names, vec!["postgreses.kubeplus", "etcdclusters.coreos", "moodles.moodlecontroller"]);
    }

    #[test]
    fn root_must_be_an_array() {
        let err = parse_registry_names(r#"{"a": 1}"#, "/operators").unwrap_err();
        assert!(matches!(err, SchemaError::RegistryDecode { ref key, .. } if key == "/operators"));
    }

    #[test]
    fn detail_composition_forms() {
        let csv = r#"{"kind":"Postgres","plural":"postgreses","endpoint":"apis/postgrescontroller.kubeplus/v1",
                      "composition":"Deployment, Service"}"#;
        let k = parse_registry_detail(csv, "/postgreses").unwrap();
        assert_eq!(k.composition, vec!["Deployment", "Service"]);

        let list = r#"{"kind":"Moodle","plural":"moodles","endpoint":"apis/moodle/v1","composition":["Deployment"]}"#;
        assert_eq!(parse_registry_detail(list, "/m").unwrap().composition, vec!["Deployment"]);

        let none = r#"{"kind":"Leaf","plural":"leaves","endpoint":"apis/leaf/v1"}"#;
        assert!(parse_registry_detail(none, "/l").unwrap().composition.is_empty());

        assert!(parse_registry_detail(r#"{"kind":"X"}"#, "/x").is_err());
    }

    #[test]
    fn keys_are_normalized() {
        assert_eq!(normalize_key("operators"), "/operators");
        assert_eq!(normalize_key("/postgreses.kubeplus/"), "/postgreses.kubeplus");
    }
}
