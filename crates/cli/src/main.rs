use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};

use kdisc_api::{DiscoveryApi, InProcApi};
use kdisc_core::{BuildOptions, CompositionNode, KindSchema, OwnerMatch, PurgeMatch, WILDCARD};
use kdisc_kubehub::{ClusterApi, ConnectOptions, KubeCluster, StaticCluster};
use kdisc_schema::{FileSource, RegistrySource, SchemaHandle, SchemaSource, DEFAULT_REGISTRY_ROOT, DEFAULT_REGISTRY_URL};
use kdisc_store::{spawn_discovery, CompositionStore, Discovery, DiscoverySettings};

#[derive(Parser, Debug)]
#[command(name = "kdiscctl", version, about = "Resource composition discovery")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Static kind-composition schema file; the registry is not consulted when set
    #[arg(long, env = "KIND_COMPOSITION_FILE", global = true)]
    kind_composition_file: Option<PathBuf>,

    /// Registry endpoint holding operator-published kinds
    #[arg(long, env = "ETCD_SERVERS", global = true, default_value = DEFAULT_REGISTRY_URL)]
    etcd_servers: String,

    /// Registry key listing custom kinds
    #[arg(long, env = "KDISC_REGISTRY_ROOT", global = true, default_value = DEFAULT_REGISTRY_ROOT)]
    registry_root: String,

    /// Seconds to sleep between discovery cycles
    #[arg(long, env = "KDISC_INTERVAL_SECS", global = true, default_value_t = 10)]
    interval_secs: u64,

    /// Connect/read timeout for cluster and registry requests
    #[arg(long, env = "KDISC_REQUEST_TIMEOUT_SECS", global = true, default_value_t = 30)]
    request_timeout_secs: u64,

    /// Deepest tree level to expand (root = 1)
    #[arg(long, env = "KDISC_MAX_DEPTH", global = true)]
    max_depth: Option<usize>,

    /// Link children through any owner reference, not only the first
    #[arg(long, env = "KDISC_ALL_OWNERS", global = true, action = ArgAction::SetTrue)]
    all_owners: bool,

    /// Keep stored records alive while any observed object shares their name
    #[arg(long, env = "KDISC_PURGE_BY_NAME", global = true, action = ArgAction::SetTrue)]
    purge_by_name: bool,

    /// Use kubeconfig credentials instead of the in-cluster service account
    #[arg(long, env = "KDISC_OUT_OF_CLUSTER", global = true, action = ArgAction::SetTrue)]
    out_of_cluster: bool,

    /// Serve cluster reads from a JSON fixture instead of the API server
    #[arg(long, env = "KDISC_FIXTURE", global = true)]
    fixture: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the discovery loop until Ctrl-C
    Run,
    /// Run one discovery cycle and print the compositions of one resource
    Once {
        /// Kind, singular or plural (e.g. Deployment, deployments)
        kind: String,
        /// Resource name, or * for every instance
        #[arg(default_value = WILDCARD)]
        name: String,
        /// Namespace of the resource (empty for cluster-scoped kinds)
        #[arg(long = "ns", default_value = "default")]
        namespace: String,
    },
    /// Load the schema once and print known kinds
    Schema {
        /// Print a single kind (singular or plural)
        kind: Option<String>,
    },
}

impl Cli {
    fn timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn build_options(&self) -> BuildOptions {
        BuildOptions {
            max_depth: self.max_depth,
            owner_match: if self.all_owners { OwnerMatch::Any } else { OwnerMatch::First },
        }
    }

    fn purge_match(&self) -> PurgeMatch {
        if self.purge_by_name { PurgeMatch::NameOnly } else { PurgeMatch::Identity }
    }

    fn settings(&self) -> DiscoverySettings {
        DiscoverySettings { interval: Duration::from_secs(self.interval_secs), build: self.build_options() }
    }

    fn schema_source(&self) -> Result<Arc<dyn SchemaSource>> {
        Ok(match &self.kind_composition_file {
            Some(path) => Arc::new(FileSource::new(path)) as Arc<dyn SchemaSource>,
            None => Arc::new(
                RegistrySource::new(&self.etcd_servers, &self.registry_root, self.timeout())
                    .context("building registry client")?,
            ) as Arc<dyn SchemaSource>,
        })
    }

    /// Credential bootstrap failure is returned and ends the process.
    async fn cluster(&self) -> Result<Arc<dyn ClusterApi>> {
        if let Some(path) = &self.fixture {
            info!(fixture = %path.display(), "serving cluster reads from fixture");
            return Ok(Arc::new(StaticCluster::load(path)?));
        }
        let opts = ConnectOptions { out_of_cluster: self.out_of_cluster, timeout: self.timeout() };
        Ok(Arc::new(KubeCluster::connect(&opts).await?))
    }
}

fn init_tracing() {
    let env = std::env::var("KDISC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KDISC_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KDISC_METRICS_ADDR; expected host:port");
        }
    }
}

fn print_tree(node: &CompositionNode, depth: usize) {
    let status = if node.status.is_empty() { "-" } else { node.status.as_str() };
    let ns = if node.namespace.is_empty() { String::new() } else { format!(" ({})", node.namespace) };
    println!("{:indent$}{} {}{} [{}]", "", node.kind, node.name, ns, status, indent = depth * 2);
    for child in &node.children {
        print_tree(child, depth + 1);
    }
}

fn print_kind(k: &KindSchema) {
    let children = if k.composition.is_empty() { "-".to_string() } else { k.composition.join(", ") };
    println!("{:<24} {:<24} {:<40} {}", k.kind, k.plural, k.endpoint, children);
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run => {
            let schema = SchemaHandle::default();
            let store = Arc::new(CompositionStore::with_purge_match(cli.purge_match()));
            let discovery = Discovery {
                cluster: cli.cluster().await?,
                source: cli.schema_source()?,
                schema,
                store,
                settings: cli.settings(),
            };
            info!(interval_s = cli.interval_secs, source = %discovery.source.describe(), "discovery loop starting");
            let handle = spawn_discovery(discovery);
            let mut reports = handle.subscribe();
            loop {
                tokio::select! {
                    changed = reports.changed() => {
                        if changed.is_err() {
                            warn!("discovery loop stopped");
                            break;
                        }
                        if cli.output == Output::Json {
                            let latest = reports.borrow().clone();
                            if let Some(report) = latest {
                                println!("{}", serde_json::to_string(&report)?);
                            }
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; stopping discovery loop");
                        break;
                    }
                }
            }
            handle.abort();
        }
        Commands::Once { kind, name, namespace } => {
            let schema = SchemaHandle::default();
            let store = Arc::new(CompositionStore::with_purge_match(cli.purge_match()));
            let discovery = Discovery {
                cluster: cli.cluster().await?,
                source: cli.schema_source()?,
                schema: schema.clone(),
                store: Arc::clone(&store),
                settings: cli.settings(),
            };
            let report = discovery.run_cycle(1).await;
            if let Some(e) = &report.schema_error {
                warn!(error = %e, "schema reload failed; used baseline kinds");
            }
            let api = InProcApi::new(store, schema);
            match cli.output {
                Output::Human => {
                    let trees = api.get_compositions(kind, name, namespace).await?;
                    if trees.is_empty() {
                        eprintln!("no compositions for {} {} in {:?}", kind, name, namespace);
                    }
                    for tree in &trees {
                        print_tree(tree, 0);
                    }
                }
                Output::Json => println!("{}", api.get_compositions_json(kind, name, namespace).await?),
            }
        }
        Commands::Schema { kind } => {
            let schema = SchemaHandle::default();
            let source = cli.schema_source()?;
            if let Err(e) = schema.refresh(source.as_ref()).await {
                eprintln!("schema error ({}): {}; showing baseline kinds", source.describe(), e);
            }
            let api = InProcApi::new(Arc::new(CompositionStore::new()), schema);
            let kinds = match kind {
                Some(k) => vec![api.describe_kind(k).await?],
                None => api.kinds().await?,
            };
            match cli.output {
                Output::Human => {
                    println!("{:<24} {:<24} {:<40} {}", "KIND", "PLURAL", "ENDPOINT", "CHILDREN");
                    kinds.iter().for_each(print_kind);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&kinds)?),
            }
        }
    }
    Ok(())
}
