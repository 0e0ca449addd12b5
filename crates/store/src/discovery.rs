//! Discovery loop: reload schema, scan kinds x namespaces, build and store trees, purge, sleep.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rustc_hash::FxHashSet;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use kdisc_compose::TreeBuilder;
use kdisc_core::{BuildOptions, Identity};
use kdisc_kubehub::ClusterApi;
use kdisc_schema::{SchemaHandle, SchemaSource};

use crate::CompositionStore;

#[derive(Debug, Clone, Copy)]
pub struct DiscoverySettings {
    /// Sleep between the end of one cycle and the start of the next.
    pub interval: Duration,
    pub build: BuildOptions,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self { interval: Duration::from_secs(10), build: BuildOptions::default() }
    }
}

/// Outcome of one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub epoch: u64,
    pub started_at: DateTime<Utc>,
    pub kinds: usize,
    pub namespaces: usize,
    /// Top-level instances built and stored.
    pub roots: usize,
    pub purged: usize,
    pub failed_calls: usize,
    /// `None` when the schema reloaded cleanly.
    pub schema_error: Option<String>,
    /// False when the namespace listing failed and scan/purge were skipped.
    pub scanned: bool,
    pub elapsed_ms: u64,
}

/// Everything one cycle needs.
pub struct Discovery {
    pub cluster: Arc<dyn ClusterApi>,
    pub source: Arc<dyn SchemaSource>,
    pub schema: SchemaHandle,
    pub store: Arc<CompositionStore>,
    pub settings: DiscoverySettings,
}

impl Discovery {
    /// One full pass. Never fails: every error is logged and counted in the report.
    pub async fn run_cycle(&self, epoch: u64) -> CycleReport {
        let started_at = Utc::now();
        let started = Instant::now();

        let (snapshot, schema_error) = match self.schema.refresh(self.source.as_ref()).await {
            Ok(snapshot) => (snapshot, None),
            Err(e) => (self.schema.current(), Some(e.to_string())),
        };

        let mut report = CycleReport {
            epoch,
            started_at,
            kinds: snapshot.len(),
            namespaces: 0,
            roots: 0,
            purged: 0,
            failed_calls: 0,
            schema_error,
            scanned: false,
            elapsed_ms: 0,
        };

        let namespaces = match self.cluster.list_namespaces().await {
            Ok(ns) => {
                counter!("cluster_requests_total", 1u64, "outcome" => "ok");
                ns
            }
            Err(e) => {
                counter!("cluster_requests_total", 1u64, "outcome" => "error");
                warn!(error = %e, "listing namespaces failed; skipping scan and purge this cycle");
                report.failed_calls = 1;
                return self.finish(report, started);
            }
        };
        report.namespaces = namespaces.len();

        let builder = TreeBuilder::new(self.cluster.as_ref(), Arc::clone(&snapshot), self.settings.build);
        let mut observed: FxHashSet<Identity> = FxHashSet::default();
        let mut built: FxHashSet<Identity> = FxHashSet::default();

        for kind in snapshot.kinds() {
            for ns in &namespaces {
                let tops = match builder.try_list(kind, ns).await {
                    Ok(tops) => tops,
                    Err(e) => {
                        warn!(kind = %kind.kind, ns = %ns, error = %e, "top-level list failed; keeping stored records for this scope");
                        observed.extend(self.store.identities_in(&kind.kind, ns));
                        observed.extend(self.store.identities_in(&kind.kind, ""));
                        continue;
                    }
                };
                for inst in tops.iter() {
                    let id = Identity::new(&kind.kind, &inst.name, &inst.namespace);
                    observed.insert(id.clone());
                    // cluster-scoped roots come back for every namespace; keep the first build
                    if !built.insert(id) {
                        continue;
                    }
                    let scan_ns = if inst.namespace.is_empty() { ns.as_str() } else { inst.namespace.as_str() };
                    let tree = builder.build(&kind.kind, &inst.name, scan_ns).await;
                    self.store.upsert(&kind.kind, &inst.name, &inst.namespace, &inst.status, tree);
                    report.roots += 1;
                }
            }
        }

        report.purged = self.store.purge(&observed);
        report.failed_calls = builder.failed_calls();
        report.scanned = true;
        self.finish(report, started)
    }

    fn finish(&self, mut report: CycleReport, started: Instant) -> CycleReport {
        let elapsed = started.elapsed();
        report.elapsed_ms = elapsed.as_millis() as u64;
        counter!("discovery_cycles_total", 1u64);
        histogram!("discovery_cycle_ms", elapsed.as_secs_f64() * 1000.0);
        info!(
            epoch = report.epoch,
            kinds = report.kinds,
            namespaces = report.namespaces,
            roots = report.roots,
            purged = report.purged,
            failed = report.failed_calls,
            stored = self.store.len(),
            took_ms = report.elapsed_ms,
            "discovery cycle done"
        );
        report
    }
}

/// Running loop: latest report plus the task handle.
pub struct DiscoveryHandle {
    reports: watch::Receiver<Option<CycleReport>>,
    task: JoinHandle<()>,
}

impl DiscoveryHandle {
    /// Receiver updated after every cycle.
    pub fn subscribe(&self) -> watch::Receiver<Option<CycleReport>> {
        self.reports.clone()
    }

    /// Stop the loop; a cycle in flight is dropped at its next await point.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Run cycles forever on a background task, sleeping `settings.interval` between them.
pub fn spawn_discovery(discovery: Discovery) -> DiscoveryHandle {
    let (tx, rx) = watch::channel(None);
    let task = tokio::spawn(async move {
        let mut epoch = 0u64;
        loop {
            epoch = epoch.saturating_add(1);
            let report = discovery.run_cycle(epoch).await;
            if tx.send(Some(report)).is_err() {
                debug!("no report subscribers left");
            }
            tokio::time::sleep(discovery.settings.interval).await;
        }
    });
    DiscoveryHandle { reports: rx, task }
}
