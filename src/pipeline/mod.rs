//! The pipeline runtime: graph building and the cycle driver.
//!
//! A pipeline is built from its configuration document: nodes are
//! instantiated as soon as all their upstreams exist, wired, partitioned
//! into weakly-connected subpipelines and topologically ordered. Pipelines
//! holding a stream source become synchronous and cycle on data-bus
//! arrivals; everything else cycles on a timer derived from the readout
//! intervals it depends on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::bus::{BusError, DataMessage, DataSubscriber};
use crate::config::{Document, NodeSpec, PipelineDoc, SensorDoc};
use crate::node::{
    create_behavior, Node, NodeCore, NodeError, SensorBinding, Services, SetupCtx,
};
use crate::sample::Sample;
use crate::store::StoreError;
use crate::util::unix_now;

/// Cycle interval used when the real one cannot be computed.
const FALLBACK_INTERVAL: f64 = 10.0;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("node type '{kind}' not implemented for node '{node}'")]
    UnknownNodeType { node: String, kind: String },

    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),

    #[error("node '{node}' references unknown upstream '{upstream}'")]
    UnknownUpstream { node: String, upstream: String },

    #[error("can't construct graph, unbuildable nodes: {0:?}")]
    GraphStuck(Vec<String>),

    #[error("invalid sensor '{sensor}' for node '{node}'")]
    UnknownSensor { node: String, sensor: String },

    #[error("node '{node}' failed setup: {source}")]
    Setup {
        node: String,
        #[source]
        source: NodeError,
    },

    #[error("node '{node}' failed reconfigure: {source}")]
    Reconfigure {
        node: String,
        #[source]
        source: NodeError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Sync-mode bookkeeping: which inputs must be fresh, who listens to what,
/// and what has arrived since the last cycle.
struct SyncState {
    required_inputs: HashSet<String>,
    listens_for: HashMap<String, Vec<usize>>,
    has_new: HashSet<String>,
}

enum Mode {
    Async,
    Sync(SyncState),
}

/// A built, runnable pipeline.
pub struct Pipeline {
    pub name: String,
    services: Arc<Services>,
    nodes: Vec<Node>,
    /// Disjoint subpipelines, each in topological order.
    subpipelines: Vec<Vec<usize>>,
    depends_on: Vec<String>,
    startup_cycles: u64,
    cycles: u64,
    last_error: i64,
    mode: Mode,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("name", &self.name).finish()
    }
}

impl Pipeline {
    /// Build the node graph from the pipeline document.
    pub async fn build(doc: &PipelineDoc, services: Arc<Services>) -> Result<Self, PipelineError> {
        let store = services.store.clone();
        let influx = store.influx_config().await?;
        let alarm = store.alarm_config().await?;
        let specs = &doc.pipeline;
        info!("Loading graph config, {} nodes total", specs.len());

        let mut names_seen = HashSet::new();
        for spec in specs {
            if !names_seen.insert(spec.name.clone()) {
                return Err(PipelineError::DuplicateNode(spec.name.clone()));
            }
        }

        // instantiate each node once all its upstreams exist, so a plain
        // loop over creation order is also a valid evaluation order
        let mut nodes: Vec<Node> = Vec::with_capacity(specs.len());
        let mut index: HashMap<String, usize> = HashMap::new();
        while index.len() != specs.len() {
            let before = index.len();
            for spec in specs {
                if index.contains_key(&spec.name) {
                    continue;
                }
                if !spec.upstream.iter().all(|u| index.contains_key(u)) {
                    continue;
                }
                debug!("{} ready for creation", spec.name);
                let node = Self::instantiate(spec, &services, &influx, &alarm).await?;
                index.insert(spec.name.clone(), nodes.len());
                nodes.push(node);
            }
            if index.len() == before {
                let missing: Vec<String> = specs
                    .iter()
                    .filter(|s| !index.contains_key(&s.name))
                    .map(|s| s.name.clone())
                    .collect();
                error!("Created {:?}", index.keys().collect::<Vec<_>>());
                error!("Didn't create {:?}", missing);
                return Err(PipelineError::GraphStuck(missing));
            }
            debug!(
                "Created {} nodes this iter, {}/{} total",
                index.len() - before,
                index.len(),
                specs.len()
            );
        }

        // downstream pointers
        for spec in specs {
            let this = index[&spec.name];
            for upstream in &spec.upstream {
                let up = *index
                    .get(upstream)
                    .ok_or_else(|| PipelineError::UnknownUpstream {
                        node: spec.name.clone(),
                        upstream: upstream.clone(),
                    })?;
                nodes[up].downstream.push(this);
            }
        }

        let subpipelines = partition(&nodes, &index);
        for pl in &subpipelines {
            let names: Vec<&str> = pl.iter().map(|&i| nodes[i].core.name.as_str()).collect();
            info!("Found subpipeline: {:?}", names);
        }

        let sync = nodes.iter().any(|n| n.behavior.is_sync_source());
        let mode = if sync {
            let mut listens_for: HashMap<String, Vec<usize>> = HashMap::new();
            let mut required_inputs = HashSet::new();
            for (i, node) in nodes.iter().enumerate() {
                if !node.behavior.is_sync_source() {
                    continue;
                }
                if let Ok(input) = node.core.input() {
                    listens_for.entry(input.to_string()).or_default().push(i);
                    if node.behavior.requires_fresh() {
                        required_inputs.insert(input.to_string());
                    }
                }
            }
            Mode::Sync(SyncState {
                required_inputs,
                listens_for,
                has_new: HashSet::new(),
            })
        } else {
            Mode::Async
        };

        let mut pipeline = Self {
            name: doc.name.clone(),
            services,
            nodes,
            subpipelines,
            depends_on: doc.depends_on.clone(),
            startup_cycles: 0,
            cycles: 0,
            last_error: -1,
            mode,
        };

        // an early reconfigure sizes the buffers for the startup estimate
        let sensor_docs = pipeline.fetch_sensor_docs().await?;
        pipeline.reconfigure(&doc.node_config, &sensor_docs)?;
        let mut buffer_nodes = 0;
        let mut longest_buffer = 0;
        for node in &pipeline.nodes {
            if node.behavior.uses_buffer() && !node.behavior.is_merge() {
                buffer_nodes += 1;
                longest_buffer = longest_buffer.max(node.core.buffer.limit().unwrap_or(0));
            }
        }
        pipeline.startup_cycles = (buffer_nodes + longest_buffer) as u64;
        info!(
            "{} estimates {} cycles to start",
            pipeline.name, pipeline.startup_cycles
        );
        Ok(pipeline)
    }

    async fn instantiate(
        spec: &NodeSpec,
        services: &Arc<Services>,
        influx: &crate::config::InfluxDoc,
        alarm: &crate::config::AlarmConfigDoc,
    ) -> Result<Node, PipelineError> {
        let mut behavior =
            create_behavior(&spec.kind).ok_or_else(|| PipelineError::UnknownNodeType {
                node: spec.name.clone(),
                kind: spec.kind.clone(),
            })?;
        let mut core = NodeCore::new(
            spec.name.clone(),
            spec.input_var.clone(),
            spec.output_var.clone(),
            spec.upstream.clone(),
            services.clone(),
        );
        let sensor = match behavior.sensor_binding() {
            SensorBinding::None => None,
            SensorBinding::Input | SensorBinding::Output => {
                let bound = if behavior.sensor_binding() == SensorBinding::Output {
                    core.output().ok().map(str::to_string)
                } else {
                    core.input().ok().map(str::to_string)
                };
                let bound = bound.ok_or_else(|| PipelineError::UnknownSensor {
                    node: spec.name.clone(),
                    sensor: "<unset>".to_string(),
                })?;
                let doc = services.store.get_sensor(&bound).await.map_err(|_| {
                    PipelineError::UnknownSensor {
                        node: spec.name.clone(),
                        sensor: bound.clone(),
                    }
                })?;
                Some(doc)
            }
        };
        let ctx = SetupCtx {
            options: spec.options.clone(),
            sensor,
            influx: influx.clone(),
            alarm: alarm.clone(),
        };
        behavior
            .setup(&mut core, &ctx)
            .await
            .map_err(|source| PipelineError::Setup {
                node: spec.name.clone(),
                source,
            })?;
        Ok(Node {
            core,
            behavior,
            downstream: Vec::new(),
        })
    }

    async fn fetch_sensor_docs(&self) -> Result<HashMap<String, SensorDoc>, PipelineError> {
        let mut docs = HashMap::new();
        for name in &self.depends_on {
            let doc = self.services.store.get_sensor(name).await?;
            docs.insert(name.clone(), doc);
        }
        Ok(docs)
    }

    /// Merge `node_config.general` and the node's own section into each
    /// node's runtime config; alarm-bound nodes also take their listed
    /// fields from the sensor document.
    fn reconfigure(
        &mut self,
        node_config: &std::collections::BTreeMap<String, Document>,
        sensor_docs: &HashMap<String, SensorDoc>,
    ) -> Result<(), PipelineError> {
        let general = node_config.get("general").cloned().unwrap_or_default();
        for node in &mut self.nodes {
            let mut merged = general.clone();
            if let Some(own) = node_config.get(&node.core.name) {
                for (key, value) in own {
                    merged.insert(key.clone(), value.clone());
                }
            }
            let needed = node.behavior.sensor_config_needed();
            if !needed.is_empty() {
                let sensor = node
                    .core
                    .input()
                    .ok()
                    .and_then(|name| sensor_docs.get(name))
                    .ok_or_else(|| PipelineError::Reconfigure {
                        node: node.core.name.clone(),
                        source: NodeError::MissingField("sensor document".to_string()),
                    })?;
                let as_json = serde_json::to_value(sensor).unwrap_or_default();
                if let serde_json::Value::Object(map) = as_json {
                    for field in needed {
                        if let Some(value) = map.get(*field) {
                            merged.insert((*field).to_string(), value.clone());
                        }
                    }
                }
            }
            node.behavior
                .load_config(&mut node.core, &merged)
                .map_err(|source| PipelineError::Reconfigure {
                    node: node.core.name.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Run one evaluation of every subpipeline and persist the heartbeat.
    /// Returns the interval to sleep before the next cycle.
    pub async fn process_cycle(&mut self) -> Result<f64, PipelineError> {
        let doc = self.services.store.get_pipeline(&self.name).await?;
        let sensor_docs = self.fetch_sensor_docs().await?;
        self.reconfigure(&doc.node_config, &sensor_docs)?;
        let now = unix_now();
        let is_silent = self.cycles <= self.startup_cycles
            || doc.silent_until > now
            || doc.silent_until == -1.0;
        if !is_silent {
            self.services.set_silenced_at_level(-1);
        }
        debug!("Pipeline {} cycle {}", self.name, self.cycles);
        let mut rate_ms = 0.0;
        let mut drift: f64 = 0.0;
        for subpipeline in self.subpipelines.clone() {
            for &i in &subpipeline {
                let started = Instant::now();
                let result = self.nodes[i].process_base(is_silent).await;
                rate_ms += started.elapsed().as_secs_f64() * 1000.0;
                match result {
                    Ok(package) => {
                        let downstream = self.nodes[i].downstream.clone();
                        for j in downstream {
                            self.nodes[j].receive(package.clone());
                        }
                    }
                    Err(e) => {
                        self.last_error = self.cycles as i64;
                        let message = format!(
                            "Pipeline {} node {} failed: {}",
                            self.name, self.nodes[i].core.name, e
                        );
                        if self.nodes[i].behavior.is_source() {
                            // a touch of drift helps sources that race
                            // their producer
                            drift = 0.1;
                        }
                        if self.cycles <= self.startup_cycles {
                            // buffers are still filling, errors are expected
                            debug!("{}", message);
                        } else {
                            error!("{}", message);
                        }
                        for &k in &subpipeline {
                            let node = &mut self.nodes[k];
                            node.behavior.on_error(&mut node.core).await;
                        }
                        // the rest of this subpipeline is skipped, the
                        // others still run
                        break;
                    }
                }
            }
        }
        self.cycles += 1;
        self.services
            .store
            .set_pipeline_values(
                &self.name,
                &[
                    ("heartbeat", serde_json::to_value(chrono::Utc::now()).unwrap_or_default()),
                    ("cycles", self.cycles.into()),
                    ("error", self.last_error.into()),
                    ("rate", rate_ms.into()),
                ],
            )
            .await?;
        drift = drift.max(0.001);
        let interval = sensor_docs
            .values()
            .map(|d| d.readout_interval)
            .fold(f64::NEG_INFINITY, f64::max);
        let interval = if interval.is_finite() {
            interval
        } else {
            FALLBACK_INTERVAL
        };
        Ok(interval + drift)
    }

    /// Record a data-bus arrival; returns true when every required input
    /// has seen a fresh sample and the pipeline should cycle.
    pub fn handle_data(&mut self, msg: &DataMessage) -> bool {
        let Mode::Sync(state) = &mut self.mode else {
            return false;
        };
        let listeners = state.listens_for.get(&msg.name).cloned().unwrap_or_default();
        if listeners.is_empty() && !state.required_inputs.contains(&msg.name) {
            return false;
        }
        state.has_new.insert(msg.name.clone());
        let sample = Sample::new(msg.time).with(msg.name.clone(), msg.value.clone());
        for i in listeners {
            self.nodes[i].receive(sample.clone());
        }
        let Mode::Sync(state) = &mut self.mode else {
            return false;
        };
        state.required_inputs.is_subset(&state.has_new)
    }

    fn clear_arrivals(&mut self) {
        if let Mode::Sync(state) = &mut self.mode {
            state.has_new.clear();
        }
    }

    pub fn is_sync(&self) -> bool {
        matches!(self.mode, Mode::Sync(_))
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn startup_cycles(&self) -> u64 {
        self.startup_cycles
    }

    /// Drive the pipeline until told to stop. The cancel channel carries
    /// `Some(keep_status)` when the owner wants the pipeline down.
    pub async fn run(mut self, mut cancel: watch::Receiver<Option<bool>>) {
        if self.is_sync() {
            self.run_sync(&mut cancel).await;
        } else {
            self.run_async(&mut cancel).await;
        }
        let keep_status = (*cancel.borrow()).unwrap_or(false);
        self.finish(keep_status).await;
    }

    async fn run_async(&mut self, cancel: &mut watch::Receiver<Option<bool>>) {
        loop {
            let interval = match self.process_cycle().await {
                Ok(interval) => interval,
                Err(e) => {
                    error!("Pipeline {} cycle failed: {}", self.name, e);
                    FALLBACK_INTERVAL
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs_f64(interval)) => {}
                _ = cancel.changed() => {
                    if cancel.borrow().is_some() {
                        return;
                    }
                }
            }
        }
    }

    async fn run_sync(&mut self, cancel: &mut watch::Receiver<Option<bool>>) {
        loop {
            let mut subscriber = match self.subscribe().await {
                Ok(subscriber) => subscriber,
                Err(e) => {
                    // the broker may not be up yet, keep trying
                    debug!("Pipeline {} can't reach the data bus: {}", self.name, e);
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => continue,
                        _ = cancel.changed() => {
                            if cancel.borrow().is_some() {
                                return;
                            }
                            continue;
                        }
                    }
                }
            };
            loop {
                tokio::select! {
                    msg = subscriber.recv() => {
                        match msg {
                            Ok(msg) => {
                                if self.handle_data(&msg) {
                                    if let Err(e) = self.process_cycle().await {
                                        error!("Pipeline {} cycle failed: {}", self.name, e);
                                    }
                                    self.clear_arrivals();
                                }
                            }
                            Err(BusError::BadMessage(line)) => {
                                error!("Pipeline {} got a malformed message: {}", self.name, line);
                            }
                            Err(e) => {
                                error!("Pipeline {} lost the data bus: {}", self.name, e);
                                break;
                            }
                        }
                    }
                    _ = cancel.changed() => {
                        if cancel.borrow().is_some() {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn subscribe(&self) -> Result<DataSubscriber, PipelineError> {
        let doc = self.services.store.hypervisor_config().await?;
        Ok(DataSubscriber::connect(&doc.host, doc.comms.data.recv, &self.depends_on).await?)
    }

    /// Shut every node down and optionally mark the pipeline inactive.
    async fn finish(mut self, keep_status: bool) {
        if !keep_status {
            if let Err(e) = self
                .services
                .store
                .set_pipeline_values(&self.name, &[("status", "inactive".into())])
                .await
            {
                error!("Could not mark {} inactive: {}", self.name, e);
            }
        }
        for node in &mut self.nodes {
            node.behavior.shutdown(&mut node.core).await;
        }
    }
}

/// Split the graph into weakly-connected components, each topologically
/// ordered so a node's upstreams precede it.
fn partition(nodes: &[Node], index: &HashMap<String, usize>) -> Vec<Vec<usize>> {
    let n = nodes.len();
    let mut upstream_idx: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, node) in nodes.iter().enumerate() {
        for upstream in &node.core.upstream {
            if let Some(&u) = index.get(upstream) {
                upstream_idx[i].push(u);
            }
        }
    }
    let mut visited = vec![false; n];
    let mut subpipelines = Vec::new();
    for start in 0..n {
        if visited[start] {
            continue;
        }
        // weak connectivity: walk both directions
        let mut component = Vec::new();
        let mut queue = vec![start];
        visited[start] = true;
        while let Some(i) = queue.pop() {
            component.push(i);
            for &j in upstream_idx[i].iter().chain(nodes[i].downstream.iter()) {
                if !visited[j] {
                    visited[j] = true;
                    queue.push(j);
                }
            }
        }
        // topological order within the component
        let mut ordered: Vec<usize> = Vec::with_capacity(component.len());
        let mut placed: HashSet<usize> = HashSet::new();
        while ordered.len() < component.len() {
            let mut advanced = false;
            for &i in &component {
                if placed.contains(&i) {
                    continue;
                }
                if upstream_idx[i].iter().all(|u| placed.contains(u)) {
                    ordered.push(i);
                    placed.insert(i);
                    advanced = true;
                }
            }
            if !advanced {
                // a cycle in the config; surface everything left in
                // arbitrary order rather than spinning
                for &i in &component {
                    if placed.insert(i) {
                        ordered.push(i);
                    }
                }
            }
        }
        subpipelines.push(ordered);
    }
    subpipelines
}
