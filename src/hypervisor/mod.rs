//! The cluster supervisor.
//!
//! The hypervisor is assumed to be the first thing started and owns the
//! things everyone else depends on: both bus brokers, the fixed-cadence
//! sync signals, and the liveness loop that starts, pings and restarts
//! device processes and the three pipeline monitors. It also appends a
//! dead-man's-switch heartbeat to a file on a paired remote experiment.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::bus::data::run_data_proxy;
use crate::bus::{fanout_channel, run_fanin, run_fanout, DataPublisher, IngressMessage};
use crate::config::{HypervisorDoc, SensorDoc};
use crate::monitor::pipeline::FLAVORS;
use crate::monitor::{Monitor, MonitorApp};
use crate::store::{ConfigStore, HypervisorUpdate};
use crate::util::{make_hash, unix_now, ACK_HASH_LEN};

/// How often the dispatcher broadcasts `ping`.
const PING_PERIOD: f64 = 5.0;

/// A worker that hasn't ponged for this long gets restarted.
const PING_TIMEOUT: f64 = 30.0;

/// Unacknowledged commands are dropped after this long.
const ACK_TIMEOUT: f64 = 5.0;

/// Hard ceiling on local and ssh subprocess runtime.
const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Subprocess helpers
// ============================================================================

/// Run a shell command locally; stdout goes to the debug log, stderr to
/// the error log. Returns the exit code, -1 on timeout or spawn failure.
pub async fn run_locally(command: &str) -> i32 {
    debug!("Running \"{}\"", command);
    let result = tokio::time::timeout(
        SUBPROCESS_TIMEOUT,
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .output(),
    )
    .await;
    finish_subprocess(command, result)
}

/// Run a command on another host over ssh, `ssh user@host "command"`.
pub async fn run_over_ssh(address: &str, command: &str, port: u16) -> i32 {
    let mut ssh = tokio::process::Command::new("ssh");
    if port != 22 {
        ssh.arg("-p").arg(port.to_string());
    }
    ssh.arg(address).arg(command).stdin(Stdio::null());
    debug!("Running \"ssh {} {}\"", address, command);
    let result = tokio::time::timeout(SUBPROCESS_TIMEOUT, ssh.output()).await;
    finish_subprocess(command, result)
}

fn finish_subprocess(
    command: &str,
    result: Result<std::io::Result<std::process::Output>, tokio::time::error::Elapsed>,
) -> i32 {
    match result {
        Err(_) => {
            error!("Command \"{}\" timed out", command);
            -1
        }
        Ok(Err(e)) => {
            error!("Could not run \"{}\": {}", command, e);
            -1
        }
        Ok(Ok(output)) => {
            if !output.stdout.is_empty() {
                debug!("Stdout: {}", String::from_utf8_lossy(&output.stdout).trim_end());
            }
            if !output.stderr.is_empty() {
                error!("Stderr: {}", String::from_utf8_lossy(&output.stderr).trim_end());
            }
            output.status.code().unwrap_or(-1)
        }
    }
}

// ============================================================================
// Liveness policy
// ============================================================================

/// What the hypervise loop should do about one managed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    /// Managed but not active: start it.
    Start,
    /// Claims to be active but hasn't heartbeated in two periods.
    RestartStaleHeartbeat,
    /// Heartbeats fine but doesn't answer pings.
    RestartUnresponsive,
    /// Leave it alone.
    Leave,
}

pub fn device_action(
    is_active: bool,
    heartbeat_age: Option<f64>,
    pong_age: f64,
    period: f64,
) -> DeviceAction {
    if !is_active {
        return DeviceAction::Start;
    }
    match heartbeat_age {
        Some(age) if age <= 2.0 * period => {
            if pong_age > PING_TIMEOUT {
                DeviceAction::RestartUnresponsive
            } else {
                DeviceAction::Leave
            }
        }
        // no heartbeat at all counts as stale
        _ => DeviceAction::RestartStaleHeartbeat,
    }
}

// ============================================================================
// Sync-signal schedule
// ============================================================================

#[derive(Debug, PartialEq)]
struct SyncEntry {
    due: f64,
    period: u64,
}

impl Eq for SyncEntry {}

impl Ord for SyncEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due
            .total_cmp(&other.due)
            .then(self.period.cmp(&other.period))
    }
}

impl PartialOrd for SyncEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of next-due times, one entry per sync period.
pub struct SyncSchedule {
    queue: BinaryHeap<Reverse<SyncEntry>>,
}

impl SyncSchedule {
    pub fn new(periods: &[u64], now: f64) -> Self {
        let queue = periods
            .iter()
            .map(|&period| {
                Reverse(SyncEntry {
                    due: now + period as f64,
                    period,
                })
            })
            .collect();
        Self { queue }
    }

    pub fn next_due(&self) -> Option<f64> {
        self.queue.peek().map(|Reverse(entry)| entry.due)
    }

    /// Pop every period that is due at `now`, rescheduling each at
    /// `now + period`.
    pub fn pop_due(&mut self, now: f64) -> Vec<u64> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.queue.peek() {
            if entry.due > now {
                break;
            }
            let Reverse(entry) = self.queue.pop().expect("peeked entry exists");
            due.push(entry.period);
            self.queue.push(Reverse(SyncEntry {
                due: now + entry.period as f64,
                period: entry.period,
            }));
        }
        due
    }
}

async fn run_sync_signals(
    publisher: DataPublisher,
    periods: Vec<u64>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut schedule = SyncSchedule::new(&periods, unix_now());
    loop {
        let Some(due) = schedule.next_due() else {
            return;
        };
        let wait = (due - unix_now()).max(0.0);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(wait)) => {
                let now = unix_now();
                for period in schedule.pop_due(now) {
                    let line = format!("X_SYNC_{} {:.3} 0", period, now);
                    if let Err(e) = publisher.send_line(line).await {
                        warn!("Can't publish sync signal: {}", e);
                    }
                }
            }
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return;
                }
            }
        }
    }
}

// ============================================================================
// Command dispatch
// ============================================================================

#[derive(Debug, PartialEq)]
struct QueuedCommand {
    time: f64,
    to: String,
    command: String,
}

impl Eq for QueuedCommand {}

impl Ord for QueuedCommand {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time
            .total_cmp(&other.time)
            .then_with(|| self.to.cmp(&other.to))
            .then_with(|| self.command.cmp(&other.command))
    }
}

impl PartialOrd for QueuedCommand {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Time-ordered queue of addressed commands plus outstanding-ack tracking.
pub(crate) struct DispatchQueue {
    queue: BinaryHeap<Reverse<QueuedCommand>>,
    pending_acks: HashMap<String, (String, f64)>,
}

impl DispatchQueue {
    fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            pending_acks: HashMap::new(),
        }
    }

    fn push(&mut self, time: f64, to: String, command: String) {
        self.queue.push(Reverse(QueuedCommand { time, to, command }));
    }

    fn next_command_in(&self, now: f64) -> Option<f64> {
        self.queue.peek().map(|Reverse(c)| c.time - now)
    }

    /// Commands whose dispatch time has arrived, oldest first.
    fn pop_due(&mut self, now: f64) -> Vec<(String, String)> {
        let mut due = Vec::new();
        while let Some(Reverse(head)) = self.queue.peek() {
            if head.time - now >= 0.001 {
                break;
            }
            let Reverse(cmd) = self.queue.pop().expect("peeked entry exists");
            due.push((cmd.to, cmd.command));
        }
        due
    }

    fn record_sent(&mut self, hash: String, to: String, now: f64) {
        self.pending_acks.insert(hash, (to, now));
    }

    fn acknowledge(&mut self, hash: &str) -> bool {
        self.pending_acks.remove(hash).is_some()
    }

    /// Drop commands nobody acknowledged within the timeout.
    fn expire_acks(&mut self, now: f64) {
        self.pending_acks.retain(|_, (name, sent)| {
            if now - *sent > ACK_TIMEOUT {
                error!(
                    "Command to {} hasn't been ack'd in over {} seconds",
                    name, ACK_TIMEOUT as i64
                );
                false
            } else {
                true
            }
        });
    }
}

// ============================================================================
// The hypervisor itself
// ============================================================================

pub struct Hypervisor {
    experiment: String,
    store: Arc<dyn ConfigStore>,
    debug: bool,
    logbase: String,
    last_pong: DashMap<String, f64>,
}

impl Hypervisor {
    pub fn new(
        experiment: &str,
        store: Arc<dyn ConfigStore>,
        debug: bool,
        logbase: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            experiment: experiment.to_string(),
            store,
            debug,
            logbase: logbase.to_string(),
            last_pong: DashMap::new(),
        })
    }

    fn debug_flag(&self) -> &'static str {
        if self.debug {
            " --debug"
        } else {
            ""
        }
    }

    async fn config(&self) -> anyhow::Result<HypervisorDoc> {
        Ok(self.store.hypervisor_config().await?)
    }

    /// Launch a command on the named host, locally when it is our own.
    async fn run_on(&self, cfg: &HypervisorDoc, host: &str, command: &str) -> i32 {
        if host == cfg.host {
            run_locally(command).await
        } else {
            let username = cfg
                .username
                .clone()
                .or_else(|| std::env::var("USER").ok())
                .unwrap_or_else(|| "labwatch".to_string());
            run_over_ssh(&format!("{}@{}", username, host), command, 22).await
        }
    }

    async fn start_pipeline_monitor(&self, cfg: &HypervisorDoc, flavor: &str) {
        let command = format!(
            "cd {} && ./start_process.sh --{}{}",
            cfg.path,
            flavor,
            self.debug_flag()
        );
        run_locally(&command).await;
        self.last_pong.insert(format!("pl_{}", flavor), unix_now());
    }

    pub async fn start_device(&self, device: &str) -> i32 {
        let Ok(cfg) = self.config().await else {
            return -1;
        };
        let doc = match self.store.get_device(device).await {
            Ok(doc) => doc,
            Err(e) => {
                error!("Can't start unknown device {}: {}", device, e);
                return -1;
            }
        };
        if let Err(e) = self
            .store
            .update_hypervisor(HypervisorUpdate::manage(device))
            .await
        {
            error!("Can't mark {} managed: {}", device, e);
        }
        // a fresh pong deadline so a just-started device isn't instantly
        // flagged unresponsive
        self.last_pong.insert(device.to_string(), unix_now());
        let command = format!(
            "cd {} && ./start_process.sh -d {}{}",
            cfg.path,
            device,
            self.debug_flag()
        );
        self.run_on(&cfg, &doc.host, &command).await
    }

    pub async fn stop_device(&self, device: &str) -> i32 {
        let Ok(cfg) = self.config().await else {
            return -1;
        };
        let Ok(doc) = self.store.get_device(device).await else {
            error!("Can't stop unknown device {}", device);
            return -1;
        };
        if let Err(e) = self
            .store
            .update_hypervisor(HypervisorUpdate::deactivate(device))
            .await
        {
            error!("Can't mark {} inactive: {}", device, e);
        }
        let command = format!("screen -S {} -X quit", device);
        self.run_on(&cfg, &doc.host, &command).await
    }

    /// One pass of the liveness loop.
    async fn hypervise(&self) -> anyhow::Result<Option<f64>> {
        debug!("Hypervising");
        let cfg = self.config().await?;
        let now = unix_now();
        for flavor in FLAVORS {
            let name = format!("pl_{}", flavor);
            let pong_age = now - self.last_pong.get(&name).map(|v| *v).unwrap_or(0.0);
            if pong_age > PING_TIMEOUT {
                warn!("Failed to ping {}, restarting it", name);
                self.start_pipeline_monitor(&cfg, flavor).await;
            }
        }
        for device in &cfg.processes.managed {
            let is_active = cfg.processes.active.contains(device);
            let heartbeat_age = self
                .store
                .get_device_heartbeat(device)
                .await
                .ok()
                .map(|hb| (Utc::now() - hb).num_milliseconds() as f64 / 1000.0);
            let pong_age = now - self.last_pong.get(device).map(|v| *v).unwrap_or(0.0);
            match device_action(is_active, heartbeat_age, pong_age, cfg.period) {
                DeviceAction::Start => {
                    info!("{} is managed but not active, starting it", device);
                    if self.start_device(device).await != 0 {
                        error!("Problem starting {}, check the logs", device);
                    }
                }
                DeviceAction::RestartStaleHeartbeat => {
                    error!(
                        "{} had no heartbeat for {} seconds, it's getting restarted",
                        device,
                        heartbeat_age.map(|a| a as i64).unwrap_or(-1)
                    );
                    if self.start_device(device).await != 0 {
                        error!("Problem starting {}, check the logs", device);
                    } else {
                        info!("{} restarted", device);
                    }
                }
                DeviceAction::RestartUnresponsive => {
                    error!("Failed to ping {}, restarting it", device);
                    self.start_device(device).await;
                }
                DeviceAction::Leave => {
                    debug!(
                        "{} last heartbeat {} seconds ago",
                        device,
                        heartbeat_age.map(|a| a as i64).unwrap_or(-1)
                    );
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.store
            .update_hypervisor(HypervisorUpdate::heartbeat(Utc::now()))
            .await?;
        Ok(Some(self.config().await?.period))
    }

    /// Touch a file on a paired remote host so its watchdog knows this
    /// experiment is alive and whom to page if it isn't.
    async fn send_remote_heartbeat(
        &self,
        target: &crate::config::RemoteHeartbeatDoc,
    ) -> anyhow::Result<Option<f64>> {
        let numbers: Vec<String> = self
            .store
            .contacts()
            .await?
            .into_iter()
            .filter(|c| c.on_shift && !c.sms.is_empty())
            .map(|c| c.sms)
            .collect();
        let path = format!("{}/remote_hb_{}", target.directory, self.experiment);
        run_over_ssh(
            &target.address,
            &format!("date +%s > {}", path),
            target.port,
        )
        .await;
        run_over_ssh(
            &target.address,
            &format!("echo \"{}\" >> {}", numbers.join(","), path),
            target.port,
        )
        .await;
        Ok(None)
    }

    /// Gzip week-old log directories.
    async fn compress_logs(&self) -> anyhow::Result<Option<f64>> {
        let then = Utc::now() - chrono::Duration::days(7);
        let dir = crate::logging::log_dir(&self.logbase, &self.experiment, then.date_naive());
        info!("Compressing logs from {}", then.format("%Y-%m-%d"));
        run_locally(&format!("cd {} && gzip --best *.log", dir.display())).await;
        Ok(None)
    }

    /// Commands addressed to the hypervisor itself.
    pub async fn execute_command(&self, command: &str) {
        info!("Processing {}", command);
        let known = self.store.device_names().await.unwrap_or_default();
        let (verb, target) = match command.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (command, ""),
        };
        match verb {
            "start" => {
                if known.iter().any(|d| d == target) {
                    info!("Hypervisor starting {}", target);
                    self.start_device(target).await;
                } else {
                    error!("Don't know what \"{}\" is, can't start it", target);
                }
            }
            "manage" => {
                if !known.iter().any(|d| d == target) {
                    error!("Hypervisor can't manage {}", target);
                    return;
                }
                info!("Hypervisor now managing {}", target);
                let _ = self
                    .store
                    .update_hypervisor(HypervisorUpdate::manage(target))
                    .await;
            }
            "unmanage" => {
                if !known.iter().any(|d| d == target) {
                    error!("Hypervisor can't unmanage {}", target);
                    return;
                }
                info!("Hypervisor relinquishing control of {}", target);
                let _ = self
                    .store
                    .update_hypervisor(HypervisorUpdate::unmanage(target))
                    .await;
            }
            "kill" => {
                let command = format!("screen -S {} -X quit", target);
                match self.store.get_device(target).await {
                    Ok(doc) => {
                        if let Ok(cfg) = self.config().await {
                            self.run_on(&cfg, &doc.host, &command).await;
                        }
                    }
                    // not a device; assume it's a local process
                    Err(_) => {
                        run_locally(&command).await;
                    }
                }
            }
            _ => error!("Command \"{}\" not understood", command),
        }
    }

    /// The command-bus broker: ingest pongs, envelopes, acks and bare
    /// commands; broadcast pings and due commands; expire stale acks.
    async fn dispatch(
        self: Arc<Self>,
        ingress: TcpListener,
        egress: tokio::sync::broadcast::Sender<String>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let (tx, mut rx) = mpsc::channel::<String>(1024);
        let fanin = tokio::spawn(run_fanin(ingress, tx, cancel.clone()));
        let mut state = DispatchQueue::new();
        let mut last_ping = unix_now();
        loop {
            let now = unix_now();
            let until_ping = last_ping + PING_PERIOD - now;
            let until_command = state.next_command_in(now).unwrap_or(PING_PERIOD);
            let wait = until_ping.min(until_command).max(0.0);
            tokio::select! {
                line = rx.recv() => {
                    let Some(line) = line else { break };
                    let now = unix_now();
                    match IngressMessage::parse(&line) {
                        Ok(IngressMessage::Pong(name)) => {
                            self.last_pong.insert(name, now);
                        }
                        Ok(IngressMessage::Envelope { to, time, command }) => {
                            state.push(time, to, command);
                        }
                        Ok(IngressMessage::Ack { hash, .. }) => {
                            if !state.acknowledge(&hash) {
                                error!("Unknown hash: {}", line);
                            }
                        }
                        Ok(IngressMessage::Bare(command)) => {
                            self.execute_command(&command).await;
                        }
                        Err(e) => error!("Error processing \"{}\": {}", line, e),
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs_f64(wait)) => {}
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
            }
            let now = unix_now();
            if now - last_ping > PING_PERIOD {
                let _ = egress.send("ping".to_string());
                last_ping = now;
            }
            for (to, command) in state.pop_due(now) {
                if to == "hypervisor" {
                    self.execute_command(&command).await;
                } else {
                    let hash = make_hash(
                        [format!("{}", now), to.clone(), command.clone()],
                        ACK_HASH_LEN,
                    );
                    let _ = egress.send(format!("{} {} {}", to, hash, command));
                    state.record_sent(hash, to, now);
                }
            }
            state.expire_acks(now);
        }
        fanin.abort();
    }
}

#[async_trait]
impl MonitorApp for Hypervisor {
    fn name(&self) -> &str {
        "hypervisor"
    }

    async fn setup(self: Arc<Self>, monitor: &Arc<Monitor>) -> anyhow::Result<()> {
        self.store
            .update_hypervisor(HypervisorUpdate::status("online"))
            .await?;
        let cfg = self.config().await?;

        // brokers first, everything else needs them
        let data_send = TcpListener::bind(("0.0.0.0", cfg.comms.data.send)).await?;
        let data_recv = TcpListener::bind(("0.0.0.0", cfg.comms.data.recv)).await?;
        monitor
            .register_task("data_broker", true, move |cancel| {
                Box::pin(run_data_proxy(data_send, data_recv, cancel))
            })
            .await;

        let command_ingress = TcpListener::bind(("0.0.0.0", cfg.comms.command.send)).await?;
        let command_egress = TcpListener::bind(("0.0.0.0", cfg.comms.command.recv)).await?;
        let egress = fanout_channel();
        {
            let egress = egress.clone();
            monitor
                .register_task("command_egress", true, move |cancel| {
                    Box::pin(run_fanout(command_egress, egress, cancel))
                })
                .await;
        }
        {
            let dispatcher = self.clone();
            monitor
                .register_task("dispatch", true, move |cancel| {
                    Box::pin(dispatcher.dispatch(command_ingress, egress, cancel))
                })
                .await;
        }

        // per-host startup activities
        for (host, activities) in &cfg.startup_sequence {
            for activity in activities {
                self.run_on(&cfg, host, activity).await;
            }
        }

        // the three pipeline monitors
        for flavor in FLAVORS {
            self.start_pipeline_monitor(&cfg, flavor).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // fixed-cadence sync signals get fresh synthetic sensors
        self.store.delete_sync_sensors().await?;
        for period in &cfg.sync_periods {
            self.store
                .upsert_sensor(SensorDoc::sync_signal(*period))
                .await?;
        }
        let publisher = DataPublisher::new(&cfg.host, cfg.comms.data.send);
        let periods = cfg.sync_periods.clone();
        monitor
            .register_task("sync_signals", true, move |cancel| {
                Box::pin(run_sync_signals(publisher, periods, cancel))
            })
            .await;

        {
            let compactor = self.clone();
            monitor
                .register_periodic("log_compactor", 86400.0, true, move || {
                    let compactor = compactor.clone();
                    async move { compactor.compress_logs().await }
                })
                .await;
        }

        for (i, target) in cfg.remote_heartbeat.iter().cloned().enumerate() {
            let beeper = self.clone();
            monitor
                .register_periodic(&format!("remote_heartbeat_{}", i), 60.0, true, move || {
                    let beeper = beeper.clone();
                    let target = target.clone();
                    async move { beeper.send_remote_heartbeat(&target).await }
                })
                .await;
        }

        {
            let supervisor = self.clone();
            monitor
                .register_periodic("hypervise", cfg.period, true, move || {
                    let supervisor = supervisor.clone();
                    async move { supervisor.hypervise().await }
                })
                .await;
        }
        Ok(())
    }

    async fn process_command(self: Arc<Self>, _monitor: &Arc<Monitor>, command: &str) {
        self.execute_command(command).await;
    }

    async fn shutdown(self: Arc<Self>, _monitor: &Arc<Monitor>) {
        let managed = match self.config().await {
            Ok(cfg) => cfg.processes.managed,
            Err(_) => Vec::new(),
        };
        for flavor in FLAVORS {
            run_locally(&format!("screen -S pl_{} -X quit", flavor)).await;
            let _ = self
                .store
                .update_hypervisor(HypervisorUpdate::deactivate(format!("pl_{}", flavor)))
                .await;
        }
        for device in managed {
            self.stop_device(&device).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let _ = self
            .store
            .update_hypervisor(HypervisorUpdate::status("offline"))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_action_start_when_inactive() {
        assert_eq!(
            device_action(false, Some(1.0), 1.0, 30.0),
            DeviceAction::Start
        );
    }

    #[test]
    fn test_device_action_restart_on_stale_heartbeat() {
        // two periods is the cutoff
        assert_eq!(
            device_action(true, Some(61.0), 1.0, 30.0),
            DeviceAction::RestartStaleHeartbeat
        );
        assert_eq!(
            device_action(true, Some(59.0), 1.0, 30.0),
            DeviceAction::Leave
        );
        // no heartbeat at all is stale
        assert_eq!(
            device_action(true, None, 1.0, 30.0),
            DeviceAction::RestartStaleHeartbeat
        );
    }

    #[test]
    fn test_device_action_restart_on_silence() {
        assert_eq!(
            device_action(true, Some(5.0), 31.0, 30.0),
            DeviceAction::RestartUnresponsive
        );
        assert_eq!(
            device_action(true, Some(5.0), 29.0, 30.0),
            DeviceAction::Leave
        );
    }

    #[test]
    fn test_sync_schedule_cadence() {
        // over 30 seconds, a 5s signal fires 6 times and a 10s one 3 times
        let mut schedule = SyncSchedule::new(&[5, 10], 0.0);
        let mut fired: HashMap<u64, u32> = HashMap::new();
        let mut now = 0.0;
        while let Some(due) = schedule.next_due() {
            if due > 30.0 {
                break;
            }
            now = due;
            for period in schedule.pop_due(now) {
                *fired.entry(period).or_default() += 1;
            }
        }
        assert_eq!(now, 30.0);
        assert_eq!(fired[&5], 6);
        assert_eq!(fired[&10], 3);
    }

    #[test]
    fn test_dispatch_queue_orders_by_time() {
        let mut queue = DispatchQueue::new();
        queue.push(30.0, "late".to_string(), "cmd".to_string());
        queue.push(10.0, "early".to_string(), "cmd".to_string());
        queue.push(20.0, "middle".to_string(), "cmd".to_string());
        let due = queue.pop_due(100.0);
        let order: Vec<&str> = due.iter().map(|(to, _)| to.as_str()).collect();
        assert_eq!(order, vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_dispatch_queue_holds_future_commands() {
        let mut queue = DispatchQueue::new();
        queue.push(50.0, "later".to_string(), "cmd".to_string());
        assert!(queue.pop_due(10.0).is_empty());
        assert_eq!(queue.next_command_in(10.0), Some(40.0));
        assert_eq!(queue.pop_due(50.0).len(), 1);
    }

    #[test]
    fn test_ack_expiry() {
        let mut queue = DispatchQueue::new();
        queue.record_sent("abc123".to_string(), "pl_alarm".to_string(), 0.0);
        queue.expire_acks(ACK_TIMEOUT - 1.0);
        assert!(queue.acknowledge("abc123"));
        // a second ack for the same hash is unknown
        assert!(!queue.acknowledge("abc123"));

        queue.record_sent("def456".to_string(), "pl_alarm".to_string(), 0.0);
        queue.expire_acks(ACK_TIMEOUT + 1.0);
        assert!(!queue.acknowledge("def456"));
    }
}
