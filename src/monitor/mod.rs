//! Process supervision inside one worker.
//!
//! A [`Monitor`] owns a set of named tasks: periodic functions with
//! absolute-deadline scheduling and restart-on-death, plus long-running
//! tasks like pipeline receivers. Every monitor registers two internal
//! tasks through [`run_monitor`]: `check_tasks` (restarts dead periodic
//! tasks every 30 s) and `listen` (the command-bus listener answering
//! pings and dispatching addressed commands).

pub mod alarm;
pub mod pipeline;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{CommandListener, CommandSender, Delivery};
use crate::store::{ConfigStore, HypervisorUpdate};

/// How often dead tasks are checked for and restarted.
const CHECK_TASKS_PERIOD: f64 = 30.0;

/// Grace period for tasks to wind down at shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

type TaskFactory = Arc<dyn Fn(watch::Receiver<bool>) -> BoxFuture<'static, ()> + Send + Sync>;

struct TaskEntry {
    handle: JoinHandle<()>,
    cancel: watch::Sender<bool>,
    restart: Option<TaskFactory>,
}

/// The per-process supervisor.
pub struct Monitor {
    pub name: String,
    pub experiment: String,
    pub store: Arc<dyn ConfigStore>,
    pub commands: Arc<CommandSender>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    no_stop: Mutex<HashSet<String>>,
}

impl Monitor {
    pub fn new(
        name: impl Into<String>,
        experiment: impl Into<String>,
        store: Arc<dyn ConfigStore>,
        commands: Arc<CommandSender>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.into(),
            experiment: experiment.into(),
            store,
            commands,
            shutdown,
            tasks: Mutex::new(HashMap::new()),
            no_stop: Mutex::new(HashSet::new()),
        }
    }

    /// A receiver that flips when the process should wind down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Register a function to run every `period` seconds. Deadlines are
    /// absolute (`loop_top + period`), so a slow invocation doesn't push
    /// later ones back. A callable returning `Ok(Some(p))` re-periods
    /// itself to `p`. Dead periodic tasks are restarted by `check_tasks`.
    pub async fn register_periodic<F, Fut>(
        &self,
        name: &str,
        period: f64,
        no_stop: bool,
        callable: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Option<f64>>> + Send + 'static,
    {
        let callable = Arc::new(callable);
        let task_name = name.to_string();
        let factory: TaskFactory = Arc::new(move |mut cancel| {
            let callable = callable.clone();
            let name = task_name.clone();
            let mut period = period;
            Box::pin(async move {
                info!("Starting {}", name);
                loop {
                    let loop_top = tokio::time::Instant::now();
                    debug!("Running {}", name);
                    match callable().await {
                        Ok(Some(new_period)) if new_period > 0.0 => period = new_period,
                        Ok(_) => {}
                        Err(e) => error!("{} failed: {}", name, e),
                    }
                    let deadline = loop_top + Duration::from_secs_f64(period.max(0.001));
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = cancel.changed() => {
                            if *cancel.borrow() {
                                break;
                            }
                        }
                    }
                }
                info!("Returning {}", name);
            })
        });
        self.spawn_entry(name, factory, true, no_stop).await;
    }

    /// Register a long-running task. It must watch the passed cancel
    /// receiver; it is not restarted if it dies.
    pub async fn register_task<F>(&self, name: &str, no_stop: bool, make: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> BoxFuture<'static, ()>,
    {
        info!("Registering {}", name);
        let (cancel, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(make(cancel_rx));
        if no_stop {
            self.no_stop.lock().await.insert(name.to_string());
        }
        self.tasks.lock().await.insert(
            name.to_string(),
            TaskEntry {
                handle,
                cancel,
                restart: None,
            },
        );
    }

    async fn spawn_entry(&self, name: &str, factory: TaskFactory, restart: bool, no_stop: bool) {
        info!("Registering {}", name);
        let (cancel, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(factory(cancel_rx));
        if no_stop {
            self.no_stop.lock().await.insert(name.to_string());
        }
        self.tasks.lock().await.insert(
            name.to_string(),
            TaskEntry {
                handle,
                cancel,
                restart: restart.then_some(factory),
            },
        );
    }

    /// Stop one task by name; refused for tasks flagged no-stop.
    pub async fn stop_task(&self, name: &str) {
        if self.no_stop.lock().await.contains(name) {
            error!("Asked to stop task {}, but not permitted", name);
            return;
        }
        let entry = self.tasks.lock().await.remove(name);
        match entry {
            Some(entry) => {
                let _ = entry.cancel.send(true);
                if tokio::time::timeout(JOIN_TIMEOUT, entry.handle).await.is_err() {
                    error!("Task {} did not stop in time", name);
                }
            }
            None => error!("Asked to stop task {}, but it isn't registered", name),
        }
    }

    /// Restart any periodic task that died.
    pub async fn check_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        let dead: Vec<String> = tasks
            .iter()
            .filter(|(_, entry)| entry.handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        for name in dead {
            error!("{}-task died", name);
            let Some(entry) = tasks.remove(&name) else {
                continue;
            };
            if let Some(factory) = entry.restart {
                let (cancel, cancel_rx) = watch::channel(false);
                let handle = tokio::spawn(factory(cancel_rx));
                tasks.insert(
                    name,
                    TaskEntry {
                        handle,
                        cancel,
                        restart: Some(factory.clone()),
                    },
                );
            }
        }
    }

    /// Cancel and join everything.
    pub async fn close(&self) {
        self.trigger_shutdown();
        let mut tasks = self.tasks.lock().await;
        let entries: Vec<(String, TaskEntry)> = tasks.drain().collect();
        drop(tasks);
        for (_, entry) in &entries {
            let _ = entry.cancel.send(true);
        }
        for (name, entry) in entries {
            if tokio::time::timeout(JOIN_TIMEOUT, entry.handle).await.is_err() {
                error!("Can't close {}-task", name);
            }
        }
    }
}

/// One kind of worker process: a pipeline monitor, the alarm monitor or
/// the hypervisor. The monitor base handles tasks and commands; the app
/// supplies the substance.
#[async_trait]
pub trait MonitorApp: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn setup(self: Arc<Self>, monitor: &Arc<Monitor>) -> anyhow::Result<()>;

    async fn process_command(self: Arc<Self>, monitor: &Arc<Monitor>, command: &str);

    async fn shutdown(self: Arc<Self>, monitor: &Arc<Monitor>);
}

/// Construct the monitor for an app, wire the internal tasks, wait for a
/// shutdown trigger (signal or `stop` command), then tear down cleanly.
pub async fn run_monitor<A: MonitorApp>(
    app: Arc<A>,
    experiment: &str,
    store: Arc<dyn ConfigStore>,
) -> anyhow::Result<()> {
    let hypervisor_doc = store.hypervisor_config().await?;
    let comms = hypervisor_doc.comms.clone();
    let host = hypervisor_doc.host;
    let commands = Arc::new(CommandSender::new(&host, comms.command.send));
    let monitor = Arc::new(Monitor::new(
        app.name(),
        experiment,
        store.clone(),
        commands,
    ));
    info!("Monitor \"{}\" constructing", monitor.name);
    store
        .update_hypervisor(HypervisorUpdate::activate(app.name()))
        .await?;

    app.clone().setup(&monitor).await?;

    {
        let monitor_ref = monitor.clone();
        monitor
            .register_periodic("check_tasks", CHECK_TASKS_PERIOD, true, move || {
                let monitor = monitor_ref.clone();
                async move {
                    monitor.check_tasks().await;
                    Ok(None)
                }
            })
            .await;
    }
    {
        let monitor_ref = monitor.clone();
        let app_ref = app.clone();
        let listen_host = host.clone();
        monitor
            .register_task("listen", true, move |cancel| {
                Box::pin(run_listener(
                    monitor_ref,
                    app_ref,
                    listen_host,
                    comms.command.recv,
                    cancel,
                ))
            })
            .await;
    }

    tokio::select! {
        _ = monitor.wait_for_shutdown() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt");
            monitor.trigger_shutdown();
        }
    }

    info!("{} shutting down", monitor.name);
    app.shutdown(&monitor).await;
    monitor.close().await;
    store
        .update_hypervisor(HypervisorUpdate::deactivate(monitor.name.clone()))
        .await?;
    Ok(())
}

/// The command listener: answer pings with `pong <name>`, ack and dispatch
/// addressed commands. A `stop` is acked before the shutdown trigger so
/// the broker doesn't flag us as unresponsive.
async fn run_listener<A: MonitorApp>(
    monitor: Arc<Monitor>,
    app: Arc<A>,
    host: String,
    port: u16,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        if *cancel.borrow() {
            return;
        }
        let mut listener = match CommandListener::connect(&host, port, &monitor.name).await {
            Ok(listener) => listener,
            Err(e) => {
                // the broker may simply not be up yet
                warn!("Can't reach the command bus: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    _ = cancel.changed() => return,
                }
            }
        };
        loop {
            tokio::select! {
                line = listener.recv() => {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            warn!("Command listener lost the bus: {}", e);
                            break;
                        }
                    };
                    if line == "ping" || line.starts_with("ping ") {
                        if let Err(e) = monitor.commands.pong(&monitor.name).await {
                            warn!("Can't pong: {}", e);
                        }
                        continue;
                    }
                    let delivery = match Delivery::parse(&line) {
                        Ok(delivery) => delivery,
                        Err(e) => {
                            error!("Malformed command delivery: {}", e);
                            continue;
                        }
                    };
                    if delivery.command == "stop" {
                        // ack first, the shutdown takes us off the bus
                        let _ = monitor.commands.ack(&monitor.name, &delivery.hash).await;
                        monitor.trigger_shutdown();
                        continue;
                    }
                    app.clone()
                        .process_command(&monitor, &delivery.command)
                        .await;
                    if let Err(e) = monitor.commands.ack(&monitor.name, &delivery.hash).await {
                        warn!("Can't ack {}: {}", delivery.hash, e);
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn bare_monitor() -> Monitor {
        Monitor::new(
            "pl_test",
            "testing",
            Arc::new(MemoryStore::new()),
            Arc::new(CommandSender::new("127.0.0.1", 1)),
        )
    }

    #[tokio::test]
    async fn test_periodic_task_runs_repeatedly() {
        let monitor = bare_monitor();
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        monitor
            .register_periodic("tick", 0.01, false, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            })
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        monitor.close().await;
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_returned_period_overrides() {
        let monitor = bare_monitor();
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        // the first invocation stretches the period far beyond the test
        monitor
            .register_periodic("slow", 0.001, false, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(3600.0))
                }
            })
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.close().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_check_tasks_restarts_dead_periodic() {
        let monitor = bare_monitor();
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        monitor
            .register_periodic("flaky", 3600.0, false, move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    panic!("simulated task death");
                }
            })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        monitor.check_tasks().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        monitor.close().await;
    }

    #[tokio::test]
    async fn test_no_stop_tasks_cannot_be_stopped() {
        let monitor = bare_monitor();
        monitor
            .register_periodic("protected", 3600.0, true, || async { Ok(None) })
            .await;
        monitor.stop_task("protected").await;
        assert!(monitor.tasks.lock().await.contains_key("protected"));
        monitor.close().await;
    }

    #[tokio::test]
    async fn test_stop_task_removes_entry() {
        let monitor = bare_monitor();
        monitor
            .register_periodic("ephemeral", 3600.0, false, || async { Ok(None) })
            .await;
        monitor.stop_task("ephemeral").await;
        assert!(!monitor.tasks.lock().await.contains_key("ephemeral"));
        monitor.close().await;
    }
}
