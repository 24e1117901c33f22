use crate::{
    backoff,
    config::ConnectionConfig,
    driver::{Driver, FailureRecord, ProcessOutcome},
    error::{Error, Result},
    job::JobHandler,
    registry::ConnectionRegistry,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{self, Duration},
};

/// Schedule of a worker. Unset fields fall back to the connection's config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerOptions {
    pub connection: Option<String>,
    pub queue: Option<String>,
    pub concurrency: Option<usize>,
    pub interval: Option<Duration>,
    pub timeout: Option<Duration>,
    pub initial_offset: Option<Duration>,
    pub jitter_max: Option<Duration>,
}

impl WorkerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection<S: Into<String>>(mut self, connection: S) -> Self {
        self.connection = Some(connection.into());
        self
    }

    pub fn queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Number of independent polling loops
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Budget of one `process` cycle
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fixed wait before the first poll, replacing the hashed offset
    pub fn initial_offset(mut self, offset: Duration) -> Self {
        self.initial_offset = Some(offset);
        self
    }

    pub fn jitter_max(mut self, jitter: Duration) -> Self {
        self.jitter_max = Some(jitter);
        self
    }

    fn apply(&self, config: &ConnectionConfig) -> ConnectionConfig {
        let mut config = config.clone();
        if let Some(concurrency) = self.concurrency {
            config.worker_concurrency = concurrency;
        }
        if let Some(interval) = self.interval {
            config.worker_interval = interval;
        }
        if let Some(timeout) = self.timeout {
            config.worker_timeout = timeout;
        }
        if self.initial_offset.is_some() {
            config.worker_initial_offset = self.initial_offset;
        }
        if self.jitter_max.is_some() {
            config.worker_jitter_max = self.jitter_max;
        }
        config
    }
}

/// Timing of one polling loop, resolved at start
#[derive(Debug, Clone, Copy)]
struct LoopTiming {
    initial_offset: Duration,
    interval: Duration,
    timeout: Duration,
    jitter_max: Duration,
}

#[derive(Default)]
struct Loops {
    shutdown_tx: Option<broadcast::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

struct WorkerTask {
    name: String,
    options: WorkerOptions,
    registry: Arc<ConnectionRegistry>,
    process_id: u32,
    handler: RwLock<Arc<dyn JobHandler>>,
    registered: AtomicBool,
    loops: Mutex<Loops>,
}

impl WorkerTask {
    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn current_handler(&self) -> Arc<dyn JobHandler> {
        Arc::clone(&self.handler.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn loops(&self) -> std::sync::MutexGuard<'_, Loops> {
        self.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn driver(&self) -> Result<Driver> {
        let driver = match &self.options.connection {
            Some(connection) => self.registry.driver(connection).await?,
            None => self.registry.default_driver().await?,
        };
        Ok(match &self.options.queue {
            Some(queue) => driver.with_queue(queue.clone()),
            None => driver,
        })
    }

    fn timing(&self, driver: &Driver) -> LoopTiming {
        let config = self.options.apply(driver.config());
        let initial_offset = config.worker_initial_offset.unwrap_or_else(|| {
            backoff::initial_offset(
                &self.name,
                driver.connection_name(),
                self.process_id,
                config.worker_interval,
            )
        });
        LoopTiming {
            initial_offset,
            interval: config.worker_interval,
            timeout: config.worker_timeout,
            jitter_max: config.effective_jitter_max(),
        }
    }

    /// One `process` cycle under the timeout. A timed-out cycle keeps running
    /// in the background; the job's lease reclaims it if it never finishes.
    async fn run_once(&self, driver: &Driver, timeout: Duration) {
        let handler = self.current_handler();
        let cycle_driver = driver.clone();
        let cycle = tokio::spawn(async move { cycle_driver.process(handler.as_ref()).await });

        match time::timeout(timeout, cycle).await {
            Ok(Ok(Ok(ProcessOutcome::Idle))) => {}
            Ok(Ok(Ok(outcome))) => {
                log::debug!("Worker {}: {:?}", self.name, outcome);
            }
            Ok(Ok(Err(e))) => {
                log::error!(
                    "Worker {} could not process queue {}: {}",
                    self.name,
                    driver.queue_name(),
                    e
                );
            }
            Ok(Err(e)) => {
                log::error!("Worker {} cycle aborted: {}", self.name, e);
            }
            Err(_) => {
                FailureRecord::new(
                    &Error::WorkerTimeout(timeout),
                    driver.queue_name(),
                    driver.deadletter_name(),
                    None,
                )
                .log();
            }
        }
    }
}

async fn run_loop(
    task: Arc<WorkerTask>,
    driver: Driver,
    timing: LoopTiming,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::select! {
        _ = time::sleep(timing.initial_offset) => {}
        _ = shutdown_rx.recv() => return,
    }

    loop {
        if !task.is_registered() {
            break;
        }

        task.run_once(&driver, timing.timeout).await;

        if !task.is_registered() {
            break;
        }

        let pause = timing.interval + backoff::random_up_to(timing.jitter_max);
        tokio::select! {
            _ = time::sleep(pause) => {}
            _ = shutdown_rx.recv() => break,
        }
    }

    log::debug!("Worker {} loop stopped", task.name);
}

/// Handle to one registered worker
#[derive(Clone)]
pub struct WorkerHandle {
    task: Arc<WorkerTask>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.task.name
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.task.options
    }

    /// Replace the handler and re-arm the worker. The schedule is unchanged;
    /// running loops pick the new handler up on their next cycle.
    pub fn handler(&self, handler: Arc<dyn JobHandler>) -> &Self {
        *self
            .task
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = handler;
        self.task.registered.store(true, Ordering::SeqCst);
        self
    }

    pub fn is_registered(&self) -> bool {
        self.task.is_registered()
    }

    pub fn is_running(&self) -> bool {
        !self.task.loops().handles.is_empty()
    }

    /// Spawn the polling loops. A no-op when the worker is stopped or
    /// already running.
    pub async fn start(&self) -> Result<()> {
        if !self.is_registered() || self.is_running() {
            return Ok(());
        }

        let driver = self.task.driver().await?;
        let timing = self.task.timing(&driver);
        let concurrency = self
            .task
            .options
            .concurrency
            .unwrap_or(driver.config().worker_concurrency)
            .max(1);

        let mut loops = self.task.loops();
        if !self.task.is_registered() || !loops.handles.is_empty() {
            return Ok(());
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        for _ in 0..concurrency {
            loops.handles.push(tokio::spawn(run_loop(
                Arc::clone(&self.task),
                driver.clone(),
                timing,
                shutdown_tx.subscribe(),
            )));
        }
        loops.shutdown_tx = Some(shutdown_tx);

        log::info!(
            "Worker {} started on {}/{} ({} loops, every {:?}, first poll in {:?})",
            self.task.name,
            driver.connection_name(),
            driver.queue_name(),
            concurrency,
            timing.interval,
            timing.initial_offset
        );
        Ok(())
    }

    /// Stop the worker. Pending waits are cancelled at once; a cycle already
    /// in flight finishes but is not rescheduled.
    pub fn stop(&self) {
        self.task.registered.store(false, Ordering::SeqCst);

        let mut loops = self.task.loops();
        let Some(shutdown_tx) = loops.shutdown_tx.take() else {
            return;
        };
        if shutdown_tx.send(()).is_err() {
            log::debug!("Worker {} loops had already exited", self.task.name);
        }
        loops.handles.clear();

        log::info!("Worker {} stopped", self.task.name);
    }
}

/// Owns the named workers of a process
pub struct WorkerScheduler {
    registry: Arc<ConnectionRegistry>,
    process_id: u32,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl WorkerScheduler {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self::with_process_id(registry, std::process::id())
    }

    /// Scheduler hashing initial offsets with an explicit process identity
    pub fn with_process_id(registry: Arc<ConnectionRegistry>, process_id: u32) -> Self {
        Self {
            registry,
            process_id,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn workers(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a worker. Registering a known name replaces its handler only.
    pub fn register_worker<S: Into<String>>(
        &self,
        name: S,
        options: WorkerOptions,
        handler: Arc<dyn JobHandler>,
    ) -> WorkerHandle {
        let name = name.into();
        let mut workers = self.workers();

        if let Some(existing) = workers.get(&name) {
            existing.handler(handler);
            return existing.clone();
        }

        let handle = WorkerHandle {
            task: Arc::new(WorkerTask {
                name: name.clone(),
                options,
                registry: Arc::clone(&self.registry),
                process_id: self.process_id,
                handler: RwLock::new(handler),
                registered: AtomicBool::new(true),
                loops: Mutex::new(Loops::default()),
            }),
        };
        workers.insert(name, handle.clone());
        handle
    }

    pub fn worker(&self, name: &str) -> Option<WorkerHandle> {
        self.workers().get(name).cloned()
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.workers().keys().cloned().collect()
    }

    /// Start every registered worker, stopping at the first setup error
    pub async fn start_all(&self) -> Result<()> {
        let handles: Vec<WorkerHandle> = self.workers().values().cloned().collect();
        for handle in handles {
            handle.start().await?;
        }
        Ok(())
    }

    pub fn stop_all(&self) {
        for handle in self.workers().values() {
            handle.stop();
        }
    }
}

impl Drop for WorkerScheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}
