//! Module framework: uniform stage lifecycle and queue wiring
//!
//! Every stage (capture, sync, encode, mux) implements [`Module`]. A
//! [`ModuleContext`] owns one module, validates lifecycle transitions, holds
//! the queues bound to it and runs the module's `process` loop on a dedicated
//! worker thread while it is running.

use log::{debug, error, info, warn};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::health::{StageHealth, StageProbe, StageRole};
use super::lock;
use super::queue::BoundedQueue;
use super::state::ModuleStatus;
use super::types::{MediaFrame, MediaKind, MuxItem};
use crate::config::ConfigMap;
use crate::error::{Error, Result};

/// What travels over a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Raw [`MediaFrame`]s
    Frames,
    /// [`MuxItem`]s (track table, then compressed packets)
    Packets,
}

/// One declared input or output port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpec {
    pub kind: LinkKind,
    /// Media carried, when the port is specific to one stream
    pub media: Option<MediaKind>,
}

impl PortSpec {
    pub const fn frames(media: Option<MediaKind>) -> Self {
        Self {
            kind: LinkKind::Frames,
            media,
        }
    }

    pub const fn packets() -> Self {
        Self {
            kind: LinkKind::Packets,
            media: None,
        }
    }

    fn accepts(&self, upstream: &PortSpec) -> bool {
        self.kind == upstream.kind
            && match (self.media, upstream.media) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

/// Port declaration of a module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ports {
    pub inputs: Vec<PortSpec>,
    pub output: Option<PortSpec>,
}

/// A bounded queue shared by two modules
#[derive(Clone)]
pub enum Link {
    Frames(Arc<BoundedQueue<MediaFrame>>),
    Packets(Arc<BoundedQueue<MuxItem>>),
}

impl Link {
    fn allocate(kind: LinkKind, queue_size: usize) -> Result<Self> {
        Ok(match kind {
            LinkKind::Frames => Link::Frames(Arc::new(BoundedQueue::new(queue_size)?)),
            LinkKind::Packets => Link::Packets(Arc::new(BoundedQueue::new(queue_size)?)),
        })
    }

    pub fn kind(&self) -> LinkKind {
        match self {
            Link::Frames(_) => LinkKind::Frames,
            Link::Packets(_) => LinkKind::Packets,
        }
    }

    pub fn close(&self) {
        match self {
            Link::Frames(q) => q.close(),
            Link::Packets(q) => q.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Link::Frames(q) => q.is_closed(),
            Link::Packets(q) => q.is_closed(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Link::Frames(q) => q.len(),
            Link::Packets(q) => q.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        match self {
            Link::Frames(q) => q.capacity(),
            Link::Packets(q) => q.capacity(),
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("kind", &self.kind())
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Queues bound to a module, handed over at `start`
#[derive(Debug, Clone, Default)]
pub struct Wiring {
    inputs: Vec<Option<Link>>,
    output: Option<Link>,
}

impl Wiring {
    pub fn new(inputs: Vec<Option<Link>>, output: Option<Link>) -> Self {
        Self { inputs, output }
    }

    fn input(&self, port: usize) -> Result<&Link> {
        self.inputs
            .get(port)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::InvalidParameter(format!("input port {} is not connected", port)))
    }

    fn output(&self) -> Result<&Link> {
        self.output
            .as_ref()
            .ok_or_else(|| Error::InvalidParameter("output port is not connected".into()))
    }

    pub fn frames_in(&self, port: usize) -> Result<Arc<BoundedQueue<MediaFrame>>> {
        match self.input(port)? {
            Link::Frames(q) => Ok(Arc::clone(q)),
            Link::Packets(_) => Err(Error::InvalidParameter(format!(
                "input port {} carries packets, expected frames",
                port
            ))),
        }
    }

    pub fn packets_in(&self, port: usize) -> Result<Arc<BoundedQueue<MuxItem>>> {
        match self.input(port)? {
            Link::Packets(q) => Ok(Arc::clone(q)),
            Link::Frames(_) => Err(Error::InvalidParameter(format!(
                "input port {} carries frames, expected packets",
                port
            ))),
        }
    }

    pub fn frames_out(&self) -> Result<Arc<BoundedQueue<MediaFrame>>> {
        match self.output()? {
            Link::Frames(q) => Ok(Arc::clone(q)),
            Link::Packets(_) => Err(Error::InvalidParameter(
                "output port carries packets, expected frames".into(),
            )),
        }
    }

    pub fn packets_out(&self) -> Result<Arc<BoundedQueue<MuxItem>>> {
        match self.output()? {
            Link::Packets(q) => Ok(Arc::clone(q)),
            Link::Frames(_) => Err(Error::InvalidParameter(
                "output port carries frames, expected packets".into(),
            )),
        }
    }

    fn links(&self) -> impl Iterator<Item = &Link> {
        self.inputs.iter().flatten().chain(self.output.iter())
    }

    fn close_all(&self) {
        for link in self.links() {
            link.close();
        }
    }
}

/// Result of one `process` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Work was done; call again
    Continue,
    /// Nothing to do; the module already waited up to the wait interval
    Idle,
    /// Inputs reached end of stream and the outputs are closed
    Finished,
}

/// A pipeline stage
///
/// `process` must never block longer than the `wait` it is given, so that a
/// stop request is observed within one wait interval.
pub trait Module: Send {
    fn name(&self) -> &str;

    fn role(&self) -> StageRole;

    fn ports(&self) -> Ports;

    fn health(&self) -> Arc<StageHealth>;

    /// Parse configuration and acquire resources
    fn init(&mut self, config: &ConfigMap) -> Result<()>;

    /// Take the bound queues; called on the caller's thread before the worker spawns
    fn start(&mut self, wiring: &Wiring) -> Result<()>;

    /// One step of work, on the worker thread
    fn process(&mut self, wait: Duration) -> Result<Flow>;

    fn pause(&mut self) {}

    fn resume(&mut self) {}

    /// Push out anything buffered
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release runtime resources; called at most once
    fn stop(&mut self) -> Result<()>;

    fn destroy(&mut self) {}
}

/// Worker timing, read from the `"pipeline"` scope
#[derive(Debug, Deserialize)]
#[serde(default)]
pub(crate) struct StageSettings {
    pub(crate) wait_timeout_ms: u64,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self { wait_timeout_ms: 20 }
    }
}

impl StageSettings {
    pub(crate) fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms.max(1))
    }
}

#[derive(Default)]
struct Control {
    running: AtomicBool,
    paused: AtomicBool,
    flush: AtomicBool,
    finished: AtomicBool,
}

/// Lifecycle owner of one module
pub struct ModuleContext {
    name: String,
    role: StageRole,
    ports: Ports,
    module: Option<Box<dyn Module>>,
    worker: Option<JoinHandle<Box<dyn Module>>>,
    status: Arc<Mutex<ModuleStatus>>,
    health: Arc<StageHealth>,
    control: Arc<Control>,
    wiring: Wiring,
    wait: Duration,
    started: bool,
    stop_invoked: bool,
    destroyed: bool,
}

impl ModuleContext {
    pub fn new(module: impl Module + 'static) -> Self {
        Self::from_box(Box::new(module))
    }

    pub fn from_box(module: Box<dyn Module>) -> Self {
        let ports = module.ports();
        Self {
            name: module.name().to_string(),
            role: module.role(),
            health: module.health(),
            wiring: Wiring::new(vec![None; ports.inputs.len()], None),
            ports,
            module: Some(module),
            worker: None,
            status: Arc::new(Mutex::new(ModuleStatus::Uninitialized)),
            control: Arc::new(Control::default()),
            wait: Duration::from_millis(StageSettings::default().wait_timeout_ms),
            started: false,
            stop_invoked: false,
            destroyed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> StageRole {
        self.role
    }

    pub fn ports(&self) -> &Ports {
        &self.ports
    }

    pub fn status(&self) -> ModuleStatus {
        *lock(&self.status)
    }

    /// Last human-readable error recorded for this module
    pub fn last_error(&self) -> Option<String> {
        self.health.last_error()
    }

    pub fn health(&self) -> &Arc<StageHealth> {
        &self.health
    }

    /// Read-only view for statistics polling
    pub fn probe(&self) -> StageProbe {
        StageProbe {
            name: self.name.clone(),
            role: self.role,
            health: Arc::clone(&self.health),
            status: Arc::clone(&self.status),
        }
    }

    /// Whether a worker thread exists (running, paused, or exited but not joined)
    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    /// The worker returned `Flow::Finished`
    pub fn is_finished(&self) -> bool {
        self.control.finished.load(Ordering::Acquire)
    }

    pub fn wait_interval(&self) -> Duration {
        self.wait
    }

    pub fn input(&self, port: usize) -> Option<&Link> {
        self.wiring.inputs.get(port).and_then(Option::as_ref)
    }

    pub fn output(&self) -> Option<&Link> {
        self.wiring.output.as_ref()
    }

    fn set_status(&self, status: ModuleStatus) {
        *lock(&self.status) = status;
    }

    /// Record `err`, move to `Error` and hand the error back
    fn fail(&self, err: Error) -> Error {
        error!("{}: {}", self.name, err);
        self.health.record_error(err.to_string());
        self.set_status(ModuleStatus::Error);
        err
    }

    fn ensure_live(&self, operation: &'static str) -> Result<()> {
        if self.destroyed {
            return Err(Error::invalid_state(operation, "Destroyed"));
        }
        Ok(())
    }

    pub fn init(&mut self, config: &ConfigMap) -> Result<()> {
        self.ensure_live("init")?;
        match self.status() {
            ModuleStatus::Uninitialized => {}
            ModuleStatus::Error => return Err(Error::invalid_state("init", ModuleStatus::Error)),
            _ => return Err(Error::AlreadyInitialized),
        }

        let settings = match config.settings::<StageSettings>("pipeline") {
            Ok(settings) => settings,
            Err(e) => return Err(self.fail(e)),
        };
        self.wait = settings.wait();

        let Some(module) = self.module.as_mut() else {
            return Err(Error::NotInitialized);
        };
        if let Err(e) = module.init(config) {
            return Err(self.fail(e));
        }

        self.set_status(ModuleStatus::Initialized);
        info!("{}: initialized", self.name);
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.ensure_live("start")?;
        match self.status() {
            ModuleStatus::Initialized => {}
            ModuleStatus::Uninitialized => return Err(Error::NotInitialized),
            other => return Err(Error::invalid_state("start", other)),
        }

        for (port, link) in self.wiring.inputs.iter().enumerate() {
            if link.is_none() {
                let err = Error::InvalidParameter(format!("input port {} is not connected", port));
                return Err(self.fail(err));
            }
        }
        if self.ports.output.is_some() && self.wiring.output.is_none() {
            let err = Error::InvalidParameter("output port is not connected".into());
            return Err(self.fail(err));
        }

        let Some(mut module) = self.module.take() else {
            return Err(Error::NotInitialized);
        };
        if let Err(e) = module.start(&self.wiring) {
            self.module = Some(module);
            return Err(self.fail(e));
        }
        self.started = true;

        self.control.finished.store(false, Ordering::Release);
        self.control.paused.store(false, Ordering::Release);
        self.control.running.store(true, Ordering::Release);
        self.set_status(ModuleStatus::Running {
            started_at: Instant::now(),
        });

        let worker = Worker {
            name: self.name.clone(),
            control: Arc::clone(&self.control),
            status: Arc::clone(&self.status),
            health: Arc::clone(&self.health),
            wiring: self.wiring.clone(),
            wait: self.wait,
        };
        let spawned = thread::Builder::new()
            .name(format!("stage-{}", self.name))
            .spawn(move || worker.run(module));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                info!("{}: started", self.name);
                Ok(())
            }
            Err(e) => {
                self.control.running.store(false, Ordering::Release);
                self.wiring.close_all();
                Err(self.fail(Error::Io(e)))
            }
        }
    }

    pub fn pause(&mut self) -> Result<()> {
        self.ensure_live("pause")?;
        let status = self.status();
        let target = ModuleStatus::Paused {
            paused_at: Instant::now(),
        };
        if !status.is_running() {
            return Err(Error::invalid_state("pause", status));
        }
        self.control.paused.store(true, Ordering::Release);
        self.set_status(target);
        info!("{}: paused", self.name);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        self.ensure_live("resume")?;
        let status = self.status();
        if !status.is_paused() {
            return Err(Error::invalid_state("resume", status));
        }
        self.set_status(ModuleStatus::Running {
            started_at: Instant::now(),
        });
        self.control.paused.store(false, Ordering::Release);
        info!("{}: resumed", self.name);
        Ok(())
    }

    /// Ask the module to push out buffered data
    ///
    /// Runs on the worker when one is active, otherwise on the caller.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_live("flush")?;
        let status = self.status();
        if status.is_active() {
            self.control.flush.store(true, Ordering::Release);
            return Ok(());
        }
        if status != ModuleStatus::Initialized {
            return Err(Error::invalid_state("flush", status));
        }
        match self.module.as_mut() {
            Some(module) => module.flush(),
            None => Err(Error::NotInitialized),
        }
    }

    /// Stop the worker and release runtime resources
    ///
    /// Clears the running flag, joins the worker (observed within one wait
    /// interval), calls the module's `stop` and closes every bound queue.
    /// Stopping a stopped module is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        self.ensure_live("stop")?;
        let status = self.status();
        match status {
            ModuleStatus::Stopped => return Ok(()),
            ModuleStatus::Uninitialized | ModuleStatus::Error => {
                return Err(Error::invalid_state("stop", status));
            }
            _ => {}
        }

        self.halt_worker();
        let result = self.stop_module();
        self.wiring.close_all();

        let current = self.status();
        if current.can_transition_to(&ModuleStatus::Stopped) {
            self.set_status(ModuleStatus::Stopped);
        }
        match &result {
            Ok(()) => info!("{}: stopped", self.name),
            Err(e) => {
                self.health.record_error(e.to_string());
                warn!("{}: stop failed: {}", self.name, e);
            }
        }
        result
    }

    /// Stop if needed, then release the module and its queues
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }

        let status = self.status();
        if status.is_error() {
            self.halt_worker();
            if self.started
                && let Err(e) = self.stop_module()
            {
                warn!("{}: stop during destroy failed: {}", self.name, e);
            }
            self.wiring.close_all();
        } else if status != ModuleStatus::Stopped && status != ModuleStatus::Uninitialized {
            // Error already logged and recorded by stop
            let _ = self.stop();
        }

        if let Some(mut module) = self.module.take() {
            module.destroy();
        }
        self.wiring = Wiring::default();
        self.destroyed = true;
        debug!("{}: destroyed", self.name);
    }

    fn halt_worker(&mut self) {
        self.control.running.store(false, Ordering::Release);
        let Some(handle) = self.worker.take() else {
            return;
        };
        match handle.join() {
            Ok(module) => self.module = Some(module),
            Err(_) => {
                let err = Error::Unknown("worker thread panicked".into());
                let _ = self.fail(err);
            }
        }
    }

    fn stop_module(&mut self) -> Result<()> {
        if self.stop_invoked {
            return Ok(());
        }
        let Some(module) = self.module.as_mut() else {
            return Ok(());
        };
        self.stop_invoked = true;
        module.stop()
    }
}

impl Drop for ModuleContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("wiring", &self.wiring)
            .finish()
    }
}

/// State moved onto the worker thread
struct Worker {
    name: String,
    control: Arc<Control>,
    status: Arc<Mutex<ModuleStatus>>,
    health: Arc<StageHealth>,
    wiring: Wiring,
    wait: Duration,
}

impl Worker {
    fn run(self, mut module: Box<dyn Module>) -> Box<dyn Module> {
        let mut was_paused = false;

        while self.control.running.load(Ordering::Acquire) {
            if self.control.paused.load(Ordering::Acquire) {
                if !was_paused {
                    module.pause();
                    was_paused = true;
                }
                thread::sleep(self.wait);
                continue;
            }
            if was_paused {
                module.resume();
                was_paused = false;
            }

            let step = if self.control.flush.swap(false, Ordering::AcqRel) {
                module.flush().map(|_| Flow::Continue)
            } else {
                module.process(self.wait)
            };

            match step {
                Ok(Flow::Continue) | Ok(Flow::Idle) => {}
                Ok(Flow::Finished) => {
                    info!("{}: end of stream", self.name);
                    self.control.finished.store(true, Ordering::Release);
                    break;
                }
                Err(e) => {
                    error!("{}: {}", self.name, e);
                    self.health.record_error(e.to_string());
                    *lock(&self.status) = ModuleStatus::Error;
                    // Neighbours observe end of stream instead of blocking forever
                    self.wiring.close_all();
                    break;
                }
            }
        }

        module
    }
}

/// Wire `producer`'s output to a free, compatible input of `consumer`
///
/// Allocates one bounded queue of `queue_size` slots (`0` for the default).
/// Either both modules end up bound to the new queue or neither is touched.
pub fn connect(
    producer: &mut ModuleContext,
    consumer: &mut ModuleContext,
    queue_size: usize,
) -> Result<Link> {
    for ctx in [&*producer, &*consumer] {
        ctx.ensure_live("connect")?;
        let status = ctx.status();
        if !matches!(
            status,
            ModuleStatus::Uninitialized | ModuleStatus::Initialized
        ) {
            return Err(Error::invalid_state("connect", status));
        }
    }

    let Some(upstream) = producer.ports.output else {
        return Err(Error::InvalidParameter(format!(
            "{} has no output port",
            producer.name
        )));
    };
    if producer.wiring.output.is_some() {
        return Err(Error::InvalidParameter(format!(
            "{} output is already connected",
            producer.name
        )));
    }

    let port = consumer
        .ports
        .inputs
        .iter()
        .enumerate()
        .position(|(i, spec)| consumer.wiring.inputs[i].is_none() && spec.accepts(&upstream))
        .ok_or_else(|| {
            Error::InvalidParameter(format!(
                "{} has no free input accepting {:?} from {}",
                consumer.name, upstream.kind, producer.name
            ))
        })?;

    let link = Link::allocate(upstream.kind, queue_size)?;
    producer.wiring.output = Some(link.clone());
    consumer.wiring.inputs[port] = Some(link.clone());

    info!(
        "Pipeline: connected {} -> {} (port {}, {} slots)",
        producer.name,
        consumer.name,
        port,
        link.capacity()
    );
    Ok(link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::frame::{AudioFrame, SampleFormat};
    use crate::pipeline::queue::PopError;
    use crate::pipeline::types::Timestamp;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct Calls {
        init: AtomicU32,
        start: AtomicU32,
        stop: AtomicU32,
        destroy: AtomicU32,
        pause: AtomicU32,
        resume: AtomicU32,
    }

    /// Emits `limit` audio frames, then closes its output
    struct Emitter {
        limit: usize,
        emitted: usize,
        fail_at: Option<usize>,
        fail_init: bool,
        output: Option<Arc<BoundedQueue<MediaFrame>>>,
        calls: Arc<Calls>,
        health: Arc<StageHealth>,
    }

    impl Emitter {
        fn new(limit: usize, calls: Arc<Calls>) -> Self {
            Self {
                limit,
                emitted: 0,
                fail_at: None,
                fail_init: false,
                output: None,
                calls,
                health: Arc::new(StageHealth::new()),
            }
        }
    }

    impl Module for Emitter {
        fn name(&self) -> &str {
            "emitter"
        }

        fn role(&self) -> StageRole {
            StageRole::Capture
        }

        fn ports(&self) -> Ports {
            Ports {
                inputs: vec![],
                output: Some(PortSpec::frames(Some(MediaKind::Audio))),
            }
        }

        fn health(&self) -> Arc<StageHealth> {
            Arc::clone(&self.health)
        }

        fn init(&mut self, _config: &ConfigMap) -> Result<()> {
            self.calls.init.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                return Err(Error::Unsupported("emitter".into()));
            }
            Ok(())
        }

        fn start(&mut self, wiring: &Wiring) -> Result<()> {
            self.calls.start.fetch_add(1, Ordering::SeqCst);
            self.output = Some(wiring.frames_out()?);
            Ok(())
        }

        fn process(&mut self, wait: Duration) -> Result<Flow> {
            let Some(output) = &self.output else {
                return Err(Error::NotInitialized);
            };
            if Some(self.emitted) == self.fail_at {
                return Err(Error::Encoding("scripted failure".into()));
            }
            if self.emitted == self.limit {
                output.close();
                return Ok(Flow::Finished);
            }
            let pts = Timestamp::from_micros(self.emitted as i64 * 20_000);
            let frame = AudioFrame::new(48_000, 2, SampleFormat::F32, 960, pts)?;
            match output.push(MediaFrame::Audio(frame), wait) {
                Ok(()) => {
                    self.emitted += 1;
                    self.health.record_frame(0, false);
                    Ok(Flow::Continue)
                }
                Err(_) => Ok(Flow::Idle),
            }
        }

        fn pause(&mut self) {
            self.calls.pause.fetch_add(1, Ordering::SeqCst);
        }

        fn resume(&mut self) {
            self.calls.resume.fetch_add(1, Ordering::SeqCst);
        }

        fn stop(&mut self) -> Result<()> {
            self.calls.stop.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn destroy(&mut self) {
            self.calls.destroy.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Consumes frames into a shared vector
    struct Collector {
        input: Option<Arc<BoundedQueue<MediaFrame>>>,
        seen: Arc<Mutex<Vec<Timestamp>>>,
        health: Arc<StageHealth>,
    }

    impl Collector {
        fn new(seen: Arc<Mutex<Vec<Timestamp>>>) -> Self {
            Self {
                input: None,
                seen,
                health: Arc::new(StageHealth::new()),
            }
        }
    }

    impl Module for Collector {
        fn name(&self) -> &str {
            "collector"
        }

        fn role(&self) -> StageRole {
            StageRole::Mux
        }

        fn ports(&self) -> Ports {
            Ports {
                inputs: vec![PortSpec::frames(None)],
                output: None,
            }
        }

        fn health(&self) -> Arc<StageHealth> {
            Arc::clone(&self.health)
        }

        fn init(&mut self, _config: &ConfigMap) -> Result<()> {
            Ok(())
        }

        fn start(&mut self, wiring: &Wiring) -> Result<()> {
            self.input = Some(wiring.frames_in(0)?);
            Ok(())
        }

        fn process(&mut self, wait: Duration) -> Result<Flow> {
            let Some(input) = &self.input else {
                return Err(Error::NotInitialized);
            };
            match input.pop(wait) {
                Ok(frame) => {
                    lock(&self.seen).push(frame.pts());
                    Ok(Flow::Continue)
                }
                Err(PopError::Empty) => Ok(Flow::Idle),
                Err(PopError::Closed) => Ok(Flow::Finished),
            }
        }

        fn stop(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_lifecycle_order_enforced() {
        let calls = Arc::new(Calls::default());
        let mut ctx = ModuleContext::new(Emitter::new(0, calls.clone()));
        let config = ConfigMap::new();

        assert!(matches!(ctx.start(), Err(Error::NotInitialized)));
        assert!(matches!(ctx.pause(), Err(Error::InvalidState { .. })));

        ctx.init(&config).unwrap();
        assert_eq!(ctx.status(), ModuleStatus::Initialized);
        assert!(matches!(ctx.init(&config), Err(Error::AlreadyInitialized)));

        // Output not connected: structural failure, no worker
        assert!(ctx.start().is_err());
        assert!(ctx.status().is_error());
        assert!(!ctx.has_worker());
        assert!(ctx.last_error().is_some());
        assert_eq!(calls.start.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_data_flows_and_finishes() {
        let calls = Arc::new(Calls::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut producer = ModuleContext::new(Emitter::new(10, calls.clone()));
        let mut consumer = ModuleContext::new(Collector::new(seen.clone()));

        connect(&mut producer, &mut consumer, 4).unwrap();
        let config = ConfigMap::new();
        producer.init(&config).unwrap();
        consumer.init(&config).unwrap();
        consumer.start().unwrap();
        producer.start().unwrap();

        assert!(wait_for(|| consumer.is_finished()));
        assert!(producer.is_finished());

        let seen = lock(&seen).clone();
        let expected: Vec<Timestamp> = (0..10).map(|i| Timestamp::from_micros(i * 20_000)).collect();
        assert_eq!(seen, expected);

        producer.stop().unwrap();
        consumer.stop().unwrap();
        assert_eq!(producer.status(), ModuleStatus::Stopped);
        assert_eq!(calls.stop.load(Ordering::SeqCst), 1);
        assert_eq!(producer.health().frames_out(), 10);
    }

    #[test]
    fn test_pause_and_resume_reach_worker() {
        let calls = Arc::new(Calls::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut producer = ModuleContext::new(Emitter::new(1_000_000, calls.clone()));
        let mut consumer = ModuleContext::new(Collector::new(seen));
        connect(&mut producer, &mut consumer, 0).unwrap();
        producer.init(&ConfigMap::new()).unwrap();
        producer.start().unwrap();

        producer.pause().unwrap();
        assert!(producer.status().is_paused());
        assert!(wait_for(|| calls.pause.load(Ordering::SeqCst) == 1));
        assert!(matches!(producer.pause(), Err(Error::InvalidState { .. })));

        producer.resume().unwrap();
        assert!(producer.status().is_running());
        assert!(wait_for(|| calls.resume.load(Ordering::SeqCst) == 1));

        // Consumer never started: the producer fills the queue and idles
        let started = Instant::now();
        producer.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(producer.output().unwrap().is_closed());
    }

    #[test]
    fn test_destroy_stops_exactly_once_from_every_state() {
        let config = ConfigMap::new();

        // Initialized
        let calls = Arc::new(Calls::default());
        let mut ctx = ModuleContext::new(Emitter::new(0, calls.clone()));
        ctx.init(&config).unwrap();
        ctx.destroy();
        assert_eq!(calls.stop.load(Ordering::SeqCst), 1);
        assert_eq!(calls.destroy.load(Ordering::SeqCst), 1);

        // Running, Paused, Stopped
        for target in ["running", "paused", "stopped"] {
            let calls = Arc::new(Calls::default());
            let mut producer = ModuleContext::new(Emitter::new(1_000_000, calls.clone()));
            let mut consumer = ModuleContext::new(Collector::new(Arc::new(Mutex::new(Vec::new()))));
            connect(&mut producer, &mut consumer, 8).unwrap();
            producer.init(&config).unwrap();
            producer.start().unwrap();
            match target {
                "paused" => producer.pause().unwrap(),
                "stopped" => producer.stop().unwrap(),
                _ => {}
            }
            producer.destroy();
            producer.destroy();
            assert_eq!(calls.stop.load(Ordering::SeqCst), 1, "{}", target);
            assert_eq!(calls.destroy.load(Ordering::SeqCst), 1, "{}", target);
            assert!(!producer.has_worker());
        }
    }

    #[test]
    fn test_process_error_moves_to_error_and_closes_queues() {
        let calls = Arc::new(Calls::default());
        let mut emitter = Emitter::new(100, calls.clone());
        emitter.fail_at = Some(3);
        let mut producer = ModuleContext::new(emitter);
        let mut consumer = ModuleContext::new(Collector::new(Arc::new(Mutex::new(Vec::new()))));
        let link = connect(&mut producer, &mut consumer, 16).unwrap();

        producer.init(&ConfigMap::new()).unwrap();
        producer.start().unwrap();

        assert!(wait_for(|| producer.status().is_error()));
        assert!(link.is_closed());
        assert_eq!(link.len(), 3);
        assert!(producer.last_error().unwrap().contains("scripted failure"));

        // Error is terminal: cannot stop or restart, only destroy
        assert!(matches!(producer.stop(), Err(Error::InvalidState { .. })));
        assert!(matches!(producer.start(), Err(Error::InvalidState { .. })));
        producer.destroy();
        assert_eq!(calls.stop.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_init_failure_prevents_start() {
        let calls = Arc::new(Calls::default());
        let mut emitter = Emitter::new(1, calls.clone());
        emitter.fail_init = true;
        let mut ctx = ModuleContext::new(emitter);

        let err = ctx.init(&ConfigMap::new()).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert!(ctx.status().is_error());
        assert!(ctx.start().is_err());
        assert!(!ctx.has_worker());

        ctx.destroy();
        assert_eq!(calls.stop.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_connect_checks_kinds_and_binds_nothing_on_failure() {
        let mut a = ModuleContext::new(Emitter::new(0, Arc::new(Calls::default())));
        let mut b = ModuleContext::new(Emitter::new(0, Arc::new(Calls::default())));

        // An emitter has no input port
        assert!(matches!(connect(&mut a, &mut b, 4), Err(Error::InvalidParameter(_))));
        assert!(a.output().is_none());

        let mut sink = ModuleContext::new(Collector::new(Arc::new(Mutex::new(Vec::new()))));
        let err = connect(&mut a, &mut sink, usize::MAX).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory(_)));
        assert!(a.output().is_none());
        assert!(sink.input(0).is_none());

        connect(&mut a, &mut sink, 0).unwrap();
        assert_eq!(a.output().unwrap().capacity(), 32);
        // Both ends are taken now
        assert!(connect(&mut b, &mut sink, 4).is_err());
        assert!(b.output().is_none());
    }

    #[test]
    fn test_wait_interval_from_config() {
        let mut ctx = ModuleContext::new(Emitter::new(0, Arc::new(Calls::default())));
        let config = ConfigMap::from_json_str(r#"{"pipeline": {"wait_timeout_ms": 7}}"#).unwrap();
        ctx.init(&config).unwrap();
        assert_eq!(ctx.wait_interval(), Duration::from_millis(7));
    }
}
