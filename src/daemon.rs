//! Startup wiring and lifecycle.
//!
//! The control socket binds and serves immediately; a dedicated init thread
//! seeds the session-id generator, brings up the transport and the three
//! pipeline stages, then opens the init barrier. Shutdown runs the stages
//! down in pipeline order so every queued response is flushed before the
//! endpoints close.

use std::fs::File;
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use libc::{SIGINT, SIGTERM};
use log::{error, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sysio::sync::Mutex;
use sysio::{register_signal_handler, Event, WorkerThread};

use crate::barrier::{InitBarrier, PipelineHandles};
use crate::broker::{Broker, BrokerHandle};
use crate::config::Config;
use crate::control::ControlPlane;
use crate::registry::SessionRegistry;
use crate::sink::ResponseSink;
use crate::source::CommandSource;
use crate::transport::{self, TpmTransport};

/// Capacity of each inter-stage queue. Bounds the backlog a misbehaving
/// client can build before its reads stall behind the broker.
const PIPELINE_QUEUE_DEPTH: usize = 16;

// Signal handler state: the flag and the eventfd the handler writes.
// Nothing else may run in signal context.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn shutdown_signal_handler(_num: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    let fd = SHUTDOWN_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let v: u64 = 1;
        // SAFETY: write(2) is async-signal-safe and the buffer is a valid
        // u64 for the eventfd.
        let _ = unsafe {
            libc::write(fd, &v as *const u64 as *const libc::c_void, 8)
        };
    }
}

struct Pipeline {
    source: WorkerThread<()>,
    broker_thread: JoinHandle<transport::Result<()>>,
    sink_thread: JoinHandle<()>,
    registry: Arc<SessionRegistry>,
    broker_handle: BrokerHandle,
}

impl Pipeline {
    fn shutdown(self) -> Result<()> {
        // Stage order matters: stopping the source closes its queue, the
        // broker drains and exits, then the sink flushes and exits.
        self.source.stop();
        // Unwedge a broker still waiting on the TPM for a response.
        self.broker_handle.cancel_active();
        let broker_result = self
            .broker_thread
            .join()
            .map_err(|_| anyhow!("broker thread panicked"))?;
        self.sink_thread
            .join()
            .map_err(|_| anyhow!("response sink thread panicked"))?;

        let leftover = self.registry.drain();
        if !leftover.is_empty() {
            info!("closed {} remaining sessions", leftover.len());
        }
        drop(leftover);

        broker_result.map_err(|e| anyhow!("irrecoverable transport fault: {}", e))
    }
}

/// A running daemon.
pub struct Daemon {
    shutdown_evt: Event,
    control: WorkerThread<()>,
    init_thread: JoinHandle<Result<Pipeline>>,
    barrier: Arc<InitBarrier>,
}

impl Daemon {
    /// Binds the control surface and kicks off initialization. Returns as
    /// soon as the control socket is accepting; requests that arrive before
    /// initialization finishes block on the init barrier.
    pub fn start(cfg: Config) -> Result<Daemon> {
        let barrier = Arc::new(InitBarrier::new());
        let control = ControlPlane::bind(&cfg.socket_path, barrier.clone()).with_context(|| {
            format!(
                "failed to bind control socket {}",
                cfg.socket_path.display()
            )
        })?;
        info!("control socket listening at {}", cfg.socket_path.display());
        let control = WorkerThread::start("control", move |kill| control.run(kill))
            .context("failed to start control thread")?;

        let shutdown_evt =
            Event::new().map_err(|e| anyhow!("failed to create shutdown event: {}", e))?;
        let init_shutdown = shutdown_evt
            .try_clone()
            .map_err(|e| anyhow!("failed to clone shutdown event: {}", e))?;
        let init_barrier = barrier.clone();
        let init_thread = thread::Builder::new()
            .name("init".to_owned())
            .spawn(move || {
                let result = init_pipeline(cfg, init_barrier, &init_shutdown);
                if let Err(e) = &result {
                    error!("initialization failed: {:#}", e);
                    let _ = init_shutdown.signal();
                }
                result
            })
            .context("failed to start init thread")?;

        Ok(Daemon {
            shutdown_evt,
            control,
            init_thread,
            barrier,
        })
    }

    /// A handle that requests shutdown when signaled.
    pub fn shutdown_handle(&self) -> sysio::Result<Event> {
        self.shutdown_evt.try_clone()
    }

    /// The session registry. Blocks until initialization has finished.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.barrier.wait().registry.clone()
    }

    /// Waits for a shutdown request, then stops everything in order.
    pub fn run_to_completion(self) -> Result<()> {
        self.shutdown_evt
            .wait()
            .map_err(|e| anyhow!("wait for shutdown failed: {}", e))?;
        info!("shutting down");

        // Control surface first: no new sessions, no new control ops.
        self.control.stop();

        let pipeline = match self.init_thread.join() {
            Ok(result) => result?,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        pipeline.shutdown()
    }
}

/// Parses, starts, serves until a signal arrives, and tears down.
pub fn run(cfg: Config) -> Result<()> {
    let daemon = Daemon::start(cfg)?;
    daemon.run_to_completion()
}

fn seed_rng(path: &Path) -> Result<StdRng> {
    let mut seed = <StdRng as SeedableRng>::Seed::default();
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut seed))
        .with_context(|| format!("failed to read entropy source {}", path.display()))?;
    Ok(StdRng::from_seed(seed))
}

fn init_pipeline(cfg: Config, barrier: Arc<InitBarrier>, shutdown: &Event) -> Result<Pipeline> {
    let rng = seed_rng(&cfg.entropy_source)?;

    // Constructing the transport touches the device, so a broken TPM setup
    // is caught here, before any client traffic is accepted.
    let transport: Box<dyn TpmTransport> =
        transport::new_transport(&cfg.transport, &cfg.transport_options, cfg.max_command_size)
            .context("failed to initialize TPM transport")?;

    let registry = Arc::new(SessionRegistry::new());
    let wakeup = Event::new().map_err(|e| anyhow!("failed to create wakeup event: {}", e))?;
    let (cmd_tx, cmd_rx) = sync_channel(PIPELINE_QUEUE_DEPTH);
    let (rsp_tx, rsp_rx) = sync_channel(PIPELINE_QUEUE_DEPTH);

    let sink = ResponseSink::new(
        registry.clone(),
        rsp_rx,
        wakeup
            .try_clone()
            .map_err(|e| anyhow!("failed to clone wakeup event: {}", e))?,
    );
    let sink_thread = thread::Builder::new()
        .name("response_sink".to_owned())
        .spawn(move || sink.run())
        .context("failed to start response sink thread")?;

    let (broker, broker_handle) = Broker::new(transport, registry.clone(), cmd_rx, rsp_tx);
    let broker_shutdown = shutdown
        .try_clone()
        .map_err(|e| anyhow!("failed to clone shutdown event: {}", e))?;
    let broker_thread = thread::Builder::new()
        .name("tpm_broker".to_owned())
        .spawn(move || {
            let result = broker.run();
            if result.is_err() {
                // Transport faults take the whole daemon down.
                let _ = broker_shutdown.signal();
            }
            result
        })
        .context("failed to start broker thread")?;

    let source = CommandSource::new(
        registry.clone(),
        wakeup
            .try_clone()
            .map_err(|e| anyhow!("failed to clone wakeup event: {}", e))?,
        cmd_tx,
        cfg.max_command_size,
    );
    let source_worker = WorkerThread::start("command_source", move |kill| source.run(kill))
        .context("failed to start command source thread")?;

    if cfg.handle_signals {
        let sig_evt = shutdown
            .try_clone()
            .map_err(|e| anyhow!("failed to clone shutdown event: {}", e))?;
        SHUTDOWN_FD.store(sig_evt.as_raw_fd(), Ordering::SeqCst);
        // The handler owns this descriptor for the rest of the process.
        std::mem::forget(sig_evt);
        // SAFETY: the handler only stores an atomic and writes an eventfd,
        // both async-signal-safe.
        unsafe {
            register_signal_handler(SIGINT, shutdown_signal_handler)
                .and_then(|_| register_signal_handler(SIGTERM, shutdown_signal_handler))
        }
        .map_err(|e| anyhow!("failed to install signal handlers: {}", e))?;
    }

    barrier.open(Arc::new(PipelineHandles {
        registry: registry.clone(),
        broker: broker_handle.clone(),
        wakeup,
        rng: Mutex::new(rng),
    }));
    info!("pipeline initialized, transport {:?}", cfg.transport);

    Ok(Pipeline {
        source: source_worker,
        broker_thread,
        sink_thread,
        registry,
        broker_handle,
    })
}
