use std::sync::Arc;

use rand::rngs::StdRng;
use sysio::sync::{Condvar, Mutex};
use sysio::Event;

use crate::broker::BrokerHandle;
use crate::registry::SessionRegistry;

/// Everything a control-plane handler needs once initialization finishes.
pub struct PipelineHandles {
    pub registry: Arc<SessionRegistry>,
    pub broker: BrokerHandle,
    /// Command source wakeup; signaled after every registry insert.
    pub wakeup: Event,
    /// Session-id generator, seeded from the configured entropy source.
    pub rng: Mutex<StdRng>,
}

/// One-shot gate between the control plane and pipeline initialization.
///
/// The gate starts closed. Initialization opens it exactly once, publishing
/// the pipeline handles; every control handler calls [`wait`](Self::wait)
/// before touching the registry or the broker. Nothing ever holds the gate,
/// so handlers cannot block initialization.
#[derive(Default)]
pub struct InitBarrier {
    handles: Mutex<Option<Arc<PipelineHandles>>>,
    cond: Condvar,
}

impl InitBarrier {
    pub fn new() -> InitBarrier {
        InitBarrier {
            handles: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Opens the barrier. Must be called at most once.
    pub fn open(&self, handles: Arc<PipelineHandles>) {
        let mut slot = self.handles.lock();
        assert!(slot.is_none(), "init barrier opened twice");
        *slot = Some(handles);
        self.cond.notify_all();
    }

    /// Blocks until the barrier has opened, then returns the handles.
    pub fn wait(&self) -> Arc<PipelineHandles> {
        let mut slot = self.handles.lock();
        loop {
            if let Some(handles) = slot.as_ref() {
                return handles.clone();
            }
            slot = self.cond.wait(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::thread;
    use std::time::Duration;

    use crate::broker;
    use crate::message::PipelineMsg;
    use crate::transport::EchoTransport;
    use std::sync::mpsc::sync_channel;

    fn test_handles() -> Arc<PipelineHandles> {
        let registry = Arc::new(SessionRegistry::new());
        let (_tx, rx) = sync_channel::<PipelineMsg>(1);
        let (tx, _rx) = sync_channel::<PipelineMsg>(1);
        let (_broker, handle) = broker::Broker::new(
            Box::new(EchoTransport::new(Duration::ZERO)),
            registry.clone(),
            rx,
            tx,
        );
        Arc::new(PipelineHandles {
            registry,
            broker: handle,
            wakeup: Event::new().unwrap(),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        })
    }

    #[test]
    fn wait_blocks_until_open() {
        let barrier = Arc::new(InitBarrier::new());
        let waiter_barrier = barrier.clone();
        let waiter = thread::spawn(move || waiter_barrier.wait());

        thread::sleep(Duration::from_millis(20));
        barrier.open(test_handles());
        waiter.join().unwrap();
    }

    #[test]
    fn wait_after_open_returns_immediately() {
        let barrier = InitBarrier::new();
        barrier.open(test_handles());
        barrier.wait();
    }
}
