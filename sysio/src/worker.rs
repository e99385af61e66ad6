use std::io;
use std::panic;
use std::thread;
use std::thread::JoinHandle;

use crate::errno;
use crate::event::Event;

/// A worker thread that can be asked to stop by signaling an event.
///
/// The thread function receives a stop [`Event`] and must return once it is
/// signaled. [`stop`](WorkerThread::stop) signals the event and joins;
/// dropping an unstopped worker does the same.
pub struct WorkerThread<T: Send + 'static> {
    worker: Option<(Event, JoinHandle<T>)>,
}

impl<T: Send + 'static> WorkerThread<T> {
    /// Spawns a thread named `thread_name` running `thread_func`.
    pub fn start<F>(thread_name: &str, thread_func: F) -> io::Result<WorkerThread<T>>
    where
        F: FnOnce(Event) -> T + Send + 'static,
    {
        let stop_evt = Event::new().map_err(io::Error::from)?;
        let thread_stop_evt = stop_evt.try_clone().map_err(io::Error::from)?;

        let handle = thread::Builder::new()
            .name(thread_name.to_owned())
            .spawn(move || thread_func(thread_stop_evt))?;

        Ok(WorkerThread {
            worker: Some((stop_evt, handle)),
        })
    }

    /// Signals the stop event and joins the thread, returning its value.
    pub fn stop(mut self) -> T {
        // stop_internal only returns None after a previous stop, which
        // consuming self makes impossible.
        self.stop_internal().expect("worker already stopped")
    }

    /// Signals the stop event without joining. Safe to call repeatedly;
    /// `stop` or drop still joins the thread afterwards.
    pub fn signal(&self) -> errno::Result<()> {
        match &self.worker {
            Some((evt, _)) => evt.signal(),
            None => Ok(()),
        }
    }

    fn stop_internal(&mut self) -> Option<T> {
        self.worker.take().map(|(evt, handle)| {
            // If the event cannot be signaled the thread would never be
            // joined; there is no way to limp on from that.
            evt.signal().expect("failed to signal worker stop event");
            match handle.join() {
                Ok(v) => v,
                Err(e) => panic::resume_unwind(e),
            }
        })
    }
}

impl<T: Send + 'static> Drop for WorkerThread<T> {
    fn drop(&mut self) {
        let _ = self.stop_internal();
    }
}
