//! Asynchronous I/O engine
//!
//! A fixed pool of worker threads services read and write jobs. Each job
//! carries a completion slot; the worker stores the result and signals the
//! slot's condvar, so callers observe completion as an ordinary blocking
//! `wait()` on their own thread.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use super::errors::{DeviceError, DeviceResult};
use super::BlockDevice;

/// Source bytes of a write.
#[derive(Debug, Clone)]
pub enum IoBuffer {
    /// Bytes owned by the job.
    Owned(Vec<u8>),
    /// A window into shared bytes, written without copying.
    Shared {
        data: Arc<[u8]>,
        start: usize,
        len: usize,
    },
}

impl IoBuffer {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            IoBuffer::Owned(v) => v,
            IoBuffer::Shared { data, start, len } => &data[*start..*start + *len],
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct Slot {
    result: Mutex<Option<DeviceResult<Vec<u8>>>>,
    done: Condvar,
}

impl Slot {
    fn complete(&self, result: DeviceResult<Vec<u8>>) {
        let mut guard = self.result.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(result);
        self.done.notify_all();
    }
}

/// Handle to a submitted I/O.
#[derive(Debug)]
pub struct IoCompletion {
    slot: Arc<Slot>,
}

impl IoCompletion {
    fn pending() -> (Self, Arc<Slot>) {
        let slot = Arc::new(Slot::default());
        (Self { slot: slot.clone() }, slot)
    }

    /// A completion that has already finished with `result`.
    pub fn ready(result: DeviceResult<Vec<u8>>) -> Self {
        let (completion, slot) = Self::pending();
        slot.complete(result);
        completion
    }

    /// Whether the I/O has finished.
    pub fn is_done(&self) -> bool {
        self.slot
            .result
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Block until the I/O finishes. Reads return the bytes read; writes
    /// return an empty vector.
    pub fn wait(self) -> DeviceResult<Vec<u8>> {
        let mut guard = self.slot.result.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            guard = self
                .slot
                .done
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

enum Job {
    Read {
        dev: Arc<dyn BlockDevice>,
        offset: u64,
        len: usize,
        slot: Arc<Slot>,
    },
    Write {
        dev: Arc<dyn BlockDevice>,
        offset: u64,
        buf: IoBuffer,
        sync: bool,
        slot: Arc<Slot>,
    },
}

impl Job {
    fn run(self) {
        match self {
            Job::Read {
                dev,
                offset,
                len,
                slot,
            } => {
                let mut buf = vec![0u8; len];
                let result = dev.read_at(offset, &mut buf).map(|_| buf);
                slot.complete(result);
            }
            Job::Write {
                dev,
                offset,
                buf,
                sync,
                slot,
            } => {
                let mut result = dev.write_at(offset, buf.as_slice());
                if result.is_ok() && sync {
                    result = dev.flush();
                }
                slot.complete(result.map(|_| Vec::new()));
            }
        }
    }

    fn abandon(self) {
        let slot = match self {
            Job::Read { slot, .. } | Job::Write { slot, .. } => slot,
        };
        slot.complete(Err(DeviceError::EngineShutDown));
    }
}

/// Worker pool executing device I/O.
#[derive(Debug)]
pub struct IoEngine {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Job::Read { offset, len, .. } => write!(f, "Read({offset}, {len})"),
            Job::Write { offset, buf, .. } => write!(f, "Write({offset}, {})", buf.len()),
        }
    }
}

impl IoEngine {
    /// Start an engine with `threads` workers (at least one).
    pub fn new(threads: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("samwal-io-{i}"))
                    .spawn(move || worker_loop(rx))
            })
            .filter_map(Result::ok)
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Read `len` bytes at `offset`.
    pub fn submit_read(&self, dev: &Arc<dyn BlockDevice>, offset: u64, len: usize) -> IoCompletion {
        let (completion, slot) = IoCompletion::pending();
        self.dispatch(Job::Read {
            dev: dev.clone(),
            offset,
            len,
            slot,
        });
        completion
    }

    /// Write `buf` at `offset`, flushing the device afterwards if `sync`.
    pub fn submit_write(
        &self,
        dev: &Arc<dyn BlockDevice>,
        offset: u64,
        buf: IoBuffer,
        sync: bool,
    ) -> IoCompletion {
        let (completion, slot) = IoCompletion::pending();
        self.dispatch(Job::Write {
            dev: dev.clone(),
            offset,
            buf,
            sync,
            slot,
        });
        completion
    }

    fn dispatch(&self, job: Job) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        match sender.as_ref() {
            Some(tx) => {
                if let Err(mpsc::SendError(job)) = tx.send(job) {
                    job.abandon();
                }
            }
            None => job.abandon(),
        }
    }

    /// Stop accepting jobs, finish queued ones and join the workers.
    pub fn shutdown(&self) {
        drop(
            self.sender
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take(),
        );
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for IoEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let guard = rx.lock().unwrap_or_else(|e| e.into_inner());
            guard.recv()
        };
        match job {
            Ok(job) => job.run(),
            Err(_) => return,
        }
    }
}
