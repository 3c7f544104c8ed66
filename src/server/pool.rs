//! Bounded worker pool dengan permit.
//!
//! Prinsip desain:
//! - Kapasitas dipesan (`acquire`) SEBELUM accept, jadi koneksi baru tetap
//!   di backlog OS selama semua worker sibuk
//! - `in_flight` hanya diubah di bawah lock pool
//! - Tunggu kapasitas pakai condvar, bukan busy-poll

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct State {
    queue: VecDeque<Job>,
    in_flight: usize,
    /// Gate closed: `acquire` returns `None`, workers exit once the queue
    /// drains and no permit is outstanding.
    closed: bool,
}

impl State {
    fn drained(&self) -> bool {
        self.closed && self.queue.is_empty() && self.in_flight == 0
    }
}

struct Inner {
    state: Mutex<State>,
    job_ready: Condvar,
    capacity_freed: Condvar,
    max_workers: usize,
}

impl Inner {
    fn close(&self) {
        self.state.lock().closed = true;
        self.capacity_freed.notify_all();
        self.job_ready.notify_all();
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.in_flight -= 1;
        trace!(in_flight = state.in_flight, "permit released");
        let drained = state.drained();
        drop(state);
        self.capacity_freed.notify_one();
        if drained {
            self.job_ready.notify_all();
        }
    }
}

/// Reservation of one worker slot. Released when its job finishes, or on
/// drop if it is never used.
#[must_use = "an unused permit holds a worker slot until dropped"]
pub struct Permit {
    inner: Arc<Inner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// Fixed set of worker threads executing at most `max_workers` jobs at once.
pub struct WorkerPool {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `max_workers` worker threads.
    ///
    /// # Panics
    /// Panic jika `max_workers == 0`
    pub fn new(max_workers: usize) -> io::Result<Self> {
        assert!(max_workers > 0, "worker pool needs at least one worker");

        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(max_workers),
                in_flight: 0,
                closed: false,
            }),
            job_ready: Condvar::new(),
            capacity_freed: Condvar::new(),
            max_workers,
        });

        let mut pool = Self {
            inner,
            workers: Vec::with_capacity(max_workers),
        };
        for id in 0..max_workers {
            let inner = Arc::clone(&pool.inner);
            let handle = thread::Builder::new()
                .name(format!("netkit-worker-{}", id))
                .spawn(move || worker_loop(id, &inner))?;
            pool.workers.push(handle);
        }

        debug!(max_workers, "worker pool started");
        Ok(pool)
    }

    /// Block until a worker slot is free and reserve it.
    ///
    /// Returns `None` once the pool is closed.
    pub fn acquire(&self) -> Option<Permit> {
        let mut state = self.inner.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if state.in_flight < self.inner.max_workers {
                state.in_flight += 1;
                return Some(Permit {
                    inner: Arc::clone(&self.inner),
                });
            }
            self.inner.capacity_freed.wait(&mut state);
        }
    }

    /// Reserve a slot without blocking.
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut state = self.inner.state.lock();
        if state.closed || state.in_flight >= self.inner.max_workers {
            return None;
        }
        state.in_flight += 1;
        Some(Permit {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Queue `job` on the slot reserved by `permit`.
    ///
    /// Workers outlive `close` while permits are outstanding, so a permit
    /// acquired before `close` still gets its job run.
    pub fn execute<F>(&self, permit: Permit, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(move || {
            // Permit dilepas saat job selesai, termasuk saat panic
            let _permit = permit;
            job();
        });

        self.inner.state.lock().queue.push_back(job);
        self.inner.job_ready.notify_one();
    }

    /// Close the gate: pending and future `acquire` calls return `None`.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    #[inline]
    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Slots reserved or running.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight
    }

    /// Free worker slots.
    pub fn available(&self) -> usize {
        self.inner.max_workers - self.in_flight()
    }

    /// Read-only view of the pool's counters that can also close the gate.
    /// Holding it does not keep worker threads alive.
    pub fn gauge(&self) -> PoolGauge {
        PoolGauge {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Close the pool and wait until every queued job has run.
    ///
    /// Blocks while any permit is still held outside the pool.
    pub fn join(mut self) {
        self.close();
        for handle in std::mem::take(&mut self.workers) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Worker dilepas (detach): keluar sendiri setelah antrean habis dan
        // semua permit kembali
        self.close();
    }
}

/// Counters of a [`WorkerPool`].
#[derive(Clone)]
pub struct PoolGauge {
    inner: Arc<Inner>,
}

impl PoolGauge {
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight
    }

    pub fn available(&self) -> usize {
        self.inner.max_workers - self.in_flight()
    }

    #[inline]
    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    pub fn close(&self) {
        self.inner.close();
    }
}

fn worker_loop(id: usize, inner: &Inner) {
    loop {
        let job = {
            let mut state = inner.state.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                if state.drained() {
                    trace!(worker = id, "worker exiting");
                    return;
                }
                inner.job_ready.wait(&mut state);
            }
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            error!(
                worker = id,
                panic = panic_message(&*payload),
                "connection handler panicked"
            );
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}
