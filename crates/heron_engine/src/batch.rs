//! Write coalescing: concurrent `batch` callers are merged into a single
//! engine write transaction.
//!
//! The first caller to arrive becomes the leader. It waits up to the batch
//! delay for more callers to join (or until the batch is full), then runs
//! every queued closure inside one transaction and distributes the results.
//! If any closure or the commit fails, the batch falls back to one
//! transaction per closure so a failing member cannot abort the others.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::EngineError;
use crate::store::{Engine, WriteTx};

pub(crate) type BatchFn = Box<dyn FnMut(&mut WriteTx) -> Result<(), EngineError> + Send>;

#[derive(Default)]
struct Slot {
    result: Mutex<Option<Result<(), EngineError>>>,
    done: Condvar,
}

impl Slot {
    fn fill(&self, r: Result<(), EngineError>) {
        let mut g = self.result.lock().unwrap_or_else(|p| p.into_inner());
        *g = Some(r);
        self.done.notify_one();
    }

    fn wait(&self) -> Result<(), EngineError> {
        let mut g = self.result.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(r) = g.take() {
                return r;
            }
            g = self.done.wait(g).unwrap_or_else(|p| p.into_inner());
        }
    }
}

struct Call {
    f: BatchFn,
    slot: Arc<Slot>,
}

#[derive(Default)]
struct Queue {
    calls: Vec<Call>,
    leading: bool,
}

pub(crate) struct Batcher {
    queue: Mutex<Queue>,
    grew: Condvar,
    max_size: usize,
    max_delay: Duration,
}

impl Batcher {
    pub(crate) fn new(max_size: usize, max_delay: Duration) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            grew: Condvar::new(),
            max_size,
            max_delay,
        }
    }

    pub(crate) fn run(&self, engine: &Engine, mut f: BatchFn) -> Result<(), EngineError> {
        if self.max_size <= 1 {
            return engine.update(|tx| f(tx));
        }

        let slot = Arc::new(Slot::default());
        let lead = {
            let mut q = self.queue.lock().unwrap_or_else(|p| p.into_inner());
            q.calls.push(Call { f, slot: slot.clone() });
            let lead = !q.leading;
            if lead {
                q.leading = true;
            }
            self.grew.notify_all();
            lead
        };

        if lead {
            self.lead(engine);
        }
        slot.wait()
    }

    /// Collect joiners until the batch is full or the delay elapses, then run.
    fn lead(&self, engine: &Engine) {
        let deadline = Instant::now() + self.max_delay;
        let calls = {
            let mut q = self.queue.lock().unwrap_or_else(|p| p.into_inner());
            loop {
                if q.calls.len() >= self.max_size {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (g, _) = self
                    .grew
                    .wait_timeout(q, deadline - now)
                    .unwrap_or_else(|p| p.into_inner());
                q = g;
            }
            q.leading = false;
            std::mem::take(&mut q.calls)
        };
        self.execute(engine, calls);
    }

    fn execute(&self, engine: &Engine, mut calls: Vec<Call>) {
        let shared = (|| -> Result<(), EngineError> {
            let mut tx = engine.begin_write()?;
            for call in calls.iter_mut() {
                (call.f)(&mut tx)?;
            }
            tx.commit()?;
            Ok(())
        })();

        match shared {
            Ok(()) => {
                for call in calls {
                    call.slot.fill(Ok(()));
                }
            }
            Err(e) => {
                tracing::debug!(batch = calls.len(), "batch fell back to individual transactions: {e}");
                for mut call in calls {
                    let r = engine.update(|tx| (call.f)(tx));
                    call.slot.fill(r);
                }
            }
        }
    }
}
