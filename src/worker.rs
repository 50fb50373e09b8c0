//! Worker pools behind the prefetcher.
//!
//! Both backends expose the same shape: submit an index, receive `Event`s.
//! - Threads share the source view directly and send results over a channel.
//! - Processes are forked, receive tasks over per-child pipes, and send
//!   results back through shared-memory slots or in-band frames. A reader
//!   thread per child decodes results as they arrive and recycles slots.
//!
//! Worker death is observable in both cases: every worker announces its exit,
//! and a missing announcement (result pipe closing without a goodbye) is
//! reported as an unclean exit.

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::protocol::{self, ResultMsg, TaskMsg};
use crate::slot::{SlotError, SlotId, SlotPool, SlotWriter};
use crate::view::{SequenceView, ViewError};

/// How long a stopping pool waits for worker processes to exit on their own
/// before resorting to SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Poll interval while waiting for worker processes to exit.
const REAP_POLL: Duration = Duration::from_millis(5);

/// Tasks a single worker process may hold at once: one being computed plus
/// one queued in its pipe, so it never stalls on the scheduler round-trip.
const WORKER_QUEUE_DEPTH: usize = 2;

/// What a pool reports back to the scheduler.
pub(crate) enum Event<T> {
    /// Index `index` finished: either its value or its per-element error.
    Done { worker: usize, index: usize, result: Result<T, ViewError> },
    /// A worker is gone. `clean` means it was told to stop and said goodbye;
    /// anything else is a crash.
    Exited { worker: usize, clean: bool },
}

// ========================================================================
// THREAD BACKEND
// ========================================================================

pub(crate) struct ThreadPool<T> {
    task_tx: Option<Sender<usize>>,
    events: Receiver<Event<T>>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> ThreadPool<T> {
    pub(crate) fn spawn<V>(view: Arc<V>, nworkers: usize, max_buffered: usize) -> Self
    where
        V: SequenceView<Item = T> + Send + Sync + 'static,
    {
        // Tasks in the queue never exceed the issue window, and events never
        // exceed the window plus one goodbye per worker, so neither side of
        // either channel can block indefinitely.
        let (task_tx, task_rx) = bounded::<usize>(max_buffered);
        let (event_tx, events) = bounded::<Event<T>>(max_buffered + nworkers);
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(nworkers);
        for worker in 0..nworkers {
            let view = Arc::clone(&view);
            let tasks = task_rx.clone();
            let results = event_tx.clone();
            let stop = Arc::clone(&stop);
            handles.push(thread::spawn(move || worker_loop(worker, view, tasks, results, stop)));
        }
        ThreadPool { task_tx: Some(task_tx), events, stop, handles }
    }
}

impl<T> ThreadPool<T> {
    fn submit(&self, index: usize) {
        if let Some(tx) = &self.task_tx {
            if tx.send(index).is_err() {
                debug!("task queue closed before index {index} could be issued");
            }
        }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Closing the task channel wakes every idle worker; the stop flag
        // makes the busy ones skip whatever is still queued.
        self.task_tx = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        while self.events.try_recv().is_ok() {}
    }
}

impl<T> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Announces the worker's exit when the loop ends for any reason, including
/// a panic in `SequenceView::get`.
struct ExitSentinel<T> {
    worker: usize,
    results: Sender<Event<T>>,
    clean: bool,
}

impl<T> Drop for ExitSentinel<T> {
    fn drop(&mut self) {
        let _ = self.results.send(Event::Exited { worker: self.worker, clean: self.clean });
    }
}

fn worker_loop<V, T>(
    worker: usize,
    view: Arc<V>,
    tasks: Receiver<usize>,
    results: Sender<Event<T>>,
    stop: Arc<AtomicBool>,
) where
    V: SequenceView<Item = T> + Send + Sync,
    T: Send,
{
    let mut sentinel = ExitSentinel { worker, results: results.clone(), clean: false };
    while let Ok(index) = tasks.recv() {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let result = view.get(index);
        if results.send(Event::Done { worker, index, result }).is_err() {
            break;
        }
    }
    sentinel.clean = true;
}

// ========================================================================
// PROCESS BACKEND
// ========================================================================

struct Child {
    pid: libc::pid_t,
    /// Task pipe write end. `None` once a stop was sent or a write failed.
    task_w: Option<File>,
    /// Tasks sent to this child that have not produced a result yet.
    outstanding: usize,
    reaped: bool,
}

pub(crate) struct ProcessPool<T> {
    children: Vec<Child>,
    /// Indices accepted but not yet written to any child's pipe.
    backlog: VecDeque<usize>,
    slots: Option<Arc<SlotPool>>,
    readers: Vec<JoinHandle<()>>,
    events: Receiver<Event<T>>,
    stopped: bool,
}

impl<T> ProcessPool<T>
where
    T: Send + Serialize + DeserializeOwned + 'static,
{
    pub(crate) fn spawn<V>(
        view: Arc<V>,
        nworkers: usize,
        max_buffered: usize,
        slot_bytes: Option<usize>,
    ) -> io::Result<Self>
    where
        V: SequenceView<Item = T> + Send + Sync + 'static,
    {
        let mut pool = match slot_bytes {
            Some(bytes) => Some(SlotPool::new(max_buffered, bytes)?),
            None => None,
        };
        // The raw mapping handle must exist before forking so children
        // inherit the same addresses.
        let writer = pool.as_mut().map(|p| p.writer());
        let slots = pool.map(Arc::new);

        let (event_tx, events) = bounded::<Event<T>>(max_buffered + nworkers);
        let mut children: Vec<Child> = Vec::with_capacity(nworkers);
        let mut result_pipes: Vec<File> = Vec::with_capacity(nworkers);

        for _ in 0..nworkers {
            let pipes = protocol::pipe().and_then(|t| protocol::pipe().map(|r| (t, r)));
            let ((task_r, task_w), (result_r, result_w)) = match pipes {
                Ok(p) => p,
                Err(e) => {
                    kill_children(&mut children);
                    return Err(e);
                }
            };
            // SAFETY: fork(2); the child branch touches only what it owns and
            // leaves through _exit without unwinding.
            let pid = unsafe { libc::fork() };
            if pid < 0 {
                let e = io::Error::last_os_error();
                kill_children(&mut children);
                return Err(e);
            }
            if pid == 0 {
                // Child: close every descriptor inherited from earlier
                // siblings and the parent ends of its own pipes, then serve.
                drop(children);
                drop(result_pipes);
                drop(task_w);
                drop(result_r);
                child_serve(task_r, result_w, view.as_ref(), writer);
                // SAFETY: never unwind back into the forked copy of the
                // parent's stack; skip destructors and leave immediately.
                unsafe { libc::_exit(0) };
            }
            children.push(Child { pid, task_w: Some(task_w), outstanding: 0, reaped: false });
            result_pipes.push(result_r);
            // task_r and result_w drop here, closing the parent's copies so
            // the child's exit is visible as EOF on its result pipe.
        }

        // Readers attach only after every fork so no child inherits them.
        let mut readers = Vec::with_capacity(nworkers);
        for (worker, result_r) in result_pipes.into_iter().enumerate() {
            let tx = event_tx.clone();
            let pool = slots.clone();
            readers.push(thread::spawn(move || read_results(worker, result_r, tx, pool)));
        }

        Ok(ProcessPool { children, backlog: VecDeque::new(), slots, readers, events, stopped: false })
    }
}

impl<T> ProcessPool<T> {
    fn submit(&mut self, index: usize) {
        self.backlog.push_back(index);
        self.flush_backlog();
    }

    fn task_finished(&mut self, worker: usize) {
        if let Some(child) = self.children.get_mut(worker) {
            child.outstanding = child.outstanding.saturating_sub(1);
        }
        self.flush_backlog();
    }

    /// Hands backlog entries to the least-loaded children that still have
    /// queue room, so every child keeps a task ready behind the one it is
    /// computing.
    fn flush_backlog(&mut self) {
        while !self.backlog.is_empty() {
            let target = self
                .children
                .iter()
                .enumerate()
                .filter(|(_, c)| c.task_w.is_some() && c.outstanding < WORKER_QUEUE_DEPTH)
                .min_by_key(|(_, c)| c.outstanding)
                .map(|(i, _)| i);
            let Some(worker) = target else { return };
            let Some(index) = self.backlog.pop_front() else { return };
            self.dispatch(worker, index);
        }
    }

    fn dispatch(&mut self, worker: usize, index: usize) {
        let slot = match &self.slots {
            Some(pool) => match pool.acquire() {
                Ok(id) => Some(id),
                Err(e) => {
                    // The pool is sized to the issue window, so this only
                    // happens if slot accounting broke.
                    debug_assert!(false, "{e}");
                    warn!("{e}; sending index {index} in-band");
                    None
                }
            },
            None => None,
        };
        let msg = TaskMsg::Compute { index: index as u64, slot };
        let child = &mut self.children[worker];
        let Some(task_w) = child.task_w.as_mut() else {
            self.return_slot(slot);
            self.backlog.push_front(index);
            return;
        };
        match protocol::write_frame(task_w, &msg) {
            Ok(()) => child.outstanding += 1,
            Err(e) => {
                // Dead pipe: the child's reader will report the loss. Keep
                // the index so a caller that survives can reschedule it.
                debug!("worker {worker} task pipe failed: {e}");
                child.task_w = None;
                self.return_slot(slot);
                self.backlog.push_front(index);
            }
        }
    }

    fn return_slot(&self, slot: Option<SlotId>) {
        if let (Some(pool), Some(id)) = (&self.slots, slot) {
            pool.release(id);
        }
    }

    fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.backlog.clear();
        for child in &mut self.children {
            // Ask politely, then close the pipe; a child that is between
            // tasks sees either the frame or EOF.
            if let Some(mut task_w) = child.task_w.take() {
                let _ = protocol::write_frame(&mut task_w, &TaskMsg::Stop);
            }
        }
        self.reap();
        for handle in self.readers.drain(..) {
            let _ = handle.join();
        }
        while self.events.try_recv().is_ok() {}
        self.slots = None;
    }

    /// Waits up to [`STOP_GRACE`] for children to exit, then kills stragglers.
    fn reap(&mut self) {
        let deadline = Instant::now() + STOP_GRACE;
        loop {
            let mut alive = 0usize;
            for child in &mut self.children {
                if child.reaped {
                    continue;
                }
                let mut status: libc::c_int = 0;
                // SAFETY: pid names a child this pool forked and has not
                // yet reaped.
                let rc = unsafe { libc::waitpid(child.pid, &mut status, libc::WNOHANG) };
                if rc == 0 {
                    alive += 1;
                } else {
                    child.reaped = true;
                }
            }
            if alive == 0 {
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(REAP_POLL);
        }
        for child in &mut self.children {
            if child.reaped {
                continue;
            }
            warn!("worker process {} ignored stop for {:?}; killing it", child.pid, STOP_GRACE);
            let mut status: libc::c_int = 0;
            // SAFETY: the pid is still our unreaped child; kill then block
            // until the zombie is collected.
            unsafe {
                libc::kill(child.pid, libc::SIGKILL);
                libc::waitpid(child.pid, &mut status, 0);
            }
            child.reaped = true;
        }
    }
}

impl<T> Drop for ProcessPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Parent-side reader for one child: decodes results as they arrive,
/// recycles slots immediately, and reports how the stream ended.
fn read_results<T: DeserializeOwned>(
    worker: usize,
    result_r: File,
    tx: Sender<Event<T>>,
    slots: Option<Arc<SlotPool>>,
) {
    use bincode::Options;

    let mut stream = BufReader::new(result_r);
    let mut clean = false;
    loop {
        let msg = match protocol::read_frame::<ResultMsg>(&mut stream) {
            Ok(Some(ResultMsg::Exiting)) => {
                clean = true;
                break;
            }
            Ok(Some(msg)) => msg,
            // EOF without a goodbye is a crash.
            Ok(None) => break,
            Err(e) => {
                debug!("worker {worker} result stream failed: {e}");
                break;
            }
        };
        let event = match msg {
            ResultMsg::Slot { index, slot, len } => {
                let decoded = slots
                    .as_deref()
                    .ok_or_else(|| "slot payload arrived without a slot pool".to_string())
                    .and_then(|pool| {
                        let bytes = pool.region(slot, len as usize).map_err(|e| e.to_string())?;
                        let value: T =
                            protocol::codec().deserialize(bytes).map_err(|e| e.to_string())?;
                        pool.release(slot);
                        Ok(value)
                    });
                match decoded {
                    Ok(value) => Event::Done { worker, index: index as usize, result: Ok(value) },
                    Err(reason) => {
                        warn!("worker {worker} sent an undecodable result for index {index}: {reason}");
                        break;
                    }
                }
            }
            ResultMsg::Inline { index, spare, bytes } => {
                if let (Some(pool), Some(id)) = (&slots, spare) {
                    pool.release(id);
                }
                match protocol::codec().deserialize(&bytes) {
                    Ok(value) => Event::Done { worker, index: index as usize, result: Ok(value) },
                    Err(e) => {
                        warn!("worker {worker} sent an undecodable result for index {index}: {e}");
                        break;
                    }
                }
            }
            ResultMsg::Failed { index, spare, error } => {
                if let (Some(pool), Some(id)) = (&slots, spare) {
                    pool.release(id);
                }
                Event::Done { worker, index: index as usize, result: Err(error) }
            }
            // Handled above; a second goodbye would be a protocol bug.
            ResultMsg::Exiting => break,
        };
        if tx.send(event).is_err() {
            return;
        }
    }
    let _ = tx.send(Event::Exited { worker, clean });
}

/// Child main loop: frames in, frames out, goodbye, gone.
fn child_serve<V, T>(task_r: File, mut result_w: File, view: &V, writer: Option<SlotWriter>)
where
    V: SequenceView<Item = T>,
    T: Serialize,
{
    let mut tasks = BufReader::new(task_r);
    loop {
        let msg = match protocol::read_frame::<TaskMsg>(&mut tasks) {
            Ok(Some(msg)) => msg,
            Ok(None) | Err(_) => break,
        };
        match msg {
            TaskMsg::Stop => break,
            TaskMsg::Compute { index, slot } => {
                let reply = compute_reply(view, index as usize, slot, writer);
                if protocol::write_frame(&mut result_w, &reply).is_err() {
                    // Parent is gone; no point in a goodbye.
                    return;
                }
            }
        }
    }
    let _ = protocol::write_frame(&mut result_w, &ResultMsg::Exiting);
}

fn compute_reply<V, T>(
    view: &V,
    index: usize,
    slot: Option<SlotId>,
    writer: Option<SlotWriter>,
) -> ResultMsg
where
    V: SequenceView<Item = T>,
    T: Serialize,
{
    use bincode::Options;

    let value = match view.get(index) {
        Ok(value) => value,
        Err(error) => return ResultMsg::Failed { index: index as u64, spare: slot, error },
    };
    if let (Some(id), Some(writer)) = (slot, writer) {
        if let Ok(size) = protocol::codec().serialized_size(&value) {
            if size <= writer.slot_size() as u64 {
                // SAFETY: the scheduler assigned `id` to this task alone and
                // will not recycle it until the result frame is read.
                let mut region: &mut [u8] = unsafe { writer.region_mut(id) };
                if protocol::codec().serialize_into(&mut region, &value).is_ok() {
                    return ResultMsg::Slot { index: index as u64, slot: id, len: size };
                }
            } else {
                let fallback =
                    SlotError::TooLarge { required: size as usize, capacity: writer.slot_size() };
                debug!("index {index}: {fallback}; sending in-band");
            }
        }
    }
    match protocol::codec().serialize(&value) {
        Ok(bytes) => ResultMsg::Inline { index: index as u64, spare: slot, bytes },
        Err(e) => ResultMsg::Failed {
            index: index as u64,
            spare: slot,
            error: ViewError::Element { index, reason: format!("result serialization failed: {e}") },
        },
    }
}

fn kill_children(children: &mut [Child]) {
    for child in children {
        if child.reaped {
            continue;
        }
        let mut status: libc::c_int = 0;
        // SAFETY: pid is an unreaped child of this process.
        unsafe {
            libc::kill(child.pid, libc::SIGKILL);
            libc::waitpid(child.pid, &mut status, 0);
        }
        child.reaped = true;
    }
}

// ========================================================================
// BACKEND SELECTION
// ========================================================================

pub(crate) enum Backend<T> {
    Threads(ThreadPool<T>),
    Processes(ProcessPool<T>),
}

impl<T> Backend<T> {
    pub(crate) fn submit(&mut self, index: usize) {
        match self {
            Backend::Threads(pool) => pool.submit(index),
            Backend::Processes(pool) => pool.submit(index),
        }
    }

    pub(crate) fn recv(&self) -> Result<Event<T>, crossbeam_channel::RecvError> {
        match self {
            Backend::Threads(pool) => pool.events.recv(),
            Backend::Processes(pool) => pool.events.recv(),
        }
    }

    /// Lets the backend refill whatever capacity the finished task freed.
    pub(crate) fn task_finished(&mut self, worker: usize) {
        match self {
            Backend::Threads(_) => {}
            Backend::Processes(pool) => pool.task_finished(worker),
        }
    }

    pub(crate) fn shutdown(&mut self) {
        match self {
            Backend::Threads(pool) => pool.shutdown(),
            Backend::Processes(pool) => pool.shutdown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::SequenceViewExt;
    use std::collections::BTreeMap;

    fn squares(n: usize) -> Arc<crate::view::FnView<impl Fn(usize) -> u64 + Send + Sync>> {
        Arc::new(crate::view::from_fn(n, |i| (i as u64) * (i as u64)))
    }

    fn drain_done<T>(pool: &ThreadPool<T>, expected: usize) -> BTreeMap<usize, Result<T, ViewError>> {
        let mut done = BTreeMap::new();
        while done.len() < expected {
            match pool.events.recv().expect("worker events") {
                Event::Done { index, result, .. } => {
                    done.insert(index, result);
                }
                Event::Exited { worker, clean } => {
                    panic!("worker {worker} exited early (clean: {clean})");
                }
            }
        }
        done
    }

    #[test]
    fn threads_compute_everything_submitted() {
        let view = squares(16);
        let mut pool = ThreadPool::spawn(view, 3, 16);
        for index in 0..16 {
            pool.submit(index);
        }
        let done = drain_done(&pool, 16);
        assert_eq!(done.len(), 16);
        for (index, result) in done {
            assert_eq!(result.unwrap(), (index as u64) * (index as u64));
        }
        pool.shutdown();
    }

    #[test]
    fn threads_deliver_element_errors_in_events() {
        let view = Arc::new(crate::view::try_from_fn(4, |i| {
            if i == 2 {
                Err(ViewError::Element { index: i, reason: "bad element".into() })
            } else {
                Ok(i)
            }
        }));
        let mut pool = ThreadPool::spawn(view, 2, 4);
        for index in 0..4 {
            pool.submit(index);
        }
        let done = drain_done(&pool, 4);
        assert!(done[&2].is_err());
        assert_eq!(done[&3], Ok(3));
        pool.shutdown();
    }

    #[test]
    fn thread_panic_reports_an_unclean_exit() {
        let view = Arc::new(crate::view::from_fn(2, |i: usize| {
            if i == 1 {
                panic!("boom");
            }
            i
        }));
        let mut pool = ThreadPool::spawn(view, 1, 2);
        pool.submit(0);
        pool.submit(1);
        let mut saw_unclean = false;
        for _ in 0..2 {
            match pool.events.recv().expect("events") {
                Event::Done { index, result, .. } => {
                    assert_eq!(index, 0);
                    assert_eq!(result.unwrap(), 0);
                }
                Event::Exited { clean, .. } => {
                    assert!(!clean);
                    saw_unclean = true;
                }
            }
        }
        assert!(saw_unclean);
        pool.shutdown();
    }

    #[test]
    fn shutdown_abandons_queued_work() {
        let view = squares(1000);
        let mut pool = ThreadPool::spawn(view, 1, 1000);
        for index in 0..1000 {
            pool.submit(index);
        }
        pool.shutdown();
        // No hang and no leftover threads is the assertion here.
        assert!(pool.handles.is_empty());
    }

    #[test]
    fn stacked_views_feed_workers() {
        let view = Arc::new(squares(10).map(|v| v + 1).batched(4));
        let mut pool = ThreadPool::spawn(view, 2, 3);
        for index in 0..3 {
            pool.submit(index);
        }
        let done = drain_done(&pool, 3);
        assert_eq!(done[&0], Ok(vec![1, 2, 5, 10]));
        assert_eq!(done[&2], Ok(vec![65, 82]));
        pool.shutdown();
    }
}
