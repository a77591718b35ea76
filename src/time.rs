//! The discrete-event clock and cooperative scheduler (C1).
//!
//! Simulation time is kept as a [`tai_time::MonotonicTime`], the same time type
//! the teacher crate threads through its `nexosim` re-export. Concurrent
//! activity is modelled as `Future`s polled to completion by [`Engine::run`] —
//! "a coroutine abstraction on top of a min-heap event loop" per the design
//! notes: `Timeout`, `Event`, `AnyOf` and `AllOf` are the only suspension
//! points, and exactly one driver (`Engine::run`) ever polls a task.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::task::{waker, ArcWake};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tai_time::MonotonicTime;

/// Minutes-since-epoch representation used throughout the component design;
/// converted to/from [`MonotonicTime`] at the engine boundary.
pub type SimTime = f64;

pub fn to_monotonic(minutes: SimTime) -> MonotonicTime {
    let secs = (minutes * 60.0).max(0.0);
    MonotonicTime::EPOCH + Duration::from_secs_f64(secs)
}

pub fn from_monotonic(t: MonotonicTime) -> SimTime {
    let d = t.duration_since(MonotonicTime::EPOCH).unwrap_or(Duration::ZERO);
    d.as_secs_f64() / 60.0
}

type TaskId = u64;

struct TimerEntry {
    time: MonotonicTime,
    seq: u64,
    task: TaskId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so BinaryHeap (a max-heap) behaves as a min-heap on (time, seq).
        other.time.cmp(&self.time).then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct TaskWaker {
    id: TaskId,
    ready: Arc<Mutex<VecDeque<TaskId>>>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.ready.lock().unwrap().push_back(arc_self.id);
    }
}

/// An unfired latch. `succeed` resumes every waiting coroutine, in the order
/// they started waiting, at the current `now` — mirroring simpy's `Event`.
#[derive(Default)]
pub struct Event {
    inner: RefCell<EventInner>,
}

#[derive(Default)]
struct EventInner {
    fired: bool,
    wakers: Vec<std::task::Waker>,
}

impl Event {
    pub fn new() -> Rc<Self> {
        Rc::new(Event::default())
    }

    pub fn succeed(self: &Rc<Self>) {
        let mut inner = self.inner.borrow_mut();
        if inner.fired {
            return;
        }
        inner.fired = true;
        let wakers = std::mem::take(&mut inner.wakers);
        drop(inner);
        for w in wakers {
            w.wake();
        }
    }

    pub fn is_fired(&self) -> bool {
        self.inner.borrow().fired
    }

    /// Re-arms the event so it can be awaited and fired again (controllers
    /// reissue `state_changed` after every iteration of their loop).
    pub fn reset(self: &Rc<Self>) {
        let mut inner = self.inner.borrow_mut();
        inner.fired = false;
    }

    pub fn wait(self: &Rc<Self>) -> EventWait {
        EventWait { event: self.clone() }
    }
}

/// A re-fireable signal ("controller.state_changed"-style). Every `notify`
/// swaps in a fresh [`Event`] and succeeds the old one, rather than resetting
/// a single `Event` in place — resetting in place would race a waiter that
/// hasn't polled yet into missing the wake entirely. Waiters always fetch
/// [`Notifier::current`] immediately before awaiting.
#[derive(Clone)]
pub struct Notifier {
    current: Rc<RefCell<Rc<Event>>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Notifier { current: Rc::new(RefCell::new(Event::new())) }
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Rc<Event> {
        self.current.borrow().clone()
    }

    pub fn notify(&self) {
        let old = self.current.replace(Event::new());
        old.succeed();
    }

    pub async fn wait(&self) {
        let ev = self.current();
        ev.wait().await;
    }
}

pub struct EventWait {
    event: Rc<Event>,
}

impl Future for EventWait {
    type Output = ();
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut inner = self.event.inner.borrow_mut();
        if inner.fired {
            Poll::Ready(())
        } else {
            inner.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Fires once the underlying event fires or `now` reaches `deadline`, whichever
/// is first. Drives the engine's `Run(until=time|event)` semantics.
pub struct Timeout {
    deadline: MonotonicTime,
    handle: EngineHandle,
    registered: bool,
}

impl Future for Timeout {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let now = self.handle.now();
        if now >= self.deadline {
            return Poll::Ready(());
        }
        if !self.registered {
            self.handle.schedule_wake(self.deadline, cx.waker().clone());
            self.registered = true;
        }
        Poll::Pending
    }
}

/// A cloneable, non-owning reference to the engine, handed to every coroutine
/// so it can schedule timeouts without borrowing the driving `Engine` by value.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Rc<RefCell<EngineState>>,
}

struct EngineState {
    now: MonotonicTime,
    timers: BinaryHeap<TimerEntry>,
    timer_wakers: std::collections::HashMap<u64, std::task::Waker>,
    seq: u64,
    rng: SmallRng,
    /// Coroutines spawned from inside a running task (e.g. a source spawning
    /// one `run_product` task per arrival) via [`EngineHandle::spawn`]. Drained
    /// into `Engine`'s own task table at the top of every `run_until` pass,
    /// since a polled future has no direct access to `&mut Engine`.
    pending_spawns: Vec<Pin<Box<dyn Future<Output = ()>>>>,
}

impl EngineHandle {
    pub fn now(&self) -> MonotonicTime {
        self.inner.borrow().now
    }

    pub fn now_minutes(&self) -> SimTime {
        from_monotonic(self.now())
    }

    fn schedule_wake(&self, deadline: MonotonicTime, waker: std::task::Waker) {
        let mut st = self.inner.borrow_mut();
        st.seq += 1;
        let seq = st.seq;
        st.timers.push(TimerEntry { time: deadline, seq, task: 0 });
        st.timer_wakers.insert(seq, waker);
    }

    pub fn timeout_minutes(&self, minutes: f64) -> Timeout {
        let secs = (minutes.max(0.0) * 60.0).round() as u64;
        let deadline = self.now() + Duration::from_secs(secs) + Duration::from_nanos(
            ((minutes.max(0.0) * 60.0 - secs as f64) * 1e9).round().max(0.0) as u64,
        );
        Timeout { deadline, handle: self.clone(), registered: false }
    }

    pub fn timeout(&self, d: Duration) -> Timeout {
        Timeout { deadline: self.now() + d, handle: self.clone(), registered: false }
    }

    pub fn rng(&self) -> std::cell::RefMut<'_, SmallRng> {
        std::cell::RefMut::map(self.inner.borrow_mut(), |s| &mut s.rng)
    }

    /// Queues a coroutine to start at the current `now`, from inside a
    /// running task. Picked up by the driving [`Engine`] at the top of its
    /// next `run_until` pass.
    pub fn spawn(&self, fut: impl Future<Output = ()> + 'static) {
        self.inner.borrow_mut().pending_spawns.push(Box::pin(fut));
    }
}

/// The single-threaded driver. Owns the task table, the ready queue and the
/// timer heap. `spawn` schedules a coroutine to run at the current `now`;
/// `run_until` advances the clock, popping the earliest timer or ready task,
/// resuming it, repeating until the requested horizon is reached.
pub struct Engine {
    handle: EngineHandle,
    tasks: std::collections::HashMap<TaskId, Pin<Box<dyn Future<Output = ()>>>>,
    ready: Arc<Mutex<VecDeque<TaskId>>>,
    next_task_id: TaskId,
}

impl Engine {
    pub fn new(seed: u64) -> Self {
        Engine {
            handle: EngineHandle {
                inner: Rc::new(RefCell::new(EngineState {
                    now: MonotonicTime::EPOCH,
                    timers: BinaryHeap::new(),
                    timer_wakers: std::collections::HashMap::new(),
                    seq: 0,
                    rng: SmallRng::seed_from_u64(seed),
                    pending_spawns: Vec::new(),
                })),
            },
            tasks: std::collections::HashMap::new(),
            ready: Arc::new(Mutex::new(VecDeque::new())),
            next_task_id: 0,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn now(&self) -> SimTime {
        self.handle.now_minutes()
    }

    /// Schedules a new cooperative task ("coroutine") at the current `now`.
    pub fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let id = self.next_task_id;
        self.next_task_id += 1;
        self.tasks.insert(id, Box::pin(fut));
        self.ready.lock().unwrap().push_back(id);
    }

    /// Moves any coroutines queued via [`EngineHandle::spawn`] into the task
    /// table, giving each a fresh ready `TaskId`.
    fn drain_pending_spawns(&mut self) {
        let spawned: Vec<_> = std::mem::take(&mut self.handle.inner.borrow_mut().pending_spawns);
        for fut in spawned {
            let id = self.next_task_id;
            self.next_task_id += 1;
            self.tasks.insert(id, fut);
            self.ready.lock().unwrap().push_back(id);
        }
    }

    fn poll_task(&mut self, id: TaskId) {
        let Some(mut fut) = self.tasks.remove(&id) else { return };
        let waker = waker(Arc::new(TaskWaker { id, ready: self.ready.clone() }));
        let mut cx = Context::from_waker(&waker);
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {}
            Poll::Pending => {
                self.tasks.insert(id, fut);
            }
        }
    }

    /// Drains the ready queue, then advances to the next timer, until `now`
    /// reaches `until_minutes`. This is the "loop: pop earliest item, advance
    /// now, resume" driver from the design notes; `Run` is exclusive — this is
    /// the only place the clock advances.
    pub fn run_until(&mut self, until_minutes: SimTime) {
        let until = to_monotonic(until_minutes);
        loop {
            self.drain_pending_spawns();
            // Drain everything ready at the current instant first (FIFO).
            loop {
                let next = self.ready.lock().unwrap().pop_front();
                match next {
                    Some(id) => self.poll_task(id),
                    None => break,
                }
                self.drain_pending_spawns();
            }

            let next_timer_time = {
                let st = self.handle.inner.borrow();
                st.timers.peek().map(|e| e.time)
            };

            match next_timer_time {
                Some(t) if t <= until => {
                    self.advance_to(t);
                }
                _ => {
                    self.advance_to(until);
                    break;
                }
            }
        }
    }

    fn advance_to(&mut self, t: MonotonicTime) {
        {
            let mut st = self.handle.inner.borrow_mut();
            if t > st.now {
                st.now = t;
            }
        }
        // Fire every timer due at exactly `t`, in insertion order.
        loop {
            let due = {
                let mut st = self.handle.inner.borrow_mut();
                match st.timers.peek() {
                    Some(e) if e.time <= t => {
                        let entry = st.timers.pop().unwrap();
                        st.timer_wakers.remove(&entry.seq)
                    }
                    _ => None,
                }
            };
            match due {
                Some(w) => w.wake(),
                None => break,
            }
        }
        // Run whatever that woke up.
        loop {
            let next = self.ready.lock().unwrap().pop_front();
            match next {
                Some(id) => self.poll_task(id),
                None => break,
            }
            self.drain_pending_spawns();
        }
    }
}

/// Waits for the first of several events to fire, resolving with its index.
/// `AnyOf(es)` from the design notes.
pub async fn any_of(events: &[Rc<Event>]) -> usize {
    loop {
        for (i, e) in events.iter().enumerate() {
            if e.is_fired() {
                return i;
            }
        }
        let waits: Vec<_> = events.iter().map(|e| e.wait()).collect();
        // Poll once per event via select_all; re-check after any wakes.
        futures::future::select_all(waits.into_iter().map(Box::pin)).await;
    }
}

/// Waits for every event in `events` to have fired. `AllOf(es)`.
pub async fn all_of(events: &[Rc<Event>]) {
    for e in events {
        e.wait().await;
    }
}
