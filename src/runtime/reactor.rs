//! Single-threaded reactor driving one event loop.
//!
//! Readiness-based model built on mio: poll tells us which registered
//! sources are ready, then the matching callbacks run. Timers are kept by the
//! reactor itself and turned into the poll timeout. Cross-thread work arrives
//! through the task queue, whose waker sits on a reserved token.
//!
//! Each iteration runs, in order:
//! 1. I/O callbacks for every ready source
//! 2. timer callbacks that were due when the iteration started
//! 3. up to one budget of queued tasks per priority lane
//!
//! Everything here is confined to the loop thread. Callbacks get
//! `&mut Reactor`, so they can arm timers or register sources on the loop
//! they run on.

use super::registry::HandlerRegistry;
use super::task_queue::TaskQueue;
use super::timeout_map::{Timeout, TimeoutMap, MAX_FAST_TIMEOUTS};
use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Token reserved for the task queue waker.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 1024;

static NEXT_REACTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Work submitted to a loop from any thread.
pub type Task = Box<dyn FnOnce(&mut Reactor) + Send + 'static>;

type TimerCallback = Box<dyn FnMut(&mut Reactor, TimerId)>;

/// Handle to a timer created with [`Reactor::new_timer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    slot: usize,
    serial: u64,
}

/// Handle to a source registered with [`Reactor::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoToken {
    slot: usize,
    serial: u64,
}

impl IoToken {
    /// The mio token events for this source carry.
    pub fn token(&self) -> Token {
        Token(self.slot)
    }
}

struct TimerSlot {
    /// `None` while the callback is running.
    callback: Option<TimerCallback>,
    serial: u64,
    /// Bumped on every arm and cancel; stale queue entries no longer match.
    generation: u64,
    armed: bool,
    /// Freed from inside its own callback; removed once the callback returns.
    freed: bool,
}

/// A scheduled firing of a timer.
#[derive(Debug, Clone, Copy)]
struct Pending {
    deadline: Instant,
    seq: u64,
    slot: usize,
    serial: u64,
    generation: u64,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

fn is_live(timers: &HandlerRegistry<TimerSlot>, pending: &Pending) -> bool {
    timers.get(pending.slot).is_some_and(|t| {
        t.serial == pending.serial && t.generation == pending.generation && t.armed
    })
}

trait IoHandler {
    fn ready(&mut self, reactor: &mut Reactor, event: &Event);
    fn source(&mut self) -> &mut dyn Source;
}

struct IoEntry<S, F> {
    source: S,
    callback: F,
}

impl<S, F> IoHandler for IoEntry<S, F>
where
    S: Source,
    F: FnMut(&mut Reactor, &mut S, &Event),
{
    fn ready(&mut self, reactor: &mut Reactor, event: &Event) {
        (self.callback)(reactor, &mut self.source, event)
    }

    fn source(&mut self) -> &mut dyn Source {
        &mut self.source
    }
}

struct IoSlot {
    /// `None` while the callback is running.
    handler: Option<Box<dyn IoHandler>>,
    serial: u64,
    /// Deregistered from inside its own callback.
    closing: bool,
    /// Interest change requested from inside its own callback.
    pending_interest: Option<Interest>,
}

/// Timer, I/O and task multiplexer owned by a single loop thread.
pub struct Reactor {
    id: u64,
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    timeouts: TimeoutMap,
    timers: HandlerRegistry<TimerSlot>,
    heap: BinaryHeap<Reverse<Pending>>,
    lanes: Vec<VecDeque<Pending>>,
    io: HandlerRegistry<IoSlot>,
    next_serial: u64,
    next_seq: u64,
    iterations: u64,
    timers_fired: u64,
}

impl Reactor {
    /// Create a reactor allowing at most `max_io_handlers` registered sources.
    pub fn new(max_io_handlers: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let id = NEXT_REACTOR_ID.fetch_add(1, Ordering::Relaxed);

        Ok(Self {
            id,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            waker,
            timeouts: TimeoutMap::new(id, MAX_FAST_TIMEOUTS),
            timers: HandlerRegistry::new(usize::MAX),
            heap: BinaryHeap::new(),
            lanes: Vec::new(),
            io: HandlerRegistry::new(max_io_handlers),
            next_serial: 1,
            next_seq: 0,
            iterations: 0,
            timers_fired: 0,
        })
    }

    /// Identifier embedded in the timeouts this reactor hands out.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waker that interrupts this reactor's poll from any thread.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// The underlying mio registry, for collaborators that manage their own
    /// registrations.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Completed poll iterations.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Timer callbacks run so far.
    pub fn timers_fired(&self) -> u64 {
        self.timers_fired
    }

    /// Cached timeout for `duration`. See [`TimeoutMap::get`].
    pub fn common_timeout(&mut self, duration: Duration) -> Timeout {
        self.timeouts.get(duration)
    }

    /// Timeout that fires on the next iteration.
    pub fn zero_timeout(&mut self) -> Timeout {
        self.timeouts.get(Duration::ZERO)
    }

    // ---- timers ----

    /// Create an unarmed timer.
    pub fn new_timer<F>(&mut self, callback: F) -> TimerId
    where
        F: FnMut(&mut Reactor, TimerId) + 'static,
    {
        let serial = self.serial();
        let slot = self
            .timers
            .insert(TimerSlot {
                callback: Some(Box::new(callback)),
                serial,
                generation: 0,
                armed: false,
                freed: false,
            })
            .unwrap_or_else(|| unreachable!("timer registry is unbounded"));
        TimerId { slot, serial }
    }

    /// Arm `id` to fire once after `timeout`, replacing any pending deadline.
    ///
    /// Returns false if the timer no longer exists.
    pub fn arm(&mut self, id: TimerId, timeout: &Timeout) -> bool {
        let seq = self.next_seq;
        let Some(slot) = self.timer_slot(id) else {
            return false;
        };
        if slot.freed {
            return false;
        }
        slot.generation += 1;
        slot.armed = true;

        let pending = Pending {
            deadline: Instant::now() + timeout.duration(),
            seq,
            slot: id.slot,
            serial: id.serial,
            generation: slot.generation,
        };
        self.next_seq += 1;

        match *timeout {
            Timeout::Common {
                reactor_id, lane, ..
            } if reactor_id == self.id => {
                if self.lanes.len() <= lane {
                    self.lanes.resize_with(lane + 1, VecDeque::new);
                }
                self.lanes[lane].push_back(pending);
            }
            Timeout::Common { reactor_id, .. } => {
                debug_assert!(false, "timeout from reactor {reactor_id} used on {}", self.id);
                self.heap.push(Reverse(pending));
            }
            Timeout::Plain(_) => self.heap.push(Reverse(pending)),
        }
        true
    }

    /// Disarm `id`. The timer can be armed again later.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.timer_slot(id) {
            Some(slot) => {
                slot.generation += 1;
                slot.armed = false;
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.timers
            .get(id.slot)
            .is_some_and(|t| t.serial == id.serial && t.armed)
    }

    /// Destroy a timer. Safe to call from the timer's own callback.
    pub fn free_timer(&mut self, id: TimerId) -> bool {
        let Some(slot) = self.timer_slot(id) else {
            return false;
        };
        slot.armed = false;
        if slot.callback.is_none() {
            slot.freed = true;
        } else {
            self.timers.remove(id.slot);
        }
        true
    }

    /// Number of live timers.
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    fn timer_slot(&mut self, id: TimerId) -> Option<&mut TimerSlot> {
        self.timers
            .get_mut(id.slot)
            .filter(|t| t.serial == id.serial)
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        let timers = &self.timers;

        while let Some(Reverse(top)) = self.heap.peek() {
            if is_live(timers, top) {
                break;
            }
            self.heap.pop();
        }
        let mut best = self.heap.peek().map(|Reverse(p)| p.deadline);

        for lane in &mut self.lanes {
            while let Some(front) = lane.front() {
                if is_live(timers, front) {
                    break;
                }
                lane.pop_front();
            }
            if let Some(front) = lane.front() {
                best = Some(best.map_or(front.deadline, |b| b.min(front.deadline)));
            }
        }
        best
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();

        while let Some(Reverse(top)) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            if let Some(Reverse(p)) = self.heap.pop() {
                if is_live(&self.timers, &p) {
                    due.push(p);
                }
            }
        }
        for lane in &mut self.lanes {
            while let Some(front) = lane.front() {
                if front.deadline > now {
                    break;
                }
                if let Some(p) = lane.pop_front() {
                    if is_live(&self.timers, &p) {
                        due.push(p);
                    }
                }
            }
        }

        due.sort_unstable();
        for pending in due {
            self.fire(pending);
        }
    }

    fn fire(&mut self, pending: Pending) {
        // An earlier callback in this batch may have cancelled or re-armed it.
        if !is_live(&self.timers, &pending) {
            return;
        }
        let id = TimerId {
            slot: pending.slot,
            serial: pending.serial,
        };
        let Some(mut callback) = self.timer_slot(id).and_then(|slot| {
            slot.armed = false;
            slot.callback.take()
        }) else {
            return;
        };

        self.timers_fired += 1;
        callback(self, id);

        if let Some(slot) = self.timer_slot(id) {
            if slot.freed {
                self.timers.remove(id.slot);
            } else {
                slot.callback = Some(callback);
            }
        }
    }

    // ---- I/O ----

    /// Register `source` for readiness events. The reactor owns the source
    /// until it is deregistered.
    pub fn register<S, F>(
        &mut self,
        mut source: S,
        interest: Interest,
        callback: F,
    ) -> io::Result<IoToken>
    where
        S: Source + 'static,
        F: FnMut(&mut Reactor, &mut S, &Event) + 'static,
    {
        let serial = self.serial();
        let slot = self
            .io
            .insert(IoSlot {
                handler: None,
                serial,
                closing: false,
                pending_interest: None,
            })
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "I/O handler limit reached"))?;

        if let Err(e) = self.poll.registry().register(&mut source, Token(slot), interest) {
            self.io.remove(slot);
            return Err(e);
        }
        if let Some(entry) = self.io.get_mut(slot) {
            entry.handler = Some(Box::new(IoEntry { source, callback }));
        }

        trace!(reactor = self.id, slot, "Registered I/O handler");
        Ok(IoToken { slot, serial })
    }

    /// Change the interest set of a registered source.
    pub fn reregister(&mut self, token: IoToken, interest: Interest) -> io::Result<()> {
        let registry = self.poll.registry();
        let slot = self
            .io
            .get_mut(token.slot)
            .filter(|s| s.serial == token.serial && !s.closing)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "I/O handler not found"))?;

        match slot.handler.as_mut() {
            Some(handler) => registry.reregister(handler.source(), token.token(), interest),
            None => {
                slot.pending_interest = Some(interest);
                Ok(())
            }
        }
    }

    /// Deregister and drop a source. Safe to call from the source's own
    /// callback.
    pub fn deregister(&mut self, token: IoToken) -> bool {
        let Some(slot) = self
            .io
            .get_mut(token.slot)
            .filter(|s| s.serial == token.serial)
        else {
            return false;
        };

        match slot.handler.take() {
            Some(mut handler) => {
                let _ = self.poll.registry().deregister(handler.source());
                self.io.remove(token.slot);
            }
            None => slot.closing = true,
        }
        true
    }

    /// Number of registered sources.
    pub fn io_count(&self) -> usize {
        self.io.len()
    }

    fn dispatch_io(&mut self, events: &Events) {
        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let slot_id = event.token().0;
            let Some((mut handler, serial)) = self
                .io
                .get_mut(slot_id)
                .and_then(|s| s.handler.take().map(|h| (h, s.serial)))
            else {
                continue;
            };

            handler.ready(self, event);

            let registry = self.poll.registry();
            match self.io.get_mut(slot_id) {
                Some(slot) if slot.serial == serial && slot.closing => {
                    let _ = registry.deregister(handler.source());
                    self.io.remove(slot_id);
                }
                Some(slot) if slot.serial == serial => {
                    if let Some(interest) = slot.pending_interest.take() {
                        let source = handler.source();
                        if let Err(e) = registry.reregister(source, Token(slot_id), interest) {
                            debug!(slot = slot_id, error = %e, "Failed to change interest");
                        }
                    }
                    slot.handler = Some(handler);
                }
                _ => {}
            }
        }
    }

    // ---- loop ----

    /// Run until `queue` is shut down and drained.
    ///
    /// Only a poll failure other than `Interrupted` ends the loop early.
    pub(crate) fn run(&mut self, queue: &TaskQueue<Task>) -> io::Result<()> {
        let mut tasks_pending = false;

        loop {
            let timeout = if tasks_pending {
                Some(Duration::ZERO)
            } else {
                self.next_deadline()
                    .map(|d| d.saturating_duration_since(Instant::now()))
            };

            let mut events = std::mem::replace(&mut self.events, Events::with_capacity(0));
            let polled = self.poll.poll(&mut events, timeout);
            match polled {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.events = events;
                    continue;
                }
                Err(e) => {
                    self.events = events;
                    return Err(e);
                }
            }
            self.iterations += 1;

            self.dispatch_io(&events);
            self.events = events;

            self.fire_due_timers();

            if queue.is_shutdown() {
                let drained = queue.drain_all(|task| task(self));
                debug!(reactor = self.id, drained, "Task queue shut down, leaving loop");
                return Ok(());
            }
            tasks_pending = queue.drain(|task| task(self));
        }
    }

    fn serial(&mut self) -> u64 {
        let serial = self.next_serial;
        self.next_serial += 1;
        serial
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let registry = self.poll.registry();
        for mut slot in self.io.drain() {
            if let Some(handler) = slot.handler.as_mut() {
                let _ = registry.deregister(handler.source());
            }
        }
        trace!(reactor = self.id, timers = self.timers.len(), "Reactor released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::task_queue::DEFAULT_REQUESTS_PER_ITERATION;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn run_until_shutdown(reactor: &mut Reactor, queue: &TaskQueue<Task>) {
        reactor.run(queue).unwrap();
    }

    fn queue_for(reactor: &Reactor) -> Arc<TaskQueue<Task>> {
        Arc::new(TaskQueue::new(reactor.waker(), 64, DEFAULT_REQUESTS_PER_ITERATION).unwrap())
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let mut reactor = Reactor::new(16).unwrap();
        let queue = queue_for(&reactor);
        let order = Rc::new(RefCell::new(Vec::new()));

        let slow = reactor.common_timeout(Duration::from_millis(30));
        let fast = Timeout::Plain(Duration::from_millis(10));
        let mid = reactor.common_timeout(Duration::from_millis(20));

        for (name, timeout) in [("slow", slow), ("fast", fast), ("mid", mid)] {
            let order = Rc::clone(&order);
            let q = Arc::clone(&queue);
            let id = reactor.new_timer(move |_, _| {
                order.borrow_mut().push(name);
                if name == "slow" {
                    q.shutdown();
                }
            });
            assert!(reactor.arm(id, &timeout));
        }

        run_until_shutdown(&mut reactor, &queue);
        assert_eq!(*order.borrow(), vec!["fast", "mid", "slow"]);
        assert_eq!(reactor.timers_fired(), 3);
    }

    #[test]
    fn test_rearm_replaces_deadline_and_cancel_disarms() {
        let mut reactor = Reactor::new(16).unwrap();
        let queue = queue_for(&reactor);
        let fired = Rc::new(RefCell::new(0));

        let f = Rc::clone(&fired);
        let id = reactor.new_timer(move |_, _| *f.borrow_mut() += 1);
        reactor.arm(id, &Timeout::Plain(Duration::from_millis(1)));
        reactor.arm(id, &Timeout::Plain(Duration::from_millis(5)));
        assert!(reactor.is_armed(id));

        let cancelled = Rc::new(RefCell::new(false));
        let c = Rc::clone(&cancelled);
        let other = reactor.new_timer(move |_, _| *c.borrow_mut() = true);
        reactor.arm(other, &Timeout::Plain(Duration::from_millis(2)));
        assert!(reactor.cancel(other));
        assert!(!reactor.is_armed(other));

        let q = Arc::clone(&queue);
        let stop = reactor.new_timer(move |_, _| q.shutdown());
        reactor.arm(stop, &Timeout::Plain(Duration::from_millis(20)));

        run_until_shutdown(&mut reactor, &queue);
        assert_eq!(*fired.borrow(), 1);
        assert!(!*cancelled.borrow());
    }

    #[test]
    fn test_timer_can_rearm_and_free_itself() {
        let mut reactor = Reactor::new(16).unwrap();
        let queue = queue_for(&reactor);
        let count = Rc::new(RefCell::new(0));

        let c = Rc::clone(&count);
        let q = Arc::clone(&queue);
        let id = reactor.new_timer(move |r, me| {
            *c.borrow_mut() += 1;
            if *c.borrow() < 3 {
                let zero = r.zero_timeout();
                r.arm(me, &zero);
            } else {
                assert!(r.free_timer(me));
                q.shutdown();
            }
        });
        let zero = reactor.zero_timeout();
        reactor.arm(id, &zero);

        run_until_shutdown(&mut reactor, &queue);
        assert_eq!(*count.borrow(), 3);
        assert_eq!(reactor.timer_count(), 0);
        assert!(!reactor.arm(id, &Timeout::Plain(Duration::ZERO)));
    }

    #[test]
    fn test_queued_tasks_get_reactor_access() {
        let mut reactor = Reactor::new(16).unwrap();
        let queue = queue_for(&reactor);
        let (tx, rx) = crossbeam_channel::unbounded();

        let q = Arc::clone(&queue);
        queue
            .add(Box::new(move |r: &mut Reactor| {
                let tx = tx.clone();
                let q = Arc::clone(&q);
                let id = r.new_timer(move |_, _| {
                    tx.send("timer").unwrap();
                    q.shutdown();
                });
                let zero = r.zero_timeout();
                r.arm(id, &zero);
            }))
            .unwrap();

        run_until_shutdown(&mut reactor, &queue);
        assert_eq!(rx.try_recv(), Ok("timer"));
    }

    #[cfg(unix)]
    #[test]
    fn test_io_callback_runs_and_deregisters_itself() {
        use mio::net::UnixStream;
        use std::io::{Read, Write};

        let mut reactor = Reactor::new(4).unwrap();
        let queue = queue_for(&reactor);
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let received = Rc::new(RefCell::new(Vec::new()));

        let got = Rc::clone(&received);
        let q = Arc::clone(&queue);
        let token = Rc::new(RefCell::new(None::<IoToken>));
        let t = Rc::clone(&token);
        let registered = reactor
            .register(ours, Interest::READABLE, move |r, stream, event| {
                assert!(event.is_readable());
                let mut buf = [0u8; 16];
                if let Ok(n) = stream.read(&mut buf) {
                    got.borrow_mut().extend_from_slice(&buf[..n]);
                }
                if let Some(me) = *t.borrow() {
                    assert!(r.deregister(me));
                }
                q.shutdown();
            })
            .unwrap();
        *token.borrow_mut() = Some(registered);
        assert_eq!(reactor.io_count(), 1);

        theirs.write_all(b"hello").unwrap();
        run_until_shutdown(&mut reactor, &queue);

        assert_eq!(&*received.borrow(), b"hello");
        assert_eq!(reactor.io_count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_io_handler_limit() {
        use mio::net::UnixStream;

        let mut reactor = Reactor::new(1).unwrap();
        let (a, _a) = UnixStream::pair().unwrap();
        let (b, _b) = UnixStream::pair().unwrap();
        reactor.register(a, Interest::READABLE, |_, _, _| {}).unwrap();
        assert!(reactor.register(b, Interest::READABLE, |_, _, _| {}).is_err());
    }
}
