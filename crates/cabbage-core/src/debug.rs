//! Breakpoint relay between the engine thread and a debugger UI.
//!
//! When the engine hits a breakpoint it hands a [`BreakpointSnapshot`] to
//! [`DebugBreakpointBridge::on_breakpoint`], which publishes it (latest
//! value wins) and then parks the engine thread until the UI resumes it.
//! The pause is bounded by a timeout, and [`DebugBreakpointBridge::detach`]
//! releases it immediately and disables further pauses for when the UI
//! goes away.
//!
//! Breakpoints themselves are requested from the control plane through a
//! small queue that the audio thread drains at block start.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};

const REQUEST_CAPACITY: usize = 64;

/// Value of one variable at a breakpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    Scalar(f64),
    Text(String),
    Array(Vec<f64>),
    /// A type the snapshot does not decode.
    Opaque,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableBinding {
    pub name: String,
    /// Engine type tag, e.g. `k`, `i`, `S`, `a`.
    pub type_name: String,
    pub value: VariableValue,
}

/// Engine debugger state captured when a breakpoint fires.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakpointSnapshot {
    /// Instrument number (p1) of the paused instance.
    pub instrument: f64,
    /// Source line of the current opcode, or 0 for instrument breakpoints.
    pub line: i32,
    /// k-cycles performed by the instance.
    pub kcounter: u64,
    pub variables: Vec<VariableBinding>,
}

impl BreakpointSnapshot {
    pub fn variable(&self, name: &str) -> Option<&VariableBinding> {
        self.variables.iter().find(|v| v.name == name)
    }
}

/// How the engine thread left a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCommand {
    /// Resumed by the UI, or released by the timeout.
    Continue,
    /// The debugger detached; breakpoints no longer pause.
    Detached,
}

/// Breakpoint edits requested by the control plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BreakpointRequest {
    SetLine {
        line: i32,
        /// Instrument number, or 0 for any instrument
        instrument: i32,
        /// Hits to skip before pausing
        skip: i32,
    },
    RemoveLine {
        line: i32,
        instrument: i32,
    },
    SetInstrument {
        instrument: f64,
        skip: i32,
    },
    RemoveInstrument(f64),
    ClearAll,
}

struct Gate {
    paused: bool,
}

pub struct DebugBreakpointBridge {
    latest: ArcSwapOption<BreakpointSnapshot>,
    generation: AtomicU64,
    timeouts: AtomicU64,
    gate: Mutex<Gate>,
    wake: Condvar,
    timeout: Duration,
    detached: AtomicBool,
    requests: ArrayQueue<BreakpointRequest>,
}

impl DebugBreakpointBridge {
    pub fn new(timeout: Duration) -> Self {
        Self {
            latest: ArcSwapOption::empty(),
            generation: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            gate: Mutex::new(Gate { paused: false }),
            wake: Condvar::new(),
            timeout,
            detached: AtomicBool::new(false),
            requests: ArrayQueue::new(REQUEST_CAPACITY),
        }
    }

    /// Engine thread: publish `snapshot` and wait for the UI.
    ///
    /// Returns when the UI calls [`resume`](Self::resume) or
    /// [`detach`](Self::detach), or when the timeout elapses.
    pub fn on_breakpoint(&self, snapshot: BreakpointSnapshot) -> DebugCommand {
        if self.detached.load(Ordering::Acquire) {
            self.publish(snapshot);
            return DebugCommand::Detached;
        }

        let mut gate = self.gate.lock();
        // Paused before publishing, so a resume issued in reaction to the
        // snapshot always finds the flag set.
        gate.paused = true;
        self.publish(snapshot);

        let deadline = Instant::now() + self.timeout;
        while gate.paused {
            if self.detached.load(Ordering::Acquire) {
                gate.paused = false;
                return DebugCommand::Detached;
            }
            if self.wake.wait_until(&mut gate, deadline).timed_out() {
                if gate.paused {
                    gate.paused = false;
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "breakpoint released after {:?} without a resume",
                        self.timeout
                    );
                }
                break;
            }
        }
        if self.detached.load(Ordering::Acquire) {
            DebugCommand::Detached
        } else {
            DebugCommand::Continue
        }
    }

    fn publish(&self, snapshot: BreakpointSnapshot) {
        self.latest.store(Some(Arc::new(snapshot)));
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// UI: release a paused engine. No effect when nothing is paused.
    pub fn resume(&self) {
        let mut gate = self.gate.lock();
        gate.paused = false;
        self.wake.notify_all();
    }

    /// UI shutdown: release any pause and stop pausing on later breakpoints.
    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
        self.resume();
    }

    /// Re-enable pausing after [`detach`](Self::detach).
    pub fn attach(&self) {
        self.detached.store(false, Ordering::Release);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.gate.lock().paused
    }

    /// Most recent snapshot.
    pub fn latest(&self) -> Option<Arc<BreakpointSnapshot>> {
        self.latest.load_full()
    }

    /// Incremented each time a snapshot is published.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// The latest snapshot if one was published after `seen`.
    pub fn poll(&self, seen: u64) -> Option<(u64, Arc<BreakpointSnapshot>)> {
        let generation = self.generation();
        if generation == seen {
            return None;
        }
        self.latest().map(|snapshot| (generation, snapshot))
    }

    /// Pauses that ended by timeout.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Queue a breakpoint edit for the audio thread.
    pub fn request(&self, request: BreakpointRequest) -> bool {
        if self.requests.push(request).is_err() {
            log::warn!("breakpoint request queue full, dropping {:?}", request);
            return false;
        }
        true
    }

    /// Audio thread: apply queued edits in order.
    pub fn drain_requests(&self, mut apply: impl FnMut(&BreakpointRequest)) {
        while let Some(request) = self.requests.pop() {
            apply(&request);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn snapshot(line: i32) -> BreakpointSnapshot {
        BreakpointSnapshot {
            instrument: 1.0,
            line,
            kcounter: 10,
            variables: vec![VariableBinding {
                name: "kamp".to_string(),
                type_name: "k".to_string(),
                value: VariableValue::Scalar(0.5),
            }],
        }
    }

    fn wait_until_paused(bridge: &DebugBreakpointBridge) {
        let start = Instant::now();
        while !bridge.is_paused() {
            assert!(start.elapsed() < Duration::from_secs(5), "never paused");
            thread::yield_now();
        }
    }

    #[test]
    fn test_resume_releases_engine() {
        let bridge = Arc::new(DebugBreakpointBridge::new(Duration::from_secs(10)));
        let engine = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.on_breakpoint(snapshot(12)))
        };
        wait_until_paused(&bridge);
        let (generation, latest) = bridge.poll(0).unwrap();
        assert_eq!(generation, 1);
        assert_eq!(latest.line, 12);
        assert_eq!(
            latest.variable("kamp").unwrap().value,
            VariableValue::Scalar(0.5)
        );

        bridge.resume();
        assert_eq!(engine.join().unwrap(), DebugCommand::Continue);
        assert!(!bridge.is_paused());
        assert_eq!(bridge.timeouts(), 0);
    }

    #[test]
    fn test_timeout_releases_engine() {
        let bridge = DebugBreakpointBridge::new(Duration::from_millis(20));
        let start = Instant::now();
        assert_eq!(bridge.on_breakpoint(snapshot(3)), DebugCommand::Continue);
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(bridge.timeouts(), 1);
        assert!(!bridge.is_paused());
    }

    #[test]
    fn test_detach_releases_and_disables() {
        let bridge = Arc::new(DebugBreakpointBridge::new(Duration::from_secs(10)));
        let engine = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || bridge.on_breakpoint(snapshot(1)))
        };
        wait_until_paused(&bridge);
        bridge.detach();
        assert_eq!(engine.join().unwrap(), DebugCommand::Detached);

        let start = Instant::now();
        assert_eq!(bridge.on_breakpoint(snapshot(2)), DebugCommand::Detached);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(bridge.latest().unwrap().line, 2);

        bridge.attach();
        assert!(!bridge.is_detached());
    }

    #[test]
    fn test_poll_without_new_snapshot() {
        let bridge = DebugBreakpointBridge::new(Duration::from_millis(1));
        assert!(bridge.poll(0).is_none());
        bridge.on_breakpoint(snapshot(4));
        let (generation, _) = bridge.poll(0).unwrap();
        assert!(bridge.poll(generation).is_none());
    }

    #[test]
    fn test_requests_drain_in_order() {
        let bridge = DebugBreakpointBridge::new(Duration::from_millis(1));
        bridge.request(BreakpointRequest::SetLine {
            line: 10,
            instrument: 1,
            skip: 0,
        });
        bridge.request(BreakpointRequest::ClearAll);
        let mut seen = Vec::new();
        bridge.drain_requests(|r| seen.push(*r));
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], BreakpointRequest::ClearAll);
    }
}
