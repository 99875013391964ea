//! Table and graph snapshots for the GUI's signal scopes.
//!
//! Two sources feed the inspector:
//! - function tables the GUI has asked to watch, read from the engine by
//!   [`SignalInspector::capture_table`];
//! - engine display opcodes (`display`, `dispfft`), which draw into
//!   pre-allocated [`DisplayStaging`] slots on the audio thread.
//!
//! Both are turned into [`SignalDisplay`] snapshots only at the adapter's
//! throttled cadence. Each snapshot replaces the previous one atomically.
//! After a capture pass [`SignalInspector::mark_refreshed`] raises a
//! one-shot flag that the GUI consumes with
//! [`SignalInspector::should_refresh`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};

use crate::engine::DisplayFrame;

const CAPTION_CAPACITY: usize = 64;

/// One scope's worth of data.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDisplay {
    pub caption: String,
    /// Table number, or the engine window id for graphs.
    pub id: i64,
    pub y_scale: f32,
    pub min: f32,
    pub max: f32,
    pub points: Vec<f32>,
}

/// Read access to engine function tables.
pub trait TableSource {
    fn table(&self, number: i32) -> Option<&[f64]>;
}

struct TableEntry {
    number: i32,
    current: ArcSwapOption<SignalDisplay>,
}

struct GraphEntry {
    id: usize,
    current: ArcSwap<SignalDisplay>,
}

/// Shared inspector state. Written at the throttled cadence, read by the GUI.
pub struct SignalInspector {
    tables: ArcSwap<Vec<Arc<TableEntry>>>,
    graphs: ArcSwap<Vec<Arc<GraphEntry>>>,
    fresh: AtomicBool,
    captures: AtomicU64,
    max_points: usize,
}

impl SignalInspector {
    pub fn new(max_points: usize) -> Self {
        Self {
            tables: ArcSwap::from_pointee(Vec::new()),
            graphs: ArcSwap::from_pointee(Vec::new()),
            fresh: AtomicBool::new(false),
            captures: AtomicU64::new(0),
            max_points: max_points.max(1),
        }
    }

    /// Ask for table `number` to be captured on every refresh.
    pub fn watch_table(&self, number: i32) {
        self.tables.rcu(|tables| {
            let mut next = Vec::clone(tables);
            if !next.iter().any(|t| t.number == number) {
                next.push(Arc::new(TableEntry {
                    number,
                    current: ArcSwapOption::empty(),
                }));
            }
            next
        });
    }

    pub fn unwatch_table(&self, number: i32) {
        self.tables.rcu(|tables| {
            tables
                .iter()
                .filter(|t| t.number != number)
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    pub fn watched_tables(&self) -> Vec<i32> {
        self.tables.load().iter().map(|t| t.number).collect()
    }

    /// Read table `number` from `source` and swap it into its entry.
    ///
    /// Not real-time safe (allocates the snapshot); bounded by
    /// `max_points`. Returns `None` when the engine has no such table.
    pub fn capture_table(
        &self,
        source: &impl TableSource,
        number: i32,
    ) -> Option<Arc<SignalDisplay>> {
        let data = source.table(number)?;
        let points: Vec<f32> = data.iter().take(self.max_points).map(|&v| v as f32).collect();
        let (min, max) = range_of(&points);
        let display = Arc::new(SignalDisplay {
            caption: format!("table{}", number),
            id: i64::from(number),
            y_scale: min.abs().max(max.abs()),
            min,
            max,
            points,
        });
        if let Some(entry) = self.tables.load().iter().find(|t| t.number == number) {
            entry.current.store(Some(Arc::clone(&display)));
        }
        Some(display)
    }

    /// Capture every watched table. Returns how many were found.
    pub fn capture_watched(&self, source: &impl TableSource) -> usize {
        let tables = self.tables.load();
        tables
            .iter()
            .filter(|entry| self.capture_table(source, entry.number).is_some())
            .count()
    }

    /// Turn dirty staged graph frames into snapshots. Returns how many.
    pub fn publish_staged(&self, staging: &mut DisplayStaging) -> usize {
        let mut published = 0;
        for slot in staging.slots.iter_mut().filter(|s| s.active && s.dirty) {
            slot.dirty = false;
            let display = SignalDisplay {
                caption: slot.caption.clone(),
                id: slot.id as i64,
                y_scale: slot.y_scale,
                min: slot.min,
                max: slot.max,
                points: slot.points.clone(),
            };
            let existing = self
                .graphs
                .load()
                .iter()
                .find(|g| g.id == slot.id)
                .cloned();
            match existing {
                Some(entry) => entry.current.store(Arc::new(display)),
                None => {
                    let entry = Arc::new(GraphEntry {
                        id: slot.id,
                        current: ArcSwap::from_pointee(display),
                    });
                    self.graphs.rcu(|graphs| {
                        let mut next = Vec::clone(graphs);
                        next.push(Arc::clone(&entry));
                        next
                    });
                }
            }
            published += 1;
        }
        published
    }

    /// Latest snapshot of a watched table.
    pub fn table_display(&self, number: i32) -> Option<Arc<SignalDisplay>> {
        self.tables
            .load()
            .iter()
            .find(|t| t.number == number)
            .and_then(|t| t.current.load_full())
    }

    /// Latest graph whose caption mentions both `variable` and `kind`
    /// (for example `"aSig"` and `"fft"`).
    pub fn display(&self, variable: &str, kind: &str) -> Option<Arc<SignalDisplay>> {
        self.graphs
            .load()
            .iter()
            .map(|g| g.current.load_full())
            .find(|d| d.caption.contains(variable) && d.caption.contains(kind))
    }

    /// Every published graph snapshot.
    pub fn displays(&self) -> Vec<Arc<SignalDisplay>> {
        self.graphs
            .load()
            .iter()
            .map(|g| g.current.load_full())
            .collect()
    }

    /// Raise the one-shot refresh flag after a completed capture.
    pub fn mark_refreshed(&self) {
        self.captures.fetch_add(1, Ordering::Relaxed);
        self.fresh.store(true, Ordering::Release);
    }

    /// True once per completed capture, false until the next one.
    pub fn should_refresh(&self) -> bool {
        self.fresh.swap(false, Ordering::AcqRel)
    }

    /// Completed capture passes.
    pub fn captures(&self) -> u64 {
        self.captures.load(Ordering::Relaxed)
    }

    /// Drop every snapshot. Watched table numbers are kept.
    pub fn clear(&self) {
        self.graphs.store(Arc::new(Vec::new()));
        for entry in self.tables.load().iter() {
            entry.current.store(None);
        }
        self.fresh.store(false, Ordering::Release);
    }
}

fn range_of(points: &[f32]) -> (f32, f32) {
    if points.is_empty() {
        return (0.0, 0.0);
    }
    points
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &p| (lo.min(p), hi.max(p)))
}

struct StagedDisplay {
    active: bool,
    dirty: bool,
    id: usize,
    caption: String,
    points: Vec<f32>,
    min: f32,
    max: f32,
    y_scale: f32,
}

/// Audio-thread staging for engine graph frames.
///
/// Every slot is allocated up front; [`make`](Self::make),
/// [`draw`](Self::draw) and [`kill`](Self::kill) never allocate.
pub struct DisplayStaging {
    slots: Vec<StagedDisplay>,
}

impl DisplayStaging {
    pub fn new(max_displays: usize, max_points: usize) -> Self {
        let slots = (0..max_displays)
            .map(|_| StagedDisplay {
                active: false,
                dirty: false,
                id: 0,
                caption: String::with_capacity(CAPTION_CAPACITY),
                points: Vec::with_capacity(max_points),
                min: 0.0,
                max: 0.0,
                y_scale: 1.0,
            })
            .collect();
        Self { slots }
    }

    /// Claim a slot for display `id`. Ignored when every slot is taken.
    pub fn make(&mut self, id: usize, caption: &str) -> bool {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.active && s.id == id) {
            set_caption(&mut slot.caption, caption);
            return true;
        }
        let Some(slot) = self.slots.iter_mut().find(|s| !s.active) else {
            return false;
        };
        slot.active = true;
        slot.dirty = false;
        slot.id = id;
        set_caption(&mut slot.caption, caption);
        slot.points.clear();
        true
    }

    /// Copy a frame into its slot, truncated to the slot capacity.
    pub fn draw(&mut self, frame: &DisplayFrame<'_>) {
        let Some(slot) = self.slots.iter_mut().find(|s| s.active && s.id == frame.id) else {
            return;
        };
        let capacity = slot.points.capacity();
        slot.points.clear();
        slot.points
            .extend(frame.points.iter().take(capacity).map(|&v| v as f32));
        slot.min = frame.min as f32;
        slot.max = frame.max as f32;
        slot.y_scale = frame.y_scale as f32;
        if !frame.caption.is_empty() && slot.caption != frame.caption {
            set_caption(&mut slot.caption, frame.caption);
        }
        slot.dirty = true;
    }

    pub fn kill(&mut self, id: usize) {
        for slot in self.slots.iter_mut().filter(|s| s.id == id) {
            slot.active = false;
            slot.dirty = false;
        }
    }

    /// Release every slot.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.active = false;
            slot.dirty = false;
        }
    }
}

/// Replace `dst` with as much of `src` as fits its capacity.
fn set_caption(dst: &mut String, src: &str) {
    dst.clear();
    let mut end = src.len().min(dst.capacity());
    while !src.is_char_boundary(end) {
        end -= 1;
    }
    dst.push_str(&src[..end]);
}
