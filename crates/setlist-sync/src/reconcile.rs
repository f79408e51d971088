//! Scroll reconciliation for followers and scroll measurement for the master.
//!
//! A `scroll-synced` payload carries three hints. Followers try them in
//! [`Strategy::PRIORITY`] order against their own viewport; the first one
//! that can be applied wins. Layout can still be settling when the event
//! arrives, so the [`Reconciler`] re-runs the resolution on a fixed
//! schedule and lets a newer event take over any stage that has not run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use crate::protocol::{ScrollState, ScrollSync};

/// Offsets from event arrival at which resolution is attempted.
pub const RETRY_SCHEDULE: [Duration; 3] = [
    Duration::ZERO,
    Duration::from_millis(50),
    Duration::from_millis(200),
];

/// Local scroll container as far as reconciliation is concerned.
pub trait Viewport {
    /// Total height of the scrolled content.
    fn scroll_height(&self) -> f64;
    /// Height of the visible area.
    fn client_height(&self) -> f64;
    fn scroll_top(&self) -> f64;
    fn set_scroll_top(&mut self, offset: f64);
    /// Number of rendered content lines with a known anchor.
    fn line_count(&self) -> u32;
    /// Vertical offset of the anchor for line `index`, if rendered.
    fn line_offset(&self, index: u32) -> Option<f64>;

    fn max_scroll(&self) -> f64 {
        self.scroll_height() - self.client_height()
    }
}

/// What a follower should converge to.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScrollTarget {
    pub percent: Option<f64>,
    pub pixel_position: Option<f64>,
    pub line_index: Option<u32>,
}

impl ScrollTarget {
    /// Keep an exact offset, e.g. across a local transpose re-render.
    pub fn preserve(pixel_position: f64) -> Self {
        Self {
            percent: None,
            pixel_position: Some(pixel_position),
            line_index: None,
        }
    }
}

impl From<&ScrollState> for ScrollTarget {
    fn from(state: &ScrollState) -> Self {
        Self {
            percent: Some(state.percent),
            pixel_position: Some(state.pixel_position),
            line_index: state.line_index,
        }
    }
}

impl From<&ScrollSync> for ScrollTarget {
    fn from(sync: &ScrollSync) -> Self {
        Self {
            percent: Some(sync.percent),
            pixel_position: sync.pixel_position,
            line_index: sync.line_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Resolution independent; needs a measured scrollable extent.
    Percent,
    /// Text-size independent; needs the line's anchor to be rendered.
    LineIndex,
    /// Verbatim offset.
    Pixel,
}

impl Strategy {
    pub const PRIORITY: [Strategy; 3] = [Strategy::Percent, Strategy::LineIndex, Strategy::Pixel];

    /// Offset this strategy would scroll to, or `None` if it cannot apply
    /// to the viewport as it is right now.
    pub fn plan(self, target: &ScrollTarget, viewport: &dyn Viewport) -> Option<f64> {
        match self {
            Strategy::Percent => {
                let percent = target.percent.filter(|p| p.is_finite())?;
                let max_scroll = viewport.max_scroll();
                (max_scroll > 0.0).then(|| percent.clamp(0.0, 100.0) / 100.0 * max_scroll)
            }
            Strategy::LineIndex => target.line_index.and_then(|idx| viewport.line_offset(idx)),
            Strategy::Pixel => target
                .pixel_position
                .filter(|p| p.is_finite() && *p >= 0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Applied {
    pub strategy: Strategy,
    pub offset: f64,
}

pub fn resolve(target: &ScrollTarget, viewport: &dyn Viewport) -> Option<Applied> {
    Strategy::PRIORITY.into_iter().find_map(|strategy| {
        strategy
            .plan(target, viewport)
            .map(|offset| Applied { strategy, offset })
    })
}

/// Resolve `target` and write the result into `viewport`. The returned
/// offset is where the viewport ended up, which may be clamped.
pub fn apply_once<V: Viewport>(target: &ScrollTarget, viewport: &mut V) -> Option<Applied> {
    let planned = resolve(target, &*viewport)?;
    viewport.set_scroll_top(planned.offset);
    Some(Applied {
        offset: viewport.scroll_top(),
        ..planned
    })
}

/// Master side: describe the current position for a `syncScroll`.
pub fn measure(viewport: &dyn Viewport) -> ScrollSync {
    let scroll_top = viewport.scroll_top();
    let max_scroll = viewport.max_scroll();
    let percent = if max_scroll > 0.0 {
        scroll_top / max_scroll * 100.0
    } else {
        0.0
    };
    ScrollSync {
        percent,
        pixel_position: Some(scroll_top),
        line_index: nearest_line(viewport, scroll_top),
    }
}

/// Line whose anchor is closest to `position`; the first one wins ties.
pub fn nearest_line(viewport: &dyn Viewport, position: f64) -> Option<u32> {
    let mut best: Option<(u32, f64)> = None;
    for index in 0..viewport.line_count() {
        let Some(offset) = viewport.line_offset(index) else {
            continue;
        };
        let distance = (position - offset).abs();
        if best.map_or(true, |(_, best_distance)| distance < best_distance) {
            best = Some((index, distance));
        }
    }
    best.map(|(index, _)| index)
}

/// Runs staged reconciliation attempts against a shared viewport.
pub struct Reconciler<V> {
    viewport: Arc<Mutex<V>>,
    generation: Arc<AtomicU64>,
    schedule: Vec<Duration>,
}

impl<V> Clone for Reconciler<V> {
    fn clone(&self) -> Self {
        Self {
            viewport: Arc::clone(&self.viewport),
            generation: Arc::clone(&self.generation),
            schedule: self.schedule.clone(),
        }
    }
}

impl<V: Viewport + Send + 'static> Reconciler<V> {
    pub fn new(viewport: Arc<Mutex<V>>) -> Self {
        Self::with_schedule(viewport, RETRY_SCHEDULE.to_vec())
    }

    pub fn with_schedule(viewport: Arc<Mutex<V>>, mut schedule: Vec<Duration>) -> Self {
        schedule.sort();
        if schedule.is_empty() {
            schedule.push(Duration::ZERO);
        }
        Self {
            viewport,
            generation: Arc::new(AtomicU64::new(0)),
            schedule,
        }
    }

    pub fn viewport(&self) -> &Arc<Mutex<V>> {
        &self.viewport
    }

    /// Start converging on `target`, superseding any earlier target still
    /// in flight. The task resolves to the last applied offset, or `None`
    /// if nothing could be applied or a newer target took over.
    pub fn reconcile(&self, target: ScrollTarget) -> JoinHandle<Option<Applied>> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let current = Arc::clone(&self.generation);
        let viewport = Arc::clone(&self.viewport);
        let schedule = self.schedule.clone();
        let started = Instant::now();

        tokio::spawn(async move {
            let mut last = None;
            for (stage, offset) in schedule.into_iter().enumerate() {
                tokio::time::sleep_until(started + offset).await;
                if current.load(Ordering::SeqCst) != generation {
                    trace!(generation, stage, "scroll target superseded");
                    return None;
                }
                let mut guard = viewport.lock();
                if let Some(applied) = apply_once(&target, &mut *guard) {
                    trace!(
                        generation,
                        stage,
                        strategy = ?applied.strategy,
                        offset = applied.offset,
                        "scroll applied"
                    );
                    last = Some(applied);
                }
            }
            last
        })
    }
}

/// Headless viewport with evenly spaced lines.
///
/// While a render is in progress only the first `rendered` lines have
/// anchors and the scrollable extent reads as zero, though the content
/// itself can already be scrolled.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutViewport {
    line_height: f64,
    client_height: f64,
    lines: u32,
    rendered: u32,
    measured: bool,
    scroll_top: f64,
}

impl LayoutViewport {
    pub fn new(lines: u32, line_height: f64, client_height: f64) -> Self {
        Self {
            line_height,
            client_height,
            lines,
            rendered: lines,
            measured: true,
            scroll_top: 0.0,
        }
    }

    /// `lines` of content of which only `rendered` have anchors so far, with
    /// the extent not yet measured.
    pub fn partially_rendered(
        lines: u32,
        rendered: u32,
        line_height: f64,
        client_height: f64,
    ) -> Self {
        Self {
            rendered: rendered.min(lines),
            measured: false,
            ..Self::new(lines, line_height, client_height)
        }
    }

    pub fn for_document(document: &str, line_height: f64, client_height: f64) -> Self {
        let lines = u32::try_from(document.lines().count()).unwrap_or(u32::MAX);
        Self::new(lines, line_height, client_height)
    }

    /// Swap in fully re-rendered content, keeping the offset within bounds.
    pub fn relayout(&mut self, lines: u32, line_height: f64) {
        self.lines = lines;
        self.rendered = lines;
        self.measured = true;
        self.line_height = line_height;
        let top = self.scroll_top;
        self.set_scroll_top(top);
    }

    fn content_height(&self) -> f64 {
        f64::from(self.lines) * self.line_height
    }
}

impl Viewport for LayoutViewport {
    fn scroll_height(&self) -> f64 {
        if self.measured {
            self.content_height()
        } else {
            0.0
        }
    }

    fn client_height(&self) -> f64 {
        self.client_height
    }

    fn scroll_top(&self) -> f64 {
        self.scroll_top
    }

    fn set_scroll_top(&mut self, offset: f64) {
        let limit = (self.content_height() - self.client_height).max(0.0);
        self.scroll_top = offset.clamp(0.0, limit);
    }

    fn line_count(&self) -> u32 {
        self.rendered
    }

    fn line_offset(&self, index: u32) -> Option<f64> {
        (index < self.rendered).then(|| f64::from(index) * self.line_height)
    }
}
