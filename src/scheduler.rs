//! Render pacing — decouples mutation from redraw.
//!
//! Edits never render directly: they signal the [`RedrawScheduler`], which
//! coalesces any number of "something changed" rects into one union and
//! hands it out once per pacing tick.  [`RedrawScheduler::flush`] is the
//! escape hatch for gesture-end, so the final stroke state is never lost to
//! batching.  [`PlaybackClock`] advances animation cooperatively on the same
//! external cadence and never blocks drawing.

use crate::document::Frame;
use crate::surface::Rect;

// ============================================================================
// REDRAW SCHEDULER
// ============================================================================

pub struct RedrawScheduler {
    width: u32,
    height: u32,
    pending: Option<Rect>,
    /// Signals accumulated since the last drain.
    signals: u64,
}

impl RedrawScheduler {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, pending: None, signals: 0 }
    }

    /// Record a changed region; `None` means the whole canvas.  Merges with
    /// any pending rect so updates are never lost between ticks.
    pub fn mark_dirty(&mut self, rect: Option<Rect>) {
        let full = Rect::from_min_max(0, 0, self.width as i32, self.height as i32);
        let rect = rect.map(|r| r.intersect(full)).unwrap_or(full);
        if rect.is_empty() {
            return;
        }
        self.pending = Rect::union_opt(self.pending, rect);
        self.signals += 1;
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Number of dirty signals merged since the last drain.
    pub fn coalesced_signals(&self) -> u64 {
        self.signals
    }

    /// Called once per pacing tick: the single region to redraw, if any.
    pub fn on_tick(&mut self) -> Option<Rect> {
        self.signals = 0;
        self.pending.take()
    }

    /// Force an immediate drain (gesture-end), bypassing the pacing tick.
    pub fn flush(&mut self) -> Option<Rect> {
        self.on_tick()
    }
}

// ============================================================================
// PLAYBACK CLOCK
// ============================================================================

/// Cooperative animation playback.  A host timer calls [`PlaybackClock::tick`]
/// on a fixed cadence; the clock advances the frame index according to each
/// frame's display duration and yields immediately.
pub struct PlaybackClock {
    playing: bool,
    current: usize,
    elapsed_ms: u32,
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self { playing: false, current: 0, elapsed_ms: 0 }
    }
}

impl PlaybackClock {
    pub fn play(&mut self) {
        self.playing = true;
    }

    pub fn pause(&mut self) {
        self.playing = false;
        self.elapsed_ms = 0;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Index into the document's frame list.
    pub fn current_frame(&self) -> usize {
        self.current
    }

    pub fn set_frame(&mut self, index: usize) {
        self.current = index;
        self.elapsed_ms = 0;
    }

    /// Advance by `dt_ms`.  Returns whether the current frame changed;
    /// wraps at the end of the frame list.
    pub fn tick(&mut self, frames: &[Frame], dt_ms: u32) -> bool {
        if !self.playing || frames.is_empty() {
            return false;
        }
        if self.current >= frames.len() {
            self.current = 0;
        }
        self.elapsed_ms += dt_ms;
        let mut changed = false;
        // A long stall may skip several short frames in one tick.
        loop {
            let duration = frames[self.current].duration_ms.max(1);
            if self.elapsed_ms < duration {
                break;
            }
            self.elapsed_ms -= duration;
            self.current = (self.current + 1) % frames.len();
            changed = true;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cels::FrameId;

    fn frames(durations: &[u32]) -> Vec<Frame> {
        durations
            .iter()
            .enumerate()
            .map(|(i, &d)| Frame { id: FrameId(i as u32), duration_ms: d })
            .collect()
    }

    #[test]
    fn dirty_signals_coalesce_into_one_rect_per_tick() {
        let mut sched = RedrawScheduler::new(32, 32);
        sched.mark_dirty(Some(Rect::from_min_max(0, 0, 4, 4)));
        sched.mark_dirty(Some(Rect::from_min_max(10, 10, 12, 12)));
        sched.mark_dirty(Some(Rect::from_min_max(2, 2, 6, 6)));
        assert_eq!(sched.coalesced_signals(), 3);
        assert_eq!(sched.on_tick(), Some(Rect::from_min_max(0, 0, 12, 12)));
        assert_eq!(sched.on_tick(), None);
    }

    #[test]
    fn flush_drains_immediately() {
        let mut sched = RedrawScheduler::new(32, 32);
        assert_eq!(sched.flush(), None);
        sched.mark_dirty(None);
        assert_eq!(sched.flush(), Some(Rect::from_min_max(0, 0, 32, 32)));
    }

    #[test]
    fn playback_honors_frame_durations_and_wraps() {
        let mut clock = PlaybackClock::default();
        let frames = frames(&[100, 50, 50]);
        assert!(!clock.tick(&frames, 100)); // paused
        clock.play();
        assert!(!clock.tick(&frames, 60));
        assert!(clock.tick(&frames, 60)); // 120ms > 100ms
        assert_eq!(clock.current_frame(), 1);
        // One long stall crosses the remaining frames and wraps.
        assert!(clock.tick(&frames, 120));
        assert_eq!(clock.current_frame(), 0);
    }
}
