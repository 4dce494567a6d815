use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Timing information of a single [`super::Renderer::draw_frame`] call.
#[derive(Debug, Clone, Copy)]
pub struct FrameTiming {
    pub frame_counter: u64,
    pub slot: usize,
    pub start: Instant,
    pub end: Instant,
    /// Whether the frame got submitted and presented, as opposed to being dropped.
    pub presented: bool,
}

impl FrameTiming {
    /// Time spent on the CPU side of the frame.
    #[doc(alias = "delta")]
    pub fn cpu_time(&self) -> Duration {
        self.end.duration_since(self.start)
    }
}

/// Bounded history of frame timings, oldest first.
#[derive(Debug, Clone)]
pub struct FrameTimingHistory {
    pub max_history_size: usize,
    history: VecDeque<FrameTiming>,
    pending: Option<(Instant, u64, usize)>,
}

impl FrameTimingHistory {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            max_history_size: max_history_size.max(1),
            history: VecDeque::with_capacity(max_history_size.min(4096)),
            pending: None,
        }
    }

    pub fn begin_frame(&mut self, frame_counter: u64, slot: usize) {
        debug_assert!(self.pending.is_none());
        self.pending = Some((Instant::now(), frame_counter, slot));
    }

    pub fn finish_frame(&mut self, presented: bool) {
        let Some((start, frame_counter, slot)) = self.pending.take() else {
            return;
        };

        if self.history.len() >= self.max_history_size {
            self.history.pop_front();
        }
        self.history.push_back(FrameTiming {
            frame_counter,
            slot,
            start,
            end: Instant::now(),
            presented,
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameTiming> {
        self.history.iter()
    }

    pub fn last(&self) -> Option<&FrameTiming> {
        self.history.back()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn dropped_frames(&self) -> usize {
        self.history.iter().filter(|t| !t.presented).count()
    }

    /// Mean CPU time over the recorded history.
    pub fn average_cpu_time(&self) -> Duration {
        if self.history.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.history.iter().map(FrameTiming::cpu_time).sum();
        total / self.history.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn history_is_bounded() {
        let mut history = FrameTimingHistory::new(3);
        for frame in 0..5 {
            history.begin_frame(frame, frame as usize % 3);
            history.finish_frame(frame != 2);
        }

        assert_eq!(history.len(), 3);
        let frames: Vec<_> = history.iter().map(|t| t.frame_counter).collect();
        assert_eq!(frames, vec![2, 3, 4]);
        assert_eq!(history.dropped_frames(), 1);
    }
}
