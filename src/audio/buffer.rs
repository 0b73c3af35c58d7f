//! Frames held back while a response is in flight
//!
//! Bounded: when full, the oldest frame is evicted. Drained in arrival order
//! once the session is ready for audio again.

use std::collections::VecDeque;

#[derive(Debug)]
pub struct PendingAudio {
    frames: VecDeque<Vec<u8>>,
    max_frames: usize,
    evicted: u64,
}

impl PendingAudio {
    pub fn new(max_frames: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(max_frames),
            max_frames,
            evicted: 0,
        }
    }

    /// Queue a frame, evicting the oldest if at capacity.
    /// Returns whether a frame was evicted.
    pub fn push(&mut self, frame: Vec<u8>) -> bool {
        if self.max_frames == 0 {
            self.evicted += 1;
            return true;
        }

        let evicted = if self.frames.len() >= self.max_frames {
            self.frames.pop_front();
            self.evicted += 1;
            if self.evicted % 10 == 1 {
                log::debug!("PendingAudio: full, {} frames evicted so far", self.evicted);
            }
            true
        } else {
            false
        };

        self.frames.push_back(frame);
        evicted
    }

    /// Drain all frames, oldest first
    pub fn drain_all(&mut self) -> Vec<Vec<u8>> {
        self.frames.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
