/// Outcome of validating one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameVerdict {
    Accepted,
    Empty,
    TooShort { len: usize },
    TooLarge { len: usize },
    /// Odd byte count cannot be PCM16
    Misaligned { len: usize },
}

impl FrameVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FrameVerdict::Accepted)
    }
}

impl std::fmt::Display for FrameVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameVerdict::Accepted => write!(f, "accepted"),
            FrameVerdict::Empty => write!(f, "empty frame"),
            FrameVerdict::TooShort { len } => write!(f, "frame too short ({} bytes)", len),
            FrameVerdict::TooLarge { len } => write!(f, "frame too large ({} bytes)", len),
            FrameVerdict::Misaligned { len } => {
                write!(f, "frame is not PCM16 aligned ({} bytes)", len)
            }
        }
    }
}

/// Classifies byte chunks as plausible PCM16 audio. Silence is valid audio.
#[derive(Debug, Clone)]
pub struct AudioFrameValidator {
    min_bytes: usize,
    max_bytes: usize,
}

impl AudioFrameValidator {
    pub fn new(min_bytes: usize, max_bytes: usize) -> Self {
        Self {
            min_bytes: min_bytes.max(1),
            max_bytes: max_bytes.max(min_bytes),
        }
    }

    pub fn validate(&self, frame: &[u8]) -> FrameVerdict {
        let len = frame.len();
        if len == 0 {
            FrameVerdict::Empty
        } else if len < self.min_bytes {
            FrameVerdict::TooShort { len }
        } else if len > self.max_bytes {
            FrameVerdict::TooLarge { len }
        } else if len % 2 != 0 {
            FrameVerdict::Misaligned { len }
        } else {
            FrameVerdict::Accepted
        }
    }
}

impl Default for AudioFrameValidator {
    fn default() -> Self {
        Self::new(2, 1 << 20)
    }
}

/// Level statistics for a PCM16 little-endian frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameStats {
    pub samples: usize,
    pub peak_abs: i32,
    pub rms: f32,
}

impl FrameStats {
    pub fn is_silent(&self) -> bool {
        self.peak_abs == 0
    }
}

pub fn analyze_pcm16(frame: &[u8]) -> FrameStats {
    let mut peak_abs = 0i32;
    let mut sum_sq = 0f64;
    let mut samples = 0usize;

    for pair in frame.chunks_exact(2) {
        let s = i16::from_le_bytes([pair[0], pair[1]]) as i32;
        peak_abs = peak_abs.max(s.abs());
        sum_sq += (s as f64) * (s as f64);
        samples += 1;
    }

    let rms = if samples == 0 {
        0.0
    } else {
        (sum_sq / samples as f64).sqrt() as f32
    };

    FrameStats {
        samples,
        peak_abs,
        rms,
    }
}
