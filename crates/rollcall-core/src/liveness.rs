//! Blink-based liveness.
//!
//! Each tracked identity owns a [`BlinkTracker`], a small state machine fed
//! one eye aspect ratio (EAR) per frame:
//!
//! ```text
//!   Awake ──EAR < threshold──▶ Closing{n} ──EAR ≥ threshold, MIN ≤ n ≤ MAX──▶ Confirmed
//!     ▲                           │
//!     └──EAR ≥ threshold, n ∉ [MIN, MAX]
//! ```
//!
//! `Confirmed` holds until the attendance gate consumes it with
//! [`BlinkTracker::reset`], or until the confirmation TTL runs out.

use crate::types::{EyeContour, EyeLandmarks, Point};
use serde::Serialize;
use std::time::{Duration, Instant};

pub const DEFAULT_CLOSED_THRESHOLD: f32 = 0.25;
pub const DEFAULT_MIN_CLOSED_FRAMES: u32 = 1;
/// Closures longer than this are sustained eye closure, not a blink.
pub const DEFAULT_MAX_CLOSED_FRAMES: u32 = 10;
pub const DEFAULT_CONFIRMATION_TTL: Duration = Duration::from_secs(5);

/// Lower bound on eye width, so a collapsed contour reads as closed instead of NaN.
const MIN_EYE_WIDTH: f32 = 1e-3;

fn distance(a: Point, b: Point) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// EAR = (‖p2−p6‖ + ‖p3−p5‖) / (2·‖p1−p4‖).
pub fn eye_aspect_ratio(eye: &EyeContour) -> f32 {
    let [p1, p2, p3, p4, p5, p6] = *eye;
    let vertical = distance(p2, p6) + distance(p3, p5);
    let horizontal = distance(p1, p4).max(MIN_EYE_WIDTH);
    vertical / (2.0 * horizontal)
}

impl EyeLandmarks {
    /// Mean EAR of both eyes.
    pub fn aspect_ratio(&self) -> f32 {
        (eye_aspect_ratio(&self.left) + eye_aspect_ratio(&self.right)) / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlinkPolicy {
    pub closed_threshold: f32,
    pub min_closed_frames: u32,
    pub max_closed_frames: u32,
    /// How long an unconsumed confirmation stays valid; `None` keeps it forever.
    pub confirmation_ttl: Option<Duration>,
}

impl Default for BlinkPolicy {
    fn default() -> Self {
        Self {
            closed_threshold: DEFAULT_CLOSED_THRESHOLD,
            min_closed_frames: DEFAULT_MIN_CLOSED_FRAMES,
            max_closed_frames: DEFAULT_MAX_CLOSED_FRAMES,
            confirmation_ttl: Some(DEFAULT_CONFIRMATION_TTL),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessPhase {
    Awake,
    Closing { closed_frames: u32 },
    Confirmed { at: Instant },
}

/// Point-in-time view of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LivenessState {
    pub consecutive_closed_frames: u32,
    pub blink_confirmed: bool,
    #[serde(skip)]
    pub last_update: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct BlinkTracker {
    policy: BlinkPolicy,
    phase: LivenessPhase,
    last_update: Option<Instant>,
}

impl BlinkTracker {
    pub fn new(policy: BlinkPolicy) -> Self {
        Self {
            policy,
            phase: LivenessPhase::Awake,
            last_update: None,
        }
    }

    pub fn phase(&self) -> LivenessPhase {
        self.phase
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.phase, LivenessPhase::Confirmed { .. })
    }

    pub fn state(&self) -> LivenessState {
        LivenessState {
            consecutive_closed_frames: match self.phase {
                LivenessPhase::Closing { closed_frames } => closed_frames,
                _ => 0,
            },
            blink_confirmed: self.is_confirmed(),
            last_update: self.last_update,
        }
    }

    /// Back to `Awake`, discarding any confirmation.
    pub fn reset(&mut self) {
        self.phase = LivenessPhase::Awake;
    }

    /// Drop a confirmation older than the policy TTL.
    pub fn expire(&mut self, now: Instant) {
        if let (LivenessPhase::Confirmed { at }, Some(ttl)) =
            (self.phase, self.policy.confirmation_ttl)
        {
            let age = now.saturating_duration_since(at);
            if age > ttl {
                tracing::debug!(age_ms = age.as_millis() as u64, "blink confirmation expired");
                self.phase = LivenessPhase::Awake;
            }
        }
    }

    /// Feed one frame's EAR; returns the phase after the transition.
    pub fn observe(&mut self, ear: f32, now: Instant) -> LivenessPhase {
        self.expire(now);
        self.last_update = Some(now);

        let closed = ear < self.policy.closed_threshold;
        let next = match self.phase {
            LivenessPhase::Awake if closed => LivenessPhase::Closing { closed_frames: 1 },
            LivenessPhase::Awake => LivenessPhase::Awake,
            LivenessPhase::Closing { closed_frames } if closed => LivenessPhase::Closing {
                closed_frames: closed_frames.saturating_add(1),
            },
            LivenessPhase::Closing { closed_frames } => {
                let BlinkPolicy {
                    min_closed_frames: min,
                    max_closed_frames: max,
                    ..
                } = self.policy;
                if (min..=max).contains(&closed_frames) {
                    tracing::debug!(closed_frames, ear, "blink confirmed");
                    LivenessPhase::Confirmed { at: now }
                } else {
                    tracing::debug!(closed_frames, min, max, "eye reopened outside blink window");
                    LivenessPhase::Awake
                }
            }
            confirmed @ LivenessPhase::Confirmed { .. } => confirmed,
        };
        self.phase = next;
        next
    }
}
