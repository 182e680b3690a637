//! Parameter curves: sweeps and ADSR-style envelopes.
//!
//! Both generators produce [`Keyframe`]s anchored at a start beat. Durations
//! are given in seconds and converted to beats with the session tempo, so a
//! two-second sweep lasts two seconds at any BPM.

use crate::error::{Error, Result};
use crate::timing::{seconds_to_beats, Tempo};
use serde::{Deserialize, Serialize};

/// Highest value a 7-bit parameter accepts.
pub const MAX_VALUE: f64 = 127.0;

/// Upper bound on generated steps per sweep or envelope stage.
pub const MAX_STEPS: u32 = 4096;

/// Interpolation shape of a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Curve {
    /// Constant rate of change (default)
    #[default]
    Linear,
    /// Slow start, fast finish (`t²`)
    Exponential,
    /// Fast start, slow finish (`√t`)
    Logarithmic,
}

impl Curve {
    /// Shape a normalized position `t` in `0.0..=1.0`.
    pub fn apply(self, t: f64) -> f64 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Curve::Linear => t,
            Curve::Exponential => t * t,
            Curve::Logarithmic => t.sqrt(),
        }
    }
}

/// A parameter value at an absolute beat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keyframe {
    pub beat: f64,
    pub value: u8,
}

fn quantize(value: f64) -> u8 {
    value.round().clamp(0.0, MAX_VALUE) as u8
}

fn check_seconds(field: &'static str, seconds: f64) -> Result<f64> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(Error::InvalidRange {
            field,
            value: seconds,
            min: 0.0,
            max: f64::INFINITY,
        });
    }
    Ok(seconds)
}

/// A single-parameter sweep from `start` to `end`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sweep {
    pub start: f64,
    pub end: f64,
    pub duration_seconds: f64,
    #[serde(default)]
    pub curve: Curve,
    #[serde(default = "default_sweep_steps")]
    pub steps: u32,
}

fn default_sweep_steps() -> u32 {
    50
}

impl Sweep {
    /// Generate `steps` keyframes at equal time intervals starting at `start_beat`.
    ///
    /// The first keyframe carries `start` and the last carries `end`;
    /// every value is rounded and clamped to 0-127.
    pub fn keyframes(&self, start_beat: f64, tempo: Tempo) -> Result<Vec<Keyframe>> {
        if self.steps < 2 || self.steps > MAX_STEPS {
            return Err(Error::range("sweep steps", self.steps, 2, MAX_STEPS));
        }
        let duration = seconds_to_beats(check_seconds("sweep duration", self.duration_seconds)?, tempo);
        let last = (self.steps - 1) as f64;

        Ok((0..self.steps)
            .map(|i| {
                let t = i as f64 / last;
                Keyframe {
                    beat: start_beat + duration * t,
                    value: quantize(self.start + (self.end - self.start) * self.curve.apply(t)),
                }
            })
            .collect())
    }
}

/// Attack/decay/sustain/release envelope over the full 0-127 range.
///
/// Attack rises from 0 to 127, decay falls to `sustain`, release falls from
/// `sustain` to 0. Hold is not modelled: release begins as soon as decay ends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub attack_seconds: f64,
    pub decay_seconds: f64,
    pub sustain: u8,
    pub release_seconds: f64,
    #[serde(default = "default_steps_per_stage")]
    pub steps_per_stage: u32,
}

fn default_steps_per_stage() -> u32 {
    20
}

impl Envelope {
    /// Generate keyframes for all stages, starting at `start_beat`.
    ///
    /// Each stage contributes `steps_per_stage` keyframes beginning at the
    /// stage start; the next stage starts exactly where the previous one
    /// ends. A closing keyframe at the end of release returns the value to 0.
    pub fn keyframes(&self, start_beat: f64, tempo: Tempo) -> Result<Vec<Keyframe>> {
        if self.steps_per_stage == 0 || self.steps_per_stage > MAX_STEPS {
            return Err(Error::range("steps per stage", self.steps_per_stage, 1, MAX_STEPS));
        }
        if self.sustain as f64 > MAX_VALUE {
            return Err(Error::range("sustain", self.sustain, 0, 127));
        }
        let sustain = self.sustain as f64;
        let stages = [
            (check_seconds("attack", self.attack_seconds)?, 0.0, MAX_VALUE),
            (check_seconds("decay", self.decay_seconds)?, MAX_VALUE, sustain),
            (check_seconds("release", self.release_seconds)?, sustain, 0.0),
        ];

        let steps = self.steps_per_stage;
        let mut frames = Vec::with_capacity(stages.len() * steps as usize + 1);
        let mut stage_start = start_beat;
        for (seconds, from, to) in stages {
            let length = seconds_to_beats(seconds, tempo);
            for i in 0..steps {
                let t = i as f64 / steps as f64;
                frames.push(Keyframe {
                    beat: stage_start + length * t,
                    value: quantize(from + (to - from) * t),
                });
            }
            stage_start += length;
        }
        frames.push(Keyframe { beat: stage_start, value: 0 });
        Ok(frames)
    }

    /// Total envelope length in seconds.
    pub fn duration_seconds(&self) -> f64 {
        self.attack_seconds + self.decay_seconds + self.release_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempo() -> Tempo {
        Tempo::new(120.0).unwrap()
    }

    fn sweep(start: f64, end: f64, curve: Curve, steps: u32) -> Sweep {
        Sweep {
            start,
            end,
            duration_seconds: 2.0,
            curve,
            steps,
        }
    }

    #[test]
    fn test_two_step_linear_sweep() {
        let frames = sweep(0.0, 127.0, Curve::Linear, 2).keyframes(0.0, tempo()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Keyframe { beat: 0.0, value: 0 });
        // 2 seconds at 120 BPM = 4 beats
        assert_eq!(frames[1], Keyframe { beat: 4.0, value: 127 });
    }

    #[test]
    fn test_curve_shapes() {
        let lin = sweep(0.0, 100.0, Curve::Linear, 5).keyframes(0.0, tempo()).unwrap();
        let exp = sweep(0.0, 100.0, Curve::Exponential, 5).keyframes(0.0, tempo()).unwrap();
        let log = sweep(0.0, 100.0, Curve::Logarithmic, 5).keyframes(0.0, tempo()).unwrap();

        assert_eq!(lin[2].value, 50);
        assert_eq!(exp[2].value, 25);
        assert_eq!(log[2].value, 71);
        for frames in [&lin, &exp, &log] {
            assert_eq!(frames[0].value, 0);
            assert_eq!(frames[4].value, 100);
        }
    }

    #[test]
    fn test_descending_sweep_and_clamping() {
        let frames = sweep(127.0, 0.0, Curve::Logarithmic, 3).keyframes(8.0, tempo()).unwrap();
        assert_eq!(frames[0].value, 127);
        assert_eq!(frames[2].value, 0);
        assert!((frames[0].beat - 8.0).abs() < 1e-12);

        let clamped = sweep(-20.0, 300.0, Curve::Linear, 2).keyframes(0.0, tempo()).unwrap();
        assert_eq!(clamped[0].value, 0);
        assert_eq!(clamped[1].value, 127);
    }

    #[test]
    fn test_sweep_rejects_bad_input() {
        assert!(matches!(
            sweep(0.0, 1.0, Curve::Linear, 1).keyframes(0.0, tempo()),
            Err(Error::InvalidRange { field: "sweep steps", .. })
        ));
        let mut s = sweep(0.0, 1.0, Curve::Linear, 4);
        s.duration_seconds = -1.0;
        assert!(s.keyframes(0.0, tempo()).is_err());
    }

    #[test]
    fn test_envelope_stages_are_contiguous() {
        let env = Envelope {
            attack_seconds: 0.5,
            decay_seconds: 0.25,
            sustain: 64,
            release_seconds: 1.0,
            steps_per_stage: 4,
        };
        let frames = env.keyframes(0.0, tempo()).unwrap();
        assert_eq!(frames.len(), 13);

        // Attack starts from silence, decay starts at the attack peak
        assert_eq!(frames[0], Keyframe { beat: 0.0, value: 0 });
        assert!((frames[4].beat - 1.0).abs() < 1e-12);
        assert_eq!(frames[4].value, 127);
        // Release starts at the sustain level where decay ended
        assert!((frames[8].beat - 1.5).abs() < 1e-12);
        assert_eq!(frames[8].value, 64);
        // Closing frame at the end of release
        assert!((frames[12].beat - 3.5).abs() < 1e-12);
        assert_eq!(frames[12].value, 0);

        for pair in frames.windows(2) {
            assert!(pair[0].beat <= pair[1].beat);
        }
    }

    #[test]
    fn test_envelope_rejects_zero_steps() {
        let env = Envelope {
            attack_seconds: 0.1,
            decay_seconds: 0.1,
            sustain: 100,
            release_seconds: 0.1,
            steps_per_stage: 0,
        };
        assert!(env.keyframes(0.0, tempo()).is_err());
    }

    #[test]
    fn test_curve_deserializes_lowercase() {
        let s: Sweep = serde_json::from_str(
            r#"{"start": 20, "end": 127, "duration_seconds": 2.0, "curve": "exponential"}"#,
        )
        .unwrap();
        assert_eq!(s.curve, Curve::Exponential);
        assert_eq!(s.steps, 50);
    }
}
