// Speaking/silence state machine with silence hysteresis.
//
//   [Silent] ── voice ──► [Speaking]            (Transition::Started)
//      ▲                      │ no voice: silence clock starts
//      │                      │ voice again: silence clock cleared
//      └── silence >= window ─┘                 (Transition::Ended)
//
// Driven only by its inputs, one `FeatureSet` and a timestamp per tick. It
// never reads a clock.

use std::time::Duration;

use tracing::debug;

use crate::audio::features::FeatureSet;
use crate::calibration::CalibrationThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetectionState {
    pub is_speaking: bool,
    /// Tick time of the first silent tick of the current silence run.
    pub silence_start: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Started,
    Ended,
}

/// Amplitude gates; spectral centroid or ZCR confirms.
///
/// The secondary checks are either/or because voiced and unvoiced phonemes
/// each reliably satisfy only one of them.
pub fn is_voice(features: &FeatureSet, thresholds: &CalibrationThresholds) -> bool {
    let amplitude_check = features.amplitude > thresholds.amplitude_threshold;
    let spectral_check = (thresholds.spectral_centroid_min..=thresholds.spectral_centroid_max)
        .contains(&features.spectral_centroid);
    let zcr_check =
        (thresholds.zcr_min..=thresholds.zcr_max).contains(&features.zero_crossing_rate);
    amplitude_check && (spectral_check || zcr_check)
}

pub struct VoiceActivityDetector {
    state: DetectionState,
    hysteresis: Duration,
}

impl VoiceActivityDetector {
    pub fn new(hysteresis: Duration) -> Self {
        Self {
            state: DetectionState::default(),
            hysteresis,
        }
    }

    pub fn state(&self) -> DetectionState {
        self.state
    }

    pub fn is_speaking(&self) -> bool {
        self.state.is_speaking
    }

    pub fn hysteresis(&self) -> Duration {
        self.hysteresis
    }

    pub fn reset(&mut self) {
        self.state = DetectionState::default();
    }

    /// Advance one tick. Returns the transition this tick caused, if any.
    pub fn update(
        &mut self,
        features: &FeatureSet,
        thresholds: &CalibrationThresholds,
        now: Duration,
    ) -> Option<Transition> {
        self.update_with_decision(is_voice(features, thresholds), now)
    }

    /// Advance one tick with an already-made voice decision.
    pub fn update_with_decision(&mut self, voice: bool, now: Duration) -> Option<Transition> {
        match (self.state.is_speaking, voice) {
            (false, true) => {
                debug!(at_ms = now.as_millis() as u64, "VAD: Silent -> Speaking");
                self.state = DetectionState {
                    is_speaking: true,
                    silence_start: None,
                };
                Some(Transition::Started)
            }
            (true, true) => {
                self.state.silence_start = None;
                None
            }
            (true, false) => {
                let silence_start = *self.state.silence_start.get_or_insert(now);
                if now.saturating_sub(silence_start) >= self.hysteresis {
                    debug!(
                        at_ms = now.as_millis() as u64,
                        silence_ms = (now - silence_start).as_millis() as u64,
                        "VAD: Speaking -> Silent"
                    );
                    self.state = DetectionState::default();
                    Some(Transition::Ended)
                } else {
                    None
                }
            }
            (false, false) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(50);

    fn thresholds() -> CalibrationThresholds {
        CalibrationThresholds {
            amplitude_threshold: 15.0,
            spectral_centroid_min: 800.0,
            spectral_centroid_max: 5_000.0,
            zcr_min: 0.05,
            zcr_max: 0.35,
        }
    }

    fn features(amplitude: f64, centroid: f64, zcr: f64) -> FeatureSet {
        FeatureSet {
            amplitude,
            spectral_centroid: centroid,
            zero_crossing_rate: zcr,
        }
    }

    #[test]
    fn test_amplitude_is_required() {
        assert!(!is_voice(&features(10.0, 1_500.0, 0.1), &thresholds()));
        // Equal to the threshold is not above it.
        assert!(!is_voice(&features(15.0, 1_500.0, 0.1), &thresholds()));
    }

    #[test]
    fn test_either_secondary_check_suffices() {
        let t = thresholds();
        assert!(is_voice(&features(30.0, 1_500.0, 0.1), &t));
        assert!(is_voice(&features(30.0, 9_000.0, 0.1), &t));
        assert!(is_voice(&features(30.0, 1_500.0, 0.9), &t));
        assert!(!is_voice(&features(30.0, 9_000.0, 0.9), &t));
    }

    #[test]
    fn test_ranges_are_inclusive() {
        let t = thresholds();
        assert!(is_voice(&features(30.0, 800.0, 0.0), &t));
        assert!(is_voice(&features(30.0, 0.0, 0.35), &t));
    }

    #[test]
    fn test_initial_state_is_silent() {
        let vad = VoiceActivityDetector::new(Duration::from_millis(800));
        assert_eq!(vad.state(), DetectionState::default());
        assert!(!vad.is_speaking());
    }

    #[test]
    fn test_silence_is_noop_when_silent() {
        let mut vad = VoiceActivityDetector::new(Duration::from_millis(800));
        for i in 0..100 {
            assert_eq!(vad.update_with_decision(false, TICK * i), None);
        }
        assert!(!vad.is_speaking());
    }

    #[test]
    fn test_brief_dropouts_do_not_end_speech() {
        let mut vad = VoiceActivityDetector::new(Duration::from_millis(300));
        assert_eq!(vad.update_with_decision(true, TICK * 0), Some(Transition::Started));

        // Alternate 5 silent ticks (250 ms) with a voiced tick, repeatedly.
        let mut tick = 1;
        for _ in 0..10 {
            for _ in 0..5 {
                assert_eq!(vad.update_with_decision(false, TICK * tick), None);
                tick += 1;
            }
            assert_eq!(vad.update_with_decision(true, TICK * tick), None);
            assert_eq!(vad.state().silence_start, None);
            tick += 1;
        }
        assert!(vad.is_speaking());
    }

    #[test]
    fn test_silence_measured_from_first_silent_tick() {
        let mut vad = VoiceActivityDetector::new(Duration::from_millis(200));
        vad.update_with_decision(true, Duration::from_millis(0));
        vad.update_with_decision(true, Duration::from_millis(100));

        assert_eq!(vad.update_with_decision(false, Duration::from_millis(150)), None);
        assert_eq!(
            vad.state().silence_start,
            Some(Duration::from_millis(150))
        );
        // 300 - 100 (last voice) would already exceed the window; 300 - 150 does not.
        assert_eq!(vad.update_with_decision(false, Duration::from_millis(300)), None);
        assert_eq!(
            vad.update_with_decision(false, Duration::from_millis(350)),
            Some(Transition::Ended)
        );
        assert_eq!(vad.state(), DetectionState::default());
    }

    #[test]
    fn test_reset_returns_to_silent() {
        let mut vad = VoiceActivityDetector::new(Duration::from_millis(800));
        vad.update_with_decision(true, Duration::ZERO);
        vad.update_with_decision(false, TICK);
        vad.reset();
        assert_eq!(vad.state(), DetectionState::default());
    }

    #[test]
    fn test_update_uses_thresholds() {
        let mut vad = VoiceActivityDetector::new(Duration::from_millis(800));
        let t = thresholds();
        assert_eq!(vad.update(&features(5.0, 1_000.0, 0.1), &t, Duration::ZERO), None);
        assert_eq!(
            vad.update(&features(40.0, 1_000.0, 0.1), &t, TICK),
            Some(Transition::Started)
        );
    }
}
