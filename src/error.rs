// Start-up failures of the capture/analysis engine.
//
// Every variant is raised before the tick loop begins; once detection is
// running the analysis path itself has no failure modes.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The source does not expose an audio track at all.
    #[error("audio source has no audio track")]
    NoAudioTrack,

    /// The track exists but is disabled or not live.
    #[error("audio track is disabled or not live")]
    InactiveTrack,

    /// The noise-suppression stage could not be loaded.
    #[error("noise suppression failed to load: {0}")]
    SuppressionLoad(String),

    /// The real-time audio context failed to initialize or resume.
    #[error("audio context error: {0}")]
    AudioContext(String),

    /// A detection session is already running on this engine.
    #[error("a detection session is already active")]
    SessionActive,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    /// One sentence suitable for showing to the person at the microphone.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NoAudioTrack => "No microphone was found. Connect one and try again.",
            Self::InactiveTrack => {
                "The microphone is muted or unavailable. Enable it and try again."
            }
            Self::SuppressionLoad(_) => {
                "Noise suppression could not be loaded. Please try starting again."
            }
            Self::AudioContext(_) => "The audio system could not be started.",
            Self::SessionActive => "Voice detection is already running.",
            Self::InvalidConfig(_) => "The audio settings are invalid. Check your configuration.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_detail() {
        let err = EngineError::SuppressionLoad("profile.json: not found".to_string());
        assert_eq!(
            err.to_string(),
            "noise suppression failed to load: profile.json: not found"
        );
    }

    #[test]
    fn test_every_variant_has_user_message() {
        let errors = [
            EngineError::NoAudioTrack,
            EngineError::InactiveTrack,
            EngineError::SuppressionLoad(String::new()),
            EngineError::AudioContext(String::new()),
            EngineError::SessionActive,
            EngineError::InvalidConfig(String::new()),
        ];
        for err in &errors {
            assert!(!err.user_message().is_empty());
        }
    }

    #[test]
    fn test_works_with_anyhow() {
        let result: anyhow::Result<()> = Err(EngineError::NoAudioTrack.into());
        let err = result.unwrap_err();
        assert!(err.downcast_ref::<EngineError>().is_some());
    }
}
