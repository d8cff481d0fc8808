//! Pipeline settings sent with `set_task` for each leg.
//!
//! Both legs share the same audio format and queue levelling; they differ
//! only in direction: each leg transcribes its own language and translates
//! into the other leg's language.

use serde_json::{json, Value};

use crate::call::session::LegRole;
use crate::config::{AppConfig, TranslationConfig};

/// (source, target) languages for `role`.
pub fn languages(config: &TranslationConfig, role: LegRole) -> (&str, &str) {
    match role {
        LegRole::Client => (config.client_language.as_str(), config.operator_language.as_str()),
        LegRole::Operator => (config.operator_language.as_str(), config.client_language.as_str()),
    }
}

/// Build the `set_task` payload for `role`.
pub fn task_settings(config: &AppConfig, role: LegRole) -> Value {
    let translation = &config.translation;
    let (source, target) = languages(translation, role);
    let audio_format = json!({
        "type": "ws",
        "format": "pcm_s16le",
        "sample_rate": config.audio.service_sample_rate,
        "channels": 1,
    });

    json!({
        "input_stream": {
            "content_type": "audio",
            "source": audio_format.clone(),
        },
        "output_stream": {
            "content_type": "audio",
            "target": audio_format,
        },
        "pipeline": {
            "preprocessing": {},
            "transcription": {
                "source_language": source,
                "detectable_languages": [
                    translation.operator_language,
                    translation.client_language,
                ],
                "asr_model": "auto",
                "segment_confirmation_silence_threshold": translation.segment_confirmation_silence,
                "sentence_splitter": { "enabled": true },
                "verification": {
                    "auto_transcription_correction": false,
                    "transcription_correction_style": null,
                },
            },
            "translations": [
                {
                    "target_language": target,
                    "translate_partial_transcriptions": false,
                }
            ],
        },
        "translation_queue_configs": {
            "global": {
                "desired_queue_level_ms": translation.desired_queue_level_ms,
                "max_queue_level_ms": translation.max_queue_level_ms,
                "auto_tempo": translation.auto_tempo,
                "min_tempo": translation.min_tempo,
                "max_tempo": translation.max_tempo,
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_translate_in_opposite_directions() {
        let config = AppConfig::default();

        let client = task_settings(&config, LegRole::Client);
        assert_eq!(client["pipeline"]["transcription"]["source_language"], "en");
        assert_eq!(client["pipeline"]["translations"][0]["target_language"], "ru");

        let operator = task_settings(&config, LegRole::Operator);
        assert_eq!(operator["pipeline"]["transcription"]["source_language"], "ru");
        assert_eq!(operator["pipeline"]["translations"][0]["target_language"], "en");
    }

    #[test]
    fn test_audio_format_and_queue_config() {
        let config = AppConfig::default();
        let settings = task_settings(&config, LegRole::Client);

        assert_eq!(settings["input_stream"]["source"]["format"], "pcm_s16le");
        assert_eq!(settings["output_stream"]["target"]["sample_rate"], 24000);
        assert_eq!(
            settings["translation_queue_configs"]["global"]["desired_queue_level_ms"],
            10000
        );
        let detectable = settings["pipeline"]["transcription"]["detectable_languages"]
            .as_array()
            .map(|langs| langs.len());
        assert_eq!(detectable, Some(2));
    }
}
