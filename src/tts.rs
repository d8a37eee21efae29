use crate::config::TtsConfig;

/// Text-to-speech adapter for the telephony leg.
///
/// Whatever the backend, the output contract is fixed: mu-law / 8 kHz / mono
/// bytes ready to frame onto a carrier media stream.
#[derive(Debug)]
pub struct TelephonyTts {
    client: reqwest::Client,
    provider: String,
    api_key: String,
    voice_id: String,
    model: String,
}

impl TelephonyTts {
    /// Build from core TTS settings merged with plugin overrides (overrides
    /// win field by field).
    pub fn from_merged(core: &TtsConfig, overrides: Option<&TtsConfig>) -> Result<Self, TtsError> {
        let merged = merge_config(core, overrides);

        // Edge TTS outputs compressed formats only; the carrier leg needs
        // PCM-grade audio.
        if merged.provider == "edge" {
            return Err(TtsError::UnsupportedProvider(merged.provider));
        }

        if merged.api_key.is_empty() {
            return Err(TtsError::Unavailable(format!(
                "no API key configured for TTS provider {:?}",
                merged.provider
            )));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            provider: merged.provider,
            api_key: merged.api_key,
            voice_id: merged.voice_id,
            model: merged.model,
        })
    }

    /// Convert text to mu-law 8 kHz mono bytes.
    pub async fn synthesize_for_telephony(&self, text: &str) -> Result<Vec<u8>, TtsError> {
        match self.provider.as_str() {
            "elevenlabs" => self.synthesize_elevenlabs(text).await,
            other => Err(TtsError::UnsupportedProvider(other.to_string())),
        }
    }

    async fn synthesize_elevenlabs(&self, text: &str) -> Result<Vec<u8>, TtsError> {
        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}",
            self.voice_id
        );

        let body = serde_json::json!({
            "text": text,
            "model_id": self.model,
            "voice_settings": {
                "stability": 0.5,
                "similarity_boost": 0.75
            }
        });

        let resp = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .query(&[("output_format", "ulaw_8000")])
            .json(&body)
            .send()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(TtsError::Api(format!("{status}: {body}")));
        }

        let audio = resp
            .bytes()
            .await
            .map_err(|e| TtsError::Request(e.to_string()))?;

        Ok(audio.to_vec())
    }
}

/// Core settings with plugin overrides applied field by field. Empty override
/// fields fall through to the core value.
fn merge_config(core: &TtsConfig, overrides: Option<&TtsConfig>) -> TtsConfig {
    let Some(o) = overrides else {
        return core.clone();
    };

    let pick = |over: &str, base: &str| -> String {
        if over.is_empty() {
            base.to_string()
        } else {
            over.to_string()
        }
    };

    TtsConfig {
        provider: pick(&o.provider, &core.provider),
        api_key: pick(&o.api_key, &core.api_key),
        voice_id: pick(&o.voice_id, &core.voice_id),
        model: pick(&o.model, &core.model),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TtsError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("TTS unavailable: {0}")]
    Unavailable(String),
    #[error("TTS provider {0:?} cannot produce telephony audio")]
    UnsupportedProvider(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str, api_key: &str) -> TtsConfig {
        TtsConfig {
            provider: provider.to_string(),
            api_key: api_key.to_string(),
            ..TtsConfig::default()
        }
    }

    #[test]
    fn edge_provider_refused() {
        let err = TelephonyTts::from_merged(&config("edge", "key"), None).unwrap_err();
        assert!(matches!(err, TtsError::UnsupportedProvider(_)));
    }

    #[test]
    fn missing_key_is_unavailable() {
        let err = TelephonyTts::from_merged(&config("elevenlabs", ""), None).unwrap_err();
        assert!(matches!(err, TtsError::Unavailable(_)));
    }

    #[test]
    fn overrides_win_field_by_field() {
        let core = config("elevenlabs", "core-key");
        let over = TtsConfig {
            provider: String::new(),
            api_key: "plugin-key".to_string(),
            voice_id: "custom-voice".to_string(),
            model: String::new(),
        };

        let merged = merge_config(&core, Some(&over));
        assert_eq!(merged.provider, "elevenlabs");
        assert_eq!(merged.api_key, "plugin-key");
        assert_eq!(merged.voice_id, "custom-voice");
        assert_eq!(merged.model, core.model);
    }

    #[test]
    fn no_overrides_is_core() {
        let core = config("elevenlabs", "k");
        let merged = merge_config(&core, None);
        assert_eq!(merged.api_key, "k");
    }
}
