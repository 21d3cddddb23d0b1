use super::adaptor::ClientSink;
use super::info::{RelayInfo, RelayMode};
use super::{RelayEngine, RelayOutcome, require_model, resolve_adaptor};
use crate::error::{RelayError, Result};
use crate::token_count::count_text_tokens;
use crate::types::AudioRequest;

impl RelayEngine {
    /// Speech synthesis and transcription or translation. `info.relay_mode`
    /// selects which; speech reserves the input's token count, the others
    /// reserve the configured default.
    pub async fn relay_audio(
        &self,
        info: &mut RelayInfo,
        request: AudioRequest,
        sink: &mut dyn ClientSink,
    ) -> Result<RelayOutcome> {
        if !info.relay_mode.is_audio() {
            return Err(RelayError::invalid(
                "invalid_request",
                format!("{:?} is not an audio relay mode", info.relay_mode),
            ));
        }
        require_model(&request.model)?;
        if info.relay_mode == RelayMode::AudioSpeech && request.input.is_empty() {
            return Err(RelayError::invalid("invalid_request", "input is required"));
        }
        info.set_model(&request.model);
        info.is_stream = false;

        let adaptor = resolve_adaptor(info)?;
        let estimate_tokens = if info.relay_mode == RelayMode::AudioSpeech {
            info.prompt_tokens = count_text_tokens(&info.upstream_model_name, &request.input);
            info.prompt_tokens
        } else {
            self.default_estimate_tokens()
        };
        let body = adaptor.convert_audio_request(info, request)?;

        self.run(info, adaptor.as_ref(), body, estimate_tokens, sink)
            .await
    }
}
