//! # OpenAI-Compatible Providers
//!
//! Speech-to-text, language model and speech synthesis against any server that speaks the
//! OpenAI HTTP API (OpenAI itself, or a local gateway that mimics it).
//!
//! ## Endpoints Used:
//! - `POST {base}/chat/completions` with `stream: true`: Server-Sent Events, one `data:` line
//!   per chunk, terminated by `data: [DONE]`
//! - `POST {base}/audio/transcriptions`: multipart upload of a WAV file, JSON `{text}` back
//! - `POST {base}/audio/speech` with `response_format: "pcm"`: raw 24kHz PCM16 body, streamed
//!
//! ## Timeouts:
//! `request_timeout_secs` bounds the wait for response headers and, for streamed bodies,
//! the wait between two chunks. Expiry surfaces as `AdapterError::Timeout`.

use crate::adapters::{
    AudioInput, ChatMessage, LlmProvider, LlmToken, Role, StageStream, SttProvider, Transcript,
    TtsProvider,
};
use crate::audio::pcm::PcmRechunker;
use crate::audio::{AudioFrame, UtteranceBuffer};
use crate::config::{OpenAiConfig, PipelineConfig};
use crate::error::AdapterError;
use crate::turn::detector;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, warn};

/// Shared HTTP plumbing for the three OpenAI providers.
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiClient {
    pub fn new(config: &OpenAiConfig) -> Result<Self, AdapterError> {
        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| AdapterError::Configuration("OPENAI_API_KEY is not set".into()))?
            .to_string();

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AdapterError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.api_key)
    }

    /// Send a request, enforcing the header timeout and mapping non-2xx answers to errors.
    async fn send(
        &self,
        what: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, AdapterError> {
        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| AdapterError::Timeout(format!("{} request", what)))??;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Provider(format!(
                "{} API error {}: {}",
                what, status, body
            )));
        }
        Ok(response)
    }
}

// ---------------------------------------------------------------------------
// Language model
// ---------------------------------------------------------------------------

pub struct OpenAiLlm {
    client: OpenAiClient,
    model: String,
}

impl OpenAiLlm {
    pub fn new(client: OpenAiClient, config: &OpenAiConfig) -> Self {
        Self {
            client,
            model: config.chat_model.clone(),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiLlm {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn start(
        &self,
        prompt: String,
        history: Vec<ChatMessage>,
    ) -> Result<StageStream<LlmToken>, AdapterError> {
        let mut messages = history;
        messages.push(ChatMessage::new(Role::User, prompt));

        debug!("Starting chat completion with {} messages", messages.len());
        let body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });

        let response = self
            .client
            .send("chat completion", self.client.post("chat/completions").json(&body))
            .await?;

        Ok(sse_tokens(response.bytes_stream().boxed(), self.client.timeout))
    }
}

/// One meaningful line of a chat-completions event stream.
#[derive(Debug, PartialEq, Eq)]
enum SseChunk {
    Token(String),
    Done,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<StreamError>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamError {
    message: String,
}

/// Parse one SSE line. Comments, blank lines and chunks without text yield `None`.
fn parse_sse_line(line: &str) -> Result<Option<SseChunk>, AdapterError> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();

    if data == "[DONE]" {
        return Ok(Some(SseChunk::Done));
    }

    let chunk: StreamChunk = serde_json::from_str(data)
        .map_err(|e| AdapterError::Provider(format!("invalid stream chunk: {}", e)))?;

    if let Some(error) = chunk.error {
        return Err(AdapterError::Provider(error.message));
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|text| !text.is_empty())
        .map(SseChunk::Token))
}

struct SseState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<LlmToken, AdapterError>>,
    finished: bool,
    chunk_timeout: Duration,
}

/// Turn a chat-completions body into a token stream.
///
/// Bytes are buffered until a full line is available so multi-byte characters split across
/// network chunks are decoded correctly. A body that ends without `[DONE]` still ends the
/// reply normally.
fn sse_tokens<B>(
    body: BoxStream<'static, reqwest::Result<B>>,
    chunk_timeout: Duration,
) -> StageStream<LlmToken>
where
    B: AsRef<[u8]> + Send + 'static,
{
    let state = SseState {
        body: body.map(|chunk| chunk.map(|b| b.as_ref().to_vec())).boxed(),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
        chunk_timeout,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }

            if let Some(pos) = st.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = st.buffer.drain(..=pos).collect();
                match parse_sse_line(&String::from_utf8_lossy(&line)) {
                    Ok(Some(SseChunk::Token(text))) => st.pending.push_back(Ok(LlmToken::text(text))),
                    Ok(Some(SseChunk::Done)) => {
                        st.finished = true;
                        st.pending.push_back(Ok(LlmToken::done()));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        st.finished = true;
                        st.pending.push_back(Err(e));
                    }
                }
                continue;
            }

            match tokio::time::timeout(st.chunk_timeout, st.body.next()).await {
                Ok(Some(Ok(chunk))) => st.buffer.extend_from_slice(&chunk),
                Ok(Some(Err(e))) => {
                    st.finished = true;
                    st.pending.push_back(Err(e.into()));
                }
                Ok(None) => {
                    st.finished = true;
                    // Trailing line without newline
                    let rest = std::mem::take(&mut st.buffer);
                    if let Ok(Some(SseChunk::Token(text))) =
                        parse_sse_line(&String::from_utf8_lossy(&rest))
                    {
                        st.pending.push_back(Ok(LlmToken::text(text)));
                    }
                    st.pending.push_back(Ok(LlmToken::done()));
                }
                Err(_) => {
                    st.finished = true;
                    st.pending
                        .push_back(Err(AdapterError::Timeout("chat completion stream".into())));
                }
            }
        }
    })
    .boxed()
}

// ---------------------------------------------------------------------------
// Speech-to-text
// ---------------------------------------------------------------------------

/// Silence kept ahead of the first voiced frame.
const STT_LEAD_IN: Duration = Duration::from_millis(500);

pub struct OpenAiStt {
    client: OpenAiClient,
    model: String,
    language: Option<String>,
    sample_rate: u32,
    energy_threshold: f32,
    max_utterance: Duration,
}

impl OpenAiStt {
    pub fn new(client: OpenAiClient, config: &OpenAiConfig, pipeline: &PipelineConfig) -> Self {
        Self {
            client,
            model: config.transcription_model.clone(),
            language: config.language.clone(),
            sample_rate: pipeline.sample_rate,
            energy_threshold: pipeline.energy_threshold,
            max_utterance: Duration::from_secs(config.max_utterance_secs),
        }
    }
}

/// Gather the utterance from the input stream, bounded by `UtteranceBuffer`.
async fn collect_utterance(
    mut audio: AudioInput,
    sample_rate: u32,
    energy_threshold: f32,
    max_utterance: Duration,
) -> Vec<i16> {
    let mut buffer = UtteranceBuffer::new(sample_rate, STT_LEAD_IN, max_utterance);
    while let Some(frame) = audio.next().await {
        let voiced = detector::is_voiced(&frame, energy_threshold);
        buffer.push(frame, voiced);
    }
    if buffer.truncated() {
        warn!("Utterance longer than {:?}, later audio not transcribed", max_utterance);
    }
    debug!(
        samples = buffer.held_samples(),
        voice_heard = buffer.voice_heard(),
        "Utterance collected"
    );
    buffer.finish()
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[async_trait]
impl SttProvider for OpenAiStt {
    fn name(&self) -> &'static str {
        "openai"
    }

    /// The transcription endpoint is not incremental: the utterance is collected until the
    /// input ends, then uploaded once. No partials are produced. Leading silence is trimmed
    /// to a short lead-in and the upload is capped at `max_utterance_secs`.
    async fn start(&self, audio: AudioInput) -> Result<StageStream<Transcript>, AdapterError> {
        let client = self.client.clone();
        let model = self.model.clone();
        let language = self.language.clone();
        let sample_rate = self.sample_rate;
        let energy_threshold = self.energy_threshold;
        let max_utterance = self.max_utterance;

        let job = async move {
            let samples =
                collect_utterance(audio, sample_rate, energy_threshold, max_utterance).await;
            if samples.is_empty() {
                return Ok(Transcript::Final(String::new()));
            }

            let wav = encode_wav(&samples, sample_rate)?;
            debug!("Uploading {} bytes of WAV for transcription", wav.len());

            let file = reqwest::multipart::Part::bytes(wav)
                .file_name("audio.wav")
                .mime_str("audio/wav")
                .map_err(|e| AdapterError::Request(e.to_string()))?;
            let mut form = reqwest::multipart::Form::new()
                .text("model", model)
                .part("file", file);
            if let Some(language) = language {
                form = form.text("language", language);
            }

            let response = client
                .send("transcription", client.post("audio/transcriptions").multipart(form))
                .await?;
            let body: TranscriptionResponse = response.json().await?;
            Ok(Transcript::Final(body.text.trim().to_string()))
        };

        Ok(stream::once(job).boxed())
    }
}

/// Encode mono PCM16 samples as a WAV file in memory.
fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, AdapterError> {
    let header = wav::Header::new(wav::WAV_FORMAT_PCM, 1, sample_rate, 16);
    let mut cursor = Cursor::new(Vec::new());
    wav::write(header, &wav::BitDepth::Sixteen(samples.to_vec()), &mut cursor)
        .map_err(|e| AdapterError::Provider(format!("WAV encoding failed: {}", e)))?;
    Ok(cursor.into_inner())
}

// ---------------------------------------------------------------------------
// Speech synthesis
// ---------------------------------------------------------------------------

pub struct OpenAiTts {
    client: OpenAiClient,
    model: String,
    voice: String,
    sample_rate: u32,
}

impl OpenAiTts {
    pub fn new(client: OpenAiClient, config: &OpenAiConfig, sample_rate: u32) -> Self {
        Self {
            client,
            model: config.speech_model.clone(),
            voice: config.voice.clone(),
            sample_rate,
        }
    }
}

#[async_trait]
impl TtsProvider for OpenAiTts {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn synthesize(&self, text: String) -> Result<StageStream<AudioFrame>, AdapterError> {
        let body = json!({
            "model": self.model,
            "voice": self.voice,
            "input": text,
            "response_format": "pcm",
        });

        let response = self
            .client
            .send("speech", self.client.post("audio/speech").json(&body))
            .await?;

        Ok(rechunk_pcm(
            response.bytes_stream().boxed(),
            self.sample_rate,
            self.client.timeout,
        ))
    }
}

/// Re-chunk a streamed PCM body into nominal frames.
fn rechunk_pcm<B>(
    body: BoxStream<'static, reqwest::Result<B>>,
    sample_rate: u32,
    chunk_timeout: Duration,
) -> StageStream<AudioFrame>
where
    B: AsRef<[u8]> + Send + 'static,
{
    struct State<B> {
        body: BoxStream<'static, reqwest::Result<B>>,
        rechunker: Option<PcmRechunker>,
        pending: VecDeque<Result<AudioFrame, AdapterError>>,
    }

    let state = State {
        body,
        rechunker: Some(PcmRechunker::new(sample_rate)),
        pending: VecDeque::new(),
    };

    stream::unfold(state, move |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            let rechunker = st.rechunker.as_mut()?;

            match tokio::time::timeout(chunk_timeout, st.body.next()).await {
                Ok(Some(Ok(chunk))) => {
                    st.pending.extend(rechunker.push(chunk.as_ref()).into_iter().map(Ok))
                }
                Ok(Some(Err(e))) => {
                    st.rechunker = None;
                    st.pending.push_back(Err(e.into()));
                }
                Ok(None) => {
                    if let Some(tail) = st.rechunker.take().and_then(PcmRechunker::finish) {
                        st.pending.push_back(Ok(tail));
                    }
                }
                Err(_) => {
                    st.rechunker = None;
                    st.pending.push_back(Err(AdapterError::Timeout("speech stream".into())));
                }
            }
        }
    })
    .boxed()
}
