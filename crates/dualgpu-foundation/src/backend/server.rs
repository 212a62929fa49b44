//! Inference-server backends.
//!
//! Each load spawns one server process (llama.cpp `llama-server`, vLLM's
//! OpenAI-compatible server, or text-generation-inference) and waits until
//! its port accepts connections. Generation streams over HTTP as
//! server-sent events so first-token latency is measured, not estimated.

use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dualgpu_kernel::{
    BackendError, BackendHandle, BackendKind, BackendLauncher, BackendResult, Generation,
    GenerationParams, ModelKey,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the server binaries live and how readiness is polled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerLauncherConfig {
    #[serde(default = "default_llama_server_bin")]
    pub llama_server_bin: String,
    #[serde(default = "default_python_bin")]
    pub python_bin: String,
    #[serde(default = "default_tgi_bin")]
    pub tgi_launcher_bin: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_ready_poll_ms")]
    pub ready_poll_ms: u64,
    /// Used when the pool passes no load timeout
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_llama_server_bin() -> String {
    "llama-server".to_string()
}

fn default_python_bin() -> String {
    "python3".to_string()
}

fn default_tgi_bin() -> String {
    "text-generation-launcher".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_ready_poll_ms() -> u64 {
    250
}

fn default_ready_timeout_secs() -> u64 {
    600
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for ServerLauncherConfig {
    fn default() -> Self {
        Self {
            llama_server_bin: default_llama_server_bin(),
            python_bin: default_python_bin(),
            tgi_launcher_bin: default_tgi_bin(),
            host: default_host(),
            ready_poll_ms: default_ready_poll_ms(),
            ready_timeout_secs: default_ready_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Default listen port per backend kind.
pub fn default_port(kind: BackendKind) -> u16 {
    match kind {
        BackendKind::LlamaCpp => 8080,
        BackendKind::Vllm => 8000,
        BackendKind::Transformers => 8081,
        BackendKind::Mock => 0,
    }
}

/// Program and arguments for one server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub port: u16,
}

impl ServerCommand {
    fn new(program: &str, port: u16) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            port,
        }
    }

    fn arg(mut self, flag: &str, value: impl ToString) -> Self {
        self.args.push(flag.to_string());
        self.args.push(value.to_string());
        self
    }

    fn arg_opt(self, flag: &str, value: Option<String>) -> Self {
        match value {
            Some(value) => self.arg(flag, value),
            None => self,
        }
    }

    /// Shell-style rendering, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn param_string(key: &ModelKey, name: &str) -> Option<String> {
    key.param(name).map(ToString::to_string)
}

fn resolve_port(key: &ModelKey) -> BackendResult<u16> {
    match key.param("port") {
        None => Ok(default_port(key.backend_kind())),
        Some(value) => value
            .as_i64()
            .and_then(|p| u16::try_from(p).ok())
            .filter(|p| *p != 0)
            .ok_or_else(|| BackendError::Launch(format!("invalid port parameter '{value}'"))),
    }
}

/// Launches inference servers for llama.cpp, vLLM and Transformers keys.
pub struct ServerLauncher {
    config: ServerLauncherConfig,
    client: reqwest::Client,
}

impl ServerLauncher {
    pub fn new(config: ServerLauncherConfig) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| BackendError::Launch(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ServerLauncherConfig {
        &self.config
    }

    /// Command line for `key`.
    pub fn command_for(&self, key: &ModelKey) -> BackendResult<ServerCommand> {
        let port = resolve_port(key)?;
        let path = key.model_path();

        let command = match key.backend_kind() {
            BackendKind::LlamaCpp => ServerCommand::new(&self.config.llama_server_bin, port)
                .arg("-m", path)
                .arg("--host", &self.config.host)
                .arg("--port", port)
                .arg_opt("--n-gpu-layers", param_string(key, "n_gpu_layers"))
                .arg_opt("--split-mode", param_string(key, "split_mode"))
                .arg_opt("--tensor-split", param_string(key, "tensor_split"))
                .arg_opt("--ctx-size", param_string(key, "ctx_size")),
            BackendKind::Vllm => {
                let mut command = ServerCommand::new(&self.config.python_bin, port);
                command.args.push("-m".into());
                command.args.push("vllm.entrypoints.openai.api_server".into());
                command
                    .arg("--model", path)
                    .arg("--host", &self.config.host)
                    .arg("--port", port)
                    .arg(
                        "--tensor-parallel-size",
                        param_string(key, "tensor_parallel_size").unwrap_or_else(|| "1".into()),
                    )
                    .arg_opt("--max-model-len", param_string(key, "max_model_len"))
                    .arg_opt("--quantization", param_string(key, "quantization"))
            }
            BackendKind::Transformers => ServerCommand::new(&self.config.tgi_launcher_bin, port)
                .arg("--model-id", path)
                .arg("--hostname", &self.config.host)
                .arg("--port", port)
                .arg_opt("--num-shard", param_string(key, "num_shard"))
                .arg_opt("--quantize", param_string(key, "quantization")),
            BackendKind::Mock => {
                return Err(BackendError::Unsupported(
                    "mock backends are not served by a process".into(),
                ));
            }
        };
        Ok(command)
    }

    async fn wait_ready(
        &self,
        child: &mut Child,
        addr: SocketAddr,
        timeout: Duration,
    ) -> BackendResult<()> {
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(self.config.ready_poll_ms);

        loop {
            if let Some(status) = child.try_wait()? {
                return Err(BackendError::Launch(format!(
                    "server exited before becoming ready ({status})"
                )));
            }
            if port_open(addr).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BackendError::NotReady(format!(
                    "port {} not accepting connections after {timeout:?}",
                    addr.port()
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[async_trait]
impl BackendLauncher for ServerLauncher {
    async fn load(
        &self,
        key: &ModelKey,
        timeout: Option<Duration>,
    ) -> BackendResult<Arc<dyn BackendHandle>> {
        let command = self.command_for(key)?;
        let addr: SocketAddr = format!("{}:{}", self.config.host, command.port)
            .parse()
            .map_err(|e| BackendError::Launch(format!("invalid listen address: {e}")))?;

        if port_open(addr).await {
            return Err(BackendError::Launch(format!(
                "port {} is already in use",
                command.port
            )));
        }

        info!(model = %key, command = %command.display(), "Starting inference server");
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::Launch(format!("failed to spawn {}: {e}", command.program)))?;

        let ready_timeout =
            timeout.unwrap_or_else(|| Duration::from_secs(self.config.ready_timeout_secs));
        if let Err(err) = self.wait_ready(&mut child, addr, ready_timeout).await {
            if let Err(kill_err) = child.kill().await {
                debug!(error = %kill_err, "Failed to kill server that never became ready");
            }
            return Err(err);
        }

        info!(model = %key, port = command.port, "Inference server ready");
        Ok(Arc::new(ServerHandle {
            kind: key.backend_kind(),
            model_path: key.model_path().to_string(),
            addr,
            base_url: format!("http://{addr}"),
            client: self.client.clone(),
            child: Mutex::new(Some(child)),
        }))
    }
}

async fn port_open(addr: SocketAddr) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// A running inference server.
pub struct ServerHandle {
    kind: BackendKind,
    model_path: String,
    addr: SocketAddr,
    base_url: String,
    client: reqwest::Client,
    child: Mutex<Option<Child>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn request_body(&self, prompt: &str, params: &GenerationParams) -> (String, Value) {
        match self.kind {
            BackendKind::LlamaCpp => (
                format!("{}/completion", self.base_url),
                json!({
                    "prompt": prompt,
                    "n_predict": params.max_tokens,
                    "temperature": params.temperature,
                    "stream": true,
                }),
            ),
            BackendKind::Vllm => (
                format!("{}/v1/completions", self.base_url),
                json!({
                    "model": self.model_path,
                    "prompt": prompt,
                    "max_tokens": params.max_tokens,
                    "temperature": params.temperature,
                    "stream": true,
                }),
            ),
            _ => (
                format!("{}/generate_stream", self.base_url),
                json!({
                    "inputs": prompt,
                    "parameters": {
                        "max_new_tokens": params.max_tokens,
                        "temperature": params.temperature,
                    },
                }),
            ),
        }
    }
}

/// Splits a streamed response body into server-sent event `data:` payloads.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            payloads.extend(data_payload(&line));
        }
        payloads
    }

    /// Payload of a final line the server did not terminate.
    fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        data_payload(&line)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let data = line.trim().strip_prefix("data:")?.trim();
    (!data.is_empty()).then(|| data.to_string())
}

/// One decoded stream event.
#[derive(Debug, Default, PartialEq)]
struct StreamChunk {
    text: String,
    tokens: Option<u64>,
    done: bool,
}

fn parse_stream_chunk(kind: BackendKind, data: &str) -> BackendResult<StreamChunk> {
    if data == "[DONE]" {
        return Ok(StreamChunk {
            done: true,
            ..StreamChunk::default()
        });
    }
    let event: Value = serde_json::from_str(data)
        .map_err(|e| BackendError::Request(format!("invalid {kind} stream event '{data}': {e}")))?;
    if let Some(error) = event.get("error") {
        return Err(BackendError::Request(format!("{kind} stream error: {error}")));
    }

    let text = |value: &Value| value.as_str().unwrap_or_default().to_string();
    let chunk = match kind {
        BackendKind::LlamaCpp => StreamChunk {
            text: text(&event["content"]),
            tokens: event["tokens_predicted"].as_u64(),
            done: event["stop"].as_bool().unwrap_or(false),
        },
        BackendKind::Vllm => StreamChunk {
            text: text(&event["choices"][0]["text"]),
            tokens: event["usage"]["completion_tokens"].as_u64(),
            done: false,
        },
        _ => StreamChunk {
            // Special tokens (EOS) carry no visible text.
            text: if event["token"]["special"].as_bool().unwrap_or(false) {
                String::new()
            } else {
                text(&event["token"]["text"])
            },
            tokens: event["details"]["generated_tokens"].as_u64(),
            done: event["generated_text"].is_string(),
        },
    };
    Ok(chunk)
}

/// Folds stream events into a [`Generation`].
#[derive(Debug)]
struct StreamAccumulator {
    started: Instant,
    text: String,
    chunks: u32,
    reported_tokens: Option<u64>,
    first_token_latency: Option<Duration>,
    done: bool,
}

impl StreamAccumulator {
    fn new(started: Instant) -> Self {
        Self {
            started,
            text: String::new(),
            chunks: 0,
            reported_tokens: None,
            first_token_latency: None,
            done: false,
        }
    }

    fn apply(&mut self, chunk: StreamChunk) {
        if !chunk.text.is_empty() {
            let started = self.started;
            self.first_token_latency
                .get_or_insert_with(|| started.elapsed());
            self.text.push_str(&chunk.text);
            self.chunks += 1;
        }
        if chunk.tokens.is_some() {
            self.reported_tokens = chunk.tokens;
        }
        self.done |= chunk.done;
    }

    fn finish(self) -> Generation {
        let total_duration = self.started.elapsed();
        let tokens = self
            .reported_tokens
            .map(|t| t as u32)
            .unwrap_or(self.chunks);
        Generation {
            text: self.text,
            tokens,
            first_token_latency: self.first_token_latency.unwrap_or(total_duration),
            total_duration,
        }
    }
}

#[async_trait]
impl BackendHandle for ServerHandle {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn model_path(&self) -> &str {
        &self.model_path
    }

    /// Streams the completion and times the first non-empty chunk.
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> BackendResult<Generation> {
        let (url, body) = self.request_body(prompt, params);
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BackendError::Request(format!("{url} returned {status}: {detail}")));
        }

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut acc = StreamAccumulator::new(started);
        while !acc.done {
            let Some(bytes) = stream.next().await else {
                if let Some(payload) = decoder.finish() {
                    acc.apply(parse_stream_chunk(self.kind, &payload)?);
                }
                break;
            };
            let bytes = bytes.map_err(|e| BackendError::Request(format!("stream from {url} failed: {e}")))?;
            for payload in decoder.push(&bytes) {
                acc.apply(parse_stream_chunk(self.kind, &payload)?);
                if acc.done {
                    break;
                }
            }
        }

        let generation = acc.finish();
        debug!(
            model = %self.model_path,
            tokens = generation.tokens,
            first_token_ms = generation.first_token_latency.as_millis() as u64,
            "Streamed generation complete"
        );
        Ok(generation)
    }

    async fn health_check(&self) -> BackendResult<()> {
        {
            let mut child = self.child.lock().await;
            let Some(process) = child.as_mut() else {
                return Err(BackendError::Unhealthy("server has been unloaded".into()));
            };
            if let Some(status) = process.try_wait()? {
                return Err(BackendError::Unhealthy(format!("server process exited ({status})")));
            }
        }

        if port_open(self.addr).await {
            Ok(())
        } else {
            Err(BackendError::Unhealthy(format!(
                "port {} not accepting connections",
                self.addr.port()
            )))
        }
    }

    async fn unload(&self) -> BackendResult<()> {
        let Some(mut process) = self.child.lock().await.take() else {
            return Ok(());
        };

        info!(model = %self.model_path, port = self.addr.port(), "Stopping inference server");
        if let Err(err) = process.start_kill() {
            // Already exited.
            debug!(error = %err, "Kill signal not delivered");
        }
        match tokio::time::timeout(KILL_TIMEOUT, process.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(BackendError::Io(err)),
            Err(_) => {
                warn!(model = %self.model_path, "Server did not exit after kill");
                Err(BackendError::Unhealthy("server did not exit after kill".into()))
            }
        }
    }
}
