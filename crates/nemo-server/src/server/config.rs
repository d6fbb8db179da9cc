use anyhow::bail;
use clap::{Args, Parser, Subcommand, ValueEnum};
use core::time::Duration;
use std::path::PathBuf;

/// Default context prepended to every prompt sent to the generator.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Nemo AI, a friendly chat assistant. \
     Talk to the user in a warm, casual tone.";

/// Default request body limit: room for a large photo sent inline.
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Runtime configuration for the `nemo-server` binary.
///
/// These settings control the size of both worker pools, the queue and poll
/// discipline between them, shutdown grace periods and the external generator.
/// All values are parsed from CLI arguments or environment variables (a `.env`
/// file is loaded first), with defaults suitable for a single host.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "nemo-server",
    version,
    about = "An HTTP service that runs prompts through a two-stage generation pipeline"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:5000"))]
    pub server_addr: String,

    /// API key for the Gemini `generateContent` endpoint. Required to serve.
    ///
    /// Environment variable: `GEMINI_API_KEY`
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub gemini_api_key: Option<String>,

    /// Model used for generation.
    ///
    /// Environment variable: `GEMINI_MODEL`
    #[arg(long, env = "GEMINI_MODEL", default_value_t = String::from("gemini-2.0-flash-001"))]
    pub gemini_model: String,

    /// Base URL of the Gemini REST API.
    ///
    /// Environment variable: `GEMINI_BASE_URL`
    #[arg(
        long,
        env = "GEMINI_BASE_URL",
        default_value_t = String::from("https://generativelanguage.googleapis.com/v1beta")
    )]
    pub gemini_base_url: String,

    /// Context prepended to every user prompt.
    ///
    /// Environment variable: `SYSTEM_PROMPT`
    #[arg(long, env = "SYSTEM_PROMPT", default_value_t = String::from(DEFAULT_SYSTEM_PROMPT))]
    pub system_prompt: String,

    /// Number of Stage-1 workers issuing external calls concurrently.
    ///
    /// Environment variable: `NUM_THREADS`
    #[arg(long, env = "NUM_THREADS", default_value_t = 5)]
    pub num_threads: usize,

    /// Number of isolated Stage-2 workers transforming results.
    ///
    /// Environment variable: `NUM_PROCESSES`
    #[arg(long, env = "NUM_PROCESSES", default_value_t = 3)]
    pub num_processes: usize,

    /// How long a worker waits on an empty queue before re-checking whether it
    /// should stop, in milliseconds.
    ///
    /// Environment variable: `POLL_INTERVAL_MS`
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 500)]
    pub poll_interval_ms: u64,

    /// Per-call timeout for the external generator, in seconds. `0` disables
    /// the timeout.
    ///
    /// Environment variable: `REQUEST_TIMEOUT_SECS`
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Maximum number of queued prompts. `0` leaves the queue unbounded;
    /// otherwise submissions beyond the limit are refused with 503.
    ///
    /// Environment variable: `REQUEST_QUEUE_CAPACITY`
    #[arg(long, env = "REQUEST_QUEUE_CAPACITY", default_value_t = 0)]
    pub request_queue_capacity: usize,

    /// Grace period for workers to exit during shutdown, in seconds. Stage-2
    /// workers still running afterwards are killed.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 2)]
    pub shutdown_timeout_secs: u64,

    /// Artificial delay applied by each Stage-2 transformation, in
    /// milliseconds.
    ///
    /// Environment variable: `TRANSFORM_DELAY_MS`
    #[arg(long, env = "TRANSFORM_DELAY_MS", default_value_t = 200)]
    pub transform_delay_ms: u64,

    /// How Stage-2 workers are isolated from the server.
    ///
    /// Environment variable: `ISOLATION`
    #[arg(long, env = "ISOLATION", value_enum, default_value_t = Isolation::Process)]
    pub isolation: Isolation,

    /// Largest request body the HTTP API accepts, in bytes. Inline images
    /// arrive base64-encoded inside the JSON body, so this bounds image size.
    /// Larger bodies are refused with 413.
    ///
    /// Environment variable: `MAX_BODY_BYTES`
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// Directory from which plain image paths may be resolved. When unset,
    /// only inline `data:image/...;base64,` images are accepted.
    ///
    /// Environment variable: `IMAGE_ROOT`
    #[arg(long, env = "IMAGE_ROOT")]
    pub image_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run as a Stage-2 worker speaking line-delimited JSON on stdin/stdout.
    ///
    /// Spawned by the server itself; not meant to be started by hand.
    #[command(hide = true)]
    Stage2Worker(Stage2WorkerArgs),

    /// Run the pipeline in-process, answer the given prompts and print the
    /// processed responses instead of serving HTTP.
    Ask(AskArgs),
}

#[derive(Args, Debug, Clone)]
pub struct AskArgs {
    /// Prompts to answer. Several prompts are submitted as one batch.
    #[arg(required = true)]
    pub prompts: Vec<String>,

    /// Image attached to every prompt: an inline `data:image/...;base64,`
    /// payload, or a path under `IMAGE_ROOT`.
    #[arg(long)]
    pub image: Option<String>,

    /// How long to wait for Stage 2 once every prompt has been answered, in
    /// milliseconds. Responses still unprocessed afterwards are printed as
    /// they are.
    #[arg(long, default_value_t = 5_000)]
    pub settle_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct Stage2WorkerArgs {
    /// Identity attached to every result this worker produces.
    #[arg(long)]
    pub processor_id: usize,

    /// Artificial delay applied by each transformation, in milliseconds.
    #[arg(long, default_value_t = 200)]
    pub transform_delay_ms: u64,
}

/// Stage-2 isolation strategy.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    /// Separate OS processes (the server binary re-executed).
    Process,
    /// In-process tasks connected through in-memory pipes. Shares the
    /// server's address space, so a misbehaving worker is not contained.
    Task,
}

/// Settings for the pipeline itself, independent of the HTTP surface and the
/// concrete generator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub num_threads: usize,
    pub num_processes: usize,
    pub poll_interval: Duration,
    /// `None` disables the per-call timeout.
    pub request_timeout: Option<Duration>,
    /// `None` leaves the request queue unbounded.
    pub queue_capacity: Option<usize>,
    pub shutdown_timeout: Duration,
    pub transform_delay: Duration,
    pub image_root: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            num_threads: 5,
            num_processes: 3,
            poll_interval: Duration::from_millis(500),
            request_timeout: Some(Duration::from_secs(30)),
            queue_capacity: None,
            shutdown_timeout: Duration::from_secs(2),
            transform_delay: Duration::from_millis(200),
            image_root: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub system_prompt: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub max_body_bytes: usize,
    pub isolation: Isolation,
    pub gemini: GeminiConfig,
    pub pipeline: PipelineConfig,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_threads == 0 {
            bail!("NUM_THREADS must be greater than 0");
        }

        if args.num_processes == 0 {
            bail!("NUM_PROCESSES must be greater than 0");
        }

        if args.poll_interval_ms == 0 {
            bail!("POLL_INTERVAL_MS must be greater than 0");
        }

        let api_key = match args.gemini_api_key {
            Some(key) if !key.trim().is_empty() => key,
            _ => bail!("GEMINI_API_KEY is not configured; set it in the environment or a .env file"),
        };

        if args.max_body_bytes == 0 {
            bail!("MAX_BODY_BYTES must be greater than 0");
        }

        if let Some(root) = &args.image_root {
            if !root.is_dir() {
                bail!("IMAGE_ROOT ({}) is not a directory", root.display());
            }
        }

        Ok(Self {
            server_addr: args.server_addr,
            max_body_bytes: args.max_body_bytes,
            isolation: args.isolation,
            gemini: GeminiConfig {
                api_key,
                model: args.gemini_model,
                base_url: args.gemini_base_url.trim_end_matches('/').to_string(),
                system_prompt: args.system_prompt,
            },
            pipeline: PipelineConfig {
                num_threads: args.num_threads,
                num_processes: args.num_processes,
                poll_interval: Duration::from_millis(args.poll_interval_ms),
                request_timeout: (args.request_timeout_secs > 0)
                    .then(|| Duration::from_secs(args.request_timeout_secs)),
                queue_capacity: (args.request_queue_capacity > 0)
                    .then_some(args.request_queue_capacity),
                shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
                transform_delay: Duration::from_millis(args.transform_delay_ms),
                image_root: args.image_root,
            },
        })
    }
}
