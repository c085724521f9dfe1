//! Command-line client for the DeepMicroPath analysis backend.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use micropath_client::{
    ConnectionState, FileUpload, InferenceClient, RealtimeSession, SessionOptions,
};
use micropath_core::config::Endpoint;
use micropath_core::events::{AnalysisMode, AnalysisRequest, GenerationConfig};
use micropath_core::ids::JobId;

#[derive(Parser, Debug)]
#[command(name = "micropath", about = "DeepMicroPath analysis client")]
struct Cli {
    /// Backend base URL (scheme + host), e.g. https://backend.example.
    #[arg(long, env = "DEEPMICROPATH_URL")]
    backend: Option<String>,

    /// Bearer key sent with API requests.
    #[arg(long, env = "DEEPMICROPATH_API_KEY")]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an analysis, streaming output over the realtime connection.
    Analyze {
        question: String,

        #[arg(long, default_value = "auto")]
        mode: AnalysisMode,

        /// Previously uploaded file URLs to attach.
        #[arg(long = "file")]
        files: Vec<String>,

        #[arg(long)]
        temperature: Option<f64>,

        #[arg(long)]
        top_p: Option<f64>,

        #[arg(long)]
        max_tokens: Option<u32>,

        /// Use the synchronous HTTP endpoint instead of the realtime
        /// connection (no streaming).
        #[arg(long)]
        sync: bool,

        /// Give up after this many seconds.
        #[arg(long, default_value = "600")]
        timeout: u64,
    },
    /// Show the status of a job.
    Status { job_id: JobId },
    /// Fetch the result of a completed job.
    Result { job_id: JobId },
    /// Ask the backend to cancel a job.
    Cancel { job_id: JobId },
    /// Upload local files and print their public URLs.
    Upload { paths: Vec<PathBuf> },
    /// List files stored on the backend.
    Files,
    /// Show the backend's feature configuration.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let endpoint = resolve_endpoint(&cli)?;
    let client = InferenceClient::new(&endpoint);

    match cli.command {
        Command::Analyze {
            question,
            mode,
            files,
            temperature,
            top_p,
            max_tokens,
            sync,
            timeout,
        } => {
            let mut request = AnalysisRequest::new(question, mode);
            if !files.is_empty() {
                request.files = Some(files);
            }
            if temperature.is_some() || top_p.is_some() || max_tokens.is_some() {
                request.config = Some(GenerationConfig {
                    temperature,
                    top_p,
                    max_tokens,
                    presence_penalty: None,
                });
            }

            if sync {
                run_sync(&client, &request).await
            } else {
                run_realtime(&endpoint, request, Duration::from_secs(timeout)).await
            }
        }
        Command::Status { job_id } => {
            let status = client.job_status(&job_id).await?;
            println!("{}: {:?}", status.job_id, status.status);
            if let Some(progress) = status.progress {
                println!("progress: {progress}%");
            }
            if let Some(error) = status.error {
                println!("error: {error}");
            }
            Ok(())
        }
        Command::Result { job_id } => {
            let job = client.job_result(&job_id).await?;
            print_outcome(&job.result);
            if let Some(duration) = job.duration_seconds {
                tracing::info!(duration_seconds = duration, "job finished");
            }
            Ok(())
        }
        Command::Cancel { job_id } => {
            if client.cancel_job(&job_id).await? {
                println!("canceled");
            } else {
                println!("not canceled (job may already be finished)");
            }
            Ok(())
        }
        Command::Upload { paths } => {
            let mut uploads = Vec::with_capacity(paths.len());
            for path in &paths {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("upload")
                    .to_string();
                uploads.push(FileUpload::new(name, guess_content_type(path), bytes));
            }
            for url in client.upload_files(uploads).await? {
                println!("{url}");
            }
            Ok(())
        }
        Command::Files => {
            for file in client.list_files().await? {
                match file.size {
                    Some(size) => println!("{}\t{}\t{size}", file.name, file.url),
                    None => println!("{}\t{}", file.name, file.url),
                }
            }
            Ok(())
        }
        Command::Config => {
            let config = client.server_config().await?;
            println!("need_code: {}", config.need_code);
            println!("hide_user_api_key: {}", config.hide_user_api_key);
            println!("hide_balance_query: {}", config.hide_balance_query);
            println!("default_model: {}", config.default_model);
            println!("custom_models: {}", config.custom_models);
            Ok(())
        }
    }
}

fn resolve_endpoint(cli: &Cli) -> Result<Endpoint> {
    let mut endpoint = match &cli.backend {
        Some(base) => Endpoint::from_base_url(base)?,
        None => Endpoint::from_env()?,
    };
    if let Some(key) = &cli.api_key {
        endpoint = endpoint.with_api_key(key);
    }
    Ok(endpoint)
}

async fn run_sync(client: &InferenceClient, request: &AnalysisRequest) -> Result<()> {
    tracing::info!(mode = request.mode.as_str(), "running synchronous inference");
    let outcome = client.submit_sync(request).await?;
    print_outcome(&outcome);
    Ok(())
}

/// Connect, run one analysis, and print chunks as they stream in.
async fn run_realtime(
    endpoint: &Endpoint,
    request: AnalysisRequest,
    timeout: Duration,
) -> Result<()> {
    let session = RealtimeSession::open(endpoint, SessionOptions::default());
    let mut rx = session.subscribe();
    session.connect();

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            {
                let snap = rx.borrow_and_update();
                if snap.is_connected() {
                    return Ok(());
                }
                if snap.connection == ConnectionState::Error {
                    let message = snap.error.clone().unwrap_or_else(|| "unknown".into());
                    return Err(anyhow!("connection failed: {message}"));
                }
            }
            rx.changed().await.map_err(|_| anyhow!("session closed"))?;
        }
    })
    .await
    .context("timed out connecting to backend")??;

    session.start_analysis(request);

    let deadline = tokio::time::Instant::now() + timeout;
    let mut printed = 0;
    let mut stdout = std::io::stdout();
    loop {
        let snap = rx.borrow_and_update().clone();

        if snap.streamed_content.len() > printed {
            stdout.write_all(snap.streamed_content[printed..].as_bytes())?;
            stdout.flush()?;
            printed = snap.streamed_content.len();
        }

        if let Some(result) = &snap.result {
            if printed == 0 {
                println!("{}", result.prediction);
            } else {
                println!();
            }
            tracing::info!(
                execution_time = result.execution_time,
                rounds = result.rounds,
                tools = result.tools_used.join(",").as_str(),
                "analysis complete"
            );
            break;
        }

        if !snap.analyzing {
            if let Some(error) = &snap.error {
                bail!("analysis failed: {error}");
            }
        }

        tokio::time::timeout_at(deadline, rx.changed())
            .await
            .context("timed out waiting for analysis")?
            .map_err(|_| anyhow!("session closed"))?;
    }

    session.disconnect();
    Ok(())
}

fn print_outcome(outcome: &micropath_client::InferenceOutcome) {
    match (&outcome.prediction, &outcome.report) {
        (Some(prediction), _) => println!("{prediction}"),
        (None, Some(report)) => println!("{report}"),
        (None, None) => println!("(no prediction returned)"),
    }
}

fn guess_content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("txt") => "text/plain",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}
