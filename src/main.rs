use std::{path::PathBuf, process, time::Duration};

use clap::{Parser, ValueEnum};
use medrouter_rs::{
    ExtraOutputType, InferenceParams, MedRouterError, MedRouterUrl, OutputFormat, PollPolicy,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to a NIfTI file, a zip of DICOM files or a directory of DICOM files
    #[clap(required = true)]
    source: PathBuf,
    /// Name of the model to run
    #[clap(short, long)]
    model: String,
    /// Id of the model to run
    #[clap(short = 'i', long)]
    model_id: String,
    /// Notes sent along with the scan
    #[clap(short, long, default_value = "")]
    notes: String,
    /// Ask the server for an additional output
    #[arg(value_enum)]
    #[clap(short, long)]
    extra_output_type: Option<ExtraOutputType>,
    /// Run the server-side prechecks before the inference
    #[clap(short, long)]
    prechecks: bool,
    /// Seconds to wait between two status checks
    #[clap(short = 'c', long, default_value = "15")]
    check_interval: u64,
    /// How many times the status is checked again while the request is not processed
    #[clap(short = 'r', long, default_value = "40")]
    max_retries: u32,
    /// Download the outputs of this format once the request is processed
    #[arg(value_enum)]
    #[clap(short = 'D', long)]
    download: Option<OutputFormat>,
    /// Output directory
    #[clap(short = 'd', long, default_value = ".")]
    output_dir: PathBuf,
    /// Override the API key from the environment variable
    #[clap(short = 'k', long)]
    api_key: Option<String>,
    /// Override the API URL from the environment variable
    #[clap(short, long)]
    api_url: Option<String>,
    /// Set the log level
    #[arg(value_enum)]
    #[clap(short = 'L', long, default_value = "info")]
    log_level: LogLevel,
    /// Display timestamps with log messages
    #[clap(short = 'T', long)]
    timestamp: bool,
}

#[derive(Copy, Clone, ValueEnum, Debug)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Quiet,
}

#[tokio::main]
pub async fn main() {
    let args = Args::parse();

    tracing_subscriber_handler(&args);

    if let Err(e) = run(args).await {
        error!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), MedRouterError> {
    let key = match &args.api_key {
        Some(key) => key.clone(),
        None => medrouter_rs::api_key_from_envar()?,
    };

    let url = match &args.api_url {
        Some(url) => MedRouterUrl::new(url.as_str()),
        None => MedRouterUrl::from_envar(),
    };

    let params = params_from_args(&args);
    let policy = PollPolicy::new(Duration::from_secs(args.check_interval), args.max_retries);

    let response =
        medrouter_rs::process_with_url(url.as_str(), &key, &args.source, &params, &policy).await?;

    match args.download {
        Some(format) => {
            let files = medrouter_rs::download(&response, format, &args.output_dir).await?;
            for (name, path) in files {
                info!("{} saved to {}", name, path.display());
            }
        }
        None => println!("{}", serde_json::to_string_pretty(&response)?),
    }

    Ok(())
}

fn params_from_args(args: &Args) -> InferenceParams {
    InferenceParams {
        model: args.model.clone(),
        model_id: args.model_id.clone(),
        notes: args.notes.clone(),
        extra_output_type: args.extra_output_type,
        prechecks: args.prechecks,
    }
}

fn tracing_subscriber_handler(args: &Args) {
    let env_filter = match args.log_level {
        LogLevel::Debug => "medrouter_rs=debug,medrouter=debug",
        LogLevel::Info => "medrouter_rs=info,medrouter=info",
        LogLevel::Warn => "medrouter_rs=warn,medrouter=warn",
        LogLevel::Error => "medrouter_rs=error,medrouter=error",
        LogLevel::Quiet => "medrouter_rs=off,medrouter=off",
    };

    // "if" because the subscriber doesn't yield the same type with or without time which prevents
    // using a match statement.
    if args.timestamp {
        let sub = tracing_subscriber::fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .finish();
        tracing::subscriber::set_global_default(sub)
            .expect("Error while setting subscriber for tracing.");
    } else {
        let sub = tracing_subscriber::fmt::Subscriber::builder()
            .with_env_filter(env_filter)
            .without_time()
            .finish();
        tracing::subscriber::set_global_default(sub)
            .expect("Error while setting subscriber for tracing.");
    };
}
