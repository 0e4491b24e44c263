use std::{process, sync::Arc};

use platelet_worker::{
    RenderRequest, RenderResponse,
    application::{error::AppError, render::RenderWorker},
    config,
    infra::{
        error::InfraError, process::ProcessCapabilityLoader, stdio, telemetry, templates,
    },
};
use tokio::io::AsyncWriteExt;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(config::ServeArgs::default()));

    telemetry::init(&settings.logging)?;

    let loader = Arc::new(ProcessCapabilityLoader::new(settings.capability.clone()));
    let worker = RenderWorker::new(loader);

    match command {
        config::Command::Serve(_) => run_serve(settings, worker).await,
        config::Command::Render(args) => run_render(worker, args).await,
    }
}

async fn run_serve(settings: config::Settings, worker: RenderWorker) -> Result<(), AppError> {
    let queue_capacity = settings.worker.queue_capacity.get();

    info!(
        target = "platelet_worker::serve",
        worker_id = %worker.id(),
        queue_capacity,
        program = %settings.capability.program.display(),
        "Serving render requests on stdio"
    );

    let mut stdout = tokio::io::stdout();
    stdio::serve_lines(worker, queue_capacity, tokio::io::stdin(), &mut stdout).await?;
    Ok(())
}

async fn run_render(worker: RenderWorker, args: config::RenderArgs) -> Result<(), AppError> {
    let templates_dir = args.templates.clone();
    let files =
        tokio::task::spawn_blocking(move || templates::collect_files(&templates_dir))
            .await
            .map_err(InfraError::from)??;
    let json = read_context(&args).await?;

    info!(
        target = "platelet_worker::render",
        worker_id = %worker.id(),
        root = %args.root,
        files = files.len(),
        "Rendering template"
    );

    let request = RenderRequest {
        root: args.root,
        files,
        json,
    };

    match worker.handle(request).await {
        RenderResponse::Success { result } => {
            let mut stdout = tokio::io::stdout();
            stdout
                .write_all(result.as_bytes())
                .await
                .map_err(InfraError::from)?;
            stdout.write_all(b"\n").await.map_err(InfraError::from)?;
            stdout.flush().await.map_err(InfraError::from)?;
            Ok(())
        }
        RenderResponse::Failure { error } => Err(AppError::render(error)),
    }
}

async fn read_context(args: &config::RenderArgs) -> Result<serde_json::Value, AppError> {
    match (&args.context, &args.context_file) {
        (Some(inline), _) => parse_context(inline, "--context"),
        (None, Some(path)) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .map_err(InfraError::from)?;
            parse_context(&text, &path.display().to_string())
        }
        (None, None) => Ok(serde_json::Value::Object(serde_json::Map::new())),
    }
}

fn parse_context(text: &str, source: &str) -> Result<serde_json::Value, AppError> {
    serde_json::from_str(text)
        .map_err(|err| AppError::validation(format!("{source} is not valid JSON: {err}")))
}
