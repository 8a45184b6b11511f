use std::{path::PathBuf, process::ExitCode};

use bookshelf_reader::{BookshelfReaderBuilder, Config};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

const USAGE: &str = "usage: bookshelf-reader <image> [config.json]";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args_os().skip(1).map(PathBuf::from);
    let Some(image_path) = args.next() else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };

    match run(image_path, args.next()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(image_path: PathBuf, config_path: Option<PathBuf>) -> bookshelf_reader::Result<()> {
    let config = match config_path {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    let reader = BookshelfReaderBuilder::from_config(config).build()?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted, cancelling the run");
                cancel.cancel();
            }
        }
    });

    let image = tokio::fs::File::open(&image_path).await?;
    let result = reader.process(image, &cancel).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
