use std::{env, error::Error, fs, process::ExitCode};

use controller::{Controller, StopToken, TrainerConfig};
use log::{error, info};
use tokio::signal;

mod model;

use model::UnigramModel;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let Some(path) = env::args().nth(1) else {
        eprintln!("usage: node <config.json>");
        return ExitCode::from(2);
    };

    match run(&path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(path: &str) -> Result<(), Box<dyn Error>> {
    let cfg: TrainerConfig = serde_json::from_str(&fs::read_to_string(path)?)?;

    let stop = StopToken::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("received SIGINT, stopping at the next step boundary");
                stop.request();
            }
        });
    }

    let controller = Controller::new(cfg, 0, None, stop)?;
    let summary = controller.run(Box::new(UnigramModel::new(0.1, 0.9))).await?;

    info!(
        "finished: phase={} steps={} records={} skipped={} truncated={} checkpoints={} last={}",
        summary.phase,
        summary.metrics.steps,
        summary.metrics.records,
        summary.metrics.skipped_records,
        summary.metrics.truncated_records,
        summary.metrics.checkpoints_written,
        summary.last_checkpoint.as_deref().unwrap_or("none"),
    );
    Ok(())
}
