use std::process::ExitCode;

use anyhow::Result;
use tracing::{error, info};

use evidentia::{cli, config, context::EngineContext, logging};

fn main() -> ExitCode {
    logging::init_logging();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli_opts = cli::parse();
    let mut loaded = config::load_config(cli_opts.config_path.as_deref())?;
    cli_opts.apply_overrides(&mut loaded.config);
    loaded.config.check()?;

    let modality = cli_opts.modality()?;
    let request = cli_opts.request()?;

    info!(
        "starting run_id={} evidence_id={} input={} modality={modality} workers={}",
        loaded.config.run_id,
        request.evidence_id,
        request.path.display(),
        loaded.config.worker_count()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let report = runtime.block_on(async {
        let engine = EngineContext::from_config(loaded)?;
        let on_signal = engine.clone();
        ctrlc::set_handler(move || on_signal.cancel_all())?;

        let outcome = engine.processor(modality).process(request).await;
        engine.shutdown();
        anyhow::Ok(outcome?)
    })?;

    println!("{}", report.to_json_pretty()?);
    if !report.is_complete() {
        info!(
            "evidence_id={} finished with {} failed analysis type(s)",
            report.evidence_id,
            report.errors.len()
        );
    }
    Ok(())
}
