//! CLI subcommand handlers.

use actiondet_core::checkpoint::CheckpointStore;
use actiondet_core::procedures;
use actiondet_core::{Backend, Config, Orchestrator, RunMode, RunSummary, load_checkpoint};
use std::fmt::Write as _;
use std::path::Path;

pub fn train(config: Config, backend: &dyn Backend) -> anyhow::Result<RunSummary> {
    let mut orchestrator = Orchestrator::prepare(config, backend)?;
    Ok(orchestrator.run()?)
}

pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    match summary.mode {
        RunMode::EvaluateOnly => {
            if let Some(eval) = &summary.evaluation {
                let _ = write!(
                    out,
                    "Evaluation: fscore {:.6} (precision {:.6}, recall {:.6})",
                    eval.score,
                    eval.stats.precision(),
                    eval.stats.recall()
                );
            }
        }
        RunMode::Train => {
            let _ = writeln!(out, "Epochs run: {}", summary.epochs.len());
            for report in &summary.epochs {
                let _ = writeln!(
                    out,
                    "  epoch {:>3}  lr {:<10.3e}  loss {:<10.4}  score {:.6}{}",
                    report.epoch,
                    report.learning_rate,
                    report.train_loss,
                    report.score,
                    if report.is_best { "  *best*" } else { "" }
                );
            }
            let _ = write!(out, "Best score: {:.6}", summary.best_score);
        }
    }
    out
}

/// Validate `config` and describe what a run would do, without building a
/// model.
pub fn check(config: &Config) -> anyhow::Result<String> {
    let procedures = procedures::resolve(config.train.dataset)?;
    let store = CheckpointStore::from_config(config);

    let mut out = String::new();
    let _ = writeln!(
        out,
        "Dataset:     {} ({} procedures)",
        config.train.dataset, procedures.family
    );
    if config.train.evaluate {
        let _ = writeln!(out, "Mode:        evaluate once");
    } else {
        let _ = writeln!(
            out,
            "Epochs:      {}..={}",
            config.train.begin_epoch, config.train.end_epoch
        );
    }
    let _ = writeln!(
        out,
        "Clip:        {} frames, rate {}, crop {}",
        config.data.num_frames, config.data.sampling_rate, config.data.train_crop_size
    );
    let _ = writeln!(out, "Latest slot: {}", store.latest_path().display());
    let _ = writeln!(out, "Best slot:   {}", store.best_path().display());

    match config.resume_path() {
        None => {
            let _ = write!(out, "Resume:      none");
        }
        Some(path) => match load_checkpoint(path)? {
            Some(record) => {
                let _ = write!(
                    out,
                    "Resume:      {} (epoch {}, score {:.6}; next epoch {})",
                    path.display(),
                    record.epoch,
                    record.score,
                    record.epoch.saturating_add(1)
                );
            }
            None => {
                let _ = write!(
                    out,
                    "Resume:      {} not found, run starts fresh",
                    path.display()
                );
            }
        },
    }
    Ok(out)
}

pub fn inspect(path: &Path) -> anyhow::Result<String> {
    let record = load_checkpoint(path)?
        .ok_or_else(|| anyhow::anyhow!("No checkpoint file at {}", path.display()))?;

    let mut out = String::new();
    let _ = writeln!(out, "Checkpoint:      {}", path.display());
    let _ = writeln!(out, "Dataset:         {}", record.dataset);
    let _ = writeln!(out, "Frames:          {}", record.num_frames);
    let _ = writeln!(out, "Epoch:           {}", record.epoch);
    let _ = writeln!(out, "Score:           {:.6}", record.score);
    let _ = writeln!(out, "Saved at:        {}", record.saved_at.to_rfc3339());
    let _ = writeln!(out, "Model state:     {} bytes", record.model_state.len());
    let _ = writeln!(out, "Optimizer state: {} bytes", record.optimizer_state.len());
    let _ = write!(out, "Digest:          {}", record.digest());
    Ok(out)
}

pub fn schedule(config: &Config) -> String {
    let policy = &config.solver.lr_policy;
    let base = config.train.learning_rate;
    let mut out = String::new();
    let _ = write!(out, "Policy: {policy:?}, base lr {base}");
    for epoch in config.train.begin_epoch..=config.train.end_epoch {
        let _ = write!(out, "\n  epoch {epoch:>3}: {}", policy.learning_rate(base, epoch));
    }
    out
}

/// Write the default configuration as TOML.
pub fn init(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at: {} (use --force to replace it)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let toml_str = toml::to_string_pretty(&Config::default())?;
    std::fs::write(path, toml_str)?;
    Ok(())
}
