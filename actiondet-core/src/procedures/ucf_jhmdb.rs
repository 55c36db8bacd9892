//! Frame-level procedures shared by UCF101-24 and J-HMDB-21.

use tracing::{debug, info};

use super::{EvalStep, EvalSummary, ProcedureSet, TrainStep, TrainSummary};
use crate::backend::{Backend, LossModule, Mode};
use crate::config::Config;
use crate::detection::FrameStats;

pub const PROCEDURES: ProcedureSet = ProcedureSet {
    family: "ucf24/jhmdb21",
    train: train_epoch,
    evaluate,
    build_loss: region_loss,
};

fn region_loss(backend: &dyn Backend, config: &Config) -> anyhow::Result<Box<dyn LossModule>> {
    backend.build_region_loss(config)
}

/// One pass over the training loader: forward, region loss, backward, step.
pub fn train_epoch(step: TrainStep<'_>) -> anyhow::Result<TrainSummary> {
    let TrainStep {
        epoch,
        model,
        optimizer,
        loss,
        loader,
        rng,
        log_every,
    } = step;

    model.set_mode(Mode::Train);
    let log_every = log_every.max(1);
    let total = loader.num_batches();
    let mut loss_sum = 0.0;
    let mut batches = 0usize;

    for (index, batch) in loader.batches(rng).enumerate() {
        let batch = batch?;

        optimizer.zero_grad(model);
        let output = model.forward(&batch.clips)?;
        let batch_loss = loss.forward(&output, &batch.targets, epoch, index)?;
        if !batch_loss.value.is_finite() {
            anyhow::bail!("loss became {} at batch {index}", batch_loss.value);
        }
        model.backward(&batch_loss)?;
        optimizer.step(model)?;

        loss_sum += batch_loss.value;
        batches += 1;

        if batches % log_every == 0 {
            info!(
                "epoch {epoch} batch {batches}/{total}: loss {:.4} (mean {:.4})",
                batch_loss.value,
                loss_sum / batches as f64
            );
        }
        if !batch_loss.components.is_empty() {
            debug!(epoch, batch = index, components = ?batch_loss.components, "loss components");
        }
    }

    let mean_loss = if batches == 0 {
        0.0
    } else {
        loss_sum / batches as f64
    };
    info!("epoch {epoch}: trained {batches} batches, mean loss {mean_loss:.4}");
    Ok(TrainSummary { batches, mean_loss })
}

/// Score the model on the evaluation loader; the score is the frame F-score.
pub fn evaluate(step: EvalStep<'_>) -> anyhow::Result<EvalSummary> {
    let EvalStep {
        epoch,
        model,
        loader,
        rng,
        thresholds,
    } = step;

    model.set_mode(Mode::Eval);
    let mut stats = FrameStats::default();

    for batch in loader.batches(rng) {
        let batch = batch?;
        let output = model.forward(&batch.clips)?;
        let detections = model.decode(&output, thresholds.conf_thresh)?;
        if detections.len() != batch.len() {
            anyhow::bail!(
                "model decoded {} clips for a batch of {}",
                detections.len(),
                batch.len()
            );
        }
        for (clip_dets, truths) in detections.iter().zip(&batch.targets) {
            stats.add_clip(clip_dets, truths, &thresholds);
        }
    }

    let score = stats.fscore();
    info!(
        "epoch {epoch}: precision {:.6}, recall {:.6}, fscore {:.6} ({} correct / {} proposals / {} ground truths)",
        stats.precision(),
        stats.recall(),
        score,
        stats.correct,
        stats.proposals,
        stats.total
    );
    Ok(EvalSummary { stats, score })
}
