mod checkpoint;
mod problem;
mod settings;

use anyhow::{anyhow, Result};
use checkpoint::{Checkpoint, Snapshot};
use clap::{arg, ArgAction, Command};
use log::{debug, info};
use problem::Regression;
use rand::{rngs::StdRng, SeedableRng};
use serde_json::json;
use settings::load_settings;
use sophia_optim::{Parameter, Sophia};
use sophia_utils::{jsonify, u64s_from_str, u8s_from_str};
use std::path::PathBuf;

fn cli() -> Command {
    Command::new("sophia-runtime")
        .about("Trains synthetic problems with the Sophia optimizers")
        .arg_required_else_help(true)
        .subcommand(
            Command::new("train")
                .about("Trains a linear regression model")
                .arg(
                    arg!(<SETTINGS> "Settings json string or path to json file")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    arg!(<SEED> "A string used in seed generation")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    arg!(--output [OUTPUT_FILE] "If set, the final checkpoint will be saved to this file path (default json)")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--compress [COMPRESS] "If output file is set, the checkpoint will be compressed as zlib")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    arg!(--resume [RESUME_FILE] "Checkpoint to continue training from")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("inspect")
                .about("Summarizes a checkpoint or optimizer state dict")
                .arg(
                    arg!(<STATE> "Path to a checkpoint or state dict (json or zlib)")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let matches = cli().get_matches();

    if let Err(e) = match matches.subcommand() {
        Some(("train", sub_m)) => train(
            sub_m.get_one::<String>("SETTINGS").unwrap().clone(),
            sub_m.get_one::<String>("SEED").unwrap().clone(),
            sub_m.get_one::<PathBuf>("output").cloned(),
            *sub_m.get_one::<bool>("compress").unwrap(),
            sub_m.get_one::<PathBuf>("resume").cloned(),
        ),
        Some(("inspect", sub_m)) => inspect(sub_m.get_one::<PathBuf>("STATE").unwrap().clone()),
        _ => Err(anyhow!("Invalid subcommand")),
    } {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

pub fn train(
    settings: String,
    seed: String,
    output_file: Option<PathBuf>,
    compress: bool,
    resume_file: Option<PathBuf>,
) -> Result<()> {
    let settings = load_settings(&settings)?;
    let mut data_rng = StdRng::from_seed(u8s_from_str(&seed));
    let problem = Regression::generate(
        &mut data_rng,
        settings.num_samples,
        settings.num_features,
        settings.num_outputs,
        settings.noise_std,
    );

    let mut optimizer = Sophia::new(settings.variant, [0usize, 1], settings.group_config())?;
    let mut params = problem.init_params();
    let mut start = 0;
    if let Some(path) = resume_file {
        let checkpoint = Checkpoint::load(&path)?;
        if checkpoint.variant != settings.variant {
            return Err(anyhow!(
                "Checkpoint was written by variant '{}', settings ask for '{}'",
                checkpoint.variant,
                settings.variant
            ));
        }
        params = checkpoint.restore_params()?;
        problem.predict(&params)?;
        optimizer.load_state_dict(checkpoint.optimizer)?;
        start = checkpoint.step;
        info!("Resumed from {} at step {}", path.display(), start);
    }

    info!(
        "Training {} samples x {} features -> {} outputs with sophia-{} for {} steps",
        settings.num_samples,
        settings.num_features,
        settings.num_outputs,
        settings.variant,
        settings.num_steps
    );

    let mut closure =
        |ps: &mut [Parameter]| -> anyhow::Result<f32> { problem.loss_and_grads(ps, &problem.targets) };
    let mut loss = f32::NAN;
    let mut rng = sampling_rng(&seed, start);
    let end = start + settings.num_steps;
    for step in start..end {
        if step % settings.hessian_interval == 0 {
            let sampled = problem.sampled_targets(&params, &mut rng)?;
            problem.loss_and_grads(&mut params, &sampled)?;
            optimizer.update_hessian(&params)?;
            debug!("Hessian refreshed at step {}", step);
        }
        if let Some(l) = optimizer.step(&mut params, Some(&mut closure), settings.batch_size)? {
            loss = l;
        }
        if settings.report_interval > 0 && (step + 1) % settings.report_interval == 0 {
            info!("step {:>6}  loss {:.6}", step + 1, loss);
        }
    }

    let final_loss = problem.loss_and_grads(&mut params, &problem.targets)?;
    println!(
        "{}",
        jsonify(&json!({
            "variant": settings.variant,
            "steps": end,
            "loss": final_loss,
        }))?
    );

    if let Some(path) = output_file {
        optimizer.zero_grad(&mut params);
        let checkpoint = Checkpoint::new(settings.variant, end, &params, optimizer.state_dict());
        checkpoint.save(&path, compress)?;
        info!("Saved checkpoint to {}", path.display());
    }
    Ok(())
}

/// Hessian sampling stream for a run starting at `start`. Resumed runs draw
/// from a fresh stream instead of replaying the one from step 0.
fn sampling_rng(seed: &str, start: usize) -> StdRng {
    StdRng::seed_from_u64(u64s_from_str(&format!("{}:{}", seed, start))[0])
}

pub fn inspect(path: PathBuf) -> Result<()> {
    let snapshot = Snapshot::load(&path)?;
    if let Snapshot::Checkpoint(checkpoint) = &snapshot {
        println!("variant: {}  step: {}", checkpoint.variant, checkpoint.step);
    }
    let dict = snapshot.state_dict();
    for (i, group) in dict.param_groups.iter().enumerate() {
        println!(
            "group {}: params {:?} lr {} betas {:?} rho {} weight_decay {} maximize {} capturable {}",
            i,
            group.params,
            group.lr,
            group.betas,
            group.rho,
            group.weight_decay,
            group.maximize,
            group.capturable
        );
    }
    for (index, record) in &dict.state {
        let state = record.to_state()?;
        let momentum = state.momentum.to_vec();
        let momentum_norm = momentum.iter().map(|m| m * m).sum::<f32>().sqrt();
        let hessian = match &state.hessian {
            Some(h) => {
                let values = h.to_vec();
                let mean = values.iter().sum::<f32>() / values.len().max(1) as f32;
                format!("{:.6e}", mean)
            }
            None => "-".to_string(),
        };
        let rms = state
            .rms
            .map(|r| format!("{:.6e}", r))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "param {:>4}  shape {:?}  step {}  |m| {:.6e}  mean h {}  rms {}  device {:?}",
            index,
            state.momentum.shape(),
            state.step.value(),
            momentum_norm,
            hessian,
            rms,
            state.step.device()
        );
    }
    Ok(())
}
