use anyhow::ensure;
use clap::Parser;
use log::{info, warn};
use lpd_reco::data_import::CflDataset;
use lpd_reco::dataset::{Dataset, Part};
use lpd_reco::ensemble::EnsembleReconstructor;
use lpd_reco::metrics::Measure;
use lpd_reco::reconstructor::{checkpoint_name, learned_params_path, Reconstructor};
use lpd_reco::task_table::{Task, TaskOptions, TaskReconstructor, TaskTable};
use lpd_reco::{load_learned_pd, N_TEST_SAMPLES, NUM_WORKERS};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(about = "score trained learned primal-dual reconstructors, averaged as an ensemble")]
struct Args {
    /// dataset root directory (holds geometry.toml and one directory per part)
    #[arg(long, default_value = "data")]
    data: PathBuf,
    /// hyper parameter file
    #[arg(long, default_value = "params")]
    params: PathBuf,
    /// directory holding best-model-<i> checkpoints
    #[arg(long, default_value = ".")]
    checkpoint_dir: PathBuf,
    /// number of models to load, best-model-0 .. best-model-<n-1>
    #[arg(long, default_value_t = 2)]
    n_models: u64,
    /// number of leading test samples to score
    #[arg(long, default_value_t = N_TEST_SAMPLES)]
    n_test: usize,
    /// score every model on its own instead of averaging them
    #[arg(long)]
    no_ensemble: bool,
    /// enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();
    ensure!(args.n_models > 0, "at least one model is needed");

    let dataset = CflDataset::open(&args.data)?;
    let test_data = dataset.get_data_pairs(Part::Test, Some(args.n_test))?;
    info!("scoring {} of {} test samples", test_data.len(), dataset.get_len(Part::Test));

    let pattern = args.checkpoint_dir.join("best-model-*.json").display().to_string();
    let available = glob::glob(&pattern)?.filter_map(|p| p.ok()).count();
    if (available as u64) < args.n_models {
        warn!("found {} checkpoints in {}, {} requested", available, args.checkpoint_dir.display(), args.n_models);
    }

    let params = args.params.with_extension("toml");
    let reconstructors = (0..args.n_models).map(|i| {
        let checkpoint = learned_params_path(&args.checkpoint_dir, &checkpoint_name(i));
        info!("loading {}", checkpoint.display());
        let r = load_learned_pd(dataset.ray_trafo(), &params, Some(&checkpoint), NUM_WORKERS)?;
        Ok(Box::new(r) as Box<dyn Reconstructor>)
    }).collect::<lpd_reco::Result<Vec<_>>>()?;

    let options = TaskOptions { skip_training: true };
    let mut task_table = TaskTable::new();
    if args.no_ensemble || reconstructors.len() == 1 {
        for r in reconstructors {
            task_table.append(Task::new(TaskReconstructor::Fixed(r), &[Measure::Psnr, Measure::Ssim], test_data.clone()).with_options(options));
        }
    } else {
        let ensemble = EnsembleReconstructor::new(reconstructors)?;
        task_table.append(Task::new(TaskReconstructor::Fixed(Box::new(ensemble)), &[Measure::Psnr, Measure::Ssim], test_data).with_options(options));
    }

    let results = task_table.run()?;
    println!("{}", results.render(&["misc"]));
    Ok(())
}
