use clap::Parser;
use log::info;
use lpd_reco::data_import::CflDataset;
use lpd_reco::dataset::{Dataset, Part};
use lpd_reco::metrics::Measure;
use lpd_reco::primal_dual::LearnedPdReconstructor;
use lpd_reco::reconstructor::{checkpoint_name, learned_params_path, LearnedReconstructor};
use lpd_reco::sub_sample::RandomSampleDataset;
use lpd_reco::task_table::{Task, TaskReconstructor, TaskTable};
use lpd_reco::{NUM_WORKERS, TRAIN_SIZE_PART};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(about = "train a learned primal-dual reconstructor on a random tenth of the dataset")]
struct Args {
    /// seed of the sub-sample permutation, also names the checkpoint best-model-<seed>
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// directory receiving the training log and the result table
    #[arg(long = "log_dir")]
    log_dir: Option<PathBuf>,
    /// dataset root directory (holds geometry.toml and one directory per part)
    #[arg(long, default_value = "data")]
    data: PathBuf,
    /// hyper parameter file
    #[arg(long, default_value = "params")]
    params: PathBuf,
    /// directory the best learned parameters are written to
    #[arg(long, default_value = ".")]
    checkpoint_dir: PathBuf,
    /// enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();

    let dataset = CflDataset::open(&args.data)?;
    let test_data = dataset.get_data_pairs(Part::Validation, None)?;

    let reduced_dataset = RandomSampleDataset::new(&dataset, TRAIN_SIZE_PART, args.seed)?;
    info!("training on {} of {} samples (seed {})",
        reduced_dataset.get_len(Part::Train), dataset.get_len(Part::Train), args.seed);

    let mut reconstructor = LearnedPdReconstructor::new(dataset.ray_trafo().clone(), NUM_WORKERS)?;
    reconstructor.load_hyper_params(&args.params.with_extension("toml"))?;
    reconstructor.save_best_learned_params_path = Some(learned_params_path(&args.checkpoint_dir, &checkpoint_name(args.seed)));
    reconstructor.log_dir = args.log_dir.clone();
    let hyper_params = reconstructor.hyper_params_table()?;

    let mut task_table = TaskTable::new();
    task_table.append(
        Task::new(TaskReconstructor::Learned(Box::new(reconstructor)), &[Measure::Psnr, Measure::Ssim], test_data)
            .with_dataset(&reduced_dataset)
            .with_hyper_param_choices(vec![hyper_params])
    );
    let results = task_table.run()?;
    println!("{}", results.render(&["misc"]));

    let report = args.log_dir.unwrap_or_else(|| PathBuf::from(".")).join(format!("results-{}.json", args.seed));
    results.save_json(&report)?;
    info!("wrote results to {}", report.display());
    Ok(())
}
