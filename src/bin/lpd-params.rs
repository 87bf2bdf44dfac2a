use clap::Parser;
use lpd_reco::primal_dual::LpdHyperParams;
use lpd_reco::ray_trafo::Geometry;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Parser)]
struct Args {
    /// path to hyper parameter file to write
    parameter_file: PathBuf,
    /// also write a default acquisition geometry to this file
    #[arg(long)]
    geometry: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let params = LpdHyperParams::default();
    let mut toml_string = toml::to_string(&params)?;
    toml_string.push('\n');
    let filename = args.parameter_file.with_extension("toml");
    let mut f = File::create(&filename)?;
    f.write_all(toml_string.as_bytes())?;
    println!("wrote default parameter file to {}", filename.display());

    if let Some(geometry) = args.geometry {
        let filename = geometry.with_extension("toml");
        Geometry::default().to_file(&filename)?;
        println!("wrote default geometry to {}", filename.display());
    }
    Ok(())
}
