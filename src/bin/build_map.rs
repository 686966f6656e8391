use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use kdam::tqdm;
use log::info;

use mapping3d::config::Config;
use mapping3d::error::Error;
use mapping3d::io;
use mapping3d::pipeline::MappingPipeline;

#[derive(Parser)]
#[clap(about = "Build a map, trajectory, and waypoints from a LiDAR sequence")]
struct Args {
    /// Directory containing the point cloud sequence (PCD, PLY, or BIN)
    data_dir: PathBuf,
    /// Output directory for map.ply, map.pcd, trajectory.txt, waypoints.txt
    #[clap(long, short, default_value = "output")]
    output: PathBuf,
    /// JSON configuration file
    #[clap(long, short)]
    config: Option<PathBuf>,
    /// Enable loop closure detection
    #[clap(long, short = 'l', action)]
    loop_closure: bool,
    /// Also save the pre-optimization poses as odometry_poses.npy
    #[clap(long, action)]
    save_odometry: bool,
}

fn load_config(args: &Args) -> Result<Config, Error> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            Config::from_json_str(&text)?
        }
        None => Config::default(),
    };
    if args.loop_closure {
        config.loop_closure.enabled = true;
    }
    Ok(config)
}

fn run(args: &Args) -> Result<(), Error> {
    let config = load_config(args)?;

    if !args.data_dir.is_dir() {
        return Err(Error::InputMissing(args.data_dir.clone()));
    }
    let paths = io::discover_frames(&args.data_dir)?;
    if paths.is_empty() {
        return Err(Error::InputMissing(args.data_dir.clone()));
    }
    info!("found {} frames in {}", paths.len(), args.data_dir.display());

    let mut pipeline = MappingPipeline::new(config)?;
    for path in tqdm!(paths.iter(), total = paths.len(), desc = "Registering frames") {
        let points = io::load_points(path)?;
        pipeline.push_frame(&points)?;
    }

    let artifacts = pipeline.finish()?;
    artifacts.save(&args.output, args.save_odometry)?;

    let fallbacks = artifacts
        .estimates
        .iter()
        .skip(1)
        .filter(|estimate| estimate.fitness == 0.0)
        .count();
    println!(
        "{} poses ({} fallbacks), {} loops, {} map points, {} waypoints",
        artifacts.trajectory.len(),
        fallbacks,
        artifacts.loops.len(),
        artifacts.map.len(),
        artifacts.waypoints.len()
    );
    println!(
        "trajectory length {:.2} m, graph {} in {} iterations",
        artifacts.trajectory.length(),
        if artifacts.graph.converged {
            "converged"
        } else {
            "did not converge"
        },
        artifacts.graph.iterations
    );
    println!("outputs in {}", args.output.display());

    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
