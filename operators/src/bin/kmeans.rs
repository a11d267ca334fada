use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Parser;
use udo_operators::csv::load_csv;
use udo_operators::kmeans::{KMeans, PointTuple};
use udo_runtime::{default_num_threads, Standalone};

#[derive(Parser, Debug)]
#[command(version, about = "Cluster a CSV of 2D points with the k-means operator", long_about = None)]
struct Args {
    /// Input CSV with x, y, and payload columns and a header line.
    input: PathBuf,

    /// Print parse/execution timing samples instead of results.
    #[clap(long)]
    benchmark: bool,

    /// Print every labeled tuple instead of the per-cluster counts.
    #[clap(long)]
    full_output: bool,
}

fn main() -> color_eyre::Result<()> {
    let args = Args::parse();

    color_eyre::install()?;
    udo_logger::setup();

    let num_threads = default_num_threads();

    if args.benchmark {
        return run_benchmark(&args.input, num_threads);
    }

    let start = Instant::now();
    let input = load_csv::<PointTuple>(&args.input, num_threads)?;
    log::info!(
        "parsed {} tuples in {} ms",
        input.len(),
        start.elapsed().as_millis()
    );

    let standalone = Standalone::new(num_threads, 10_000);
    let kmeans = KMeans::default();
    let output = standalone.run(&kmeans, &input);

    if args.full_output {
        for tuple in output.iter() {
            println!(
                "{},{},{},{}",
                tuple.x, tuple.y, tuple.payload, tuple.cluster_id
            );
        }
    } else {
        let mut cluster_counts = vec![0usize; kmeans.num_clusters()];
        for tuple in output.iter() {
            cluster_counts[tuple.cluster_id as usize] += 1;
        }
        for (cluster_id, count) in cluster_counts.iter().enumerate() {
            println!("{cluster_id}: {count}");
        }
    }

    Ok(())
}

fn run_benchmark(input: &Path, num_threads: usize) -> color_eyre::Result<()> {
    // Parse once and discard the result so the operating system has a chance
    // to cache the input file before the measurements start.
    drop(load_csv::<PointTuple>(input, num_threads)?);

    for _ in 0..3 {
        let start = Instant::now();
        let input = load_csv::<PointTuple>(input, num_threads)?;
        println!("parse:{}", start.elapsed().as_nanos());

        for run in 0..6 {
            let standalone = Standalone::new(num_threads, 10_000);
            let kmeans = KMeans::default();

            let start = Instant::now();
            let output = standalone.run(&kmeans, &input);
            let duration = start.elapsed();
            drop(output);
            // Don't measure the first run.
            if run > 0 {
                println!("exec:{}", duration.as_nanos());
            }
        }
    }

    Ok(())
}
