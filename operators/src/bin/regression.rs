use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Parser;
use color_eyre::eyre::eyre;
use udo_operators::csv::load_csv;
use udo_operators::regression::{LinearRegression, SampleTuple};
use udo_runtime::{default_num_threads, Standalone};

#[derive(Parser, Debug)]
#[command(version, about = "Fit y = a + bx + cx^2 to a CSV of samples", long_about = None)]
struct Args {
    /// Input CSV with x and y columns and a header line.
    input: PathBuf,

    /// Print parse/execution timing samples instead of results.
    #[clap(long)]
    benchmark: bool,
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
    let input = load_csv::<SampleTuple>(&args.input, num_threads)?;
    log::info!(
        "parsed {} tuples in {} ms",
        input.len(),
        start.elapsed().as_millis()
    );

    let standalone = Standalone::new(num_threads, 10_000);
    let regression = LinearRegression::default();
    let output = standalone.run(&regression, &input);

    let params = output
        .iter()
        .next()
        .ok_or_else(|| eyre!("regression produced no output"))?;
    println!("a = {}", params.a);
    println!("b = {}", params.b);
    println!("c = {}", params.c);
    println!("-> y = {} + {}x + {}x^2", params.a, params.b, params.c);

    Ok(())
}

fn run_benchmark(input: &Path, num_threads: usize) -> color_eyre::Result<()> {
    // Parse once and discard the result so the operating system has a chance
    // to cache the input file before the measurements start.
    drop(load_csv::<SampleTuple>(input, num_threads)?);

    for _ in 0..3 {
        let start = Instant::now();
        let input = load_csv::<SampleTuple>(input, num_threads)?;
        println!("parse:{}", start.elapsed().as_nanos());

        for run in 0..6 {
            let standalone = Standalone::new(num_threads, 10_000);
            let regression = LinearRegression::default();

            let start = Instant::now();
            let output = standalone.run(&regression, &input);
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
