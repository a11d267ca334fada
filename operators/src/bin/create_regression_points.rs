use std::io::{BufWriter, Write};

use clap::Parser;
use udo_operators::generate::CreateRegressionPoints;
use udo_runtime::{default_num_threads, EmptyTuple, Standalone};
use udo_storage::ParallelChunkedStorage;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Generate noisy samples of y = a + bx + cx^2 as CSV on stdout",
    long_about = None
)]
struct Args {
    /// The constant term a.
    #[clap(allow_negative_numbers = true)]
    a: f64,
    /// The linear coefficient b.
    #[clap(allow_negative_numbers = true)]
    b: f64,
    /// The quadratic coefficient c.
    #[clap(allow_negative_numbers = true)]
    c: f64,
    /// The number of samples to generate.
    num_points: u64,
}

fn main() -> color_eyre::Result<()> {
    let args = Args::parse();

    color_eyre::install()?;
    udo_logger::setup();

    let input: ParallelChunkedStorage<EmptyTuple> = ParallelChunkedStorage::new();
    let generator = CreateRegressionPoints::new(args.a, args.b, args.c, args.num_points);
    let output = Standalone::new(default_num_threads(), 10_000).run(&generator, &input);

    let stdout = std::io::stdout().lock();
    let mut writer = BufWriter::new(stdout);
    writeln!(writer, "x,y")?;
    for sample in output.iter() {
        writeln!(writer, "{},{}", sample.x, sample.y)?;
    }
    writer.flush()?;

    Ok(())
}
