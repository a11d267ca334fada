use std::io::{BufWriter, Write};

use clap::Parser;
use udo_operators::generate::CreatePoints;
use udo_runtime::{default_num_threads, EmptyTuple, Standalone};
use udo_storage::ParallelChunkedStorage;

#[derive(Parser, Debug)]
#[command(version, about = "Generate clustered 2D points as CSV on stdout", long_about = None)]
struct Args {
    /// The approximate number of points to generate.
    num_points: u64,
}

fn main() -> color_eyre::Result<()> {
    let args = Args::parse();

    color_eyre::install()?;
    udo_logger::setup();

    let input: ParallelChunkedStorage<EmptyTuple> = ParallelChunkedStorage::new();
    let generator = CreatePoints::new(args.num_points);
    let output = Standalone::new(default_num_threads(), 10_000).run(&generator, &input);

    let stdout = std::io::stdout().lock();
    let mut writer = BufWriter::new(stdout);
    writeln!(writer, "x,y,clusterId")?;
    for point in output.iter() {
        writeln!(writer, "{},{},{}", point.x, point.y, point.cluster_id)?;
    }
    writer.flush()?;

    Ok(())
}
