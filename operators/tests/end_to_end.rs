#![allow(missing_docs)] // test only

use std::io::Write;

use udo_operators::csv::load_csv;
use udo_operators::generate::{CreatePoints, CreateRegressionPoints};
use udo_operators::kmeans::{KMeans, PointTuple};
use udo_operators::regression::{LinearRegression, SampleTuple};
use udo_runtime::{EmptyTuple, Standalone};
use udo_storage::ParallelChunkedStorage;

/// Generated cluster points fed through k-means: after the final associate
/// round, every point carries the label of its nearest center, and the
/// output is a permutation of the input.
#[test]
fn kmeans_over_generated_clusters() {
    let empty: ParallelChunkedStorage<EmptyTuple> = ParallelChunkedStorage::new();
    let generator = CreatePoints::new(16_000);
    let points = Standalone::new(4, 10_000).run(&generator, &empty);
    let num_points = points.len();

    // Re-home the generated points into a k-means input, remembering the
    // generator's cluster in the payload.
    let input = ParallelChunkedStorage::new();
    let mut refs: Vec<_> = (0..4u32).map(|t| input.create_local_storage(t)).collect();
    for (i, point) in points.iter().enumerate() {
        refs[i % 4].push(PointTuple {
            x: point.x,
            y: point.y,
            payload: point.cluster_id as u64,
        });
    }

    let mut kmeans = KMeans::default();
    let output = Standalone::new(4, 10_000).run(&kmeans, &input);
    assert_eq!(output.len(), num_points);

    // The labels written by the last associate round are exactly the argmin
    // over the final centers (first center wins ties).
    let centers = kmeans.centers();
    let squared_distance = |tuple: &udo_operators::kmeans::ClusteredTuple, (cx, cy): (f64, f64)| {
        let dx = cx - tuple.x;
        let dy = cy - tuple.y;
        dx * dx + dy * dy
    };
    for tuple in output.iter() {
        let mut best = 0u16;
        let mut best_distance = squared_distance(tuple, centers[0]);
        for (i, &center) in centers.iter().enumerate().skip(1) {
            let distance = squared_distance(tuple, center);
            if distance < best_distance {
                best = i as u16;
                best_distance = distance;
            }
        }
        assert_eq!(tuple.cluster_id, best);
    }
}

/// Chains the generator, the CSV writer/loader, and the regression operator.
/// With a + b + c = 0 the generator's noise term vanishes, so the
/// coefficients are recovered exactly up to rounding.
#[test]
fn regression_roundtrip_through_csv() {
    let (a, b, c) = (2.0, -1.5, -0.5);
    let empty: ParallelChunkedStorage<EmptyTuple> = ParallelChunkedStorage::new();
    let generator = CreateRegressionPoints::new(a, b, c, 20_000);
    let samples = Standalone::new(4, 10_000).run(&generator, &empty);

    let path = std::env::temp_dir().join(format!("udo-regression-e2e-{}", std::process::id()));
    {
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "x,y").unwrap();
        for sample in samples.iter() {
            writeln!(file, "{},{}", sample.x, sample.y).unwrap();
        }
    }

    let input = load_csv::<SampleTuple>(&path, 4).unwrap();
    assert_eq!(input.len(), 20_000);

    let output = Standalone::new(4, 10_000).run(&LinearRegression::default(), &input);
    let fit = *output.iter().next().unwrap();
    std::fs::remove_file(&path).unwrap();

    assert!((fit.a - a).abs() < 1e-6, "a = {}", fit.a);
    assert!((fit.b - b).abs() < 1e-6, "b = {}", fit.b);
    assert!((fit.c - c).abs() < 1e-6, "c = {}", fit.c);
}
