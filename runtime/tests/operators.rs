#![allow(missing_docs)] // test only

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use udo_runtime::{ExecutionState, Operator, Standalone, TupleStr, EXTRA_WORK_DONE};
use udo_storage::ParallelChunkedStorage;

/// Distributes tuples round-robin over `num_workers` local storages.
fn build_input<T>(tuples: Vec<T>, num_workers: u32) -> ParallelChunkedStorage<T> {
    let storage = ParallelChunkedStorage::new();
    let mut refs: Vec<_> = (0..num_workers)
        .map(|t| storage.create_local_storage(t))
        .collect();
    for (i, tuple) in tuples.into_iter().enumerate() {
        refs[i % num_workers as usize].push(tuple);
    }
    storage
}

// --- S1: identity ---

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct IdTuple {
    a: u64,
}

struct Identity;

impl Operator for Identity {
    type Input = IdTuple;
    type Output = IdTuple;

    fn accept(&self, exec: &mut ExecutionState<IdTuple>, input: &IdTuple) {
        exec.emit(*input);
    }
}

#[test]
fn identity_returns_a_permutation() {
    let input = build_input(
        vec![IdTuple { a: 1 }, IdTuple { a: 2 }, IdTuple { a: 3 }, IdTuple { a: 4 }],
        4,
    );
    let output = Standalone::new(4, 1000).run(&Identity, &input);
    let mut values: Vec<IdTuple> = output.iter().copied().collect();
    values.sort();
    assert_eq!(
        values,
        vec![IdTuple { a: 1 }, IdTuple { a: 2 }, IdTuple { a: 3 }, IdTuple { a: 4 }]
    );
}

// --- S2: case-insensitive substring search ---

#[derive(Clone, Copy)]
struct WordTuple {
    word: TupleStr,
}

/// Emits every tuple whose word contains "database" case-insensitively.
///
/// Uses a KMP-style scan; no prefix table is needed because no proper prefix
/// of "database" is also a suffix of one of its prefixes.
struct ContainsDatabase;

const PATTERN_LOWER: &[u8] = b"database";
const PATTERN_UPPER: &[u8] = b"DATABASE";

impl Operator for ContainsDatabase {
    type Input = WordTuple;
    type Output = WordTuple;

    fn accept(&self, exec: &mut ExecutionState<WordTuple>, input: &WordTuple) {
        let word = input.word.as_bytes();
        let mut current = 0;
        let mut pattern = 0;
        while current < word.len() {
            if word[current] == PATTERN_LOWER[pattern] || word[current] == PATTERN_UPPER[pattern] {
                current += 1;
                pattern += 1;
                if pattern == PATTERN_LOWER.len() {
                    exec.emit(*input);
                    break;
                }
            } else {
                if pattern == 0 {
                    current += 1;
                }
                pattern = 0;
            }
        }
    }
}

#[test]
fn contains_database_matches_case_insensitively() {
    let words = ["hello", "DataBase rocks", "no match", "underDATABASEscore"];
    let input = build_input(
        words
            .iter()
            .map(|&w| WordTuple {
                word: TupleStr::new(w),
            })
            .collect(),
        4,
    );
    let output = Standalone::new(4, 1000).run(&ContainsDatabase, &input);
    let mut matched: Vec<String> = output
        .iter()
        .map(|t| String::from_utf8_lossy(t.word.as_bytes()).into_owned())
        .collect();
    matched.sort();
    assert_eq!(matched, ["DataBase rocks", "underDATABASEscore"]);
}

// --- S3: counting with a single elected emitter ---

#[derive(Clone, Copy)]
struct WordCountTuple {
    word: TupleStr,
    word_count: u64,
}

#[derive(Default)]
struct CountLifestyle {
    lifestyle: AtomicU64,
    other: AtomicU64,
    output_taken: AtomicBool,
}

impl Operator for CountLifestyle {
    type Input = WordTuple;
    type Output = WordCountTuple;

    fn accept(&self, _exec: &mut ExecutionState<WordCountTuple>, input: &WordTuple) {
        if input.word == "lifestyle" {
            self.lifestyle.fetch_add(1, Ordering::Relaxed);
        } else {
            self.other.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn process(&self, exec: &mut ExecutionState<WordCountTuple>) -> bool {
        if self.output_taken.swap(true, Ordering::Relaxed) {
            return true;
        }
        exec.emit(WordCountTuple {
            word: TupleStr::new("lifestyle"),
            word_count: self.lifestyle.load(Ordering::Relaxed),
        });
        exec.emit(WordCountTuple {
            word: TupleStr::new("other"),
            word_count: self.other.load(Ordering::Relaxed),
        });
        true
    }
}

#[test]
fn count_lifestyle_emits_exactly_two_totals() {
    let words = ["lifestyle", "x", "lifestyle", "y", "lifestyle"];
    let input = build_input(
        words
            .iter()
            .map(|&w| WordTuple {
                word: TupleStr::new(w),
            })
            .collect(),
        3,
    );
    let output = Standalone::new(3, 1000).run(&CountLifestyle::default(), &input);
    let mut counts: Vec<(String, u64)> = output
        .iter()
        .map(|t| {
            (
                String::from_utf8_lossy(t.word.as_bytes()).into_owned(),
                t.word_count,
            )
        })
        .collect();
    counts.sort();
    assert_eq!(
        counts,
        [("lifestyle".to_string(), 3), ("other".to_string(), 2)]
    );
}

// --- S4: splitting array fields ---

#[derive(Clone, Copy)]
struct ArrayTuple {
    name: TupleStr,
    values: TupleStr,
}

#[derive(Clone, Copy)]
struct ElementTuple {
    name: TupleStr,
    value: i64,
}

/// Splits a comma-separated value list into one output tuple per element.
/// Empty and non-numeric fields are dropped.
struct SplitArrays;

impl Operator for SplitArrays {
    type Input = ArrayTuple;
    type Output = ElementTuple;

    fn accept(&self, exec: &mut ExecutionState<ElementTuple>, input: &ArrayTuple) {
        let values = input.values.as_bytes();
        for field in values.split(|&b| b == b',') {
            let Ok(text) = std::str::from_utf8(field) else {
                continue;
            };
            if let Ok(value) = text.parse::<i64>() {
                exec.emit(ElementTuple {
                    name: input.name,
                    value,
                });
            }
        }
    }
}

#[test]
fn split_arrays_drops_empty_and_invalid_fields() {
    let input = build_input(
        vec![ArrayTuple {
            name: TupleStr::new("k"),
            values: TupleStr::new("1,2,,abc,3"),
        }],
        2,
    );
    let output = Standalone::new(2, 1000).run(&SplitArrays, &input);
    let mut values: Vec<(String, i64)> = output
        .iter()
        .map(|t| {
            (
                String::from_utf8_lossy(t.name.as_bytes()).into_owned(),
                t.value,
            )
        })
        .collect();
    values.sort();
    assert_eq!(
        values,
        [
            ("k".to_string(), 1),
            ("k".to_string(), 2),
            ("k".to_string(), 3)
        ]
    );
}

// --- Phase ordering and sub-step sequencing ---

const NUM_CHECKER_THREADS: usize = 8;

/// Walks three ExtraWork sub-steps and checks, at every entry, that the
/// previous phase or sub-step has fully completed on all workers.
#[derive(Default)]
struct PhaseChecker {
    accepts_active: AtomicUsize,
    accepts_total: AtomicUsize,
    step_calls: [AtomicUsize; 3],
    process_calls: AtomicUsize,
}

impl Operator for PhaseChecker {
    type Input = IdTuple;
    type Output = IdTuple;

    const HAS_EXTRA_WORK: bool = true;

    fn accept(&self, exec: &mut ExecutionState<IdTuple>, _input: &IdTuple) {
        self.accepts_active.fetch_add(1, Ordering::SeqCst);
        // Dirty the local state slot; the coordinator must zero it before
        // the next phase.
        exec.local_state().bytes_mut().fill(0xff);
        std::thread::yield_now();
        self.accepts_total.fetch_add(1, Ordering::SeqCst);
        self.accepts_active.fetch_sub(1, Ordering::SeqCst);
    }

    fn extra_work(&self, exec: &mut ExecutionState<IdTuple>, step: u32) -> u32 {
        assert_eq!(self.accepts_active.load(Ordering::SeqCst), 0);
        assert!(
            exec.local_state().bytes().iter().all(|&b| b == 0),
            "local state not zeroed at sub-step entry"
        );
        exec.local_state().bytes_mut().fill(0xff);

        let step = step as usize;
        assert!(step < 3);
        // All workers must have finished every earlier sub-step.
        for earlier in 0..step {
            assert_eq!(
                self.step_calls[earlier].load(Ordering::SeqCst),
                NUM_CHECKER_THREADS
            );
        }
        assert!(self.step_calls[step].load(Ordering::SeqCst) < NUM_CHECKER_THREADS);
        self.step_calls[step].fetch_add(1, Ordering::SeqCst);

        if step == 2 {
            EXTRA_WORK_DONE
        } else {
            (step + 1) as u32
        }
    }

    fn process(&self, exec: &mut ExecutionState<IdTuple>) -> bool {
        for step in 0..3 {
            assert_eq!(
                self.step_calls[step].load(Ordering::SeqCst),
                NUM_CHECKER_THREADS
            );
        }
        assert!(exec.local_state().bytes().iter().all(|&b| b == 0));
        self.process_calls.fetch_add(1, Ordering::SeqCst);
        true
    }
}

#[test]
fn phases_are_barrier_ordered() {
    for round in 0..20u64 {
        let tuples = (0..256u64).map(|i| IdTuple { a: round * 1000 + i }).collect();
        let input = build_input(tuples, NUM_CHECKER_THREADS as u32);
        let checker = PhaseChecker::default();
        let output = Standalone::new(NUM_CHECKER_THREADS, 1000).run(&checker, &input);
        assert!(output.is_empty());
        assert_eq!(checker.accepts_total.load(Ordering::SeqCst), 256);
        assert_eq!(
            checker.process_calls.load(Ordering::SeqCst),
            NUM_CHECKER_THREADS
        );
    }
}

// --- Output merging ---

/// Every worker emits an increasing sequence tagged with its thread id.
struct TaggedEmitter;

impl Operator for TaggedEmitter {
    type Input = IdTuple;
    type Output = (u32, u64);

    fn process(&self, exec: &mut ExecutionState<(u32, u64)>) -> bool {
        let thread_id = exec.thread_id();
        for seq in 0..100u64 {
            exec.emit((thread_id, seq));
        }
        true
    }
}

/// The merged result is the multiset union of the per-worker outputs, and
/// each worker's emit order survives the merge.
#[test]
fn output_merge_preserves_per_worker_order() {
    let input = build_input(Vec::<IdTuple>::new(), 1);
    let output = Standalone::new(4, 1000).run(&TaggedEmitter, &input);
    assert_eq!(output.len(), 400);

    let mut last_seq: HashMap<u32, u64> = HashMap::new();
    let mut per_thread: HashMap<u32, u64> = HashMap::new();
    for &(thread_id, seq) in output.iter() {
        if let Some(&last) = last_seq.get(&thread_id) {
            assert!(seq > last, "emit order lost for thread {thread_id}");
        }
        last_seq.insert(thread_id, seq);
        *per_thread.entry(thread_id).or_default() += 1;
    }
    assert_eq!(per_thread.len(), 4);
    assert!(per_thread.values().all(|&count| count == 100));
}

/// Zero worker threads are promoted to one.
#[test]
fn zero_threads_still_runs() {
    let input = build_input(vec![IdTuple { a: 9 }], 1);
    let output = Standalone::new(0, 1000).run(&Identity, &input);
    assert_eq!(output.iter().count(), 1);
}
