use std::{collections::BTreeMap, error::Error as _, mem, process, str::FromStr};

use argh::FromArgs;
use bedrock_memory::{
    Allocator, Blob, Config, DebugAllocator, FixedSizeObjectPool, HeapPageSource, MemoryError,
    Region, SlowGeneralPurpose, SmallShortLivedChunked,
    log::{self, LevelFormat, LogLevel, LogSink, Record},
};
use rand::{Rng as _, SeedableRng as _, rngs::StdRng};
use snafu::{OptionExt as _, ResultExt as _, Snafu, ensure};

const POOL_OBJECT_SIZE: usize = 256;

/// Drive a randomized allocate/free workload against one allocator.
#[derive(Debug, FromArgs)]
struct Args {
    /// allocator to exercise: pool, general, chunked or debug
    #[argh(option, default = "AllocatorKind::General")]
    allocator: AllocatorKind,
    /// number of allocate/free steps
    #[argh(option, default = "100_000")]
    iterations: u64,
    /// seed of the workload generator
    #[argh(option, default = "0x2545_f491_4f6c_dd1d")]
    seed: u64,
    /// largest request in bytes
    #[argh(option, default = "1024")]
    max_size: usize,
    /// arena size in bytes for the region-backed allocators
    #[argh(option, default = "4 * 1024 * 1024")]
    arena_size: usize,
    /// print every allocator event
    #[argh(switch, short = 'v')]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
enum AllocatorKind {
    #[display("pool")]
    Pool,
    #[display("general")]
    General,
    #[display("chunked")]
    Chunked,
    #[display("debug")]
    Debug,
}

impl FromStr for AllocatorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pool" => Ok(Self::Pool),
            "general" => Ok(Self::General),
            "chunked" => Ok(Self::Chunked),
            "debug" => Ok(Self::Debug),
            _ => Err(format!(
                "unknown allocator `{s}`, expected pool, general, chunked or debug"
            )),
        }
    }
}

#[derive(Debug, Snafu)]
enum StressError {
    #[snafu(display("failed to create the {kind} allocator"))]
    Create {
        kind: AllocatorKind,
        source: MemoryError,
    },
    #[snafu(display("allocations {first:?} and {second:?} overlap"))]
    Overlap { first: Blob, second: Blob },
    #[snafu(display("payload of {blob:?} changed while it was live"))]
    PayloadDamaged { blob: Blob },
    #[snafu(display("no payload available for live allocation {blob:?}"))]
    MissingPayload { blob: Blob },
    #[snafu(display("failed to free {blob:?}"))]
    Free { blob: Blob, source: MemoryError },
    #[snafu(display("integrity check failed"))]
    Integrity { source: MemoryError },
}

struct StdoutSink {
    verbose: bool,
}

impl LogSink for StdoutSink {
    fn enabled(&self, level: LogLevel) -> bool {
        self.verbose || level >= LogLevel::Info
    }

    fn write(&self, record: &Record<'_>) {
        println!(
            "[{}] {} ({}:{})",
            LevelFormat(record.level),
            record.message,
            record.location.file(),
            record.location.line()
        );
    }
}

fn main() {
    let args: Args = argh::from_env();
    log::set_sink(Box::leak(Box::new(StdoutSink {
        verbose: args.verbose,
    })));

    if let Err(err) = run(&args) {
        eprintln!("Error: {err}");
        let mut source = err.source();
        while let Some(cause) = source {
            eprintln!("Caused by: {cause}");
            source = cause.source();
        }
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), StressError> {
    let config = Config::reporting();
    let kind = args.allocator;
    match kind {
        AllocatorKind::Pool => {
            let mut arena = vec![0u8; args.arena_size];
            let mut pool = FixedSizeObjectPool::<POOL_OBJECT_SIZE>::with_config(
                Region::new(&mut arena),
                config,
            )
            .context(CreateSnafu { kind })?;
            Workload::new(args, args.max_size.min(POOL_OBJECT_SIZE), true)
                .run(&mut pool, |_| Ok(()))
        }
        AllocatorKind::General => {
            let mut arena = vec![0u8; args.arena_size];
            let mut heap =
                SlowGeneralPurpose::with_config("stress", Region::new(&mut arena), config)
                    .context(CreateSnafu { kind })?;
            Workload::new(args, args.max_size, true).run(&mut heap, |heap| {
                let report = heap.internal_sanity_check(args.verbose, args.verbose)?;
                println!(
                    "arena: {} free blocks ({} bytes, largest {}), {} allocated, {} wastage",
                    report.free_blocks,
                    report.free_bytes,
                    report.largest_free_bytes,
                    report.allocated_blocks,
                    report.wastage_blocks
                );
                Ok(())
            })
        }
        AllocatorKind::Chunked => {
            let mut chunks = SmallShortLivedChunked::with_config(HeapPageSource::new(), config);
            Workload::new(args, args.max_size, true).run(&mut chunks, |chunks| {
                println!("chunks held: {}", chunks.chunk_count());
                Ok(())
            })
        }
        AllocatorKind::Debug => {
            let mut debug = DebugAllocator::with_config(config);
            // Debug offsets are block slots, so byte ranges cannot be compared.
            Workload::new(args, args.max_size, false).run(&mut debug, |debug| {
                let live = debug.check_integrity()?;
                debug.print_block_list(args.verbose);
                println!("live blocks: {live}");
                Ok(())
            })
        }
    }
}

struct Workload {
    rng: StdRng,
    iterations: u64,
    max_size: usize,
    check_overlap: bool,
    live: Vec<(Blob, u8)>,
    spans: BTreeMap<usize, Blob>,
}

impl Workload {
    fn new(args: &Args, max_size: usize, check_overlap: bool) -> Self {
        Self {
            rng: StdRng::seed_from_u64(args.seed),
            iterations: args.iterations,
            max_size: max_size.max(1),
            check_overlap,
            live: Vec::new(),
            spans: BTreeMap::new(),
        }
    }

    fn run<A, F>(mut self, alloc: &mut A, check: F) -> Result<(), StressError>
    where
        A: Allocator,
        F: Fn(&A) -> Result<(), MemoryError>,
    {
        for _ in 0..self.iterations {
            if self.live.is_empty() || self.rng.gen_bool(0.6) {
                let size = self.rng.gen_range(1..=self.max_size);
                let Some(blob) = alloc.allocate(size) else {
                    continue;
                };
                self.claim(blob)?;
                let tag = self.rng.gen_range(0..=u8::MAX);
                alloc
                    .bytes_mut(blob)
                    .context(MissingPayloadSnafu { blob })?
                    .fill(tag);
                self.live.push((blob, tag));
            } else {
                let index = self.rng.gen_range(0..self.live.len());
                let (blob, tag) = self.live.swap_remove(index);
                self.release(alloc, blob, tag)?;
            }
        }

        check(alloc).context(IntegritySnafu)?;
        for (blob, tag) in mem::take(&mut self.live) {
            self.release(alloc, blob, tag)?;
        }
        check(alloc).context(IntegritySnafu)?;

        let stats = alloc.stats();
        println!(
            "{}: {} allocations, {} failed, peak {} bytes, {} still live",
            alloc.name(),
            stats.total_allocations,
            stats.failed_allocations,
            stats.peak_allocated_bytes,
            stats.live_allocations
        );
        Ok(())
    }

    fn claim(&mut self, blob: Blob) -> Result<(), StressError> {
        if !self.check_overlap || blob.is_empty() {
            return Ok(());
        }
        let start = blob.offset.get();
        if let Some((_, &prev)) = self.spans.range(..=start).next_back() {
            ensure!(
                !prev.overlaps(&blob),
                OverlapSnafu {
                    first: prev,
                    second: blob
                }
            );
        }
        if let Some((_, &next)) = self.spans.range(start..).next() {
            ensure!(
                !next.overlaps(&blob),
                OverlapSnafu {
                    first: blob,
                    second: next
                }
            );
        }
        self.spans.insert(start, blob);
        Ok(())
    }

    fn release<A: Allocator>(&mut self, alloc: &mut A, blob: Blob, tag: u8) -> Result<(), StressError> {
        let intact = alloc
            .bytes(blob)
            .context(MissingPayloadSnafu { blob })?
            .iter()
            .all(|&b| b == tag);
        ensure!(intact, PayloadDamagedSnafu { blob });
        if self.check_overlap {
            self.spans.remove(&blob.offset.get());
        }
        alloc.deallocate(blob).context(FreeSnafu { blob })
    }
}
