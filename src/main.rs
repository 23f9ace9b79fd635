use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use flate2::read::MultiGzDecoder;
use rayon::prelude::*;

use panmap::cache::CacheSet;
use panmap::index::fm::SuffixIndex;
use panmap::index::graph::GraphIndex;
use panmap::index::paths::PathPositions;
use panmap::mapper::{Mapper, MapperOpts, MappingQualityMethod};
use panmap::model::{aligned_interval, Alignment};
use panmap::paired::PairedAlignments;

#[derive(Parser)]
#[command(name = "panmap")]
#[command(about = "panmap - map reads to a bidirected sequence graph", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Align reads against a graph
    Map {
        /// Graph in GFA format (S/L/P lines; optionally gzipped)
        #[arg(short = 'g', long, value_name = "GRAPH.GFA")]
        graph: PathBuf,

        /// Input FASTQ file(s) - one for single-end, two for paired-end
        #[arg(value_name = "READS.FQ", required = true)]
        reads: Vec<PathBuf>,

        /// Output file (default: stdout)
        #[arg(short = 'o', long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Number of worker threads
        #[arg(short = 't', long, default_value = "1")]
        threads: usize,

        /// Report up to this many mappings per read
        #[arg(short = 'M', long, default_value = "1")]
        max_multimaps: usize,

        /// Minimum MEM length
        #[arg(short = 'k', long, default_value = "1")]
        min_mem_length: usize,

        /// Reseed MEMs longer than this; 0 disables
        #[arg(short = 'r', long, default_value = "0")]
        reseed_length: usize,

        /// Skip MEMs with more than this many hits
        #[arg(short = 'c', long, default_value = "100")]
        hit_max: usize,

        /// Band width above which reads are split-aligned
        #[arg(short = 'w', long, default_value = "1000")]
        band_width: usize,

        /// Match score
        #[arg(long, default_value = "1")]
        match_score: i32,

        /// Mismatch penalty
        #[arg(long, default_value = "4")]
        mismatch: i32,

        /// Gap open penalty
        #[arg(long, default_value = "6")]
        gap_open: i32,

        /// Gap extension penalty
        #[arg(long, default_value = "1")]
        gap_extend: i32,

        /// Bonus for each un-clipped read end
        #[arg(long, default_value = "5")]
        full_length_bonus: i32,

        /// Adjust match scores by base quality
        #[arg(long)]
        qual_adjust: bool,

        /// Maximum fragment size before the length model is learned
        #[arg(long, default_value = "10000")]
        fragment_max: i64,

        /// Disable MEM chaining and use the legacy id clusterer
        #[arg(long)]
        no_chaining: bool,

        /// Pair mates with the combined product instead of the
        /// simultaneous chain model
        #[arg(long)]
        crossed_pairing: bool,

        /// Mapping quality method: approx, exact, or none
        #[arg(long, default_value = "approx")]
        mapq_method: String,
    },
}

fn main() {
    env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .init();
    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Map {
            graph,
            reads,
            output,
            threads,
            max_multimaps,
            min_mem_length,
            reseed_length,
            hit_max,
            band_width,
            match_score,
            mismatch,
            gap_open,
            gap_extend,
            full_length_bonus,
            qual_adjust,
            fragment_max,
            no_chaining,
            crossed_pairing,
            mapq_method,
        } => {
            let opts = MapperOpts {
                max_multimaps,
                min_mem_length,
                mem_reseed_length: reseed_length,
                hit_max,
                band_width,
                alignment_match: match_score,
                alignment_mismatch: mismatch,
                alignment_gap_open: gap_open,
                alignment_gap_extension: gap_extend,
                full_length_alignment_bonus: full_length_bonus,
                adjust_alignments_for_base_quality: qual_adjust,
                fragment_max,
                mem_chaining: !no_chaining,
                simultaneous_pair_alignment: !crossed_pairing,
                alignment_threads: threads,
                mapping_quality_method: match mapq_method.as_str() {
                    "exact" => MappingQualityMethod::Exact,
                    "none" => MappingQualityMethod::None,
                    _ => MappingQualityMethod::Approx,
                },
                ..Default::default()
            };
            match run_map(&graph, &reads, output.as_deref(), threads, opts) {
                Ok(()) => 0,
                Err(err) => {
                    eprintln!("error: {}", err);
                    1
                }
            }
        }
    };
    std::process::exit(code);
}

fn run_map(
    graph_path: &std::path::Path,
    read_paths: &[PathBuf],
    output: Option<&std::path::Path>,
    threads: usize,
    opts: MapperOpts,
) -> Result<(), String> {
    if read_paths.len() > 2 {
        return Err("at most two read files (paired-end) are supported".to_string());
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build_global()
        .map_err(|e| format!("failed to start worker pool: {}", e))?;

    log::info!("loading graph from {}", graph_path.display());
    let graph = Arc::new(GraphIndex::from_gfa_path(graph_path)?);
    log::info!("indexing {} nodes / {} bp", graph.node_count(), graph.total_length());
    let suffix = Arc::new(SuffixIndex::build(&graph));
    let paths = Arc::new(PathPositions::build(&graph));
    let mut mapper = Mapper::new(graph, suffix, paths, opts.clone())?;

    // a dedicated writer thread keeps alignment workers off the output lock
    let (sender, receiver) = crossbeam_channel::unbounded::<String>();
    let sink: Box<dyn Write + Send> = match output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).map_err(|e| format!("failed to create {}: {}", path.display(), e))?,
        )),
        None => Box::new(BufWriter::new(io::stdout())),
    };
    let writer = std::thread::spawn(move || -> io::Result<()> {
        let mut sink = sink;
        for line in receiver {
            sink.write_all(line.as_bytes())?;
        }
        sink.flush()
    });

    const BATCH: usize = 512;
    let mut total = 0usize;
    if read_paths.len() == 1 {
        let mut records = fastq_records(&read_paths[0])?;
        loop {
            let batch = read_batch(&mut records, BATCH)?;
            if batch.is_empty() {
                break;
            }
            total += batch.len();
            let lines: Vec<String> = batch
                .par_iter()
                .map_init(
                    || CacheSet::new(opts.cache_size),
                    |cache, read| {
                        let alns = mapper.align_multi(read, 0, 0, 0, 0, cache);
                        alns.iter().map(|a| gaf_line(a)).collect::<String>()
                    },
                )
                .collect();
            for line in lines {
                sender.send(line).map_err(|e| format!("writer thread died: {}", e))?;
            }
        }
    } else {
        let mut records1 = fastq_records(&read_paths[0])?;
        let mut records2 = fastq_records(&read_paths[1])?;
        loop {
            let batch1 = read_batch(&mut records1, BATCH)?;
            let batch2 = read_batch(&mut records2, BATCH)?;
            if batch1.is_empty() && batch2.is_empty() {
                break;
            }
            if batch1.len() != batch2.len() {
                return Err("paired read files have different lengths".to_string());
            }
            total += batch1.len() * 2;
            // map the batch against a frozen fragment model, then apply the
            // model updates sequentially between batches
            let mapped: Vec<_> = batch1
                .par_iter()
                .zip(batch2.par_iter())
                .map_init(
                    || CacheSet::new(opts.cache_size),
                    |cache, (read1, read2)| {
                        (
                            read1.clone(),
                            read2.clone(),
                            mapper.align_paired_with_model(read1, read2, false, false, cache),
                        )
                    },
                )
                .collect();
            for (read1, read2, (result, samples)) in mapped {
                for sample in samples {
                    mapper.fragment_model_mut().record(
                        sample.length,
                        sample.aln1_is_rev,
                        sample.aln2_is_rev,
                    );
                }
                if result.queued_for_later {
                    mapper.queue_pair_for_retry(read1, read2);
                } else {
                    send_pair(&sender, &result)?;
                }
            }
            if mapper.fragment_model().is_learned() && mapper.retry_queue_len() > 0 {
                let mut cache = CacheSet::new(opts.cache_size);
                for result in mapper.drain_pair_retry_queue(&mut cache) {
                    send_pair(&sender, &result)?;
                }
            }
        }
        // whatever is still deferred goes out as-is
        let mut cache = CacheSet::new(opts.cache_size);
        for result in mapper.drain_pair_retry_queue(&mut cache) {
            send_pair(&sender, &result)?;
        }
    }
    drop(sender);
    writer
        .join()
        .map_err(|_| "writer thread panicked".to_string())?
        .map_err(|e| format!("write failed: {}", e))?;
    log::info!("mapped {} reads", total);
    Ok(())
}

fn send_pair(
    sender: &crossbeam_channel::Sender<String>,
    result: &PairedAlignments,
) -> Result<(), String> {
    let mut out = String::new();
    for aln in result.first.iter().chain(result.second.iter()) {
        out.push_str(&gaf_line(aln));
    }
    sender.send(out).map_err(|e| format!("writer thread died: {}", e))
}

type FastqRecords = bio::io::fastq::Records<BufReader<Box<dyn BufRead>>>;

fn fastq_records(path: &std::path::Path) -> Result<FastqRecords, String> {
    let mut file = File::open(path).map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
    let mut magic = [0u8; 2];
    let n = io::Read::read(&mut file, &mut magic)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let file = File::open(path).map_err(|e| format!("failed to reopen {}: {}", path.display(), e))?;
    let inner: Box<dyn BufRead> = if n == 2 && magic == [0x1f, 0x8b] {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(bio::io::fastq::Reader::new(inner).records())
}

// read up to `limit` FASTQ records into query alignments
fn read_batch(records: &mut FastqRecords, limit: usize) -> Result<Vec<Alignment>, String> {
    let mut out = Vec::with_capacity(limit);
    while out.len() < limit {
        match records.next() {
            Some(Ok(record)) => {
                let mut aln = Alignment::from_sequence(
                    record.id(),
                    std::str::from_utf8(record.seq()).unwrap_or(""),
                );
                aln.quality = record.qual().iter().map(|&q| q.saturating_sub(33)).collect();
                out.push(aln);
            }
            Some(Err(err)) => return Err(format!("bad FASTQ record: {}", err)),
            None => break,
        }
    }
    Ok(out)
}

// one GAF-style line per alignment
fn gaf_line(aln: &Alignment) -> String {
    let qlen = aln.sequence.len();
    if !aln.is_mapped() {
        return format!("{}\t{}\t0\t0\t+\t*\t0\t0\t0\t0\t0\t0\tAS:i:0\n", aln.name, qlen);
    }
    let (qstart, qend) = aligned_interval(aln);
    let mut path = String::new();
    let mut path_len = 0usize;
    for mapping in &aln.path.mappings {
        path.push(if mapping.position.is_reverse { '<' } else { '>' });
        path.push_str(&mapping.position.node.to_string());
        path_len += mapping.from_len();
    }
    let matches: usize = aln
        .path
        .mappings
        .iter()
        .flat_map(|m| m.edits.iter())
        .filter(|e| e.is_match())
        .map(|e| e.to_len)
        .sum();
    let block: usize = aln.path.to_len();
    format!(
        "{}\t{}\t{}\t{}\t+\t{}\t{}\t{}\t{}\t{}\t{}\t{}\tAS:i:{}\tid:f:{:.4}\n",
        aln.name,
        qlen,
        qstart,
        qend,
        path,
        path_len,
        aln.path.mappings.first().map(|m| m.position.offset).unwrap_or(0),
        path_len,
        matches,
        block,
        aln.mapping_quality.clamp(0, 255),
        aln.score,
        aln.identity,
    )
}
