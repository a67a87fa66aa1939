//! One-shot heap snapshot analyses with NDJSON output.
//!
//! # Usage
//!
//! ```bash
//! heapsnap summary Heap.heapsnapshot --top 20
//! heapsnap diff before.heapsnapshot after.heapsnapshot.gz -o diff.ndjson
//! heapsnap search Heap.heapsnapshot 'Detached' --case-sensitive
//! heapsnap allocations Heap.heapsnapshot.zst
//! ```
//!
//! Every run writes a `header` record followed by typed records, one JSON
//! object per line. Logs go to stderr; set `RUST_LOG` to adjust them.

use clap::{Parser, Subcommand};
use heapsnap::{
    GenericPolicy, HeapSnapshot, JsHeapPolicy, Loader, NodeFilter, PolicyConfig, SearchConfig,
    SnapshotPolicy,
};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "heapsnap")]
#[command(about = "Analyze heap snapshots: retained sizes, diffs, search and allocation traces")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Output file (defaults to stdout)
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// JSON file configuring the JS heap policy
    #[arg(long, global = true)]
    policy: Option<PathBuf>,

    /// Treat the snapshot as a plain object graph
    #[arg(long, global = true, conflicts_with = "policy")]
    generic: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Statistics and the classes retaining the most memory
    Summary {
        snapshot: PathBuf,

        /// Number of classes to list
        #[arg(short = 'n', long, default_value = "25")]
        top: usize,
    },
    /// Classes that grew between two snapshots of the same heap
    Diff {
        /// Baseline heap snapshot
        baseline: PathBuf,

        /// Target heap snapshot
        target: PathBuf,

        /// Maximum number of added objects to report retention paths for
        #[arg(short = 'n', long, default_value = "100")]
        max_retained: usize,
    },
    /// Objects whose name matches a query
    Search {
        snapshot: PathBuf,

        query: String,

        /// Treat the query as a regular expression
        #[arg(long)]
        regex: bool,

        #[arg(long)]
        case_sensitive: bool,

        /// Only objects with an id above this one
        #[arg(long)]
        min_id: Option<u32>,

        /// Only objects with an id up to this one
        #[arg(long)]
        max_id: Option<u32>,
    },
    /// Functions that allocated the objects still alive
    Allocations { snapshot: PathBuf },
}

fn policy(args: &Args) -> Result<Box<dyn SnapshotPolicy>, Box<dyn std::error::Error>> {
    if args.generic {
        return Ok(Box::new(GenericPolicy));
    }
    let config = match &args.policy {
        Some(path) => PolicyConfig::from_path(path)?,
        None => PolicyConfig::default(),
    };
    Ok(Box::new(JsHeapPolicy::new(config)))
}

fn open(path: &Path) -> Result<Box<dyn Read>, Box<dyn std::error::Error>> {
    let file = BufReader::new(File::open(path)?);
    Ok(match path.extension().and_then(|e| e.to_str()) {
        Some("gz") => Box::new(flate2::read::GzDecoder::new(file)),
        Some("zst") => Box::new(zstd::stream::read::Decoder::new(file)?),
        _ => Box::new(file),
    })
}

fn load(path: &Path, args: &Args) -> Result<HeapSnapshot, Box<dyn std::error::Error>> {
    info!("loading {}", path.display());
    let raw = Loader::load(open(path)?)?;
    let snapshot = HeapSnapshot::new(raw, policy(args)?)?;
    for report in snapshot.problem_reports() {
        tracing::warn!("{}", report);
    }
    info!(
        "  {} nodes, {} edges",
        snapshot.node_count(),
        snapshot.graph().edge_count()
    );
    Ok(snapshot)
}

fn emit<W: Write + ?Sized>(
    writer: &mut W,
    record: &serde_json::Value,
) -> Result<(), Box<dyn std::error::Error>> {
    writeln!(writer, "{}", serde_json::to_string(record)?)?;
    Ok(())
}

fn header(format: &str, inputs: &[&Path]) -> serde_json::Value {
    let inputs: Vec<String> = inputs.iter().map(|p| p.display().to_string()).collect();
    serde_json::json!({
        "type": "header",
        "format": format,
        "version": env!("CARGO_PKG_VERSION"),
        "inputs": inputs,
    })
}

fn summary(
    out: &mut dyn Write,
    args: &Args,
    path: &Path,
    top: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = load(path, args)?;
    emit(out, &header("heap-summary", &[path]))?;

    let stats = snapshot.statistics();
    emit(
        out,
        &serde_json::json!({
            "type": "statistics",
            "nodes": snapshot.node_count(),
            "edges": snapshot.graph().edge_count(),
            "total": stats.total,
            "v8heap": stats.v8heap,
            "native": stats.native,
            "code": stats.code,
            "strings": stats.strings,
            "js_arrays": stats.js_arrays,
            "system": stats.system,
        }),
    )?;

    let aggregates = snapshot.aggregates(&NodeFilter::default())?;
    let mut classes: Vec<_> = aggregates.classes.values().collect();
    classes.sort_by(|a, b| b.max_ret.total_cmp(&a.max_ret).then_with(|| a.name.cmp(&b.name)));
    for aggregate in classes.into_iter().take(top) {
        emit(
            out,
            &serde_json::json!({
                "type": "class",
                "constructor": aggregate.name,
                "count": aggregate.count,
                "distance": aggregate.distance,
                "self_size": aggregate.self_size,
                "retained_size": aggregate.max_ret,
            }),
        )?;
    }

    for report in snapshot.problem_reports() {
        emit(
            out,
            &serde_json::json!({
                "type": "problem",
                "title": report.title,
                "total": report.total,
                "entries": report.entries,
            }),
        )?;
    }
    Ok(())
}

/// Class names along the dominator chain from the root down to the node.
fn retention_path(snapshot: &HeapSnapshot, node_index: usize) -> Vec<String> {
    let graph = snapshot.graph();
    let mut ordinal = graph.ordinal_of(node_index);
    let mut path = Vec::new();
    while ordinal != graph.root_ordinal() {
        path.push(snapshot.class_name(graph.node_by_ordinal(ordinal)).into_owned());
        let dominator = snapshot.dominator(ordinal);
        if dominator == ordinal {
            break;
        }
        ordinal = dominator;
    }
    path.push(graph.root().name().to_string());
    path.reverse();
    path
}

fn diff(
    out: &mut dyn Write,
    args: &Args,
    baseline_path: &Path,
    target_path: &Path,
    max_retained: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let baseline = load(baseline_path, args)?;
    let target = load(target_path, args)?;

    info!("computing diff");
    let base_aggregates = baseline.aggregates_for_diff()?;
    let diff = target.calculate_snapshot_diff("baseline", &base_aggregates)?;
    let after = target.aggregates(&NodeFilter::default())?;

    let mut growth: Vec<_> = diff.values().collect();
    growth.sort_by(|a, b| b.size_delta.cmp(&a.size_delta).then_with(|| a.name.cmp(&b.name)));
    info!("found {} changed classes", growth.len());

    emit(out, &header("heap-diff", &[baseline_path, target_path]))?;
    for class in &growth {
        let count_after = after.classes.get(&class.name).map_or(0, |a| a.count);
        emit(
            out,
            &serde_json::json!({
                "type": "growth",
                "constructor": class.name,
                "count_before": i64::from(count_after) - class.count_delta,
                "count_after": count_after,
                "count_delta": class.count_delta,
                "added_count": class.added_count,
                "removed_count": class.removed_count,
                "added_size": class.added_size,
                "removed_size": class.removed_size,
                "size_delta": class.size_delta,
            }),
        )?;
    }

    let mut added: Vec<u32> = growth
        .iter()
        .flat_map(|class| class.added_indexes.iter().copied())
        .collect();
    let graph = target.graph();
    added.sort_by(|&a, &b| {
        let a = graph.ordinal_of(a as usize);
        let b = graph.ordinal_of(b as usize);
        target.retained_size(b).total_cmp(&target.retained_size(a))
    });
    for index in added.into_iter().take(max_retained) {
        let node = graph.node(index as usize);
        emit(
            out,
            &serde_json::json!({
                "type": "retained",
                "id": node.id(),
                "constructor": target.class_name(node),
                "self_size": node.self_size(),
                "retained_size": target.retained_size(node.ordinal()),
                "retention_path": retention_path(&target, index as usize),
            }),
        )?;
    }
    Ok(())
}

fn search(
    out: &mut dyn Write,
    args: &Args,
    path: &Path,
    config: SearchConfig,
    filter: NodeFilter,
) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = load(path, args)?;
    let ids = snapshot.search(&config, &filter)?;
    info!("{} matches", ids.len());

    emit(out, &header("heap-search", &[path]))?;
    for id in ids {
        let Some(index) = snapshot.node_index_for_id(id) else {
            continue;
        };
        let node = snapshot.graph().node(index);
        emit(
            out,
            &serde_json::json!({
                "type": "match",
                "id": id,
                "name": node.name(),
                "constructor": snapshot.class_name(node),
                "self_size": node.self_size(),
                "retained_size": snapshot.retained_size(node.ordinal()),
                "distance": snapshot.distance(node.ordinal()),
            }),
        )?;
    }
    Ok(())
}

fn allocations(
    out: &mut dyn Write,
    args: &Args,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = load(path, args)?;
    let profile = snapshot.allocation_profile()?;
    let mut tops = profile.serialize_trace_tops();
    tops.sort_by(|a, b| b.live_size.cmp(&a.live_size).then_with(|| a.id.cmp(&b.id)));

    emit(out, &header("heap-allocations", &[path]))?;
    for top in tops {
        let callers = profile.serialize_callers(top.id)?;
        let stack: Vec<&str> = callers
            .nodes_with_single_caller
            .iter()
            .map(|caller| caller.name.as_str())
            .collect();
        emit(
            out,
            &serde_json::json!({
                "type": "allocation",
                "function": top.name,
                "script": top.script_name,
                "line": top.line,
                "column": top.column,
                "count": top.count,
                "size": top.size,
                "live_count": top.live_count,
                "live_size": top.live_size,
                "callers": stack,
                "branching_callers": callers.branching_callers.len(),
            }),
        )?;
    }
    Ok(())
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(std::io::stdout().lock())),
    };

    match &args.command {
        Command::Summary { snapshot, top } => summary(&mut *out, &args, snapshot, *top)?,
        Command::Diff {
            baseline,
            target,
            max_retained,
        } => diff(&mut *out, &args, baseline, target, *max_retained)?,
        Command::Search {
            snapshot,
            query,
            regex,
            case_sensitive,
            min_id,
            max_id,
        } => {
            let config = SearchConfig {
                query: query.clone(),
                case_sensitive: *case_sensitive,
                is_regex: *regex,
            };
            let filter = NodeFilter {
                min_node_id: *min_id,
                max_node_id: *max_id,
                allocation_node_id: None,
            };
            search(&mut *out, &args, snapshot, config, filter)?
        }
        Command::Allocations { snapshot } => allocations(&mut *out, &args, snapshot)?,
    }
    out.flush()?;

    if let Some(path) = &args.output {
        info!("wrote {}", path.display());
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
