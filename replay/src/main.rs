//! Replays a recorded feed (one JSON message per line) through the sync
//! engine and prints what each indicator ended up with.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use data_feed::FeedError;
use indicator_sync::{
    ChartContext, EngineConfig, IndicatorKind, RecordingSurface, ReconcilerPhase, SyncReport,
    UpdatePipeline,
};
use ts_core::{TimeFrame, Timestamp};

#[derive(Parser)]
#[command(
    name = "chart-replay",
    version,
    about = "Replay a recorded indicator feed and summarize the resulting series"
)]
struct Cli {
    /// JSON-lines feed capture; `-` reads stdin
    input: PathBuf,

    #[arg(long, default_value = "BTCUSD")]
    symbol: String,

    #[arg(long, default_value = "1m")]
    timeframe: TimeFrame,

    /// Per-series retention; overrides CHART_SYNC_MAX_POINTS
    #[arg(long)]
    max_points: Option<usize>,

    /// Print the summary as JSON
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Also print every surface operation
    #[arg(long, default_value_t = false)]
    ops: bool,
}

#[derive(Debug, Default, Serialize)]
struct Totals {
    messages: usize,
    bad_lines: usize,
    rejected_messages: usize,
    created: usize,
    updated: usize,
    removed: usize,
    ignored: usize,
    skipped: usize,
    rejected_writes: usize,
}

impl Totals {
    fn count(&mut self, report: &SyncReport) {
        self.created += report.created.len();
        self.updated += report.updated.len();
        self.removed += report.removed.len();
        self.ignored += report.ignored.len();
        self.skipped += report.skipped.len();
    }
}

#[derive(Debug, Serialize)]
struct LineSummary {
    points: usize,
    first: Option<Timestamp>,
    last: Option<(Timestamp, f64)>,
}

#[derive(Debug, Serialize)]
struct IndicatorSummary {
    id: String,
    name: String,
    kind: IndicatorKind,
    phase: Option<ReconcilerPhase>,
    visible: bool,
    lines: BTreeMap<&'static str, LineSummary>,
    markers: usize,
    levels: Vec<f64>,
}

#[derive(Debug, Serialize)]
struct Summary {
    context: ChartContext,
    totals: Totals,
    indicators: Vec<IndicatorSummary>,
}

fn open_input(path: &PathBuf) -> Result<Box<dyn BufRead>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(Box::new(BufReader::new(file)))
}

fn summarize(pipeline: &UpdatePipeline<RecordingSurface>) -> Vec<IndicatorSummary> {
    let registry = pipeline.registry();
    pipeline
        .descriptors()
        .into_iter()
        .map(|desc| {
            let id = desc.id.as_str();
            let reconciler = registry.reconciler(id);
            let lines = desc
                .kind
                .line_names()
                .iter()
                .filter_map(|&line| {
                    let points = registry.points(id, line)?;
                    Some((
                        line,
                        LineSummary {
                            points: points.len(),
                            first: points.first().map(|p| p.time),
                            last: points.last().map(|p| (p.time, p.value)),
                        },
                    ))
                })
                .collect();
            IndicatorSummary {
                id: id.to_string(),
                name: desc.display_name.clone(),
                kind: desc.kind,
                phase: reconciler.map(|r| r.phase()),
                visible: desc.visible,
                lines,
                markers: reconciler.map_or(0, |r| r.markers().len()),
                levels: reconciler
                    .map(|r| r.levels().iter().map(|l| l.value).collect())
                    .unwrap_or_default(),
            }
        })
        .collect()
}

fn print_text(summary: &Summary) {
    let t = &summary.totals;
    println!(
        "{}: {} messages ({} bad lines, {} rejected), \
         {} created, {} updated, {} removed, {} skipped",
        summary.context,
        t.messages,
        t.bad_lines,
        t.rejected_messages,
        t.created,
        t.updated,
        t.removed,
        t.skipped
    );
    for ind in &summary.indicators {
        println!("{} [{}] {:?}", ind.id, ind.kind, ind.phase);
        for (line, s) in &ind.lines {
            match s.last {
                Some((time, value)) => println!(
                    "  {line:<10} {:>5} pts  last {time} = {value:.4}",
                    s.points
                ),
                None => println!("  {line:<10} empty"),
            }
        }
        if ind.markers > 0 {
            println!("  markers    {:>5}", ind.markers);
        }
        if !ind.levels.is_empty() {
            println!("  levels     {:?}", ind.levels);
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::from_env();
    if let Some(n) = cli.max_points {
        config = config.with_max_points(n);
    }
    let context = ChartContext::new(cli.symbol.clone(), cli.timeframe);
    let mut pipeline = UpdatePipeline::new(config, RecordingSurface::new());
    let token = pipeline.switch_context(context.clone());

    let mut totals = Totals::default();
    for (n, line) in open_input(&cli.input)?.lines().enumerate() {
        let line = line.with_context(|| format!("reading line {}", n + 1))?;
        let envelope = match data_feed::parse_envelope(&line) {
            Ok(envelope) => envelope,
            Err(FeedError::EmptyLine) => continue,
            Err(err) => {
                warn!(line = n + 1, error = %err, "undecodable message skipped");
                totals.bad_lines += 1;
                continue;
            }
        };
        totals.messages += 1;
        match pipeline.handle(token, &envelope) {
            Ok(report) => totals.count(&report.sync),
            Err(_) => totals.rejected_messages += 1,
        }
        let ops = pipeline.surface_mut().take_ops();
        if cli.ops {
            for op in &ops {
                println!("{}", serde_json::to_string(op)?);
            }
        }
    }
    totals.rejected_writes = pipeline.surface().rejected();
    info!(messages = totals.messages, indicators = pipeline.indicator_count(), "replay finished");

    let summary = Summary {
        context,
        indicators: summarize(&pipeline),
        totals,
    };
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_text(&summary);
    }
    Ok(())
}
