//! carve - Recursively decode archives, images and other structured binaries
//!
//! This tool detects known formats in the given files, decodes their
//! structure and rescans every compressed stream found inside them.

use anyhow::{bail, Context, Result};
use carve_core::input::InputReader;
use carve_core::{
    FormatRegistry, NodeKind, Renderable, ResultNode, ScanListener, ScanProgress, ScanStats, ScannerConfig,
    Scheduler,
};
use clap::{Args, Parser, ValueEnum};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, trace, warn, Level};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Recursively decode archives, images and other structured binaries
#[derive(Parser, Debug)]
#[command(name = "carve")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    input: InputMode,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format
    #[arg(long, value_enum, default_value = "tree")]
    format: OutputFormat,

    /// Only probe these formats (comma separated)
    #[arg(long, value_delimiter = ',')]
    formats: Vec<String>,

    /// Maximum nesting of decoded streams
    #[arg(long, default_value = "16")]
    max_depth: usize,

    /// Directory for the decode cache scratch file
    #[arg(long, env = "CARVE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Write every decoded stream into this directory
    #[arg(short, long, value_name = "DIR")]
    extract: Option<PathBuf>,

    /// Print the decoded fields of every node
    #[arg(long)]
    sections: bool,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct InputMode {
    /// Path to a single file to decode
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Path to a directory of files to decode
    #[arg(short, long)]
    directory: Option<PathBuf>,
}

/// Output format for the result tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Indented result tree
    Tree,
    /// One line per decoded stream with its full path (for scripting)
    Paths,
}

/// Logs scan events as they happen
#[derive(Default)]
struct LogListener {
    results: usize,
}

impl ScanListener for LogListener {
    fn on_scan_progress(&mut self, progress: &ScanProgress) {
        trace!("{} processed, {} pending", progress.processed, progress.pending);
    }

    fn on_scan_result(&mut self, node: &Arc<ResultNode>) {
        self.results += 1;
        let detected: Vec<String> = node.children().iter().map(|c| c.name().to_string()).collect();
        if detected.is_empty() {
            debug!("{}: no format detected", node.path().join("/"));
        } else {
            debug!("{}: {}", node.path().join("/"), detected.join(", "));
        }
    }

    fn on_scan_cancelled(&mut self, stats: &ScanStats) {
        warn!("Scan cancelled after {} inputs", stats.inputs_scanned);
    }
}

/// Tracks written streams so identical content is written once
#[derive(Default)]
struct StreamRegistry {
    /// Content hashes already written
    seen: HashSet<String>,
    /// Statistics
    stats: ExtractStats,
}

#[derive(Default)]
struct ExtractStats {
    total_found: usize,
    duplicates_skipped: usize,
    written: usize,
}

impl StreamRegistry {
    fn new() -> Self {
        Self::default()
    }

    /// Compute a short hash of the stream content (first 8 chars of blake3)
    fn content_hash(input: &Arc<dyn carve_core::Input>) -> io::Result<String> {
        let mut hasher = blake3::Hasher::new();
        let mut reader = InputReader::new(input.clone(), 0, None);
        io::copy(&mut reader, &mut hasher)?;
        Ok(hasher.finalize().to_hex()[..8].to_string())
    }

    /// Writes the node's content into `output_dir`, returning the written path
    fn extract(&mut self, node: &ResultNode, output_dir: &Path) -> Result<Option<PathBuf>> {
        let Some(content) = node.content() else {
            return Ok(None);
        };
        self.stats.total_found += 1;

        let hash = Self::content_hash(content)
            .with_context(|| format!("Failed to read decoded stream: {}", node.name()))?;
        if !self.seen.insert(hash.clone()) {
            debug!("Skipping duplicate: {} (hash: {})", node.name(), hash);
            self.stats.duplicates_skipped += 1;
            return Ok(None);
        }

        let output_path = output_dir.join(add_suffix(&sanitize_name(node.name()), &format!("~{}", hash)));
        write_stream(content, &output_path)?;
        self.stats.written += 1;
        Ok(Some(output_path))
    }

    fn print_summary(&self) {
        info!(
            "Summary: {} streams found, {} duplicates skipped, {} written",
            self.stats.total_found, self.stats.duplicates_skipped, self.stats.written
        );
    }
}

/// Add a suffix before the extension
fn add_suffix(filename: &str, suffix: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}{}.{}", stem, suffix, ext),
        _ => format!("{}{}", filename, suffix),
    }
}

/// Reduce a stream name to a safe file name without directories
fn sanitize_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "stream".to_string()
    } else {
        cleaned.to_string()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .init();

    // Dispatch based on input mode
    if let Some(ref file) = cli.input.file {
        process_single_file(&cli, file)
    } else if let Some(ref directory) = cli.input.directory {
        process_directory(&cli, directory)
    } else {
        bail!("Either --file or --directory must be specified")
    }
}

/// Process a single file
fn process_single_file(cli: &Cli, file: &Path) -> Result<()> {
    if !file.exists() {
        bail!("Input file does not exist: {}", file.display());
    }
    if !file.is_file() {
        bail!("Input path is not a file: {}", file.display());
    }

    let scheduler = build_scheduler(cli)?;
    scheduler
        .handle()
        .queue_file(file)
        .with_context(|| format!("Failed to open input file: {}", file.display()))?;
    run_scan(cli, scheduler)
}

/// Process a directory of files recursively
fn process_directory(cli: &Cli, directory: &Path) -> Result<()> {
    if !directory.exists() {
        bail!("Directory does not exist: {}", directory.display());
    }
    if !directory.is_dir() {
        bail!("Path is not a directory: {}", directory.display());
    }

    info!("Scanning directory: {}", directory.display());

    let scheduler = build_scheduler(cli)?;
    let handle = scheduler.handle();
    let mut files_queued = 0;

    // Walk the directory
    for entry in WalkDir::new(directory)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();

        // Skip directories
        if !path.is_file() {
            continue;
        }

        // Skip hidden files
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with('.'))
            .unwrap_or(false)
        {
            continue;
        }

        match handle.queue_file(path) {
            Ok(_) => files_queued += 1,
            // Log error but continue with other files
            Err(e) => warn!("Error opening {}: {}", path.display(), e),
        }
    }

    info!("Queued {} files", files_queued);
    run_scan(cli, scheduler)
}

/// Builds the format registry selected on the command line
fn build_registry(formats: &[String]) -> Result<FormatRegistry> {
    let registry = FormatRegistry::builtin();
    if formats.is_empty() {
        return Ok(registry);
    }

    let available = registry.names();
    for name in formats {
        if !available.iter().any(|a| a.eq_ignore_ascii_case(name)) {
            bail!("Unknown format '{}' (available: {})", name, available.join(", "));
        }
    }
    Ok(registry.retain_names(formats))
}

fn build_scheduler(cli: &Cli) -> Result<Scheduler> {
    let registry = build_registry(&cli.formats)?;
    let mut config = ScannerConfig::new().max_depth(cli.max_depth);
    if let Some(ref dir) = cli.cache_dir {
        config = config.cache_dir(dir);
    }
    debug!("Probing formats: {}", registry.names().join(", "));
    Ok(Scheduler::new(registry, config))
}

/// Drain the queue, then print and extract the results
fn run_scan(cli: &Cli, mut scheduler: Scheduler) -> Result<()> {
    let mut listener = LogListener::default();
    let stats = scheduler.run(&mut listener).context("Scan failed")?;

    info!(
        "Scanned {} inputs ({} results): {} recognized, {} unrecognized, {} decoded streams, {} failures",
        stats.inputs_scanned,
        listener.results,
        stats.formats_matched,
        stats.unrecognized,
        stats.derived_inputs,
        stats.failures
    );

    for root in scheduler.tree().roots() {
        match cli.format {
            OutputFormat::Tree => print_tree(&root, cli.sections),
            OutputFormat::Paths => print_paths(&root),
        }
    }

    if let Some(ref output_dir) = cli.extract {
        fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create directory: {}", output_dir.display()))?;
        let mut registry = StreamRegistry::new();
        let mut streams = Vec::new();
        scheduler.tree().walk(&mut |node, _| {
            if node.kind() == NodeKind::EncodedInput {
                streams.push(node.clone());
            }
        });
        for stream in streams {
            match registry.extract(&stream, output_dir) {
                Ok(Some(path)) => println!("Wrote {}", path.display()),
                Ok(None) => {}
                Err(e) => warn!("Failed to extract {}: {:#}", stream.name(), e),
            }
        }
        registry.print_summary();
    }

    Ok(())
}

/// One line describing a node
fn render_node(node: &ResultNode) -> String {
    let span = match node.span() {
        Some(span) => format!("[{}..{}]", span.start, span.end),
        None => format!("[{}..]", node.start()),
    };
    let mut line = format!("{} {} {}", node.kind().as_str(), node.name(), span);
    if let Some(failure) = node.failure() {
        line.push_str(&format!(" FAILED: {}", failure));
    }
    line
}

/// One line describing a recorded section
fn render_section(range: &std::ops::Range<u64>, renderable: &Renderable) -> String {
    match renderable {
        Renderable::Value { name, value } => format!("{:>8} {} = {}", range.start, name, value),
        Renderable::Raw { name } => format!("{:>8} {} ({} bytes)", range.start, name, range.end - range.start),
        Renderable::Encoded { name } => {
            format!("{:>8} {} ({} encoded bytes)", range.start, name, range.end - range.start)
        }
    }
}

fn print_tree(root: &Arc<ResultNode>, sections: bool) {
    root.walk(&mut |node, depth| {
        let indent = "  ".repeat(depth);
        println!("{}{}", indent, render_node(node));
        if sections {
            for section in node.sections() {
                println!("{}  | {}", indent, render_section(&section.range, &section.renderable));
            }
        }
    });
}

fn print_paths(root: &Arc<ResultNode>) {
    root.walk(&mut |node, _| {
        if node.kind() == NodeKind::EncodedInput {
            println!("{}", node.path().join("/"));
        }
    });
}

/// Copy a decoded stream to disk
fn write_stream(content: &Arc<dyn carve_core::Input>, output_path: &Path) -> Result<()> {
    // Create parent directories
    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let mut file = fs::File::create(output_path)
        .with_context(|| format!("Failed to create file: {}", output_path.display()))?;
    let mut reader = InputReader::new(content.clone(), 0, None);
    io::copy(&mut reader, &mut file)
        .with_context(|| format!("Failed to write file: {}", output_path.display()))?;

    Ok(())
}
