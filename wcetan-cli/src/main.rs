// CLI application
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use wcetan_core::analyzer::config::{ArchConfig, MemoryMode};
use wcetan_core::analyzer::error::AnalyzerError;
use wcetan_core::analyzer::ilp::SolutionKind;
use wcetan_core::analyzer::parser::DumpParser;
use wcetan_core::analyzer::pipeline::{AnalysisPipeline, PipelineInput};

/// Exit code when the worst-case path crosses an unresolved indirect
/// branch (the analysis itself completed).
const EXIT_UNRESOLVED_ON_PATH: u8 = 10;
/// Exit code when the LP produced no usable bound (infeasible, unbounded
/// or timed out) and there is no fallback.
const EXIT_NO_BOUND: u8 = 11;

#[derive(Parser)]
#[command(name = "wcetan")]
#[command(about = "Static WCET analyzer for ARMv6-M binaries")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Compute the WCET bound and worst-case path of a program
    Analyze {
        /// Path to the disassembly dump file
        #[arg(short, long)]
        dump_file: PathBuf,

        /// Label of the analysis entry function
        #[arg(short, long)]
        entry: String,

        /// Path to the flow-fact file with loop bounds
        #[arg(short, long)]
        flow_facts: Option<PathBuf>,

        /// Path to the architecture configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Memory configuration: nomem, static or dynamic
        #[arg(short, long, default_value = "nomem")]
        memory: String,

        /// Scratchpad capacity in bytes; enables the assignment ILP
        #[arg(short, long)]
        scratchpad_size: Option<u32>,

        /// Directory for result and intermediate files
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Path to the lp_solve binary (default: found on PATH)
        #[arg(long)]
        lp_solve: Option<PathBuf>,
    },
    /// Parse the dump and report the CFG structure without solving
    Check {
        /// Path to the disassembly dump file
        #[arg(short, long)]
        dump_file: PathBuf,

        /// Label of the analysis entry function
        #[arg(short, long)]
        entry: String,
    },
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Analyze {
            dump_file,
            entry,
            flow_facts,
            config,
            memory,
            scratchpad_size,
            output_dir,
            lp_solve,
        } => analyze(
            &dump_file,
            &entry,
            flow_facts.as_deref(),
            config.as_deref(),
            &memory,
            scratchpad_size,
            &output_dir,
            lp_solve,
        ),
        Commands::Check { dump_file, entry } => check(&dump_file, &entry),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            let exit = err
                .downcast_ref::<AnalyzerError>()
                .map(|e| e.exit_code() as u8)
                .unwrap_or(1);
            ExitCode::from(exit)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn analyze(
    dump_file: &std::path::Path,
    entry: &str,
    flow_facts: Option<&std::path::Path>,
    config: Option<&std::path::Path>,
    memory: &str,
    scratchpad_size: Option<u32>,
    output_dir: &std::path::Path,
    lp_solve: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    let pb = create_progress_bar("Analyzing...");

    let dump_text = std::fs::read_to_string(dump_file)?;
    let flow_fact_text = match flow_facts {
        Some(path) => Some(std::fs::read_to_string(path)?),
        None => None,
    };
    let arch_config = match config {
        Some(path) => ArchConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => ArchConfig::default(),
    };
    let memory_mode = parse_memory_mode(memory)?;

    std::fs::create_dir_all(output_dir)?;

    let input = PipelineInput {
        dump_text,
        flow_fact_text,
        entry_label: entry.to_string(),
        config: arch_config,
        memory_mode,
        scratchpad_capacity: scratchpad_size,
        work_dir: output_dir.to_path_buf(),
        solver_path: lp_solve,
    };

    let report = AnalysisPipeline::run(&input)?;
    pb.finish_with_message("Analysis complete");

    std::fs::write(output_dir.join("wcpath.txt"), &report.wc_path_trace)?;
    std::fs::write(output_dir.join("wchist.txt"), &report.wc_histogram)?;
    std::fs::write(
        output_dir.join("report.json"),
        serde_json::to_string_pretty(&report.stats)?,
    )?;

    println!("WCET bound: {} cycles ({:?})", report.wcet.wcet, report.wcet.kind);
    println!(
        "functions: {}, expanded graph: {} nodes / {} edges",
        report.stats.functions, report.stats.expanded_nodes, report.stats.expanded_edges
    );
    if scratchpad_size.is_some() {
        let mut blocks = report.assigned_blocks.clone();
        blocks.sort_unstable();
        println!(
            "scratchpad: {} blocks assigned, {} bytes used",
            blocks.len(),
            report.scratchpad_used_size
        );
        for addr in blocks {
            println!("  0x{:x}", addr);
        }
    }
    println!(
        "wc-path instructions: {} ({} loads, {} stores, {} branches)",
        report.instr_stats.instructions,
        report.instr_stats.loads,
        report.instr_stats.stores,
        report.instr_stats.branches + report.instr_stats.cond_branches
    );

    if !matches!(
        report.wcet.kind,
        SolutionKind::Optimal | SolutionKind::SubOptimal
    ) {
        eprintln!("error: no WCET bound obtained ({:?})", report.wcet.kind);
        return Ok(ExitCode::from(EXIT_NO_BOUND));
    }
    if report.unresolved_branch_on_path {
        eprintln!("warning: the worst-case path crosses an unresolved indirect branch");
        return Ok(ExitCode::from(EXIT_UNRESOLVED_ON_PATH));
    }
    Ok(ExitCode::SUCCESS)
}

fn check(dump_file: &std::path::Path, entry: &str) -> anyhow::Result<ExitCode> {
    let dump_text = std::fs::read_to_string(dump_file)?;
    let program = DumpParser::new(&dump_text, entry).parse()?;
    println!("parsed {} functions:", program.functions.len());
    for f in &program.functions {
        println!(
            "  {} at 0x{:x}: {} nodes, {} bytes",
            f.name,
            f.address,
            f.cfg.graph.nodes.len(),
            f.cfg.code_size
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn parse_memory_mode(name: &str) -> anyhow::Result<MemoryMode> {
    match name {
        "nomem" => Ok(MemoryMode::NoMem),
        "static" => Ok(MemoryMode::StaticSisp),
        "dynamic" => Ok(MemoryMode::DynamicSisp),
        other => anyhow::bail!("unknown memory mode '{}', expected nomem|static|dynamic", other),
    }
}

fn create_progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(message.to_string());
    pb
}
