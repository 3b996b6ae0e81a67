use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;

use kloset::counters;
use kloset::ui;

#[derive(Debug, Parser)]
#[command(version, about = "A content-addressed snapshot repository")]
struct Args {
    /// Verbosity (-v, -vv, -vvv)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(short, long)]
    repository: Utf8PathBuf,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    Init(ui::init::Args),
    Backup(ui::backup::Args),
    Snapshots(ui::snapshots::Args),
    Ls(ui::ls::Args),
    Check(ui::check::Args),
    Restore(ui::restore::Args),
    Sync(ui::sync::Args),
    Archive(ui::archive::Args),
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.verbose);

    let result = match args.subcommand {
        Subcommand::Init(a) => ui::init::run(&args.repository, a),
        Subcommand::Backup(a) => ui::backup::run(&args.repository, a),
        Subcommand::Snapshots(a) => ui::snapshots::run(&args.repository, a),
        Subcommand::Ls(a) => ui::ls::run(&args.repository, a),
        Subcommand::Check(a) => ui::check::run(&args.repository, a),
        Subcommand::Restore(a) => ui::restore::run(&args.repository, a),
        Subcommand::Sync(a) => ui::sync::run(&args.repository, a),
        Subcommand::Archive(a) => ui::archive::run(&args.repository, a),
    };
    counters::report();
    result
}

/// Spit messages to stderr; stdout is for command output.
fn init_logger(verbosity: u8) {
    use tracing::Level;
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}
