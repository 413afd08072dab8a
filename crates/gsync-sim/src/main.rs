use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use gsync_core::{run_simulator, SimulatorConfig, SyncConfig};
use tracing_subscriber::EnvFilter;

mod live;

fn cli() -> Command {
    Command::new("gsync-sim")
        .version(gsync_core::VERSION)
        .about("Optimistic graph replication simulator")
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("simulate")
                .about("Run a deterministic randomized workload against the in-memory cluster")
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("clients")
                        .long("clients")
                        .default_value("3")
                        .value_parser(value_parser!(u64))
                        .help("Number of editing clients"),
                )
                .arg(
                    Arg::new("actions")
                        .long("actions")
                        .default_value("300")
                        .value_parser(value_parser!(u64))
                        .help("Number of submissions to attempt"),
                )
                .arg(
                    Arg::new("nodes")
                        .long("nodes")
                        .default_value("8")
                        .value_parser(value_parser!(usize))
                        .help("Nodes in the starting graph"),
                )
                .arg(
                    Arg::new("loss")
                        .long("loss")
                        .default_value("0")
                        .value_parser(value_parser!(f64))
                        .help("Probability a commit delivery is dropped"),
                )
                .arg(
                    Arg::new("dup")
                        .long("dup")
                        .default_value("0")
                        .value_parser(value_parser!(f64))
                        .help("Probability a commit delivery is duplicated"),
                )
                .arg(
                    Arg::new("packet-size")
                        .long("packet-size")
                        .default_value("32000")
                        .value_parser(value_parser!(usize))
                        .help("Maximum packet size before fragmentation"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output the report as JSON"),
                ),
        )
        .subcommand(
            Command::new("live")
                .about("Run server and clients as tokio tasks over the in-process hub")
                .arg(
                    Arg::new("clients")
                        .long("clients")
                        .default_value("3")
                        .value_parser(value_parser!(u64))
                        .help("Number of editing clients"),
                )
                .arg(
                    Arg::new("actions")
                        .long("actions")
                        .default_value("50")
                        .value_parser(value_parser!(u64))
                        .help("Submissions per client"),
                )
                .arg(
                    Arg::new("nodes")
                        .long("nodes")
                        .default_value("4")
                        .value_parser(value_parser!(usize))
                        .help("Nodes in the starting graph"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for the workload"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_name("FILE")
                        .help("TOML replication settings"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Validate a TOML config file, or print the defaults")
                .arg(Arg::new("file").value_name("FILE")),
        )
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&String>) -> anyhow::Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    SyncConfig::from_toml_str(&text).with_context(|| format!("parsing {path}"))
}

fn simulate(args: &ArgMatches) -> anyhow::Result<bool> {
    let config = SimulatorConfig {
        seed: *args.get_one::<u64>("seed").context("seed")?,
        clients: *args.get_one::<u64>("clients").context("clients")?,
        actions: *args.get_one::<u64>("actions").context("actions")?,
        nodes: *args.get_one::<usize>("nodes").context("nodes")?,
        loss_rate: *args.get_one::<f64>("loss").context("loss")?,
        duplicate_rate: *args.get_one::<f64>("dup").context("dup")?,
        max_packet_size: *args.get_one::<usize>("packet-size").context("packet-size")?,
        ..SimulatorConfig::default()
    };
    anyhow::ensure!(config.clients > 0, "at least one client is required");
    anyhow::ensure!(config.nodes > 0, "at least one node is required");
    tracing::info!(seed = config.seed, clients = config.clients, actions = config.actions, "simulating");

    let report = run_simulator(config);
    if args.get_flag("json") {
        println!("{}", report.to_json()?);
    } else {
        println!("{}", report.generate_text());
    }
    Ok(report.passed())
}

async fn live(args: &ArgMatches) -> anyhow::Result<bool> {
    let options = live::LiveOptions {
        clients: *args.get_one::<u64>("clients").context("clients")?,
        actions: *args.get_one::<u64>("actions").context("actions")?,
        nodes: *args.get_one::<usize>("nodes").context("nodes")?,
        seed: *args.get_one::<u64>("seed").context("seed")?,
        config: load_config(args.get_one::<String>("config"))?,
    };
    anyhow::ensure!(options.clients > 0, "at least one client is required");
    anyhow::ensure!(options.nodes > 0, "at least one node is required");

    let summary = live::run(options).await?;
    println!("{summary}");
    Ok(summary.converged)
}

fn config(args: &ArgMatches) -> anyhow::Result<bool> {
    let config = load_config(args.get_one::<String>("file"))?;
    println!("{}", toml_text(&config)?);
    Ok(true)
}

fn toml_text(config: &SyncConfig) -> anyhow::Result<String> {
    toml::to_string_pretty(config).context("rendering config")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_logging(matches.get_flag("log-json"));

    let passed = match matches.subcommand() {
        Some(("simulate", args)) => simulate(args)?,
        Some(("live", args)) => live(args).await?,
        Some(("config", args)) => config(args)?,
        Some((other, _)) => anyhow::bail!("unknown subcommand {other}"),
        None => anyhow::bail!("a subcommand is required"),
    };
    std::process::exit(if passed { 0 } else { 1 });
}
