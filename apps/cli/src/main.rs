use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use dutkit_core::{ExecutorConfig, Outcome, Session, SessionConfig, Size};
use dutkit_host_linux::iostat::{self, IoStat};
use dutkit_host_linux::modules::{self, ModuleArgs, RemoveMethod};
use dutkit_host_linux::plugins::{Plugin, ScsiDebug};
use dutkit_host_linux::{build_inventory, Device, Filesystem, PartitionTable};
use dutkit_report::create_report_bundle;
use dutkit_workflow_engine::{load_plan, run_plan_with_report};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dutkit")]
#[command(author, version, about = "Provision and measure block devices on a device under test", long_about = None)]
struct Cli {
    /// Session configuration (YAML, or JSON by extension)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run commands over ssh on USER@HOST instead of locally
    #[arg(long, global = true)]
    host: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover usable disks and print the inventory as JSON
    Inventory {
        #[arg(long)]
        pretty: bool,
    },
    /// Write a report bundle with the current inventory
    Report {
        #[arg(long, default_value = ".")]
        base: PathBuf,
    },
    /// Run a provisioning plan and write its report bundle
    PlanRun {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = ".")]
        report_base: PathBuf,
    },
    /// Print iostat figures for one or more devices
    Iostat {
        #[arg(long, required = true)]
        device: Vec<String>,
        #[arg(long)]
        extended: bool,
        /// Seconds between the two extended samples
        #[arg(long, default_value_t = 1)]
        interval: u64,
    },
    /// Print kernel block-layer counters for a device
    Diskstats {
        #[arg(long)]
        device: String,
    },
    /// Create a fresh partition table with one partition per size
    Partition {
        #[arg(long)]
        device: String,
        #[arg(long, default_value = "gpt")]
        table: PartitionTable,
        /// e.g. 100MiB, 1.5GB, 4096B
        #[arg(long, required = true)]
        size: Vec<Size>,
    },
    /// Destroy the partition table of a device
    RemovePartitions {
        #[arg(long)]
        device: String,
    },
    /// Create a filesystem on a device or partition
    Mkfs {
        #[arg(long)]
        device: String,
        #[arg(long)]
        fs: Filesystem,
        #[arg(long)]
        blocksize: Option<u64>,
        #[arg(long)]
        no_force: bool,
    },
    /// Load, unload or reload a kernel module
    Module {
        #[command(subcommand)]
        action: ModuleCommand,
    },
}

#[derive(Subcommand)]
enum ModuleCommand {
    Load {
        #[arg(long)]
        name: String,
        /// Module parameter as key=value; repeatable
        #[arg(long)]
        arg: Vec<String>,
    },
    Unload {
        #[arg(long)]
        name: String,
        /// Use `modprobe -r` instead of `rmmod`
        #[arg(long)]
        modprobe: bool,
    },
    Reload {
        #[arg(long)]
        name: String,
        #[arg(long)]
        arg: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(target) = &cli.host {
        config.executor = ssh_executor(target);
    }

    let default_level = config.log_level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let session = Session::from_config(&config);
    let mut plugins: Vec<Box<dyn Plugin>> = Vec::new();
    if let Some(params) = &config.plugins.scsi_debug {
        plugins.push(Box::new(ScsiDebug::new(ModuleArgs::from(params.clone()))));
    }

    let result = setup_plugins(&mut plugins, &session)
        .and_then(|()| run(&cli.command, &session, &config));
    for plugin in plugins.iter_mut().rev() {
        if let Err(err) = plugin.teardown(&session) {
            warn!(plugin = plugin.info().id, error = %err, "teardown failed");
        }
    }
    session.teardown();
    result
}

fn setup_plugins(plugins: &mut [Box<dyn Plugin>], session: &Session) -> Result<()> {
    for plugin in plugins.iter_mut() {
        let id = plugin.info().id;
        plugin
            .pre_setup(session)
            .with_context(|| format!("plugin {id} pre-setup"))?;
        plugin
            .post_setup(session)
            .with_context(|| format!("plugin {id} setup"))?;
        info!(plugin = id, "plugin ready");
    }
    Ok(())
}

fn ssh_executor(target: &str) -> ExecutorConfig {
    let (user, host) = match target.split_once('@') {
        Some((user, host)) => (Some(user.to_string()), host.to_string()),
        None => (None, target.to_string()),
    };
    ExecutorConfig::Ssh {
        host,
        user,
        port: None,
        identity_file: None,
    }
}

fn run(command: &Commands, session: &Session, config: &SessionConfig) -> Result<()> {
    match command {
        Commands::Inventory { pretty } => {
            let inventory = build_inventory(session, &config.discovery)?;
            if *pretty {
                println!("{}", serde_json::to_string_pretty(&inventory)?);
            } else {
                println!("{}", serde_json::to_string(&inventory)?);
            }
        }
        Commands::Report { base } => {
            let inventory = build_inventory(session, &config.discovery)?;
            let report = create_report_bundle(base, Some(session.id()), Some(&inventory), None, None)?;
            println!("report_root: {}", report.root.display());
            if let Some(path) = &report.inventory_json {
                println!("inventory: {}", path.display());
            }
            println!("run_json: {}", report.run_json.display());
            println!("logs: {}", report.logs_path.display());
        }
        Commands::PlanRun { file, report_base } => {
            let plan = load_plan(file)?;
            let result = run_plan_with_report(session, &plan, report_base)?;
            println!("plan: {}", plan.name);
            for step in &result.steps {
                println!("step: {} {} -> {:?}", step.id, step.action, step.status);
            }
            println!("report_root: {}", result.report.root.display());
        }
        Commands::Iostat {
            device,
            extended,
            interval,
        } => {
            if *extended {
                let devices: Vec<&str> = device.iter().map(String::as_str).collect();
                let stats = iostat::collect_extended(session, &devices, *interval)?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                for path in device {
                    println!("{path}\n{}", IoStat::collect(session, path)?);
                }
            }
        }
        Commands::Diskstats { device } => {
            let stats = Device::open(session, device)?.get_io_stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Partition {
            device,
            table,
            size,
        } => {
            let mut disk = Device::open(session, device)?;
            disk.create_partitions(size, *table)?;
            for partition in disk.partitions() {
                println!("{}", partition.as_device());
            }
        }
        Commands::RemovePartitions { device } => {
            let mut disk = Device::open(session, device)?;
            if !disk.remove_partitions()? {
                return Err(anyhow!("partitions still present on {}", device));
            }
            info!(device = %device, "partitions removed");
        }
        Commands::Mkfs {
            device,
            fs,
            blocksize,
            no_force,
        } => {
            let mut target = Device::open(session, device)?;
            target.create_filesystem(*fs, !*no_force, *blocksize)?;
            println!("{target}");
        }
        Commands::Module { action } => run_module(action, session)?,
    }
    Ok(())
}

fn run_module(action: &ModuleCommand, session: &Session) -> Result<()> {
    match action {
        ModuleCommand::Load { name, arg } => {
            modules::load(session, name, &ModuleArgs::parse_pairs(arg)?)?;
        }
        ModuleCommand::Unload { name, modprobe } => {
            let method = if *modprobe {
                RemoveMethod::ModprobeRemove
            } else {
                RemoveMethod::Rmmod
            };
            match modules::unload(session, name, method)? {
                Outcome::Done => println!("{name}: unloaded"),
                Outcome::AlreadyDone => println!("{name}: not loaded"),
                Outcome::Failed(output) => {
                    return Err(anyhow!("could not unload {}: {}", name, output.stderr.trim()))
                }
            }
        }
        ModuleCommand::Reload { name, arg } => {
            modules::reload(session, name, &ModuleArgs::parse_pairs(arg)?)?;
        }
    }
    Ok(())
}
