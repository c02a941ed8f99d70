use anyhow::{Context, Result};
use serde::Serialize;
use serverkeeper::scaffold::Template;
use serverkeeper::*;
use slog_scope::info;
use std::fs;
use std::path::PathBuf;
use std::process;
use structopt::StructOpt;

/// Starts, stops and checks on game server instances.
#[derive(StructOpt, Debug)]
#[structopt(name = "serverkeeper")]
struct Opt {
    /// Path to the settings file. Defaults apply if it doesn't exist.
    #[structopt(short = "f", long, default_value = "./serverkeeper.toml")]
    config_file: PathBuf,

    /// Print outcomes as JSON instead of text.
    #[structopt(long)]
    json: bool,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Debug)]
enum Command {
    /// Lists all instances and whether they run.
    List,

    /// Starts an instance.
    Start { name: String },

    /// Stops an instance.
    Stop { name: String },

    /// Shows whether an instance runs, and what resources it uses.
    Status { name: String },

    /// Stops an instance (if it runs) and starts it again.
    Restart { name: String },

    /// Creates a new instance from a JSON template.
    Create { template: PathBuf },
}

fn print_json<T: Serialize>(outcome: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

fn bytes(n: Option<u64>) -> String {
    match n {
        Some(n) => format!("{:.1} MiB", n as f64 / (1024.0 * 1024.0)),
        None => "unknown".to_string(),
    }
}

fn print_status(report: &StatusReport) {
    match &report.status {
        InstanceStatus::Running { pid, sample } => {
            println!("🟢 '{}' is running (PID: {})", report.instance, pid);
            println!("   memory:     {}", bytes(sample.memory_bytes));
            match sample.cpu_time {
                Some(cpu) => println!("   cpu time:   {:.1}s", cpu.as_secs_f64()),
                None => println!("   cpu time:   unknown"),
            }
            println!("   disk usage: {}", bytes(sample.disk_usage_bytes));
            println!("   free space: {}", bytes(sample.free_space_bytes));
        }
        InstanceStatus::Stopped => println!("🔴 '{}' is stopped", report.instance),
    }
}

fn print_stop(name: &str, outcome: &StopOutcome) {
    match outcome {
        StopOutcome::Stopped { pid } => println!("Server '{}' stopped (PID: {}).", name, pid),
        StopOutcome::NotRunning { .. } => println!("Server '{}' is not running.", name),
    }
}

fn print_started(started: &Started) {
    println!(
        "Server '{}' is now running (PID: {}).",
        started.instance, started.pid
    );
}

fn run(opt: Opt, settings: Settings) -> Result<()> {
    let root = settings.root_dir();
    fs::create_dir_all(&root)
        .with_context(|| format!("Could not create the instance root {:?}", root))?;
    let supervisor = Supervisor::new(settings);

    match opt.command {
        Command::List => {
            let entries = supervisor.list()?;
            if opt.json {
                return print_json(&entries);
            }
            println!("Server list:");
            for entry in entries {
                match entry.pid {
                    Some(pid) => println!("🟢 {} (PID: {})", entry.name, pid),
                    None => println!("🔴 {} (stopped)", entry.name),
                }
            }
        }
        Command::Start { name } => {
            let started = supervisor.start(&name)?;
            if opt.json {
                return print_json(&started);
            }
            print_started(&started);
        }
        Command::Stop { name } => {
            let outcome = supervisor.stop(&name)?;
            if opt.json {
                return print_json(&outcome);
            }
            print_stop(&name, &outcome);
        }
        Command::Status { name } => {
            let report = supervisor.status(&name)?;
            if opt.json {
                return print_json(&report);
            }
            print_status(&report);
        }
        Command::Restart { name } => {
            let restarted = supervisor.restart(&name)?;
            if opt.json {
                return print_json(&restarted);
            }
            print_stop(&name, &restarted.stop);
            print_started(&restarted.start);
        }
        Command::Create { template } => {
            let template = Template::from_json(&template)
                .with_context(|| format!("Could not load template {:?}", template))?;
            let created = template.generate(&root)?;
            if opt.json {
                return print_json(&created);
            }
            println!("Created '{}' in {:?}.", template.name(), created);
        }
    }
    Ok(())
}

fn main() {
    let opt = Opt::from_args();
    let settings = match Settings::load(&opt.config_file) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("[ERROR] {:?}", e);
            process::exit(2);
        }
    };

    let code = {
        let log = logging::setup_logger(&settings);
        let _guard = slog_scope::set_global_logger(log);
        info!("startup"; "command" => ?opt.command, "root" => ?settings.root_dir());
        match run(opt, settings) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("[ERROR] {:?}", e);
                1
            }
        }
    };
    // the logger is flushed by now
    process::exit(code);
}
