//! relayvisor command-line entry point.

mod cli;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stdout, Stream::Stderr};

use cli::{Cli, Commands, ExecArgs, InternalWorkerArgs, RemoteArgs};
use relayvisor::logging::{self, LogConfig};
use relayvisor::rpc::{self, RpcRequest, RpcResponse};
use relayvisor::worker::{WorkerInfo, WorkerState, worker_main};
use relayvisor::{EventBus, Payload, Pool, RootConfig, Server};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    // The reference worker owns stdout for the relay and must not log there.
    if !matches!(cli.command, Commands::InternalWorker(_)) {
        init_logging(&cli);
    }

    let result = match &cli.command {
        Commands::Serve => cmd_serve(&cli),
        Commands::Check => cmd_check(&cli),
        Commands::Exec(args) => cmd_exec(&cli, args),
        Commands::Workers(args) => cmd_workers(&cli, args),
        Commands::Reset(args) => cmd_reset(&cli, args),
        Commands::InternalWorker(args) => cmd_internal_worker(args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let base = match cli.command {
        Commands::Serve => LogConfig::for_server(),
        _ => LogConfig::for_cli(),
    };
    let mut config = base
        .with_verbosity(cli.verbose, cli.quiet)
        .with_ansi(!cli.no_color)
        .with_env_overrides();
    if let Some(format) = cli.log_format {
        config = config.with_format(format.into());
    }
    logging::init(config);
}

fn load_config(cli: &Cli) -> Result<RootConfig> {
    RootConfig::from_file(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))
}

fn cmd_serve(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let server = Server::new(config).context("failed to start server")?;
    server.run().context("server stopped with an error")?;
    Ok(())
}

fn cmd_check(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;

    println!(
        "{} {}",
        "ok".if_supports_color(Stdout, |text| text.green()),
        cli.config.display()
    );
    if config.http.enable {
        let workers = &config.http.workers;
        println!(
            "  http    {} ({} workers, relay {})",
            config.http.address,
            workers.pool.num_workers(),
            workers.relay
        );
        println!("  command {}", workers.command);
    } else {
        println!("  http    disabled");
    }
    if config.rpc.enable {
        println!("  rpc     {}", config.rpc.listen);
    } else {
        println!("  rpc     disabled");
    }
    Ok(())
}

fn cmd_exec(cli: &Cli, args: &ExecArgs) -> Result<()> {
    let config = load_config(cli)?;
    if config.http.workers.command.trim().is_empty() {
        bail!("no worker command configured under http.workers");
    }

    let pool = Pool::from_config(&config.http.workers, EventBus::default())
        .context("failed to start worker pool")?;
    let result = pool.exec(&Payload::new(args.context.as_bytes(), args.body.as_bytes()));
    pool.destroy();

    let response = result.context("job failed")?;
    if !response.context().is_empty() {
        eprintln!("{}", String::from_utf8_lossy(response.context()));
    }
    println!("{}", String::from_utf8_lossy(response.body()));
    Ok(())
}

fn rpc_address(cli: &Cli, args: &RemoteArgs) -> Result<String> {
    match &args.rpc {
        Some(address) => Ok(address.clone()),
        None => Ok(load_config(cli)?.rpc.listen),
    }
}

fn rpc_call(cli: &Cli, args: &RemoteArgs, request: RpcRequest) -> Result<RpcResponse> {
    let address = rpc_address(cli, args)?;
    let response = rpc::call(&address, &request)
        .with_context(|| format!("RPC call to {} failed", address))?;
    if let RpcResponse::Error { message } = &response {
        bail!("server returned an error: {}", message);
    }
    Ok(response)
}

fn cmd_workers(cli: &Cli, args: &RemoteArgs) -> Result<()> {
    let response = rpc_call(cli, args, RpcRequest::Workers)?;
    let RpcResponse::Workers { workers } = response else {
        bail!("unexpected RPC response: {:?}", response);
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&workers)?);
        return Ok(());
    }
    print_workers(&workers);
    Ok(())
}

fn print_workers(workers: &[WorkerInfo]) {
    println!(
        "{:>8}  {:<9}  {:>8}  {:>12}  {:<20}  COMMAND",
        "PID", "STATE", "JOBS", "BYTES", "CREATED"
    );
    for worker in workers {
        // Pad before coloring so escapes don't break alignment.
        let state = format!("{:<9}", worker.state.as_str());
        let state = match worker.state {
            WorkerState::Ready => state.if_supports_color(Stdout, |t| t.green()).to_string(),
            WorkerState::Working => state.if_supports_color(Stdout, |t| t.yellow()).to_string(),
            _ => state.if_supports_color(Stdout, |t| t.red()).to_string(),
        };
        println!(
            "{:>8}  {}  {:>8}  {:>12}  {:<20}  {}",
            worker.pid,
            state,
            worker.jobs,
            worker.bytes,
            worker.created.format("%Y-%m-%d %H:%M:%S"),
            worker.command
        );
    }
}

fn cmd_reset(cli: &Cli, args: &RemoteArgs) -> Result<()> {
    rpc_call(cli, args, RpcRequest::Reset)?;
    if args.json {
        println!("{}", serde_json::json!({ "type": "ok" }));
    } else {
        println!("{}", "workers reset".if_supports_color(Stdout, |t| t.green()));
    }
    Ok(())
}

fn cmd_internal_worker(args: &InternalWorkerArgs) -> Result<()> {
    worker_main::run(args.mode, Duration::from_millis(args.delay_ms))?;
    Ok(())
}
