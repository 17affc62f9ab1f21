use std::error::Error;
use std::process;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use debugport_core::prelude::*;
use debugport_utils::{info, init_logging_with, warn, LogConfig, LogFormat, LogLevel};

type CliResult<T> = Result<T, Box<dyn Error>>;

/// Drive the debug session broker against a simulated kernel.
#[derive(Parser, Debug)]
#[command(name = "debugport")]
#[command(version)]
#[command(about = "Drive the debug session broker against a simulated kernel", long_about = None)]
struct Cli
{
    #[command(subcommand)]
    command: Commands,

    /// Log level (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format: pretty or json (overrides DEBUGPORT_LOG_FORMAT)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Attach to a running process and print the catch-up events
    Attach(AttachArgs),
    /// Race two sessions attaching to the same process
    Race
    {
        /// Number of rounds
        #[arg(short, long, default_value_t = 20)]
        rounds: usize,
        /// Spawn a thread while the attaches run
        #[arg(long, default_value_t = false)]
        spawn: bool,
    },
    /// Close a session while producers are blocked on it
    Teardown
    {
        /// Number of blocked producer threads
        #[arg(short, long, default_value_t = 3)]
        producers: usize,
        /// Terminate the debuggee when the session closes
        #[arg(long, default_value_t = false)]
        kill_on_close: bool,
    },
}

#[derive(Args, Debug)]
struct AttachArgs
{
    /// Threads in the target process
    #[arg(short, long, default_value_t = 2)]
    threads: usize,
    /// Modules mapped besides the main image
    #[arg(short, long, default_value_t = 2)]
    modules: usize,
    /// Per-wait timeout in milliseconds
    #[arg(long, default_value_t = 100)]
    timeout_ms: u64,
    /// Detach instead of closing the session at the end
    #[arg(long, default_value_t = false)]
    detach: bool,
}

fn main()
{
    let cli = Cli::parse();

    let mut config = match LogConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to read logging configuration: {e}");
            process::exit(1);
        }
    };
    if let Some(level) = cli.log_level {
        config = config.with_level(level);
    }
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    let _guard = match init_logging_with(config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Attach(args) => run_attach(&args),
        Commands::Race { rounds, spawn } => run_race(rounds, spawn),
        Commands::Teardown {
            producers,
            kill_on_close,
        } => run_teardown(producers, kill_on_close),
    };
    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// A target with a main image, `modules` extra images and `threads` threads.
fn spawn_target(broker: &Broker, threads: usize, modules: usize) -> CliResult<Arc<Process>>
{
    let image = MappedImage::new(Address::new(0x0040_0000), 0x10_000).with_path("/bin/target");
    let process = broker.create_process(ProcessSpec::new("target").with_image(image), None);
    for index in 0..modules {
        let base = Address::new(0x7ff0_0000_0000 + (index as u64) * 0x10_0000);
        process.map_image(MappedImage::new(base, 0x8000).with_path(format!("/lib/module{index}.so")));
    }
    for index in 0..threads {
        process.spawn_thread(ThreadSpec::new(Address::new(0x0040_1000 + index as u64 * 0x100)))?;
    }
    Ok(process)
}

/// Wait for and continue events until the session goes quiet.
fn drain(broker: &Broker, session: Handle, timeout: Duration) -> CliResult<usize>
{
    let mut delivered = 0;
    while let WaitOutcome::Event(event) = broker.wait_for_event(session, Some(timeout), None)? {
        println!("  {}", event.describe());
        for handle in event.info.handles() {
            broker.close_handle(handle)?;
        }
        broker.continue_event(session, event.client_id, ContinueStatus::Continue.code())?;
        delivered += 1;
    }
    Ok(delivered)
}

fn run_attach(args: &AttachArgs) -> CliResult<()>
{
    let broker = Broker::builder().config(BrokerConfig::from_env()).build();
    let process = spawn_target(&broker, args.threads, args.modules)?;
    let session = broker.create_session(0)?;
    let target = broker.open_process(process.id())?;

    broker.attach(target, session)?;
    println!("attached to {} ({} threads)", process.id(), process.thread_count());

    let delivered = drain(&broker, session, Duration::from_millis(args.timeout_ms))?;
    println!("{delivered} events delivered");

    if args.detach {
        broker.detach(target, session)?;
        println!("detached, being debugged: {}", broker.is_debugged(process.id()));
    }
    broker.close_handle(target)?;
    broker.close_handle(session)?;
    Ok(())
}

fn run_race(rounds: usize, spawn: bool) -> CliResult<()>
{
    let broker = Arc::new(Broker::new());
    for round in 0..rounds {
        let process = spawn_target(&broker, 1, 0)?;
        let sessions = [broker.create_session(0)?, broker.create_session(0)?];
        let barrier = Arc::new(Barrier::new(if spawn { 3 } else { 2 }));

        let attachers: Vec<_> = sessions
            .iter()
            .map(|&session| {
                let broker = Arc::clone(&broker);
                let barrier = Arc::clone(&barrier);
                let pid = process.id();
                thread::spawn(move || -> BrokerResult<()> {
                    let target = broker.open_process(pid)?;
                    barrier.wait();
                    let result = broker.attach(target, session);
                    broker.close_handle(target)?;
                    result
                })
            })
            .collect();

        let spawner = spawn.then(|| {
            let broker = Arc::clone(&broker);
            let barrier = Arc::clone(&barrier);
            let process = Arc::clone(&process);
            thread::spawn(move || {
                barrier.wait();
                let thread = process.spawn_thread(ThreadSpec::new(Address::new(0x0040_9000)))?;
                broker.report_thread_start(&process, &thread)
            })
        });

        let mut winners = 0;
        for (index, attacher) in attachers.into_iter().enumerate() {
            match attacher.join().map_err(|_| "attach thread panicked")? {
                Ok(()) => {
                    winners += 1;
                    let events = drain(&broker, sessions[index], Duration::from_millis(20))?;
                    println!("round {round}: session {index} won, {events} events");
                }
                Err(BrokerError::PortAlreadySet) => {}
                Err(e) => return Err(e.into()),
            }
        }
        // Closing releases a spawned thread still waiting on its own create report.
        for session in sessions {
            broker.close_handle(session)?;
        }
        if let Some(spawner) = spawner {
            let _ = spawner.join().map_err(|_| "spawner thread panicked")?;
        }
        if winners != 1 {
            warn!(round, winners, "expected exactly one winning attach");
            return Err(format!("round {round}: {winners} attaches succeeded").into());
        }
    }

    info!(rounds, "race finished");
    println!("{rounds} rounds, exactly one winner each");
    Ok(())
}

fn run_teardown(producers: usize, kill_on_close: bool) -> CliResult<()>
{
    let broker = Arc::new(Broker::new());
    let process = spawn_target(&broker, producers.max(1), 0)?;
    let flags = if kill_on_close { SessionFlags::KILL_ON_CLOSE.bits() } else { 0 };
    let session = broker.create_session(flags)?;
    let target = broker.open_process(process.id())?;
    broker.attach(target, session)?;
    broker.close_handle(target)?;
    drain(&broker, session, Duration::from_millis(20))?;

    let blocked: Vec<_> = process
        .threads()
        .into_iter()
        .take(producers)
        .map(|thread| {
            let broker = Arc::clone(&broker);
            let process = Arc::clone(&process);
            thread::spawn(move || {
                let record = ExceptionRecord::new(NtStatus::ACCESS_VIOLATION, thread.start_address());
                broker.report_exception(&process, &thread, record, true)
            })
        })
        .collect();

    // One event is delivered and left unanswered; the rest stay queued.
    if let WaitOutcome::Event(event) = broker.wait_for_event(session, Some(Duration::from_secs(1)), None)? {
        println!("  {} (left unanswered)", event.describe());
    }
    while broker.handles().session(session)?.queued_events() < producers {
        thread::sleep(Duration::from_millis(1));
    }

    broker.close_handle(session)?;
    for producer in blocked {
        match producer.join().map_err(|_| "producer thread panicked")? {
            Ok(status) => println!("  producer released with {status}"),
            Err(e) => println!("  producer released with {} ({e})", e.status()),
        }
    }
    match process.exit_status() {
        Some(status) => println!("debuggee terminated with {status}"),
        None => println!("debuggee still running, being debugged: {}", broker.is_debugged(process.id())),
    }
    Ok(())
}
