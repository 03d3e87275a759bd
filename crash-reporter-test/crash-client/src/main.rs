use clap::Parser;
use fault_injector::{Fault, IdleThread};
use fault_monitor::{FaultMonitor, MonitorOptions, metadata};
use std::path::PathBuf;

#[derive(Parser)]
struct Command {
    /// The database directory, captures are published to its `captures`
    /// subdirectory
    #[clap(long)]
    database: PathBuf,
    /// The fault to raise
    #[clap(long)]
    fault: Fault,
    /// Raises the fault on a separate thread rather than the main thread
    #[clap(long)]
    use_thread: bool,
    /// The number of threads that are alive, but doing nothing, when the
    /// fault is raised
    #[clap(long, default_value_t = 1)]
    idle_threads: usize,
    /// Panics and catches the panic on the raising thread before raising the
    /// fault
    #[clap(long)]
    recover_from_panic: bool,
}

fn real_main() -> anyhow::Result<()> {
    let cmd = Command::parse();

    println!("pid: {}", std::process::id());

    let options = MonitorOptions::new(cmd.database.join("captures"))
        .metadata(metadata::current("crash-client", env!("CARGO_PKG_VERSION")));
    let _monitor = FaultMonitor::install(options)?;

    let idle: Vec<_> = (0..cmd.idle_threads).map(|_| IdleThread::spawn()).collect();
    for thread in &idle {
        println!("idle thread: {}", thread.tid());
    }

    let fault = cmd.fault;
    let recover_from_panic = cmd.recover_from_panic;
    let raise = move || {
        if recover_from_panic
            && std::panic::catch_unwind(fault_injector::raise_panic).is_ok()
        {
            eprintln!("the panic didn't panic");
        }
        fault.raise();
    };

    if cmd.use_thread {
        let raiser = std::thread::Builder::new()
            .name("raiser".to_owned())
            .spawn(raise)?;

        if raiser.join().is_err() {
            anyhow::bail!("the raising thread panicked instead of crashing");
        }
    } else {
        raise();
    }

    anyhow::bail!("we should have raised {fault} and exited");
}

fn main() {
    // We want this program to crash and have a capture written, it _shouldn't_
    // have errors that prevent that from happening, so emit an error code if we
    // do encounter an error so that we can fail the test
    if let Err(e) = real_main() {
        eprintln!("error: {e:#}");

        // When exiting due to a crash, the exit code will be 128 + the integer
        // signal number, at least on unixes
        #[allow(clippy::exit)]
        std::process::exit(222);
    }
}
