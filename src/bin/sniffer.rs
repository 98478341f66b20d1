use std::io;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::bounded;

use trafgen::capture::{run_capture_loop, PcapSource};
use trafgen::cli::SnifferArgs;
use trafgen::error::TrafgenError;
use trafgen::flow::FlowTable;
use trafgen::report::Reporter;
use trafgen::trace::Tracer;

/// Global shutdown flag, set by the signal handlers.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, signal_handler as libc::sighandler_t);
    }
}

fn main() {
    env_logger::init();

    let args = SnifferArgs::parse();
    match run(args) {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}

fn run(args: SnifferArgs) -> Result<(), TrafgenError> {
    install_signal_handlers();

    let tracer = if args.log {
        Tracer::to_file("sniffer")?
    } else {
        Tracer::disabled()
    };

    let mut source = PcapSource::open(&args.interface)?;
    println!("[info] sniffing on {} (Ctrl-C to stop)", args.interface);

    let table = Arc::new(FlowTable::new());
    let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

    let capture_table = Arc::clone(&table);
    let capture_tracer = tracer.clone();
    let capture_handle = thread::Builder::new()
        .name("trafgen-capture".into())
        .spawn(move || {
            run_capture_loop(
                &mut source,
                &capture_table,
                &SHUTDOWN_REQUESTED,
                &shutdown_rx,
                &capture_tracer,
            );
        })
        .map_err(|e| TrafgenError::Fatal(format!("spawn capture thread: {e}")))?;

    // Reporter runs on the main thread at 1 Hz; eviction sweeps are gated
    // internally to every 30 seconds.
    let mut reporter = Reporter::new(Arc::clone(&table), tracer);
    let mut stdout = io::stdout();
    while !SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_secs(1));
        if let Err(e) = reporter.tick(&mut stdout) {
            log::warn!("render failed: {e}");
        }
    }

    // Disconnecting the channel wakes the capture thread even if the flag
    // store raced with its last check.
    drop(shutdown_tx);
    let _ = capture_handle.join();

    println!("\n[info] sniffer stopped");
    Ok(())
}
