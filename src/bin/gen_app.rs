use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;

use trafgen::cli::{GenArgs, Mode};
use trafgen::client::ConnPool;
use trafgen::error::TrafgenError;
use trafgen::server::DrainServer;

/// Global shutdown flag, set by the signal handler.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, signal_handler as libc::sighandler_t);
    }
}

fn main() {
    env_logger::init();

    let args = GenArgs::parse();
    match run(args) {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}

fn run(args: GenArgs) -> Result<(), TrafgenError> {
    install_signal_handlers();

    match args.mode {
        Mode::Server => {
            let mut server = DrainServer::new(args.addr)?;
            println!("[server] listening on {} (Ctrl-C to stop)", args.addr);
            server.run(&SHUTDOWN_REQUESTED)?;
            println!("[server] stopped");
        }
        Mode::Client => {
            let mut pool = ConnPool::new(args.addr, args.connections, args.seed)?;
            println!(
                "[client] {} connections to {} (Ctrl-C to stop)",
                args.connections, args.addr
            );
            pool.run(&SHUTDOWN_REQUESTED)?;
            println!("[client] stopped");
        }
    }
    Ok(())
}
