use ballast::config::ServerConfig;
use ballast::logging::{self, Logger};
use ballast::path;
use ballast::stop::{StopSource, StopToken};
use clap::App;
use riptide::net::tls::TlsContext;
use riptide::server::ChatServer;
use riptide::store::{ChatStore, MemoryStore};
use std::process;
use std::sync::Arc;
use std::thread;

fn main() {
    // Broken pipes surface as write errors, and the signal mask must be
    // in place before any thread spawns so every thread inherits it.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
    let sigset = block_termination_signals();

    process::exit(run(sigset));
}

fn block_termination_signals() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
        set
    }
}

/// Consumes blocked termination signals with a 200 ms timeout so it can
/// also notice the server stopping on its own.
fn spawn_signal_waiter(
    set: libc::sigset_t,
    source: StopSource,
    log: Logger,
) -> thread::JoinHandle<()> {
    let token = source.token();

    thread::spawn(move || {
        let timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 200_000_000,
        };

        loop {
            if token.is_stop_requested() {
                return;
            }

            let sig = unsafe { libc::sigtimedwait(&set, std::ptr::null_mut(), &timeout) };
            if sig == libc::SIGINT || sig == libc::SIGTERM {
                logging::info!(log, "termination signal received"; "signal" => sig);
                source.request_stop();
                return;
            }
        }
    })
}

fn run(sigset: libc::sigset_t) -> i32 {
    App::new("chat server")
        .version("0.1.0")
        .about("Runs the TLS line-chat server.")
        .get_matches();

    let log = logging::init();
    let source = StopSource::new();
    let waiter = spawn_signal_waiter(sigset, source.clone(), log.clone());

    let code = serve(&log, source.token());

    // End the waiter when the server stopped on its own.
    source.request_stop();
    let _ = waiter.join();
    code
}

fn serve(log: &Logger, stop: StopToken) -> i32 {
    let root = path::resolve_root();
    logging::info!(log, "project root resolved"; "root" => %root.display());

    let config = match ServerConfig::load(&root) {
        Ok(config) => config,
        Err(err) => {
            logging::error!(log, "configuration error"; "error" => %err);
            return 1;
        }
    };

    let tls = match TlsContext::new_server(&config.tls_cert, &config.tls_key) {
        Ok(tls) => tls,
        Err(err) => {
            logging::error!(log, "tls setup failed"; "error" => %err);
            return 1;
        }
    };

    logging::info!(log, "database target";
                   "host" => &config.db.host,
                   "port" => &config.db.port,
                   "name" => &config.db.name,
                   "user" => &config.db.user);

    // The bundled in-memory store implements the database contract.
    let store: Arc<dyn ChatStore> = Arc::new(MemoryStore::new());
    if let Err(err) = store.ping() {
        logging::error!(log, "store ping failed"; "error" => %err);
        return 1;
    }

    let server = match ChatServer::create(config.port, store, tls, log) {
        Ok(server) => server,
        Err(err) => {
            logging::error!(log, "server startup failed"; "error" => %err);
            return 1;
        }
    };

    match server.run_with(stop) {
        Ok(()) => {
            logging::info!(log, "server stopped");
            0
        }
        Err(err) => {
            logging::error!(log, "server error"; "error" => %err);
            1
        }
    }
}
