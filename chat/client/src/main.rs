use ballast::logging::{self, Severity};
use ballast::path;
use ballast::stop::StopSource;
use clap::{App, Arg};
use riptide::client::ChatClient;
use riptide::net::tls::TlsContext;
use std::path::{Path, PathBuf};
use std::process;

const DEFAULT_CA_PATH: &str = "certs/ca.crt.pem";

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let matches = App::new("chat client")
        .version("0.1.0")
        .about("Connects to the TLS line-chat server.")
        .arg(Arg::with_name("IP").help("Server address").index(1))
        .arg(Arg::with_name("PORT").help("Server port").index(2))
        .arg(
            Arg::with_name("CA_PATH")
                .help("CA bundle used to verify the server")
                .index(3),
        )
        .get_matches();

    let log = logging::init_with_severity(Severity::Info);

    let host = matches.value_of("IP").unwrap_or("127.0.0.1");
    let port = match matches.value_of("PORT").unwrap_or("8080").parse::<u16>() {
        Ok(port) => port,
        Err(_) => {
            logging::error!(log, "invalid port"; "port" => matches.value_of("PORT").unwrap_or(""));
            return 1;
        }
    };

    // An explicit CA wins; otherwise the project-local dev CA if present,
    // else the system trust store.
    let ca_path = matches
        .value_of("CA_PATH")
        .map(PathBuf::from)
        .or_else(|| path::resolve_file_in_default_roots(Path::new(DEFAULT_CA_PATH)));

    let tls = match TlsContext::new_client(ca_path.as_deref()) {
        Ok(tls) => tls,
        Err(err) => {
            logging::error!(log, "tls setup failed"; "error" => %err);
            return 1;
        }
    };

    let mut client = match ChatClient::connect(host, port, &tls, &log) {
        Ok(client) => client,
        Err(err) => {
            logging::error!(log, "connect failed"; "error" => %err);
            return 1;
        }
    };

    let source = StopSource::new();
    match client.run(&source.token()) {
        Ok(()) => 0,
        Err(err) => {
            logging::error!(log, "client error"; "error" => %err);
            1
        }
    }
}
