use clap::{App, Arg};
use elproxy::config::ProxyConfig;
use elproxy::error::ProxyError;
use elproxy::logging;
use elproxy::logging::Severity;
use elproxy::proxy::ProxyInstance;

fn main() {
    let matches = App::new("EchoLink Proxy")
        .version("0.1.0")
        .about("Relays EchoLink client traffic through externally addressable slots.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the proxy configuration file")
                .required(true),
        )
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .takes_value(true)
                .default_value("info")
                .help("Log severity: trace, debug, info, warning, error"),
        )
        .get_matches();

    let level = match matches.value_of("log-level").unwrap() {
        "trace" => Severity::Trace,
        "debug" => Severity::Debug,
        "warning" => Severity::Warning,
        "error" => Severity::Error,
        _ => Severity::Info,
    };
    let log = logging::init(level);

    let config_path = matches.value_of("CONFIG_FILE").unwrap();
    let config = ProxyConfig::load(config_path).expect("Error loading proxy configuration");

    let mut proxy = ProxyInstance::new(config, &log).expect("Error initializing proxy");
    proxy.open().expect("Error opening proxy");
    proxy.start().expect("Error starting proxy");

    let handle = proxy
        .shutdown_handle()
        .expect("Error obtaining shutdown handle");
    ctrlc::set_handler(move || handle.shutdown()).expect("Error installing signal handler");

    loop {
        match proxy.process() {
            Ok(()) => (),
            Err(ProxyError::Shutdown) => break,
            Err(err) => {
                logging::error!(log, "accept cycle failed"; "error" => ?err);
                break;
            }
        }
    }

    proxy.close();
}
