//! Broker entry point: CLI parsing, logging bootstrap, configuration
//! loading, and the `actix` system that runs the HTTP server and the
//! parking-lot eviction sweep.

use clap::{
    app_from_crate, crate_authors, crate_description, crate_name,
    crate_version, Arg,
};
use slog::{error, info, o, Drain};

use actix_web::web::Data;

use guacg::config::Conf;
use guacg::parking::ParkingLot;
use guacg::server;

fn bootstrap_logger(debug: bool) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let level = if debug {
        slog::Level::Debug
    } else {
        slog::Level::Info
    };
    let drain = slog::LevelFilter::new(drain, level).fuse();
    slog::Logger::root(drain, o!())
}

fn main() {
    let opts = app_from_crate!()
        .arg(
            Arg::with_name("host")
                .long("host")
                .help("Address to bind the WebSocket server to.")
                .default_value("127.0.0.1")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .long("port")
                .help("Port to bind the WebSocket server to.")
                .default_value("6060")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("endpoint")
                .long("endpoint")
                .help("Path the WebSocket is served on.")
                .default_value("/ws")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("static")
                .long("static")
                .help("Serve the bundled static front-end from ./static."),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .short("c")
                .help("Path to an optional TOML configuration file.")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("debug")
                .long("debug")
                .help("Raise log verbosity to debug."),
        )
        .get_matches();

    dotenv::dotenv().ok();

    let debug = opts.is_present("debug");
    let logger = bootstrap_logger(debug);
    let _scope_guard = slog_scope::set_global_logger(logger.clone());
    slog_stdlog::init().expect("slog_stdlog::init should only be called once");

    let mut conf = match Conf::load(opts.value_of("config")) {
        Ok(conf) => conf,
        Err(e) => {
            error!(logger, "failed to load configuration"; "error" => %e);
            std::process::exit(1);
        }
    };

    conf.server.bind_addr = opts.value_of("host").unwrap_or(&conf.server.bind_addr).to_string();
    if let Some(port) = opts.value_of("port").and_then(|p| p.parse().ok()) {
        conf.server.port = port;
    }
    conf.server.endpoint = opts
        .value_of("endpoint")
        .unwrap_or(&conf.server.endpoint)
        .to_string();
    conf.server.serve_static = conf.server.serve_static || opts.is_present("static");
    conf.server.debug = conf.server.debug || debug;

    let idle_timeout = conf.parking.idle_timeout;

    let sys = actix::System::new("guacg");

    let (server, parking) = match server::build(conf, logger.clone()) {
        Ok(pair) => pair,
        Err(e) => {
            error!(logger, "failed to bind http server"; "error" => %e);
            std::process::exit(1);
        }
    };

    actix::spawn(run_sweep_loop(parking, idle_timeout, logger.clone()));

    actix::spawn(async move {
        let _ = server.await;
    });

    match sys.run() {
        Ok(()) => {
            info!(logger, "shutdown complete");
        }
        Err(e) => {
            error!(logger, "actix system exited with error"; "error" => %e);
            std::process::exit(1);
        }
    }
}

/// Periodically evicts parking-lot entries idle past `idle_timeout`.
async fn run_sweep_loop(
    parking: Data<ParkingLot>,
    idle_timeout: std::time::Duration,
    logger: slog::Logger,
) {
    let mut interval = tokio::time::interval(idle_timeout.max(std::time::Duration::from_secs(1)));
    loop {
        interval.tick().await;
        let evicted = parking.sweep_idle(idle_timeout).await;
        if !evicted.is_empty() {
            info!(logger, "evicted idle parked sessions"; "count" => evicted.len());
        }
    }
}
