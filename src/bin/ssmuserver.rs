//! Multi-port shadowsocks server binary
//!
//! Every attribute can be given on the command line; `-c` points at a JSON
//! configuration file whose `port_password` map drives the multi-port mode.
//! `SIGHUP` re-reads the file and reconfigures listeners in place.

use std::{io, path::PathBuf, process, time::Duration};

use clap::{Arg, ArgAction, Command};
use futures::future::{self, Either};
use log::info;

use shadowsocks_mu::{
    config::{self, Config},
    crypto::available_ciphers,
    net::AddrFamily,
    server,
};

fn main() {
    let matches = Command::new("ssmuserver")
        .version(shadowsocks_mu::VERSION)
        .about("Multi-port shadowsocks relay server")
        .arg(
            Arg::new("CONFIG")
                .short('c')
                .value_name("FILE")
                .default_value("config.json")
                .help("specify config file"),
        )
        .arg(Arg::new("PASSWORD").short('k').value_name("PASSWORD").help("password"))
        .arg(
            Arg::new("SERVER_PORT")
                .short('p')
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16))
                .help("server port"),
        )
        .arg(
            Arg::new("TIMEOUT")
                .short('t')
                .value_name("SECONDS")
                .value_parser(clap::value_parser!(u64))
                .help("connection timeout (in seconds)"),
        )
        .arg(
            Arg::new("ENCRYPT_METHOD")
                .short('m')
                .value_name("METHOD")
                .help("encryption method, default: aes-256-cfb"),
        )
        .arg(
            Arg::new("NET")
                .short('n')
                .value_name("FAMILY")
                .value_parser(clap::value_parser!(u32))
                .help("ipv4(4) or ipv6(6) or both(0), default is both"),
        )
        .arg(
            Arg::new("CORE")
                .long("core")
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .help("maximum number of worker threads to use, default is determined by logical CPUs"),
        )
        .arg(Arg::new("UDP").short('u').action(ArgAction::SetTrue).help("UDP relay"))
        .arg(
            Arg::new("DEBUG")
                .short('d')
                .action(ArgAction::SetTrue)
                .help("print debug message"),
        )
        .get_matches();

    init_logging(matches.get_flag("DEBUG"));

    let config_path = PathBuf::from(matches.get_one::<String>("CONFIG").expect("has default"));
    let mut config = match Config::load_from_file(&config_path) {
        Ok(config) => config,
        Err(config::Error::IoError(ref err)) if err.kind() == io::ErrorKind::NotFound => {
            // no file: run from command line options alone
            Config::new()
        }
        Err(err) => {
            eprintln!("error reading {}: {}", config_path.display(), err);
            process::exit(1);
        }
    };

    // command line options override the file
    if let Some(password) = matches.get_one::<String>("PASSWORD") {
        config.password = Some(password.clone());
    }
    if let Some(port) = matches.get_one::<u16>("SERVER_PORT") {
        config.server_port = Some(*port);
    }
    if let Some(timeout) = matches.get_one::<u64>("TIMEOUT") {
        config.timeout = Duration::from_secs(*timeout);
    }
    if let Some(method) = matches.get_one::<String>("ENCRYPT_METHOD") {
        config.method = match method.parse() {
            Ok(method) => method,
            Err(..) => {
                eprintln!(
                    "unknown cipher method `{}`, available: {}",
                    method,
                    available_ciphers().join(", ")
                );
                process::exit(1);
            }
        };
    }
    if let Some(net) = matches.get_one::<u32>("NET") {
        config.net = AddrFamily::from_net(*net);
    }

    config.unify_port_password();
    if config.port_password.is_empty() {
        eprintln!("must specify either port_password or server_port with password");
        process::exit(1);
    }

    let udp_enabled = matches.get_flag("UDP");

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(core) = matches.get_one::<usize>("CORE") {
        // cap the runtime at the requested number of worker threads
        builder.worker_threads((*core).max(1));
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("create tokio runtime: {}", err);
            process::exit(1);
        }
    };

    runtime.block_on(async move {
        let server = server::run(config, Some(config_path), udp_enabled);
        let monitor = create_signal_monitor();

        tokio::pin!(server);
        tokio::pin!(monitor);

        match future::select(server, monitor).await {
            Either::Left((Err(err), ..)) => {
                eprintln!("server exited unexpectedly: {}", err);
                process::exit(1);
            }
            Either::Left((Ok(..), ..)) | Either::Right(..) => {}
        }
    });

    process::exit(0);
}

#[cfg(unix)]
async fn create_signal_monitor() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let signal_name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };

    info!("received {}, exiting", signal_name);

    Ok(())
}

#[cfg(not(unix))]
async fn create_signal_monitor() -> io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C, exiting");
    Ok(())
}

fn init_logging(debug: bool) {
    use log::LevelFilter;
    use log4rs::{
        append::console::{ConsoleAppender, Target},
        config::{Appender, Root},
        encode::pattern::PatternEncoder,
    };

    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d} {h({l}):<5} {m}{n}")))
        .target(Target::Stdout)
        .build();

    let level = if debug { LevelFilter::Debug } else { LevelFilter::Info };

    let config = log4rs::config::Config::builder()
        .appender(Appender::builder().build("console", Box::new(console)))
        .build(Root::builder().appender("console").build(level))
        .expect("logging");

    log4rs::init_config(config).expect("logging");
}
