use std::process;

use log::{error, info, LevelFilter};
use log_receiver::config::ReceiverConfig;
use log_receiver::{signal, start_server, ErrorKind};
use simple_logger::SimpleLogger;

pub fn main() {
    if let Err(e) = SimpleLogger::new().with_level(LevelFilter::Info).env().init() {
        eprintln!("Error: {}", e);
    }
    signal::install();

    let config = ReceiverConfig::default();
    match start_server(&config) {
        Ok(()) => info!("server stopped"),
        Err(ref e) if matches!(e.kind(), ErrorKind::AddressInUse(_)) => {
            error!("port {} is already in use, stop the process holding it first", config.port);
            info!("the port can be freed with:");
            info!("   lsof -ti :{} | xargs kill -9", config.port);
            process::exit(1);
        }
        Err(e) => {
            error!("log server stopped with an error: {}", e);
            process::exit(1);
        }
    }
}
