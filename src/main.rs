use rivet::logger::{verbosity_level, LogConfig};
use rivet::{Config, TriggerMode, WebServer};

fn main() {
    let config = Config {
        trigger: TriggerMode::from_mode(3),
        log: Some(LogConfig {
            level: verbosity_level(1),
            ..LogConfig::default()
        }),
        ..Config::default()
    };
    match WebServer::new(config) {
        Ok(mut server) => server.run(),
        Err(e) => eprintln!("server init failed: {e}"),
    }
}
