use std::env;
use std::process::exit;

use tracing::{debug, error};

fn main() {
    // The binary serves two roles, selected by environment markers set by the
    // controlling orchestrator. With neither marker this was not meant to run.
    if env::var_os("SPAWNER_INTERCEPT").is_some() {
        let debug = env::var_os("SPAWNER_DEBUG").is_some();
        cradle::logging::init(debug);
        debug!("spawner debugging logs enabled");

        match cradle::spawn::run() {
            Ok(code) => exit(code),
            Err(e) => {
                error!("spawner failed: {:#}", e);
                exit(1);
            }
        }
    }

    if env::var_os("INITD_INTERCEPT").is_some() {
        let debug = env::var_os("INITD_DEBUG").is_some();
        cradle::logging::init(debug);
        debug!("initd debugging logs enabled");

        // run() only returns on a fatal startup or reactor error.
        let e = cradle::initd::run().unwrap_err();
        error!("initd failed: {:#}", e);
        exit(1);
    }

    eprintln!("Usage: SPAWNER_INTERCEPT=1 cradle [OPTIONS] [CMD [ARG]...]");
    eprintln!("       INITD_INTERCEPT=1 INITD_SOCKET=PATH cradle");
    exit(64);
}
