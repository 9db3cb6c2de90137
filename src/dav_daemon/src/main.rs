mod dav_daemon;
mod dav_handler;

use log::error;
use std::env;
use std::path::PathBuf;

use crate::dav_daemon::{run_dav_daemon, DavDaemonRunOptions, ACCESS_TOKEN_ENV, DEFAULT_ADDR};

fn usage() -> String {
    format!(
        "usage: dav_daemon [--config <path>] [--addr <host:port>] [--client-id <id>]\n\
         \x20                 [--client-secret <secret>] [--backend gdrive|memory]\n\
         defaults:\n\
         --addr {}\n\
         --backend gdrive (access token read from {})",
        DEFAULT_ADDR, ACCESS_TOKEN_ENV
    )
}

fn parse_args(args: &[String]) -> Result<DavDaemonRunOptions, String> {
    let mut options = DavDaemonRunOptions::default();
    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let mut value = || {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("missing value for {}\n{}", flag, usage()))
        };
        match flag.as_str() {
            "-h" | "--help" => return Err(usage()),
            "--config" => options.config_path = Some(PathBuf::from(value()?)),
            "--addr" => options.addr = Some(value()?),
            "--client-id" => options.client_id = Some(value()?),
            "--client-secret" => options.client_secret = Some(value()?),
            "--backend" => options.backend = Some(value()?.parse()?),
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
    }
    Ok(options)
}

fn main() {
    env_logger::init();
    let args = env::args().skip(1).collect::<Vec<String>>();
    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };

    if let Err(err) = run_dav_daemon(options) {
        error!("run dav_daemon failed: {}", err);
        std::process::exit(1);
    }
}
