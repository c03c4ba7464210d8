mod file_handle;
mod fs_mount;
mod inode;
mod inode_table;
mod meta_cache;

use log::error;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::fs_mount::{run_mount, MountRunOptions};

fn usage() -> String {
    "usage: fs_mount <mountpoint> --endpoint <host:port> [--endpoint <host:port> ...]\n\
     options:\n\
     --root <path>        remote directory exposed as the mount root (default /)\n\
     --user <name>        remote user name (default: invoking user)\n\
     --config <path>      JSON config file (staging dir, TTLs, retry, TLS)\n\
     --allow-other        allow other local users to access the mount\n\
     --log-level <level>  error|warn|info|debug|trace"
        .to_string()
}

fn default_user() -> String {
    env::var("USER")
        .or_else(|_| env::var("LOGNAME"))
        .unwrap_or_else(|_| "hdfs".to_string())
}

fn parse_args() -> Result<(MountRunOptions, Option<log::LevelFilter>), String> {
    let args = env::args().skip(1).collect::<Vec<String>>();
    if args.is_empty() || args[0] == "-h" || args[0] == "--help" {
        return Err(usage());
    }

    let mountpoint = PathBuf::from(args[0].clone());
    let mut endpoints = Vec::new();
    let mut remote_root = "/".to_string();
    let mut user = default_user();
    let mut config_path = None;
    let mut allow_other = false;
    let mut log_level = None;

    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--endpoint" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --endpoint".to_string())?;
                endpoints.push(value.clone());
            }
            "--root" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --root".to_string())?;
                remote_root = value.clone();
            }
            "--user" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --user".to_string())?;
                user = value.clone();
            }
            "--config" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --config".to_string())?;
                config_path = Some(PathBuf::from(value));
            }
            "--allow-other" => {
                allow_other = true;
            }
            "--log-level" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| "missing value for --log-level".to_string())?;
                let level = log::LevelFilter::from_str(value)
                    .map_err(|_| format!("invalid log level: {}", value))?;
                log_level = Some(level);
            }
            other => {
                return Err(format!("unknown argument: {}\n{}", other, usage()));
            }
        }
        i += 1;
    }

    if endpoints.is_empty() {
        return Err(format!("at least one --endpoint is required\n{}", usage()));
    }

    Ok((
        MountRunOptions {
            mountpoint,
            endpoints,
            remote_root,
            user,
            config_path,
            allow_other,
        },
        log_level,
    ))
}

fn main() {
    let (options, log_level) = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(1);
        }
    };
    match log_level {
        Some(level) => env_logger::Builder::from_default_env()
            .filter_level(level)
            .init(),
        None => env_logger::init(),
    }

    if let Err(err) = run_mount(options) {
        error!("fs_mount failed: {}", err);
        eprintln!("fs_mount: {}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod fs_mount_tests;
