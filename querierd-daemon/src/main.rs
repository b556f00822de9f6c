//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![warn(rust_2018_idioms)]

mod config;
mod ipc;
mod netlink;

use std::os::unix::net::UnixListener as StdUnixListener;
use std::sync::Arc;

use capctl::caps;
use clap::{App, Arg};
use config::{Config, LoggingFileRotation, LoggingFmtStyle};
use nix::unistd::{Uid, User};
use querierd_igmp::instance::spawn_protocol_task;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_appender::rolling;
use tracing_subscriber::Layer;
use tracing_subscriber::prelude::*;

fn init_tracing(config: &config::Logging) {
    // Enable logging to a file.
    let file = config.file.enabled.then(|| {
        let file_appender = match config.file.rotation {
            LoggingFileRotation::Never => {
                rolling::never(&config.file.dir, &config.file.name)
            }
            LoggingFileRotation::Hourly => {
                rolling::hourly(&config.file.dir, &config.file.name)
            }
            LoggingFileRotation::Daily => {
                rolling::daily(&config.file.dir, &config.file.name)
            }
        };

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(false)
            .with_ansi(false);
        let layer = match config.file.style {
            LoggingFmtStyle::Compact => layer.compact().boxed(),
            LoggingFmtStyle::Full => layer.boxed(),
            LoggingFmtStyle::Json => layer.json().boxed(),
            LoggingFmtStyle::Pretty => layer.pretty().boxed(),
        };
        layer.with_filter(LevelFilter::from_level(tracing::Level::TRACE))
    });

    // Enable logging to stdout.
    let stdout = config.stdout.enabled.then(|| {
        let layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_ansi(config.stdout.colors);
        let layer = match config.stdout.style {
            LoggingFmtStyle::Compact => layer.compact().boxed(),
            LoggingFmtStyle::Full => layer.boxed(),
            LoggingFmtStyle::Json => layer.json().boxed(),
            LoggingFmtStyle::Pretty => layer.pretty().boxed(),
        };
        layer.with_filter(LevelFilter::from_level(tracing::Level::TRACE))
    });

    // Configure the tracing fmt layer.
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive("querierd=debug".parse().unwrap())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(env_filter)
        .with(file)
        .with(stdout)
        .init();
}

fn privdrop(user: &str) -> nix::Result<()> {
    // Preserve set of permitted capabilities upon privdrop.
    capctl::prctl::set_securebits(capctl::prctl::Secbits::KEEP_CAPS).unwrap();

    // Drop to unprivileged user and group.
    if let Some(user) = User::from_name(user)? {
        nix::unistd::setgroups(&[user.gid])?;
        nix::unistd::setresgid(user.gid, user.gid, user.gid)?;
        nix::unistd::setresuid(user.uid, user.uid, user.uid)?;
    } else {
        error!(name = %user, "failed to find user");
        std::process::exit(1);
    }

    // Set permitted capabilities.
    let mut caps = caps::CapState::empty();
    for cap in [caps::Cap::NET_ADMIN, caps::Cap::NET_RAW] {
        caps.permitted.add(cap);
    }
    if let Err(error) = caps.set_current() {
        error!(%error, "failed to set permitted capabilities");
    }

    Ok(())
}

// Runs the daemon until SIGINT or SIGTERM; SIGHUP tears everything down and
// starts over with a freshly loaded configuration.
async fn run(
    config_file: Option<&str>,
    mut config: Config,
    ipc_listener: StdUnixListener,
) {
    let ipc_listener = UnixListener::from_std(ipc_listener)
        .expect("failed to register IPC socket");
    let ipc_listener = Arc::new(ipc_listener);

    let mut sighup = signal(SignalKind::hangup())
        .expect("failed to register signal handler");
    let mut sigint = signal(SignalKind::interrupt())
        .expect("failed to register signal handler");
    let mut sigterm = signal(SignalKind::terminate())
        .expect("failed to register signal handler");

    loop {
        // Internal event bus.
        let (ibus_tx, ibus_rx) = mpsc::unbounded_channel();

        // Start the IGMP instance.
        let instance_task = match spawn_protocol_task(
            "querierd".to_owned(),
            config.igmp.clone(),
            ibus_rx,
        ) {
            Ok(task) => task,
            Err(error) => {
                error!(%error, "failed to start IGMP instance");
                std::process::exit(1);
            }
        };

        // Start base tasks: kernel interface/address monitor and the IPC
        // status socket.
        let config_ifaces = config.igmp.interfaces.keys().cloned().collect();
        let netlink_task =
            tokio::spawn(netlink::start(ibus_tx.clone(), config_ifaces));
        let ipc_task =
            tokio::spawn(ipc::serve(ipc_listener.clone(), ibus_tx.clone()));

        // Wait for a signal.
        let restart = tokio::select! {
            _ = sighup.recv() => true,
            _ = sigint.recv() => false,
            _ = sigterm.recv() => false,
        };

        // Closing the event bus tells the instance to tear down in order.
        netlink_task.abort();
        ipc_task.abort();
        drop(ibus_tx);
        let _ = instance_task.await;

        if !restart {
            info!("shutting down");
            break;
        }

        info!("restarting");
        config = Config::load(config_file);
    }
}

// ===== main =====

fn main() {
    // Parse command-line parameters.
    let matches = App::new("IGMP querier daemon")
        .version(clap::crate_version!())
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("file")
                .help("Specify an alternative configuration file."),
        )
        .get_matches();

    // Read configuration file.
    let config_file = matches.value_of("config");
    let config = Config::load(config_file);

    // Check for root privileges.
    if !Uid::effective().is_root() {
        eprintln!("need privileged user");
        std::process::exit(1);
    }

    // Initialize tracing.
    init_tracing(&config.logging);

    // Bind the IPC socket while still privileged.
    let _ = std::fs::remove_file(&config.ipc_path);
    let ipc_listener = StdUnixListener::bind(&config.ipc_path)
        .expect("failed to bind IPC socket");
    ipc_listener
        .set_nonblocking(true)
        .expect("failed to bind IPC socket");

    // Drop privileges.
    if let Err(error) = privdrop(&config.user) {
        error!(%error, "failed to drop root privileges");
        std::process::exit(1);
    }

    // Set panic handler to abort the process if any child task panics.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    // We're ready to go!
    info!("starting up");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create async runtime")
        .block_on(run(config_file, config, ipc_listener));
}
