// Copyright (C) 2024 Laixer Equipment B.V.
// All rights reserved.
//
// This software may be modified and distributed under the terms
// of the included license.  See the LICENSE file for details.

use std::sync::Arc;

use clap::Parser;

use j1939::{Pgn, BROADCAST_ADDR};
use j1939_sock::{SockAddrJ1939, Socket, Stack, StaticDevices};

mod bus;
mod config;

#[derive(Parser)]
#[command(author = "Copyright (C) 2024 Laixer Equipment B.V.")]
#[command(version, propagate_version = true)]
#[command(about = "J1939 network simulator", long_about = None)]
struct Args {
    /// CAN network interface.
    #[arg(default_value = "vcan0")]
    interface: String,

    /// Milliseconds between status transmissions.
    #[arg(short, long, default_value_t = 100)]
    interval: u64,

    /// Stop after this many transmissions.
    #[arg(short, long)]
    count: Option<u64>,

    /// Daemonize the service.
    #[arg(long)]
    daemon: bool,

    /// Level of verbosity.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = config::SimConfig {
        interface: args.interface,
        interval: args.interval,
        count: args.count,
        stack: j1939_sock::StackConfig::default(),
    };

    let mut log_config = simplelog::ConfigBuilder::new();
    if args.daemon {
        log_config.set_time_level(log::LevelFilter::Off);
        log_config.set_thread_level(log::LevelFilter::Off);
    } else {
        log_config.set_time_offset_to_local().ok();
        log_config.set_time_format_rfc2822();
    }

    log_config.set_target_level(log::LevelFilter::Off);
    log_config.set_location_level(log::LevelFilter::Off);
    log_config.add_filter_ignore_str("mio");

    let log_level = if args.daemon {
        log::LevelFilter::Info
    } else {
        match args.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };

    let color_choice = if args.daemon {
        simplelog::ColorChoice::Never
    } else {
        simplelog::ColorChoice::Auto
    };

    simplelog::TermLogger::init(
        log_level,
        log_config.build(),
        simplelog::TerminalMode::Mixed,
        color_choice,
    )?;

    log::info!("Starting {}", env!("CARGO_BIN_NAME"));

    run(config).await
}

/// Engine speed broadcast, electronic engine controller 1.
const PGN_ENGINE_CONTROLLER: u32 = 0xF004;

async fn run(config: config::SimConfig) -> anyhow::Result<()> {
    let bus = bus::VirtualBus::new();

    // Two nodes on the same segment, each with its own stack.
    let announcer = node(&bus, 1, &config);
    let listener = node(&bus, 1, &config);

    announcer
        .bind(&SockAddrJ1939::new(1).with_addr(0x10))
        .await?;
    announcer.set_broadcast(true);

    listener
        .bind(&SockAddrJ1939::new(1).with_addr(0x20))
        .await?;
    listener.set_broadcast(true);

    tokio::spawn(async move {
        loop {
            match listener.recv().await {
                Ok(datagram) => {
                    log::info!(
                        "0x{:02X?} PGN {} Prio {}    {:02X?}",
                        datagram.source.addr,
                        datagram.source.pgn,
                        datagram.priority,
                        datagram.data.as_ref(),
                    );
                }
                Err(e) => {
                    log::error!("Failed to receive: {}", e);
                    break;
                }
            }
        }
    });

    let destination = SockAddrJ1939::new(0)
        .with_addr(BROADCAST_ADDR)
        .with_pgn(Pgn::new(PGN_ENGINE_CONTROLLER));

    let mut interval = tokio::time::interval(std::time::Duration::from_millis(config.interval));
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let rpm: u16 = 800 + ((sent % 100) as u16 * 13);
                let payload = [
                    0xFF,
                    0xFF,
                    0xFF,
                    (rpm * 8).to_le_bytes()[0],
                    (rpm * 8).to_le_bytes()[1],
                    0xFF,
                    0xFF,
                    0xFF,
                ];

                if let Err(e) = announcer.send_to(&payload, &destination).await {
                    log::error!("Failed to send: {}", e);
                }

                sent += 1;
                if config.count.is_some_and(|count| sent >= count) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Termination requested");
                break;
            }
        }
    }

    announcer.close().await;

    Ok(())
}

fn node(bus: &Arc<bus::VirtualBus>, ifindex: u32, config: &config::SimConfig) -> Socket {
    let devices = Arc::new(StaticDevices::new());
    let stack = Stack::with_config(
        devices.clone(),
        Arc::new(bus::NoTransport),
        config.stack.clone(),
    );

    devices.insert(bus::VirtualBus::attach(bus, ifindex, &config.interface, &stack));

    Socket::open(&stack)
}
