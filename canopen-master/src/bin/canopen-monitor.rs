//! Passive bus monitor: opens an interface, subscribes to the engine's
//! event streams and logs traffic as it arrives. Optionally issues an
//! NMT reset-all on startup to provoke boot-up announcements.
//!
//! ```bash
//! RUST_LOG=info cargo run --bin canopen-monitor -- --interface vcan0 --reset
//! ```

use canopen_master::transport::SocketCanTransport;
use canopen_master::{BusEvent, Engine, EngineConfig, EventKind};

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let interface = args
        .iter()
        .position(|arg| arg == "--interface")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_else(|| "vcan0".to_string());
    let reset = args.iter().any(|arg| arg == "--reset");

    let available = SocketCanTransport::enumerate();
    if !available.is_empty() {
        log::info!("CAN interfaces: {}", available.join(", "));
    }

    let config = EngineConfig { interface: interface.clone(), ..Default::default() };
    let mut engine = match Engine::open(config).await {
        Ok(engine) => engine,
        Err(err) => {
            log::error!("cannot open {}: {}", interface, err);
            std::process::exit(1);
        }
    };

    let mut nmt_rx = engine.subscribe(EventKind::NmtCommand).expect("engine running");
    let mut ec_rx = engine.subscribe(EventKind::NmtErrorControl).expect("engine running");
    let mut sdo_rx = engine.subscribe(EventKind::Sdo).expect("engine running");
    let mut emcy_rx = engine.subscribe(EventKind::Emcy).expect("engine running");
    let mut pdo_rx = engine.subscribe(EventKind::PdoBatch).expect("engine running");

    if reset {
        log::info!("sending NMT reset to all nodes");
        if let Err(err) = engine.nmt_reset_node(0) {
            log::error!("reset failed: {}", err);
        }
    }

    log::info!("listening on {} (ctrl-c to exit)", interface);

    loop {
        tokio::select! {
            Some(BusEvent::Frame(frame)) = nmt_rx.recv() => log::info!("NMT   : {}", frame),
            Some(BusEvent::Frame(frame)) = ec_rx.recv() => log::info!("NMTEC : {}", frame),
            Some(BusEvent::Frame(frame)) = sdo_rx.recv() => log::info!("SDO   : {}", frame),
            Some(BusEvent::Frame(frame)) = emcy_rx.recv() => log::warn!("EMCY  : {}", frame),
            Some(BusEvent::PdoBatch(frames)) = pdo_rx.recv() => {
                for frame in frames {
                    log::info!("PDO   : {}", frame);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.close().await;
}
