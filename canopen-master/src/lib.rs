//! # canopen-master
//!
//! A master-side CANopen protocol engine: classifies inbound traffic by
//! COB-ID, drives SDO client transfers (expedited and segmented, one in
//! flight per node), tracks per-node NMT state from heartbeats, and
//! routes PDO frames to registered decoders.
//!
//! This crate is a bus client only: it keeps no object dictionary and
//! never answers requests on behalf of a device. Higher-level tooling
//! (monitors, configuration utilities) builds on the [`engine::Engine`]
//! facade.
//!
//! ```no_run
//! use canopen_master::{Engine, EngineConfig};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig { interface: "vcan0".into(), ..Default::default() };
//! let mut engine = Engine::open(config).await?;
//!
//! let device_type = engine.sdo_read(4, 0x1000, 0x00).await?;
//! engine.sdo_write_value(4, 0x1017, 0x00, 1000u16).await?;
//! engine.nmt_start(0)?;
//!
//! engine.close().await;
//! # Ok(())
//! # }
//! ```

mod dispatch;
mod nmt;
mod pdo;
mod sdo;

pub mod config;
pub mod engine;
pub mod transport;

pub use config::EngineConfig;
pub use dispatch::{BusEvent, EventKind};
pub use engine::{CanOpenError, Engine};

// Protocol types callers need alongside the engine.
pub use canopen_common::{Bitrate, Frame, FrameClass, NmtStatus, SdoError};
