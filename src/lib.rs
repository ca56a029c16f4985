//! Camera exposure acquisition engine.
//!
//! This library runs camera exposures against an abstract hardware surface
//! ([`hardware::CameraHardware`]). It owns the exposure state machine, the
//! cancellable background worker with its live countdown and bounded restarts,
//! frame buffer geometry and colour plane conversion, an independent cooler
//! regulation loop and a per-axis guide pulse scheduler.
//!
//! Everything for one camera hangs off a [`session::CameraSession`]:
//!
//! ```rust,ignore
//! let session = CameraSession::connect(hardware, sensor, EngineConfig::load(None)?).await?;
//! session.controller().on_complete(|outcome| println!("{:?}", outcome.state()));
//! session.start_exposure(2.5, FrameKind::Light)?;
//! ```

pub mod config;
pub mod controls;
pub mod error;
pub mod error_recovery;
pub mod exposure;
pub mod frame;
pub mod guide;
pub mod hardware;
pub mod logging;
pub mod observable;
pub mod session;
pub mod temperature;

pub use error::{EngineError, EngineResult};
