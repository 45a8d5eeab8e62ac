//! Out-of-process audio workers.
//!
//! A parent spawns one worker process per track. The worker decodes the track with an external
//! media engine and writes raw audio into a named FIFO, while a pair of pipes carries control
//! records both ways: the create request, live updates (seek, volume, effects), readiness and
//! shutdown.
//!
//! The parent side is [`supervisor::Supervisor`]. The worker side is [`worker::run`], entered
//! when [`spawn::am_spawned`] recognizes the process as a worker.

pub mod backtrace;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fifo;
pub mod logging;
pub mod panic;
pub mod protocol;
pub mod registry;
pub mod spawn;
pub mod supervisor;
pub mod worker;

mod util;

pub use error::Error;
