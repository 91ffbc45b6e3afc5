#![doc = include_str!("../README.md")]

pub use visor_capture as capture;
pub use visor_codec as codec;
pub use visor_core as core;
pub use visor_display as display;

pub mod config;
pub mod motion;
pub mod passthrough;
pub mod stream;
pub mod workers;

pub mod prelude {
    pub use crate::config::StreamTunables;
    pub use crate::motion::MotionStream;
    pub use crate::passthrough::{Passthrough, PassthroughHandle};
    pub use crate::stream::{Stream, StreamBuilder, StreamHandle};
    pub use crate::workers::{EncodeJob, JobInput, ReadyWorker, WorkerPool};
    pub use visor_capture::prelude::*;
    pub use visor_codec::prelude::*;
    #[allow(unused_imports)]
    pub use visor_core::prelude::*;
    pub use visor_display::prelude::*;
}
