#![doc = include_str!("../README.md")]

pub mod frame;
pub mod memsink;
pub mod metrics;
pub mod queue;
pub mod ring;

pub mod prelude {
    pub use crate::{
        frame::{FourCc, FrameView, RawFrame, floor_seconds, now_monotonic},
        memsink::{MemSinkClient, MemSinkServer, SinkConfig, SinkError},
        metrics::{StageMetrics, StreamTelemetry},
        queue::{BoundedRx, BoundedTx, RecvOutcome, SendOutcome, bounded},
        ring::{RingConsumer, RingProducer, SlotReader, SlotWriter, frame_ring},
    };
}
