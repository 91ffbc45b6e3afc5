use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use visor_capture::HwBuffer;
use visor_codec::StillEncoder;
use visor_core::prelude::{FrameView, RawFrame, StageMetrics, now_monotonic};

/// Input of an encode job. Live capture goes through `Hw`; synthetic frames
/// can be fed as owned `Raw` payloads.
pub enum JobInput {
    Hw(HwBuffer),
    Raw(RawFrame),
    Empty,
}

impl JobInput {
    fn view(&self) -> Option<FrameView<'_>> {
        match self {
            JobInput::Hw(hw) => Some(hw.view()),
            JobInput::Raw(frame) => Some(frame.as_view()),
            JobInput::Empty => None,
        }
    }
}

/// One encode unit: input buffer, output frame, and the completion flags the
/// controller branches on. Exactly one of expose / drop-failed / drop-late
/// happens per completed job.
pub struct EncodeJob {
    pub input: JobInput,
    pub dest: RawFrame,
    pub failed: bool,
    pub timely: bool,
}

impl Default for EncodeJob {
    fn default() -> Self {
        Self {
            input: JobInput::Empty,
            dest: RawFrame::new(),
            failed: false,
            timely: false,
        }
    }
}

impl EncodeJob {
    /// Reuse this job (and its output allocation) for a fresh hardware
    /// buffer.
    pub fn reset_with_hw(&mut self, hw: HwBuffer) {
        self.input = JobInput::Hw(hw);
        self.failed = false;
        self.timely = false;
    }

    /// Take the hardware buffer out for release, if the input held one.
    pub fn take_hw(&mut self) -> Option<HwBuffer> {
        match std::mem::replace(&mut self.input, JobInput::Empty) {
            JobInput::Hw(hw) => Some(hw),
            other => {
                self.input = other;
                None
            }
        }
    }
}

/// An idle worker as returned by [`WorkerPool::wait`], carrying its previous
/// job for harvest and reuse.
pub struct ReadyWorker {
    pub index: usize,
    pub job: Option<EncodeJob>,
    /// Duration of the worker's last encode, feeding fluency pacing.
    pub last_job_secs: f64,
}

struct Slot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

#[derive(Default)]
struct SlotState {
    pending: Option<EncodeJob>,
    stop: bool,
}

struct WorkerHandle {
    name: String,
    slot: Arc<Slot>,
    thread: Option<JoinHandle<()>>,
}

struct Ready {
    index: usize,
    job: Option<EncodeJob>,
    last_job_secs: f64,
}

/// Pool of still-image encode workers.
///
/// The controller cycle is: [`WorkerPool::wait`] for any idle worker,
/// harvest its completed job, then either [`WorkerPool::assign`] the next
/// buffer or [`WorkerPool::put_back`] the idle token when pacing skips the
/// frame.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    ready_tx: mpsc::Sender<Ready>,
    ready_rx: mpsc::Receiver<Ready>,
    approx_job_time: f64,
    desired_interval: f64,
    metrics: StageMetrics,
}

impl WorkerPool {
    /// Spawn `n_workers` threads around a shared encoder. `desired_fps`
    /// bounds the fluency delay from below; `job_timeout` is the deadline
    /// after which a finished encode is dropped as late.
    pub fn new(
        n_workers: usize,
        encoder: Arc<dyn StillEncoder>,
        desired_fps: u32,
        job_timeout: Duration,
    ) -> Self {
        let n_workers = n_workers.max(1);
        let (ready_tx, ready_rx) = mpsc::channel();
        let timeout_secs = job_timeout.as_secs_f64();
        let mut workers = Vec::with_capacity(n_workers);
        for index in 0..n_workers {
            let name = format!("jpeg-{index}");
            let slot = Arc::new(Slot {
                state: Mutex::new(SlotState::default()),
                cond: Condvar::new(),
            });
            let thread = {
                let slot = slot.clone();
                let encoder = encoder.clone();
                let ready_tx = ready_tx.clone();
                let name = name.clone();
                thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || {
                        worker_main(index, &name, slot, encoder, ready_tx, timeout_secs)
                    })
                    .ok()
            };
            workers.push(WorkerHandle { name, slot, thread });
        }
        Self {
            workers,
            ready_tx,
            ready_rx,
            approx_job_time: 0.0,
            desired_interval: if desired_fps > 0 {
                1.0 / desired_fps as f64
            } else {
                0.0
            },
            metrics: StageMetrics::default(),
        }
    }

    /// Block until any worker is idle.
    pub fn wait(&mut self) -> ReadyWorker {
        loop {
            match self.ready_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(ready) => {
                    if ready.last_job_secs > 0.0 {
                        self.metrics.record(Duration::from_secs_f64(ready.last_job_secs));
                    }
                    return ReadyWorker {
                        index: ready.index,
                        job: ready.job,
                        last_job_secs: ready.last_job_secs,
                    };
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    // All workers died; hand the caller an inert token so the
                    // outer loop can observe its stop flag.
                    return ReadyWorker {
                        index: 0,
                        job: None,
                        last_job_secs: 0.0,
                    };
                }
            }
        }
    }

    /// Hand a worker its next job; it runs asynchronously.
    pub fn assign(&self, worker: ReadyWorker, job: EncodeJob) {
        let Some(handle) = self.workers.get(worker.index) else {
            return;
        };
        let mut state = handle.slot.state.lock();
        state.pending = Some(job);
        handle.slot.cond.notify_one();
        debug!(worker = %handle.name, "job assigned");
    }

    /// Return an idle token without assigning work, keeping the worker
    /// eligible for the next [`WorkerPool::wait`].
    pub fn put_back(&self, worker: ReadyWorker) {
        let _ = self.ready_tx.send(Ready {
            index: worker.index,
            job: worker.job,
            last_job_secs: worker.last_job_secs,
        });
    }

    /// Pacing term: how long the controller should wait before grabbing the
    /// next frame so the slowest worker does not dominate latency.
    pub fn fluency_delay(&mut self, last_job_secs: f64) -> f64 {
        self.approx_job_time = self.approx_job_time * 0.9 + last_job_secs * 0.1;
        let min_delay = self.approx_job_time / self.workers.len() as f64;
        if self.desired_interval > 0.0 && self.desired_interval > min_delay {
            self.desired_interval
        } else {
            min_delay
        }
    }

    /// Encode-stage timing metrics.
    pub fn metrics(&self) -> StageMetrics {
        self.metrics.clone()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in &self.workers {
            let mut state = handle.slot.state.lock();
            state.stop = true;
            handle.slot.cond.notify_one();
        }
        for handle in &mut self.workers {
            if let Some(thread) = handle.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

fn worker_main(
    index: usize,
    name: &str,
    slot: Arc<Slot>,
    encoder: Arc<dyn StillEncoder>,
    ready_tx: mpsc::Sender<Ready>,
    timeout_secs: f64,
) {
    debug!(worker = name, "worker started");
    // Announce idleness so the controller can make the first assignment.
    if ready_tx
        .send(Ready {
            index,
            job: None,
            last_job_secs: 0.0,
        })
        .is_err()
    {
        return;
    }
    loop {
        let mut job = {
            let mut state = slot.state.lock();
            while state.pending.is_none() && !state.stop {
                slot.cond.wait(&mut state);
            }
            if state.stop {
                break;
            }
            match state.pending.take() {
                Some(job) => job,
                None => continue,
            }
        };

        let start = now_monotonic();
        job.failed = match job.input.view() {
            Some(view) => match encoder.encode(view, &mut job.dest) {
                Ok(()) => false,
                Err(e) => {
                    warn!(worker = name, error = %e, code = e.code(), "encode failed");
                    true
                }
            },
            None => true,
        };
        let elapsed = now_monotonic() - start;
        job.timely = elapsed <= timeout_secs;

        if ready_tx
            .send(Ready {
                index,
                job: Some(job),
                last_job_secs: elapsed,
            })
            .is_err()
        {
            break;
        }
    }
    debug!(worker = name, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use visor_codec::{CodecError, EncoderDescriptor, EncoderKind};
    use visor_core::prelude::FourCc;

    struct FakeEncoder {
        descriptor: EncoderDescriptor,
        fail: bool,
        delay: Duration,
    }

    impl FakeEncoder {
        fn new(fail: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                descriptor: EncoderDescriptor {
                    kind: EncoderKind::Cpu,
                    input: FourCc::RGB24,
                    output: FourCc::JPEG,
                    name: "jpeg",
                    impl_name: "fake",
                },
                fail,
                delay,
            })
        }
    }

    impl StillEncoder for FakeEncoder {
        fn descriptor(&self) -> &EncoderDescriptor {
            &self.descriptor
        }

        fn encode(&self, src: FrameView<'_>, dest: &mut RawFrame) -> Result<(), CodecError> {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            if self.fail {
                return Err(CodecError::Codec("forced failure".into()));
            }
            dest.copy_from_view(src);
            Ok(())
        }
    }

    fn raw_job(payload: &[u8]) -> EncodeJob {
        let mut frame = RawFrame::new();
        frame.set_geometry(2, 2, 6, FourCc::RGB24, 30.0);
        frame.online = true;
        frame.assign(payload);
        EncodeJob {
            input: JobInput::Raw(frame),
            ..EncodeJob::default()
        }
    }

    fn wait_for_completion(pool: &mut WorkerPool) -> ReadyWorker {
        loop {
            let ready = pool.wait();
            if ready.job.is_some() {
                return ready;
            }
            // Idle announcement from a worker that never ran a job yet.
            pool.put_back(ready);
        }
    }

    #[test]
    fn assign_and_harvest() {
        let mut pool = WorkerPool::new(2, FakeEncoder::new(false, Duration::ZERO), 0, Duration::from_secs(1));
        let ready = pool.wait();
        assert!(ready.job.is_none());
        pool.assign(ready, raw_job(&[1u8; 12]));

        let done = wait_for_completion(&mut pool);
        let job = done.job.unwrap();
        assert!(!job.failed);
        assert!(job.timely);
        assert_eq!(job.dest.payload(), &[1u8; 12]);
    }

    #[test]
    fn failed_jobs_are_flagged() {
        let mut pool = WorkerPool::new(1, FakeEncoder::new(true, Duration::ZERO), 0, Duration::from_secs(1));
        let ready = pool.wait();
        pool.assign(ready, raw_job(&[0u8; 12]));
        let done = wait_for_completion(&mut pool);
        assert!(done.job.unwrap().failed);
    }

    #[test]
    fn late_jobs_are_flagged() {
        let mut pool = WorkerPool::new(
            1,
            FakeEncoder::new(false, Duration::from_millis(20)),
            0,
            Duration::from_millis(1),
        );
        let ready = pool.wait();
        pool.assign(ready, raw_job(&[0u8; 12]));
        let done = wait_for_completion(&mut pool);
        let job = done.job.unwrap();
        assert!(!job.failed);
        assert!(!job.timely);
    }

    #[test]
    fn fluency_delay_tracks_job_time_and_fps_floor() {
        let mut pool = WorkerPool::new(2, FakeEncoder::new(false, Duration::ZERO), 10, Duration::from_secs(1));
        // Short jobs: the 100 ms desired interval dominates.
        let delay = pool.fluency_delay(0.001);
        assert!((delay - 0.1).abs() < 1e-9, "delay {delay}");

        // Long jobs push the EMA past the interval floor.
        let mut delay = 0.0;
        for _ in 0..200 {
            delay = pool.fluency_delay(1.0);
        }
        assert!(delay > 0.1, "delay {delay}");
    }

    #[test]
    fn put_back_keeps_worker_available() {
        let mut pool = WorkerPool::new(1, FakeEncoder::new(false, Duration::ZERO), 0, Duration::from_secs(1));
        let ready = pool.wait();
        pool.put_back(ready);
        let again = pool.wait();
        assert_eq!(again.index, 0);
    }
}
