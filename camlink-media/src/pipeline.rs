//! Threaded decode and write stages for one stream
//!
//! ```text
//! submit() -> [decode queue] -> decode thread -> [write queue] -> write thread -> sink
//!                                     |                               |
//!                                     +---------- PipelineEvent ------+--> session
//! ```
//!
//! Both queues are bounded and never block the producer. Events are tagged
//! with the pipeline generation so a session can ignore reports from a
//! pipeline it has already replaced.
//!
//! The write thread owns the device writer. Release raises a flag and waits
//! at most the write timeout for that thread; a thread still stuck in a
//! device write is detached and releases the device once the write returns.

use crate::backend::MediaBackend;
use crate::decoder::{DecodeConfig, DecodeOutcome, DecodePipeline, DecodeStats};
use crate::error::{MediaError, MediaResult};
use crate::image::I420Image;
use crate::queue::{PushOutcome, StageQueue};
use crate::writer::{DeviceWriter, WriterConfig, WriterStats};
use camlink_core::Frame;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// Report from a pipeline worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineEvent {
    /// Generation of the pipeline that raised the event
    pub generation: u64,
    /// What happened
    pub kind: PipelineEventKind,
}

/// Kinds of pipeline reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEventKind {
    /// Consecutive decode errors reached the threshold
    DecoderFaulted,
    /// The decoder could not be created
    DecoderUnavailable {
        /// Failure reason
        reason: String,
    },
    /// The output device could not be configured
    SinkFailed {
        /// Failure reason
        reason: String,
    },
}

/// Combined pipeline counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Decode stage counters
    pub decode: DecodeStats,
    /// Write stage counters
    pub writer: WriterStats,
    /// Delta frames evicted from the decode queue
    pub decode_queue_evictions: u64,
    /// Pictures evicted from the write queue
    pub write_queue_evictions: u64,
    /// Critical frames refused by a full decode queue
    pub decode_queue_overflows: u64,
}

impl PipelineStats {
    /// Frames lost to backpressure anywhere in the pipeline
    pub fn frames_dropped(&self) -> u64 {
        self.decode_queue_evictions + self.write_queue_evictions + self.writer.frames_dropped
    }
}

#[derive(Default)]
struct Shared {
    decode: DecodeStats,
    writer: WriterStats,
    decode_queue_evictions: u64,
    write_queue_evictions: u64,
    decode_queue_overflows: u64,
}

/// Set once by a worker on its way out
#[derive(Default)]
struct ExitSignal {
    exited: Mutex<bool>,
    cond: Condvar,
}

impl ExitSignal {
    fn notify(&self) {
        *self.exited.lock() = true;
        self.cond.notify_all();
    }

    /// Whether the worker exited within `timeout`
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut exited = self.exited.lock();
        while !*exited {
            if self.cond.wait_until(&mut exited, deadline).timed_out() {
                break;
            }
        }
        *exited
    }
}

/// Decode and write workers for one stream
pub struct MediaPipeline {
    generation: u64,
    decode_queue: Arc<StageQueue<Frame>>,
    write_queue: Arc<StageQueue<I420Image>>,
    released: Arc<AtomicBool>,
    write_exit: Arc<ExitSignal>,
    write_timeout: Duration,
    shared: Arc<Mutex<Shared>>,
    decode_worker: Option<JoinHandle<()>>,
    write_worker: Option<JoinHandle<()>>,
}

impl MediaPipeline {
    /// Create the sink and start both worker threads
    pub fn spawn(
        generation: u64,
        backend: Arc<dyn MediaBackend>,
        decode_config: DecodeConfig,
        writer_config: WriterConfig,
        events: UnboundedSender<PipelineEvent>,
    ) -> MediaResult<Self> {
        let sink = backend.create_sink(&writer_config)?;
        let decode_queue = Arc::new(StageQueue::new(decode_config.queue_capacity));
        let write_queue = Arc::new(StageQueue::new(writer_config.queue_capacity));
        let released = Arc::new(AtomicBool::new(false));
        let write_exit = Arc::new(ExitSignal::default());
        let shared = Arc::new(Mutex::new(Shared::default()));
        let write_timeout = writer_config.write_timeout;

        let mut pipeline = Self {
            generation,
            decode_queue: decode_queue.clone(),
            write_queue: write_queue.clone(),
            released: released.clone(),
            write_exit: write_exit.clone(),
            write_timeout,
            shared: shared.clone(),
            decode_worker: None,
            write_worker: None,
        };

        let decode_worker = DecodeWorker {
            generation,
            backend,
            config: decode_config,
            input: decode_queue,
            output: write_queue.clone(),
            shared: shared.clone(),
            events: events.clone(),
        };
        let write_worker = WriteWorker {
            generation,
            input: write_queue,
            writer: DeviceWriter::new(sink, writer_config),
            released,
            exit: write_exit,
            shared,
            events,
        };

        // `pipeline` closes its queues if a spawn below fails
        pipeline.decode_worker = Some(
            std::thread::Builder::new()
                .name(format!("camlink-decode-{}", generation))
                .spawn(move || decode_worker.run())?,
        );
        pipeline.write_worker = Some(
            std::thread::Builder::new()
                .name(format!("camlink-write-{}", generation))
                .spawn(move || write_worker.run())?,
        );

        info!("Media pipeline {} started", generation);
        Ok(pipeline)
    }

    /// Hand a forwarded frame to the decode stage without blocking
    pub fn submit(&self, frame: Frame) -> PushOutcome {
        let outcome = self.decode_queue.push(frame);
        match outcome {
            PushOutcome::EvictedOldest | PushOutcome::DroppedIncoming => {
                self.shared.lock().decode_queue_evictions += 1;
            }
            PushOutcome::Overflow => {
                self.shared.lock().decode_queue_overflows += 1;
            }
            PushOutcome::Queued | PushOutcome::Closed => {}
        }
        outcome
    }

    /// Generation this pipeline was spawned with
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Snapshot of all counters
    pub fn stats(&self) -> PipelineStats {
        let shared = self.shared.lock();
        PipelineStats {
            decode: shared.decode.clone(),
            writer: shared.writer.clone(),
            decode_queue_evictions: shared.decode_queue_evictions,
            write_queue_evictions: shared.write_queue_evictions,
            decode_queue_overflows: shared.decode_queue_overflows,
        }
    }

    /// Stop both stages, have the sink blanked and closed, and join the workers
    ///
    /// Waits at most the write timeout for the write thread. The decode thread
    /// is joined after the device is freed.
    pub fn release(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.decode_queue.close();
        self.write_queue.close();

        if let Some(worker) = self.write_worker.take() {
            if self.write_exit.wait(self.write_timeout) {
                if worker.join().is_err() {
                    error!("Media pipeline {} write worker panicked", self.generation);
                }
            } else {
                // dropping the handle detaches the thread
                warn!(
                    "Media pipeline {} write still blocked after {:?}, device closes when it returns",
                    self.generation, self.write_timeout
                );
            }
        }
        if let Some(worker) = self.decode_worker.take() {
            if worker.join().is_err() {
                error!("Media pipeline {} decode worker panicked", self.generation);
            }
        }
        info!("Media pipeline {} released", self.generation);
    }
}

impl Drop for MediaPipeline {
    fn drop(&mut self) {
        self.release();
    }
}

struct DecodeWorker {
    generation: u64,
    backend: Arc<dyn MediaBackend>,
    config: DecodeConfig,
    input: Arc<StageQueue<Frame>>,
    output: Arc<StageQueue<I420Image>>,
    shared: Arc<Mutex<Shared>>,
    events: UnboundedSender<PipelineEvent>,
}

impl DecodeWorker {
    fn run(self) {
        let decoder = match self.backend.create_decoder() {
            Ok(decoder) => decoder,
            Err(e) => {
                error!("Decoder unavailable: {}", e);
                self.emit(PipelineEventKind::DecoderUnavailable {
                    reason: e.to_string(),
                });
                return;
            }
        };
        let mut pipeline = DecodePipeline::new(decoder, self.config.clone());

        while let Some((frame, _)) = self.input.pop() {
            let outcome = pipeline.process(&frame);
            let mut evicted = false;
            match outcome {
                DecodeOutcome::Picture(image) => {
                    evicted = matches!(
                        self.output.push(image),
                        PushOutcome::EvictedOldest | PushOutcome::DroppedIncoming
                    );
                }
                DecodeOutcome::Faulted => self.emit(PipelineEventKind::DecoderFaulted),
                DecodeOutcome::Configured
                | DecodeOutcome::Buffered
                | DecodeOutcome::Failed
                | DecodeOutcome::Discarded => {}
            }

            let mut shared = self.shared.lock();
            shared.decode = pipeline.stats().clone();
            if evicted {
                shared.write_queue_evictions += 1;
            }
        }
        debug!("Decode worker {} exiting", self.generation);
    }

    fn emit(&self, kind: PipelineEventKind) {
        let _ = self.events.send(PipelineEvent {
            generation: self.generation,
            kind,
        });
    }
}

struct WriteWorker {
    generation: u64,
    input: Arc<StageQueue<I420Image>>,
    writer: DeviceWriter,
    released: Arc<AtomicBool>,
    exit: Arc<ExitSignal>,
    shared: Arc<Mutex<Shared>>,
    events: UnboundedSender<PipelineEvent>,
}

impl WriteWorker {
    fn run(mut self) {
        while let Some((image, queued_at)) = self.input.pop() {
            if self.released.load(Ordering::Acquire) {
                break;
            }
            if queued_at.elapsed() > self.writer.write_timeout() {
                self.writer.record_dropped();
                self.publish();
                continue;
            }
            let result = self.writer.write(&image);
            self.publish();
            match result {
                Ok(()) => {}
                Err(e @ MediaError::DeviceConfigurationFailed { .. }) => {
                    error!("Output device unusable: {}", e);
                    let _ = self.events.send(PipelineEvent {
                        generation: self.generation,
                        kind: PipelineEventKind::SinkFailed {
                            reason: e.to_string(),
                        },
                    });
                    break;
                }
                // counted by the writer; only this frame is lost
                Err(_) => {}
            }
        }
        self.writer.release();
        self.publish();
        self.exit.notify();
        debug!("Write worker {} exiting", self.generation);
    }

    fn publish(&self) {
        self.shared.lock().writer = self.writer.stats().clone();
    }
}
