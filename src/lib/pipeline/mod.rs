use crossbeam::atomic::AtomicCell;
use crossbeam::channel::{self, Receiver, SendError, Sender};
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::config::PipelineSettings;
use crate::radar::cluster::Clusterer;
use crate::radar::{ClusteredObject, Packet, RadarError, Statistics};
use crate::recording::{PacketSink, RunRecorder};
use crate::sensor::{ByteSource, SerialSensor};

pub mod shutdown;
pub mod worker;

use shutdown::{ShutdownTrigger, StageTracker};
pub use worker::{PipelineFlags, process_packet};
use worker::{ReadOutcome, WorkerContext, frame_loop, read_loop, save_loop, work_loop};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Configured,
    Running,
    Draining,
    Aborting,
}

impl PipelineState {
    fn is_active(self) -> bool {
        matches!(
            self,
            PipelineState::Running | PipelineState::Draining | PipelineState::Aborting
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// The internal channels of one run
struct Channels {
    raw: (Sender<Vec<u8>>, Receiver<Vec<u8>>),
    packets: (Sender<Packet>, Receiver<Packet>),
}

impl Channels {
    fn new() -> Self {
        Channels {
            raw: channel::unbounded(),
            packets: channel::unbounded(),
        }
    }
}

// Everything needed to wind down a run
struct Run {
    stop_reading: ShutdownTrigger,
    abort: ShutdownTrigger,
    reader: Option<JoinHandle<Option<ReadOutcome>>>,
    threads: Vec<JoinHandle<()>>,
    stages: Vec<StageTracker>,
    started: Instant,
}

impl Run {
    /// Waits for the stages in order, false when `deadline` passed first
    fn wait(&mut self, deadline: Instant) -> bool {
        for stage in self.stages.iter_mut() {
            if !stage.wait(deadline) {
                warn!("Timeout waiting for {} to finish", stage.name());
                return false;
            }
            debug!("{} finished", stage.name());
        }
        true
    }

    ///
    /// Joins the finished threads, returning the source and the first error
    /// of the run: what the source reported, else a panicked thread.
    ///
    fn join(mut self) -> (Option<Box<dyn ByteSource>>, Result<(), RadarError>) {
        let mut result = Ok(());
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("?").to_string();
            if handle.join().is_err() {
                error!("{}", RadarError::ThreadPanicked(name.clone()));
                if result.is_ok() {
                    result = Err(RadarError::ThreadPanicked(name));
                }
            }
        }
        let Some(reader) = self.reader.take() else {
            return (None, result);
        };
        match reader.join() {
            Ok(Some((source, read_result))) => (Some(source), read_result.and(result)),
            Ok(None) => (None, result),
            Err(_) => {
                error!("{}", RadarError::ThreadPanicked("reader".to_string()));
                (None, Err(RadarError::ThreadPanicked("reader".to_string())))
            }
        }
    }
}

struct Inner {
    settings: Option<PipelineSettings>,
    channels: Option<Channels>,
    source: Option<Box<dyn ByteSource>>,
    sink: Option<Arc<dyn PacketSink>>,
    cluster_tx: Option<Sender<ClusteredObject>>,
    run: Option<Run>,
}

///
/// Runs the sensor pipeline: a reader thread that owns the byte source, a
/// framer thread that cuts the byte stream into packets and a pool of
/// workers that turn packets into clusters.
///
/// Only one lifecycle call (`start`, `stop_and_process`, `abort`) is handled
/// at a time; a concurrent one fails with [`RadarError::Busy`].
///
/// Clusters are delivered to the receiver handed out by [`Pipeline::subscribe`]
/// in completion order, which is not the packet order when there is more
/// than one worker. Without a subscriber they are dropped.
///
pub struct Pipeline {
    state: AtomicCell<PipelineState>,
    interaction: Mutex<()>,
    inner: Mutex<Inner>,
    statistics: Arc<Statistics>,
    flags: Arc<PipelineFlags>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline {
            state: AtomicCell::new(PipelineState::Idle),
            interaction: Mutex::new(()),
            inner: Mutex::new(Inner {
                settings: None,
                channels: None,
                source: None,
                sink: None,
                cluster_tx: None,
                run: None,
            }),
            statistics: Arc::new(Statistics::new()),
            flags: Arc::new(PipelineFlags::default()),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state.load()
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn flags(&self) -> &PipelineFlags {
        &self.flags
    }

    pub fn settings(&self) -> Option<PipelineSettings> {
        self.lock_inner().settings.clone()
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    ///
    /// Sets the settings for the next run and prepares fresh channels.
    /// Refused while a run is active.
    ///
    pub fn configure(&self, settings: PipelineSettings) -> Result<(), RadarError> {
        let _interaction = self.interaction.try_lock().map_err(|_| RadarError::Busy)?;
        if self.state().is_active() {
            return Err(RadarError::AlreadyRunning);
        }
        settings.validate()?;

        let mut inner = self.lock_inner();
        info!(
            "Configured for the {} side with {} workers",
            settings.vehicle_side, settings.worker_count
        );
        inner.settings = Some(settings);
        inner.channels = Some(Channels::new());
        self.state.store(PipelineState::Configured);
        Ok(())
    }

    /// Bytes come from this source instead of the serial sensor named in
    /// the settings
    pub fn set_source(&self, source: Box<dyn ByteSource>) -> Result<(), RadarError> {
        if self.state().is_active() {
            return Err(RadarError::AlreadyRunning);
        }
        self.lock_inner().source = Some(source);
        Ok(())
    }

    /// Packets and clusters are saved here instead of a recorder in the
    /// output directory, when saving is on
    pub fn set_sink(&self, sink: Arc<dyn PacketSink>) -> Result<(), RadarError> {
        if self.state().is_active() {
            return Err(RadarError::AlreadyRunning);
        }
        self.lock_inner().sink = Some(sink);
        Ok(())
    }

    ///
    /// A new cluster stream, replacing any previous one. Takes effect at the
    /// next start.
    ///
    pub fn subscribe(&self) -> Result<Receiver<ClusteredObject>, RadarError> {
        if self.state().is_active() {
            return Err(RadarError::AlreadyRunning);
        }
        let (tx, rx) = channel::unbounded();
        self.lock_inner().cluster_tx = Some(tx);
        Ok(rx)
    }

    /// Ends the cluster stream once the workers holding it are gone
    pub fn unsubscribe(&self) {
        self.lock_inner().cluster_tx = None;
    }

    ///
    /// Opens the source and starts the threads of a run. On failure the
    /// pipeline is left `Idle` with its settings, ready for another start.
    ///
    pub fn start(&self) -> Result<(), RadarError> {
        let _interaction = self.interaction.try_lock().map_err(|_| RadarError::Busy)?;
        if self.state().is_active() {
            return Err(RadarError::AlreadyRunning);
        }

        let mut inner = self.lock_inner();
        let result = self.start_run(&mut inner);
        if let Err(e) = &result {
            error!("Cannot start pipeline: {}", e);
            self.state.store(PipelineState::Idle);
        }
        result
    }

    fn start_run(&self, inner: &mut Inner) -> Result<(), RadarError> {
        let settings = inner.settings.clone().ok_or(RadarError::NotConfigured)?;

        let sink = match (settings.is_saving, &inner.sink) {
            (false, _) => None,
            (true, Some(sink)) => Some(sink.clone()),
            (true, None) => Some(
                Arc::new(RunRecorder::new(&settings.output_directory)?) as Arc<dyn PacketSink>
            ),
        };
        let mut source = match inner.source.take() {
            Some(source) => source,
            None => Box::new(SerialSensor::new(&settings)?),
        };
        if let Err(e) = source.open() {
            error!("Cannot open {}: {}", source.name(), e);
            inner.source = Some(source);
            return Err(e);
        }

        self.statistics.reset();
        let channels = inner.channels.take().unwrap_or_else(Channels::new);
        let run = self.spawn_run(&settings, source, channels, sink, inner.cluster_tx.clone());
        let run = match run {
            Ok(run) => run,
            Err((e, source)) => {
                inner.source = Some(source);
                return Err(e);
            }
        };
        inner.run = Some(run);
        self.state.store(PipelineState::Running);
        info!("Pipeline running with {} workers", settings.worker_count);
        Ok(())
    }

    fn spawn_run(
        &self,
        settings: &PipelineSettings,
        source: Box<dyn ByteSource>,
        channels: Channels,
        sink: Option<Arc<dyn PacketSink>>,
        cluster_tx: Option<Sender<ClusteredObject>>,
    ) -> Result<Run, (RadarError, Box<dyn ByteSource>)> {
        let (stop_reading, stop_reading_signal) = ShutdownTrigger::new();
        let (abort, abort_signal) = ShutdownTrigger::new();
        let mut run = Run {
            stop_reading,
            abort,
            reader: None,
            threads: Vec::new(),
            stages: Vec::new(),
            started: Instant::now(),
        };
        let reader_stage = StageTracker::new("reader");
        let framer_stage = StageTracker::new("framer");
        let worker_stage = StageTracker::new("workers");
        let saver_stage = StageTracker::new("packet saver");

        let (raw_tx, raw_rx) = channels.raw;
        let (packet_tx, packet_rx) = channels.packets;
        let (save_tx, save_rx) = match sink {
            Some(_) => {
                let (tx, rx) = channel::unbounded();
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };
        // The reader gets the source only once every thread is running
        let (source_tx, source_rx) = channel::bounded::<Box<dyn ByteSource>>(1);

        self.flags.reading.store(true, Ordering::Release);
        self.flags.framing.store(true, Ordering::Release);
        self.flags
            .active_workers
            .store(settings.worker_count, Ordering::Release);

        let spawned = (|| -> Result<(), RadarError> {
            for id in 0..settings.worker_count {
                let ctx = WorkerContext {
                    clusterer: Clusterer::new(settings.vehicle_side),
                    packet_rx: packet_rx.clone(),
                    cluster_tx: cluster_tx.clone(),
                    save_tx: save_tx.clone(),
                    sink: sink.clone(),
                    abort: abort_signal.clone(),
                    statistics: self.statistics.clone(),
                    flags: self.flags.clone(),
                };
                let token = worker_stage.token();
                let handle = thread::Builder::new()
                    .name(format!("worker-{}", id))
                    .spawn(move || work_loop(id, ctx, token));
                match handle {
                    Ok(handle) => run.threads.push(handle),
                    Err(e) => return Err(e.into()),
                }
            }

            if let (Some(save_rx), Some(sink)) = (save_rx, sink.clone()) {
                let abort = abort_signal.clone();
                let statistics = self.statistics.clone();
                let token = saver_stage.token();
                run.threads.push(
                    thread::Builder::new()
                        .name("packet-saver".to_string())
                        .spawn(move || save_loop(save_rx, sink, abort, statistics, token))?,
                );
            }

            let abort = abort_signal.clone();
            let statistics = self.statistics.clone();
            let flags = self.flags.clone();
            let token = framer_stage.token();
            run.threads.push(
                thread::Builder::new()
                    .name("framer".to_string())
                    .spawn(move || frame_loop(raw_rx, packet_tx, abort, statistics, flags, token))?,
            );

            let abort = abort_signal.clone();
            let flags = self.flags.clone();
            let token = reader_stage.token();
            run.reader = Some(
                thread::Builder::new()
                    .name("reader".to_string())
                    .spawn(move || {
                        let source = source_rx.recv().ok()?;
                        Some(read_loop(source, raw_tx, stop_reading_signal, abort, flags, token))
                    })?,
            );
            Ok(())
        })();

        // The workers keep the only save sender; the saver ends after them
        drop(save_tx);

        let failure = match spawned {
            Ok(()) => match source_tx.send(source) {
                Ok(()) => None,
                Err(SendError(source)) => Some((RadarError::ChannelClosed("source"), source)),
            },
            Err(e) => Some((e, source)),
        };
        drop(source_tx);
        if let Some((e, source)) = failure {
            error!("Cannot start pipeline threads: {}", e);
            return Err((e, self.unwind(run, source)));
        }

        run.stages = vec![reader_stage, framer_stage, worker_stage, saver_stage];
        Ok(run)
    }

    /// Ends a run whose threads did not all start, stopping the source that
    /// none of them got to own
    fn unwind(&self, mut run: Run, mut source: Box<dyn ByteSource>) -> Box<dyn ByteSource> {
        run.stop_reading.trigger();
        run.abort.trigger();
        let _ = run.join();

        self.flags.reading.store(false, Ordering::Release);
        self.flags.framing.store(false, Ordering::Release);
        self.flags.active_workers.store(0, Ordering::Release);
        if let Err(e) = source.stop() {
            warn!("{}: stop failed: {}", source.name(), e);
        }
        source
    }

    ///
    /// Stops reading new bytes and waits until everything already received
    /// is framed, processed and saved. On a timeout the run is left
    /// draining; `abort` still ends it.
    ///
    /// A read or stop failure of the source during the run is returned once
    /// the pipeline is back to `Idle`.
    ///
    pub fn stop_and_process(&self) -> Result<(), RadarError> {
        let _interaction = self.interaction.try_lock().map_err(|_| RadarError::Busy)?;
        match self.state() {
            PipelineState::Running | PipelineState::Draining => {}
            _ => return Err(RadarError::NotRunning),
        }
        self.state.store(PipelineState::Draining);

        let mut inner = self.lock_inner();
        let timeout = inner
            .settings
            .as_ref()
            .map(|s| s.drain_timeout())
            .unwrap_or_default();
        let Some(mut run) = inner.run.take() else {
            self.state.store(PipelineState::Idle);
            return Err(RadarError::NotRunning);
        };

        info!("Stopping, processing what was received");
        run.stop_reading.trigger();
        if !run.wait(Instant::now() + timeout) {
            inner.run = Some(run);
            return Err(RadarError::Timeout);
        }
        run.abort.trigger();
        self.finish(&mut inner, run)
    }

    ///
    /// Stops every loop of the run as soon as possible; packets in flight
    /// may be lost. When the loops do not finish within the drain timeout
    /// they are left to end on their own and `Timeout` is returned.
    ///
    pub fn abort(&self) -> Result<(), RadarError> {
        let _interaction = self.interaction.try_lock().map_err(|_| RadarError::Busy)?;
        match self.state() {
            PipelineState::Running | PipelineState::Draining => {}
            _ => return Err(RadarError::NotRunning),
        }
        self.state.store(PipelineState::Aborting);

        let mut inner = self.lock_inner();
        let timeout = inner
            .settings
            .as_ref()
            .map(|s| s.drain_timeout())
            .unwrap_or_default();
        let Some(mut run) = inner.run.take() else {
            self.state.store(PipelineState::Idle);
            return Err(RadarError::NotRunning);
        };

        warn!("Aborting");
        run.stop_reading.trigger();
        run.abort.trigger();
        if !run.wait(Instant::now() + timeout) {
            error!("Pipeline threads did not stop, leaving them behind");
            self.state.store(PipelineState::Idle);
            return Err(RadarError::Timeout);
        }
        self.finish(&mut inner, run)
    }

    fn finish(&self, inner: &mut Inner, run: Run) -> Result<(), RadarError> {
        let elapsed = run.started.elapsed();
        let (source, result) = run.join();
        inner.source = source;
        self.state.store(PipelineState::Idle);
        info!("Pipeline stopped after {:?}: {}", elapsed, self.statistics);
        if let Err(e) = &result {
            error!("Run ended with error: {}", e);
        }
        result
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.state().is_active() {
            if let Err(e) = self.abort() {
                warn!("Pipeline dropped while running: {}", e);
            }
        }
    }
}
