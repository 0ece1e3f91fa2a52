//! Owns the acquisition thread and everything built from its output.
//!
//! The capture thread only ever pushes [`Scan`]s into an rtrb ring buffer.
//! [`SweepController::update`] is called from the consumer's own cadence (a
//! frame loop, say): it pops everything that is waiting and then stitches it,
//! so it never waits on the capture side.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{bounded, Sender};
use rtrb::{Consumer, RingBuffer};
use tracing::{debug, error, info, warn};

use crate::{
    averaging::AveragingEngine,
    capture::{AcquisitionLoop, CaptureSource, HaltHandle, Scan, SourceFactory},
    error::ControllerError,
    measurement::{BaselineMode, Measure, Measurement},
    monitoring::{SourceStatus, StatusSnapshot},
    settings::Settings,
    stitch::MeasurementAssembler,
};

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Sweeps folded together before average/max/min are recomputed
    pub average_hold: usize,
    /// Ring buffer capacity in scans
    pub queue_capacity: usize,
    /// Readouts per scan
    pub batch_size: usize,
    /// Finished sweeps kept in history, 0 for unbounded
    pub history_limit: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            average_hold: 4,
            queue_capacity: 256,
            batch_size: 4,
            history_limit: 64,
        }
    }
}

struct Worker {
    handle: JoinHandle<()>,
    // Dropping this is the stop signal
    stop: Option<Sender<()>>,
    halt: Option<HaltHandle>,
}

impl Worker {
    /// Ask the thread to exit without waiting for it
    fn signal(&mut self) {
        self.stop.take();
        if let Some(halt) = self.halt.take() {
            halt();
        }
    }

    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    fn join(mut self) {
        self.signal();
        if self.handle.join().is_err() {
            error!("Acquisition thread panicked");
        }
    }
}

pub struct SweepController<F: SourceFactory> {
    factory: F,
    config: ControllerConfig,
    worker: Option<Worker>,
    consumer: Option<Consumer<Scan>>,
    next_is_first: Arc<AtomicBool>,
    launch_queued: Arc<AtomicBool>,
    status: Arc<SourceStatus>,
    assembler: MeasurementAssembler,
    averaging: AveragingEngine,
    /// Settings of the running (or next) acquisition
    settings: Settings,
    /// Pending settings, applied by `commit_settings`
    exposed: Settings,
    current: Measurement,
    measures: VecDeque<Measurement>,
    // Only used while its settings match `current`
    baseline: Option<Measurement>,
    pub baseline_mode: BaselineMode,
}

impl<F: SourceFactory> SweepController<F> {
    pub fn new(factory: F, settings: Settings, config: ControllerConfig) -> Result<Self, ControllerError> {
        settings.validate()?;
        let averaging = AveragingEngine::new(config.average_hold)?;
        Ok(Self {
            factory,
            config,
            worker: None,
            consumer: None,
            next_is_first: Arc::new(AtomicBool::new(true)),
            launch_queued: Arc::new(AtomicBool::new(false)),
            status: Arc::new(SourceStatus::default()),
            assembler: MeasurementAssembler::new(),
            averaging,
            current: Measurement::new(settings.clone()),
            exposed: settings.clone(),
            settings,
            measures: VecDeque::new(),
            baseline: None,
            baseline_mode: BaselineMode::default(),
        })
    }

    /// Start acquiring. Fails if already running or if a launch is queued.
    pub fn launch(&mut self) -> Result<(), ControllerError> {
        if self.is_running() {
            return Err(ControllerError::AlreadyRunning);
        }
        if self.launch_queued.load(Ordering::Acquire) {
            return Err(ControllerError::LaunchQueued);
        }
        self.reap();
        self.start()
    }

    fn start(&mut self) -> Result<(), ControllerError> {
        self.settings.validate()?;
        let source = self.factory.open(&self.settings)?;
        let halt = source.halt_handle();
        let (producer, consumer) = RingBuffer::new(self.config.queue_capacity.max(1));
        let (stop_tx, stop_rx) = bounded(0);

        self.next_is_first.store(true, Ordering::Release);
        self.assembler.abort();
        let lp = AcquisitionLoop {
            producer,
            stop: stop_rx,
            next_is_first: self.next_is_first.clone(),
            status: self.status.clone(),
            high_freq: self.settings.high_freq_hz(),
            batch_size: self.config.batch_size,
        };
        let handle = thread::Builder::new()
            .name("acquisition".to_owned())
            .spawn(move || lp.run(source))
            .map_err(ControllerError::Thread)?;

        self.consumer = Some(consumer);
        self.worker = Some(Worker {
            handle,
            stop: Some(stop_tx),
            halt,
        });
        info!(
            low = self.settings.low_freq_hz(),
            high = self.settings.high_freq_hz(),
            bins = self.settings.bin_count(),
            "Launched acquisition"
        );
        Ok(())
    }

    /// Stop the capture thread and wait for it. Safe to call in any state.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.join();
            info!("Stopped acquisition");
        }
        // Whatever finished before the thread exited is still worth keeping
        self.drain(false);
        self.consumer = None;
        self.assembler.abort();
        self.next_is_first.store(true, Ordering::Release);
    }

    /// Join a thread that already exited by itself
    fn reap(&mut self) {
        if !self.worker.as_ref().map_or(false, Worker::is_finished) {
            return;
        }
        self.drain(false);
        if let Some(worker) = self.worker.take() {
            worker.join();
        }
        self.consumer = None;
        self.assembler.abort();
        debug!("Reaped finished acquisition thread");
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map_or(false, |w| !w.is_finished())
    }

    /// Pop everything waiting in the ring buffer, then stitch it
    fn drain(&mut self, discard: bool) {
        let consumer = match self.consumer.as_mut() {
            Some(consumer) => consumer,
            None => return,
        };
        let mut scans = Vec::new();
        while let Ok(scan) = consumer.pop() {
            scans.push(scan);
        }
        if discard {
            if !scans.is_empty() {
                debug!(scans = scans.len(), "Discarding scans from outgoing acquisition");
            }
            return;
        }
        for scan in scans {
            self.process_scan(scan);
        }
    }

    fn process_scan(&mut self, scan: Scan) {
        if let Some(done) = self.assembler.ingest(scan, &mut self.current, &self.settings) {
            let folded = self.averaging.push(&done.spectrum, &mut self.current);
            debug!(folded, held = self.averaging.measurement_count(), "Sweep complete");
            self.measures.push_back(done);
            if self.config.history_limit > 0 {
                while self.measures.len() > self.config.history_limit {
                    self.measures.pop_front();
                }
            }
        }
    }

    /// Consume whatever the capture thread produced. Never blocks.
    pub fn update(&mut self) {
        let relaunch = self.launch_queued.load(Ordering::Acquire);
        self.drain(relaunch);
        if !relaunch {
            self.reap();
            return;
        }
        if let Some(worker) = self.worker.as_mut() {
            if !worker.is_finished() {
                // Pick it up on a later update once the thread is gone
                worker.signal();
                return;
            }
        }
        if let Some(worker) = self.worker.take() {
            worker.join();
        }
        self.consumer = None;
        self.assembler.abort();
        self.launch_queued.store(false, Ordering::Release);
        if let Err(e) = self.start() {
            error!("Queued launch failed - {}", e);
        }
    }

    /// Request a (re)start, serviced by the next `update`
    pub fn queue_launch(&self) {
        self.launch_queued.store(true, Ordering::Release);
    }

    /// Shared flag so other threads can queue a launch
    pub fn launch_flag(&self) -> Arc<AtomicBool> {
        self.launch_queued.clone()
    }

    /// No sweep is half assembled
    pub fn can_change_settings(&self) -> bool {
        !self.assembler.in_sweep()
    }

    /// Apply the exposed settings. Rejected while a sweep is in progress; the
    /// caller has to try again later. A running acquisition is relaunched if
    /// anything it was started with changed.
    pub fn commit_settings(&mut self) -> Result<(), ControllerError> {
        if !self.can_change_settings() {
            warn!("Settings change rejected, sweep in progress");
            return Err(ControllerError::SweepInProgress);
        }
        self.exposed.validate()?;
        let layout_changed = self.exposed != self.settings;
        let capture_changed = self.exposed.gain != self.settings.gain
            || self.exposed.nsamples != self.settings.nsamples;
        self.settings = self.exposed.clone();
        if layout_changed {
            self.averaging.clear();
            self.current = Measurement::new(self.settings.clone());
        }
        if (layout_changed || capture_changed) && self.is_running() {
            info!("Settings changed, relaunching");
            self.queue_launch();
        }
        Ok(())
    }

    pub fn set_average_hold(&mut self, num_average_hold: usize) -> Result<(), ControllerError> {
        if !self.can_change_settings() {
            return Err(ControllerError::SweepInProgress);
        }
        self.averaging.set_hold(num_average_hold)
    }

    /// Fold held sweeps now instead of waiting for the hold depth
    pub fn update_averaging(&mut self) -> bool {
        self.averaging.fold(&mut self.current)
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline.is_some()
    }

    pub fn baseline(&self) -> Option<&Measurement> {
        self.baseline.as_ref()
    }

    /// Keep the current measurement as the baseline
    pub fn capture_baseline(&mut self) -> Result<(), ControllerError> {
        if !self.can_change_settings() {
            return Err(ControllerError::SweepInProgress);
        }
        if self.current.num_scans == 0 {
            return Err(ControllerError::NothingToCapture);
        }
        self.baseline = Some(self.current.clone());
        Ok(())
    }

    pub fn set_baseline(&mut self, baseline: Measurement) {
        if baseline.settings != self.current.settings {
            warn!("Baseline settings differ from the current sweep, it will be ignored");
        }
        self.baseline = Some(baseline);
    }

    pub fn clear_baseline(&mut self) -> Option<Measurement> {
        self.baseline.take()
    }

    /// The baseline trace to subtract, if the baseline matches `current`
    pub fn baseline_offset(&self) -> Option<&[f64]> {
        self.baseline
            .as_ref()
            .filter(|b| b.settings == self.current.settings && b.bin_count() == self.current.bin_count())
            .map(|b| b.get_baseline_bin(self.baseline_mode))
    }

    /// One trace of `current` relative to the baseline, or as-is without a
    /// usable baseline
    pub fn relative_power(&self, mode: BaselineMode) -> Vec<f64> {
        let values = self.current.get_baseline_bin(mode);
        match self.baseline_offset() {
            Some(offset) => values.iter().zip(offset).map(|(v, b)| v - b).collect(),
            None => values.to_vec(),
        }
    }

    pub fn measure(&self) -> Measure {
        Measure::new(self.current.clone())
    }

    pub fn current(&self) -> &Measurement {
        &self.current
    }

    pub fn measures(&self) -> &VecDeque<Measurement> {
        &self.measures
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn exposed(&self) -> &Settings {
        &self.exposed
    }

    pub fn exposed_mut(&mut self) -> &mut Settings {
        &mut self.exposed
    }

    pub fn averaging(&self) -> &AveragingEngine {
        &self.averaging
    }

    /// Whether the capture source is alive
    pub fn get_power_status(&self) -> bool {
        self.status.is_alive()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }
}

impl<F: SourceFactory> Drop for SweepController<F> {
    fn drop(&mut self) {
        self.stop();
    }
}
