//! Periodic callbacks evaluated by the iteration driver.
//!
//! Observers are registered as `(interval, observer)` pairs. The driver notifies every due
//! observer, in registration order, at the start of each iteration: on the first iteration
//! and then once every `interval` iterations. Observers may stop the run through
//! [`DriverState::abort`]; the request takes effect before the next update, never during
//! one.

use crate::error::{DeconvolutionError, Result};
use crate::float::DeconvFloat;
use crate::store::VolumeStore;
use crate::volume::{relative_change, Volume};
use cancellable_loops::CancellationToken;
use crossbeam_channel::Sender;
use ndarray::{ArrayView3, Zip};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, RwLock};

/// Read-only view of the driver handed to observers.
pub struct DriverState<'a, T: DeconvFloat> {
    pub iterations_done: usize,
    pub iterations_target: usize,
    pub rule: &'a str,
    pub estimate: ArrayView3<'a, T>,
    pub old_estimate: ArrayView3<'a, T>,
    pub image: ArrayView3<'a, T>,
    cancel: &'a CancellationToken,
}

impl<'a, T: DeconvFloat> DriverState<'a, T> {
    pub(crate) fn new(
        iterations_done: usize,
        iterations_target: usize,
        rule: &'a str,
        estimate: ArrayView3<'a, T>,
        old_estimate: ArrayView3<'a, T>,
        image: ArrayView3<'a, T>,
        cancel: &'a CancellationToken,
    ) -> Self {
        DriverState {
            iterations_done,
            iterations_target,
            rule,
            estimate,
            old_estimate,
            image,
            cancel,
        }
    }

    /// Asks the driver to stop before the next iteration.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Fraction of the target reached, in `[0, 1]`.
    pub fn progress(&self) -> f32 {
        if self.iterations_target == 0 {
            1.0
        } else {
            (self.iterations_done as f32 / self.iterations_target as f32).min(1.0)
        }
    }

    /// Relative change between the current and the previous estimate.
    pub fn relative_change(&self) -> f64 {
        relative_change(&self.estimate, &self.old_estimate)
    }
}

/// Something the driver notifies periodically.
pub trait Observer<T: DeconvFloat>: Send {
    fn notify(&mut self, state: &DriverState<'_, T>) -> Result<()>;
}

impl<T, F> Observer<T> for F
where
    T: DeconvFloat,
    F: FnMut(&DriverState<'_, T>) -> Result<()> + Send,
{
    fn notify(&mut self, state: &DriverState<'_, T>) -> Result<()> {
        self(state)
    }
}

struct Scheduled<T: DeconvFloat> {
    interval: usize,
    countdown: usize,
    observer: Box<dyn Observer<T>>,
}

/// Registered observers and their countdowns.
pub struct ObserverList<T: DeconvFloat> {
    entries: Vec<Scheduled<T>>,
}

impl<T: DeconvFloat> Default for ObserverList<T> {
    fn default() -> Self {
        ObserverList {
            entries: Vec::new(),
        }
    }
}

impl<T: DeconvFloat> Debug for ObserverList<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| entry.interval))
            .finish()
    }
}

impl<T: DeconvFloat> ObserverList<T> {
    /// Registers an observer that fires on the next tick and then every `interval` ticks.
    pub fn add(&mut self, interval: usize, observer: impl Observer<T> + 'static) -> Result<()> {
        if interval == 0 {
            return Err(DeconvolutionError::InvalidConfiguration(
                "observer interval must be at least 1".to_string(),
            ));
        }
        self.entries.push(Scheduled {
            interval,
            countdown: 1,
            observer: Box::new(observer),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Restarts every countdown, so all observers fire on the next tick.
    pub fn rewind(&mut self) {
        self.entries.iter_mut().for_each(|entry| entry.countdown = 1);
    }

    /// Advances every countdown by one tick and notifies the observers that are due.
    /// Returns how many were notified.
    pub fn tick(&mut self, state: &DriverState<'_, T>) -> Result<usize> {
        let mut notified = 0;
        for entry in self.entries.iter_mut() {
            entry.countdown -= 1;
            if entry.countdown == 0 {
                entry.countdown = entry.interval;
                entry.observer.notify(state)?;
                notified += 1;
            }
        }
        Ok(notified)
    }
}

/// Publishes progress into a shared lock, the way long-running filters report to a UI.
#[derive(Debug, Clone)]
pub struct ProgressObserver {
    progress: Arc<RwLock<Option<f32>>>,
}

impl ProgressObserver {
    pub fn new(progress: Arc<RwLock<Option<f32>>>) -> Self {
        ProgressObserver { progress }
    }
}

impl<T: DeconvFloat> Observer<T> for ProgressObserver {
    fn notify(&mut self, state: &DriverState<'_, T>) -> Result<()> {
        if let Ok(mut p) = self.progress.write() {
            *p = Some(state.progress());
        }
        Ok(())
    }
}

/// Snapshot of a driver tick, sent over a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationEvent {
    pub rule: String,
    pub iterations_done: usize,
    pub iterations_target: usize,
    pub relative_change: f64,
}

/// Sends an [`IterationEvent`] per notification. A disconnected receiver is not an error.
#[derive(Debug, Clone)]
pub struct EventChannelObserver {
    sender: Sender<IterationEvent>,
}

impl EventChannelObserver {
    pub fn new(sender: Sender<IterationEvent>) -> Self {
        EventChannelObserver { sender }
    }
}

impl<T: DeconvFloat> Observer<T> for EventChannelObserver {
    fn notify(&mut self, state: &DriverState<'_, T>) -> Result<()> {
        let event = IterationEvent {
            rule: state.rule.to_string(),
            iterations_done: state.iterations_done,
            iterations_target: state.iterations_target,
            relative_change: state.relative_change(),
        };
        if self.sender.send(event).is_err() {
            log::debug!("iteration event dropped, receiver disconnected");
        }
        Ok(())
    }
}

/// One error-metric sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorSample {
    pub iterations_done: usize,
    /// `||estimate - old|| / ||old||`.
    pub relative_change: f64,
    /// Mean squared error against the reference, if one was given.
    pub mse: Option<f64>,
}

/// Records how the estimate evolves, optionally against a known ground truth.
#[derive(Debug, Clone)]
pub struct ErrorMetricObserver<T: DeconvFloat> {
    history: Arc<Mutex<Vec<ErrorSample>>>,
    reference: Option<Arc<Volume<T>>>,
}

impl<T: DeconvFloat> ErrorMetricObserver<T> {
    pub fn new(history: Arc<Mutex<Vec<ErrorSample>>>) -> Self {
        ErrorMetricObserver {
            history,
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: Volume<T>) -> Self {
        self.reference = Some(Arc::new(reference));
        self
    }
}

fn mean_squared_error<T: DeconvFloat>(a: &ArrayView3<'_, T>, b: &Volume<T>) -> f64 {
    let sum = Zip::from(a).and(b).fold(0.0f64, |acc, &x, &y| {
        let d = (x - y).as_f64();
        acc + d * d
    });
    sum / a.len().max(1) as f64
}

impl<T: DeconvFloat> Observer<T> for ErrorMetricObserver<T> {
    fn notify(&mut self, state: &DriverState<'_, T>) -> Result<()> {
        let mse = match &self.reference {
            Some(reference) if reference.dim() == state.estimate.dim() => {
                Some(mean_squared_error(&state.estimate, reference))
            }
            Some(reference) => {
                return Err(DeconvolutionError::Observer(format!(
                    "reference extent {:?} differs from estimate extent {:?}",
                    reference.dim(),
                    state.estimate.dim()
                )))
            }
            None => None,
        };
        let sample = ErrorSample {
            iterations_done: state.iterations_done,
            relative_change: state.relative_change(),
            mse,
        };
        log::debug!("{}: {:?}", state.rule, sample);
        self.history
            .lock()
            .map_err(|_| DeconvolutionError::Observer("error history poisoned".to_string()))?
            .push(sample);
        Ok(())
    }
}

/// Writes the current estimate to a store as `{prefix}-{iterations_done:05}`.
pub struct CheckpointObserver<T: DeconvFloat> {
    store: Box<dyn VolumeStore<T>>,
    prefix: String,
}

impl<T: DeconvFloat> Debug for CheckpointObserver<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointObserver")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl<T: DeconvFloat> CheckpointObserver<T> {
    pub fn new(store: Box<dyn VolumeStore<T>>, prefix: impl Into<String>) -> Self {
        CheckpointObserver {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn name_for(&self, iterations_done: usize) -> String {
        format!("{}-{:05}", self.prefix, iterations_done)
    }
}

impl<T: DeconvFloat> Observer<T> for CheckpointObserver<T> {
    fn notify(&mut self, state: &DriverState<'_, T>) -> Result<()> {
        let name = self.name_for(state.iterations_done);
        self.store
            .write_volume(&name, &state.estimate.to_owned())?;
        log::debug!("checkpoint {name} written");
        Ok(())
    }
}

/// Stops the run once the relative change between iterations falls below a threshold.
#[derive(Debug, Clone, Copy)]
pub struct ConvergenceObserver {
    threshold: f64,
}

impl ConvergenceObserver {
    pub fn new(threshold: f64) -> Self {
        ConvergenceObserver { threshold }
    }
}

impl<T: DeconvFloat> Observer<T> for ConvergenceObserver {
    fn notify(&mut self, state: &DriverState<'_, T>) -> Result<()> {
        // nothing has been computed before the first iteration
        if state.iterations_done > 0 && state.relative_change() < self.threshold {
            log::info!(
                "{} stopped after {} iterations: relative change below {}",
                state.rule,
                state.iterations_done,
                self.threshold
            );
            state.abort();
        }
        Ok(())
    }
}
