//! The iteration driver shared by every iterative algorithm.

use crate::error::Result;
use crate::estimate::{Estimate, RunState, RunSummary, StopReason};
use crate::float::DeconvFloat;
use crate::observer::{DriverState, Observer, ObserverList};
use crate::rules::{IterationContext, RuleConfig, Step, UpdateRule};
use crate::volume::{extent, uniform_prior, Volume};
use cancellable_loops::{try_for_each_cancellable, CancellationToken, LoopExit};
use ndarray::ArrayView3;
use std::ops::ControlFlow;

/// Runs an [`UpdateRule`] for a target number of iterations.
///
/// Each iteration first notifies the due observers, then snapshots the estimate into the
/// old-estimate buffer and lets the rule compute the update. Cancellation (through
/// [`IterativeEstimate::abort`], a cloned [`CancellationToken`] or an observer) is honoured
/// between iterations only.
#[derive(Debug)]
pub struct IterativeEstimate<T: DeconvFloat> {
    rule: Box<dyn UpdateRule<T>>,
    estimate: Volume<T>,
    old: Volume<T>,
    iterations_done: usize,
    iterations_target: usize,
    state: RunState,
    running: bool,
    observers: ObserverList<T>,
    token: CancellationToken,
}

impl<T: DeconvFloat> IterativeEstimate<T> {
    pub fn new(rule: Box<dyn UpdateRule<T>>, iterations_target: usize) -> Self {
        let shape = extent(&rule.image().view());
        IterativeEstimate {
            rule,
            estimate: uniform_prior(shape),
            old: uniform_prior(shape),
            iterations_done: 0,
            iterations_target,
            state: RunState::NotStarted,
            running: false,
            observers: ObserverList::default(),
            token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> RuleConfig {
        self.rule.config()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn iterations_done(&self) -> usize {
        self.iterations_done
    }

    pub fn iterations_target(&self) -> usize {
        self.iterations_target
    }

    pub fn set_iterations(&mut self, target: usize) {
        self.iterations_target = target;
    }

    /// The estimate before the most recent iteration.
    pub fn old_estimate(&self) -> ArrayView3<'_, T> {
        self.old.view()
    }

    /// A handle that stops the run from another thread or callback.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Registers an observer that fires on the first iteration and every `interval`
    /// iterations after that.
    pub fn add_observer(
        &mut self,
        interval: usize,
        observer: impl Observer<T> + 'static,
    ) -> Result<()> {
        self.observers.add(interval, observer)
    }

    /// Stops the current run before its next iteration; `run()` does nothing until
    /// [`IterativeEstimate::resume`] is called.
    pub fn abort(&mut self) {
        self.running = false;
        self.token.cancel();
        if self.state != RunState::Done {
            self.state = RunState::Aborted;
        }
    }

    /// Clears a pending cancellation and continues towards the target.
    pub fn resume(&mut self) -> Result<RunSummary> {
        self.token.reset();
        self.running = true;
        self.run()
    }

    fn reset(&mut self) {
        let shape = extent(&self.rule.image().view());
        self.estimate = uniform_prior(shape);
        self.old = uniform_prior(shape);
        self.iterations_done = 0;
        self.state = RunState::NotStarted;
        self.running = false;
        self.token.reset();
        self.observers.rewind();
    }

    fn summary(&self, iterations_executed: usize, stop: Option<StopReason>) -> RunSummary {
        RunSummary {
            iterations_executed,
            iterations_done: self.iterations_done,
            state: self.state,
            stop,
        }
    }

    /// Iterates until the target is reached, the run is cancelled or the rule converges.
    ///
    /// On error the run is marked aborted and the error returned; the estimate keeps the
    /// last completed iteration.
    pub fn run(&mut self) -> Result<RunSummary> {
        if self.state == RunState::NotStarted {
            self.running = true;
        }
        if !self.running {
            return Ok(self.summary(0, None));
        }

        let name = self.rule.config().name;
        let start = self.iterations_done;
        let target = self.iterations_target;
        let token = self.token.clone();
        self.state = RunState::Running;
        log::info!("{name}: running iterations {start}..{target}");

        let rule = &mut self.rule;
        let estimate = &mut self.estimate;
        let old = &mut self.old;
        let observers = &mut self.observers;
        let iterations_done = &mut self.iterations_done;

        let exit = try_for_each_cancellable(
            start..target,
            &token,
            |iteration| -> Result<ControlFlow<StopReason>> {
                {
                    let state = DriverState::new(
                        iteration,
                        target,
                        &name,
                        estimate.view(),
                        old.view(),
                        rule.image().view(),
                        &token,
                    );
                    let notified = observers.tick(&state)?;
                    if notified > 0 {
                        log::debug!("{name}: notified {notified} observer(s) at {iteration}");
                    }
                }
                if token.is_cancelled() {
                    return Ok(ControlFlow::Break(StopReason::Cancelled));
                }
                old.assign(&*estimate);
                let step = rule.iterate(IterationContext {
                    iteration,
                    old: &*old,
                    estimate: &mut *estimate,
                })?;
                *iterations_done += 1;
                Ok(match step {
                    Step::Continue => ControlFlow::Continue(()),
                    Step::Converged => ControlFlow::Break(StopReason::Converged),
                })
            },
        );

        let executed = self.iterations_done - start;
        match exit {
            Err(err) => {
                self.state = RunState::Aborted;
                self.running = false;
                log::error!("{name} failed after {} iterations: {err}", self.iterations_done);
                Err(err)
            }
            Ok(LoopExit::Completed { .. }) => {
                self.state = RunState::Done;
                log::info!("{name}: done after {} iterations", self.iterations_done);
                Ok(self.summary(executed, None))
            }
            Ok(LoopExit::Cancelled { .. })
            | Ok(LoopExit::Stopped {
                reason: StopReason::Cancelled,
                ..
            }) => {
                self.token.reset();
                self.state = RunState::Aborted;
                self.running = false;
                log::warn!("{name}: aborted after {} iterations", self.iterations_done);
                Ok(self.summary(executed, Some(StopReason::Cancelled)))
            }
            Ok(LoopExit::Stopped {
                reason: StopReason::Converged,
                ..
            }) => {
                self.state = RunState::Aborted;
                self.running = false;
                log::info!("{name}: converged after {} iterations", self.iterations_done);
                Ok(self.summary(executed, Some(StopReason::Converged)))
            }
        }
    }
}

impl<T: DeconvFloat> Estimate<T> for IterativeEstimate<T> {
    fn name(&self) -> String {
        self.rule.config().name
    }

    /// Replaces the PSF, discarding all iteration history.
    fn set_psf(&mut self, psf: &Volume<T>) -> Result<()> {
        self.rule.set_psf(psf)?;
        self.reset();
        Ok(())
    }

    /// Replaces the image, discarding all iteration history.
    fn set_image(&mut self, image: &Volume<T>) -> Result<()> {
        self.rule.set_image(image)?;
        self.reset();
        Ok(())
    }

    fn results(&self) -> ArrayView3<'_, T> {
        self.estimate.view()
    }

    fn run(&mut self) -> Result<RunSummary> {
        IterativeEstimate::run(self)
    }

    fn as_iterative_mut(&mut self) -> Option<&mut IterativeEstimate<T>> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeconvolutionError;
    use crate::rules::{Capabilities, DepthModel};
    use ndarray::Array3;
    use std::sync::{Arc, Mutex};

    /// Adds one to every voxel; fails or converges on request.
    #[derive(Debug)]
    struct Counting {
        image: Volume<f64>,
        fail_at: Option<usize>,
        converge_at: Option<usize>,
    }

    impl Counting {
        fn boxed(fail_at: Option<usize>, converge_at: Option<usize>) -> Box<dyn UpdateRule<f64>> {
            Box::new(Counting {
                image: Array3::zeros((2, 2, 2)),
                fail_at,
                converge_at,
            })
        }
    }

    impl UpdateRule<f64> for Counting {
        fn config(&self) -> RuleConfig {
            RuleConfig {
                name: "counting".to_string(),
                description: String::new(),
                hyperlink: None,
                depth_model: DepthModel::Invariant,
                capabilities: Capabilities {
                    set_psf: false,
                    reshape_image: true,
                },
            }
        }

        fn image(&self) -> &Volume<f64> {
            &self.image
        }

        fn set_image(&mut self, image: &Volume<f64>) -> Result<()> {
            self.image = image.clone();
            Ok(())
        }

        fn iterate(&mut self, context: IterationContext<'_, f64>) -> Result<Step> {
            if self.fail_at == Some(context.iteration) {
                return Err(DeconvolutionError::Transform("boom".to_string()));
            }
            context.estimate.mapv_inplace(|v| v + 1.0);
            if self.converge_at == Some(context.iteration) {
                Ok(Step::Converged)
            } else {
                Ok(Step::Continue)
            }
        }
    }

    #[test]
    fn runs_to_target() {
        let mut estimate = IterativeEstimate::new(Counting::boxed(None, None), 10);
        let summary = estimate.run().unwrap();
        assert_eq!(summary.iterations_executed, 10);
        assert_eq!(summary.state, RunState::Done);
        assert_eq!(estimate.results()[[0, 0, 0]], 11.0);
        assert_eq!(estimate.old_estimate()[[0, 0, 0]], 10.0);

        estimate.set_iterations(12);
        let summary = estimate.run().unwrap();
        assert_eq!(summary.iterations_executed, 2);
        assert_eq!(summary.iterations_done, 12);
    }

    #[test]
    fn observer_abort_then_resume() {
        let mut estimate = IterativeEstimate::new(Counting::boxed(None, None), 100);
        let fired = Arc::new(Mutex::new(false));
        let once = fired.clone();
        estimate
            .add_observer(1, move |state: &DriverState<'_, f64>| -> Result<()> {
                let mut fired = once.lock().unwrap();
                if state.iterations_done == 5 && !*fired {
                    *fired = true;
                    state.abort();
                }
                Ok(())
            })
            .unwrap();

        let summary = estimate.run().unwrap();
        assert_eq!(summary.iterations_done, 5);
        assert_eq!(summary.state, RunState::Aborted);
        assert_eq!(summary.stop, Some(StopReason::Cancelled));

        // run() without resume() does not restart an aborted estimate
        assert_eq!(estimate.run().unwrap().iterations_executed, 0);

        let summary = estimate.resume().unwrap();
        assert_eq!(summary.iterations_done, 100);
        assert_eq!(summary.state, RunState::Done);
    }

    #[test]
    fn external_abort_blocks_run_until_resume() {
        let mut estimate = IterativeEstimate::new(Counting::boxed(None, None), 3);
        estimate.run().unwrap();
        estimate.set_iterations(6);
        estimate.abort();
        assert_eq!(estimate.state(), RunState::Done);
        assert_eq!(estimate.run().unwrap().iterations_executed, 0);
        assert_eq!(estimate.resume().unwrap().iterations_done, 6);
    }

    #[test]
    fn convergence_stops_the_run() {
        let mut estimate = IterativeEstimate::new(Counting::boxed(None, Some(3)), 10);
        let summary = estimate.run().unwrap();
        assert_eq!(summary.iterations_done, 4);
        assert_eq!(summary.stop, Some(StopReason::Converged));
    }

    #[test]
    fn errors_abort_the_run() {
        let mut estimate = IterativeEstimate::new(Counting::boxed(Some(2), None), 10);
        assert!(matches!(
            estimate.run(),
            Err(DeconvolutionError::Transform(_))
        ));
        assert_eq!(estimate.state(), RunState::Aborted);
        assert_eq!(estimate.iterations_done(), 2);
    }

    #[test]
    fn observers_see_the_first_tick_and_every_interval() {
        let mut estimate = IterativeEstimate::new(Counting::boxed(None, None), 10);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        estimate
            .add_observer(4, move |state: &DriverState<'_, f64>| -> Result<()> {
                sink.lock().unwrap().push(state.iterations_done);
                Ok(())
            })
            .unwrap();
        estimate.run().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 4, 8]);
    }

    #[test]
    fn set_image_resets_history() {
        let mut estimate = IterativeEstimate::new(Counting::boxed(None, None), 4);
        estimate.run().unwrap();
        estimate.set_image(&Array3::zeros((3, 2, 2))).unwrap();
        assert_eq!(estimate.iterations_done(), 0);
        assert_eq!(estimate.state(), RunState::NotStarted);
        assert_eq!(estimate.results().dim(), (3, 2, 2));
        assert!(estimate.results().iter().all(|&v| v == 1.0));
        assert!(matches!(
            estimate.set_psf(&Array3::zeros((1, 1, 1))),
            Err(DeconvolutionError::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn token_cancels_from_outside() {
        let mut estimate = IterativeEstimate::new(Counting::boxed(None, None), 10);
        let token = estimate.cancellation_token();
        token.cancel();
        let summary = estimate.run().unwrap();
        assert_eq!(summary.iterations_executed, 0);
        assert_eq!(summary.stop, Some(StopReason::Cancelled));
        assert!(!token.is_cancelled());
    }
}
