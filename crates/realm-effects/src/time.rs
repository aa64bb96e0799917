//! Recurring timer subscriptions.

use futures::StreamExt;
use realm_core::{
    downcast_payload, Dispatcher, EffectError, Gate, Payload, Subscription, SubscriptionFactory,
    SubscriptionHandler, SubscriptionPayload, SubscriptionTag,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::AbortHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;

/// Tag of the recurring timer subscription.
pub const EVERY: SubscriptionTag = SubscriptionTag::new("time.every");

/// One second, the most common tick.
pub const SECOND: Duration = Duration::from_secs(1);

/// Minutes elapsed between the Unix epoch and `time`.
pub fn in_minutes(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64() / 60.0)
        .unwrap_or(0.0)
}

/// Payload of [`EVERY`].
pub struct Every<Msg> {
    /// Time between ticks.
    pub interval: Duration,
    to_msg: Arc<dyn Fn(SystemTime) -> Msg + Send + Sync>,
}

impl<Msg: Send + 'static> SubscriptionPayload<Msg> for Every<Msg> {
    const TAG: SubscriptionTag = EVERY;
}

/// Dispatch `to_msg(now)` every `interval`, starting one interval after setup.
///
/// # Example
///
/// ```rust,ignore
/// fn subscriptions(&self) -> Subscription<Msg> {
///     time::every(time::SECOND, Msg::Tick)
/// }
/// ```
pub fn every<Msg: Send + 'static>(
    interval: Duration,
    to_msg: impl Fn(SystemTime) -> Msg + Send + Sync + 'static,
) -> Subscription<Msg> {
    Subscription::effect(Every {
        interval,
        to_msg: Arc::new(to_msg),
    })
}

/// Factory for [`EVERY`] subscriptions.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimeFactory;

impl<Msg: Send + 'static> SubscriptionFactory<Msg> for TimeFactory {
    fn create(
        &self,
        payload: Payload,
        dispatch: &Dispatcher<Msg>,
    ) -> Result<Box<dyn SubscriptionHandler>, EffectError> {
        let Every { interval, to_msg } = downcast_payload::<Every<Msg>>(EVERY, payload)?;
        if interval.is_zero() {
            return Err(EffectError::InvalidPayload {
                tag: EVERY.to_string(),
                reason: "interval must be greater than zero".into(),
            });
        }
        Ok(Box::new(EveryHandler {
            interval,
            to_msg,
            dispatch: dispatch.clone(),
            running: None,
        }))
    }
}

struct Running {
    gate: Gate,
    task: AbortHandle,
}

struct EveryHandler<Msg> {
    interval: Duration,
    to_msg: Arc<dyn Fn(SystemTime) -> Msg + Send + Sync>,
    dispatch: Dispatcher<Msg>,
    running: Option<Running>,
}

impl<Msg: Send + 'static> SubscriptionHandler for EveryHandler<Msg> {
    fn setup(&mut self) -> Result<(), EffectError> {
        if self.running.is_some() {
            return Err(EffectError::AlreadyActive {
                tag: EVERY.to_string(),
            });
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EffectError::NoExecutor {
            tag: EVERY.to_string(),
        })?;

        let period = self.interval;
        let gate = Gate::new();
        let task = {
            let gate = gate.clone();
            let to_msg = self.to_msg.clone();
            let dispatch = self.dispatch.clone();
            runtime.spawn(async move {
                let mut interval = time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                let mut ticks = IntervalStream::new(interval);
                while ticks.next().await.is_some() {
                    // Stop once cleanup closed the gate or the runtime is gone.
                    if gate.pass(|| dispatch.dispatch(to_msg(SystemTime::now()))) != Some(true) {
                        break;
                    }
                }
            })
        };

        tracing::debug!(interval_ms = period.as_millis() as u64, "timer started");
        self.running = Some(Running {
            gate,
            task: task.abort_handle(),
        });
        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), EffectError> {
        if let Some(running) = self.running.take() {
            running.gate.close();
            running.task.abort();
            tracing::debug!(interval_ms = self.interval.as_millis() as u64, "timer stopped");
        }
        Ok(())
    }
}

impl<Msg> Drop for EveryHandler<Msg> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.gate.close();
            running.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use realm_core::{SubscriptionManager, SubscriptionRegistry};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn registry() -> SubscriptionRegistry<SystemTime> {
        SubscriptionRegistry::new().with(EVERY, Box::new(TimeFactory)).unwrap()
    }

    fn drain(rx: &mut UnboundedReceiver<SystemTime>) -> usize {
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_every_interval_until_cleanup() {
        let (dispatch, mut rx) = Dispatcher::channel();
        let mut manager = SubscriptionManager::new(every(SECOND, |now| now), &registry(), &dispatch);
        manager.setup().unwrap();

        time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(drain(&mut rx), 3);

        manager.cleanup().unwrap();
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(drain(&mut rx), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_with_none_starts_exactly_one_timer() {
        let (dispatch, mut rx) = Dispatcher::channel();
        let sub = Subscription::batch([every(SECOND, |now| now), Subscription::none()]);
        let mut manager = SubscriptionManager::new(sub, &registry(), &dispatch);
        manager.setup().unwrap();

        time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(drain(&mut rx), 1);

        manager.cleanup().unwrap();
        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(drain(&mut rx), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn setup_after_cleanup_restarts_the_timer() {
        let (dispatch, mut rx) = Dispatcher::channel();
        let mut manager = SubscriptionManager::new(every(SECOND, |now| now), &registry(), &dispatch);
        manager.setup().unwrap();
        manager.cleanup().unwrap();
        manager.setup().unwrap();

        time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(drain(&mut rx), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_manager_stops_the_timer() {
        let (dispatch, mut rx) = Dispatcher::channel();
        let mut manager = SubscriptionManager::new(every(SECOND, |now| now), &registry(), &dispatch);
        manager.setup().unwrap();
        drop(manager);

        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(drain(&mut rx), 0);
    }

    #[test]
    fn zero_interval_is_rejected_at_setup() {
        let (dispatch, _rx) = Dispatcher::channel();
        let mut manager =
            SubscriptionManager::new(every(Duration::ZERO, |now| now), &registry(), &dispatch);
        assert!(matches!(
            manager.setup(),
            Err(EffectError::InvalidPayload { ref tag, .. }) if tag == "time.every"
        ));
    }

    #[test]
    fn setup_without_runtime_reports_no_executor() {
        let (dispatch, _rx) = Dispatcher::channel();
        let mut manager = SubscriptionManager::new(every(SECOND, |now| now), &registry(), &dispatch);
        assert_eq!(
            manager.setup(),
            Err(EffectError::NoExecutor {
                tag: "time.every".into()
            })
        );
    }

    #[test]
    fn in_minutes_counts_from_the_epoch() {
        assert_eq!(in_minutes(UNIX_EPOCH + Duration::from_secs(120)), 2.0);
        assert_eq!(in_minutes(UNIX_EPOCH), 0.0);
    }
}
