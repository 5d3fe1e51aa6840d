//! ==============================================================================
//! engine.rs - sensor reading engine
//! ==============================================================================
//!
//! purpose:
//!     turns metric requests into scheduled, timeout-bounded, aggregated
//!     readings. this is the concurrency core of the node.
//!
//! scheduling:
//!     one unbounded request queue, one consumer loop. the loop dequeues a
//!     request and hands it to its own task, so several requests can be in
//!     flight. periodic subscriptions are separate producer tasks that only
//!     enqueue; a slow handler never stops the next tick from being queued.
//!
//! per request:
//!     - each metric is served by the first sensor (register order) declaring it
//!     - inactive sensors are initialized and verified on first use, under
//!       a guard of their own so one stuck sensor cannot hold up another
//!     - init, verify and harvest together race one timeout and the engine
//!       shutdown
//!     - per metric, the value with the most fractional digits wins; ties go
//!       to the later result; metrics with no result are left out
//!
//! idle standby:
//!     a single task owns a DelayQueue with one deadline per harvested sensor.
//!     using a sensor resets its deadline; on expiry the sensor is closed but
//!     stays registered.
//!
//! relationships:
//!     - used by: operator.rs (requirements), commands.rs (one-shot reads)
//!     - mutated by: hotswap.rs (register/unregister)
//!
//! ==============================================================================

use crate::domain::{Metric, MetricValues, ReadingResult};
use crate::error::SensorError;
use crate::sensors::{ReadingWriter, SensorRegister, SharedSensor};

use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};

/// receives the aggregated values of one request, exactly once
pub type ResultHandler = Arc<dyn Fn(MetricValues) -> BoxFuture<'static, ()> + Send + Sync>;

/// wrap an async closure as a `ResultHandler`
pub fn result_handler<F, Fut>(f: F) -> ResultHandler
where
    F: Fn(MetricValues) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |values| Box::pin(f(values)))
}

pub struct ReadingRequest {
    pub metrics: Vec<Metric>,
    pub period: Option<Duration>,
    pub handler: ResultHandler,
    pub cancel: CancellationToken,
}

pub struct ReadingEngine {
    register: Arc<SensorRegister>,
    preloaded: BTreeSet<String>,
    queue: mpsc::UnboundedSender<ReadingRequest>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<ReadingRequest>>>,
    touches: mpsc::UnboundedSender<String>,
    touch_inbox: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    init_guards: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    harvest_timeout: Duration,
    standby: Duration,
    running: AtomicBool,
    shutdown: CancellationToken,
}

impl ReadingEngine {
    pub fn new(register: Arc<SensorRegister>, harvest_timeout: Duration, standby: Duration) -> Self {
        let (queue, inbox) = mpsc::unbounded_channel();
        let (touches, touch_inbox) = mpsc::unbounded_channel();
        Self {
            preloaded: register.ids(),
            register,
            queue,
            inbox: Mutex::new(Some(inbox)),
            touches,
            touch_inbox: Mutex::new(Some(touch_inbox)),
            init_guards: Mutex::new(HashMap::new()),
            harvest_timeout,
            standby,
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn sensors(&self) -> &Arc<SensorRegister> {
        &self.register
    }

    /// ids of the sensors the register held when the engine was built
    pub fn preloaded(&self) -> &BTreeSet<String> {
        &self.preloaded
    }

    pub fn register(&self, sensors: impl IntoIterator<Item = SharedSensor>) {
        self.register.register(sensors);
    }

    /// remove sensors; active ones are closed first
    pub async fn unregister<S: AsRef<str>>(&self, ids: &[S]) {
        for sensor in self.register.unregister(ids) {
            self.init_guards.lock().remove(sensor.id());
            if sensor.active() {
                if let Err(e) = sensor.close().await {
                    tracing::warn!(sensor = sensor.id(), error = %e, "close on unregister failed");
                }
            }
            tracing::info!(sensor = sensor.id(), "sensor unregistered");
        }
    }

    /// enqueue a single request
    pub fn send_once(&self, handler: ResultHandler, metrics: Vec<Metric>) {
        let request = ReadingRequest {
            metrics,
            period: None,
            handler,
            cancel: self.shutdown.child_token(),
        };
        if self.queue.send(request).is_err() {
            tracing::warn!("reading engine stopped; request dropped");
        }
    }

    /// enqueue a request every `period` until the returned token is canceled
    pub fn subscribe(&self, handler: ResultHandler, period: Duration, metrics: Vec<Metric>) -> CancellationToken {
        let token = self.shutdown.child_token();
        if period.is_zero() {
            self.send_once(handler, metrics);
            return token;
        }

        let queue = self.queue.clone();
        let cancel = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let request = ReadingRequest {
                            metrics: metrics.clone(),
                            period: Some(period),
                            handler: handler.clone(),
                            cancel: cancel.clone(),
                        };
                        if queue.send(request).is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(?period, "periodic producer stopped");
        });
        token
    }

    /// start the consumer loop and the standby timer; only the first call
    /// starts anything
    pub fn run(self: &Arc<Self>, scope: CancellationToken) -> Option<JoinHandle<()>> {
        let mut inbox = match self.inbox.lock().take() {
            Some(inbox) => inbox,
            None => {
                tracing::debug!("reading engine already running");
                return None;
            }
        };
        if let Some(touches) = self.touch_inbox.lock().take() {
            tokio::spawn(standby_loop(
                self.register.clone(),
                touches,
                self.standby,
                self.shutdown.clone(),
            ));
        }

        self.running.store(true, Ordering::SeqCst);
        let engine = self.clone();
        Some(tokio::spawn(async move {
            tracing::info!("reading engine started");
            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    _ = engine.shutdown.cancelled() => break,
                    request = inbox.recv() => match request {
                        Some(request) => {
                            tokio::spawn(engine.clone().handle(request));
                        }
                        None => break,
                    },
                }
            }
            engine.shutdown.cancel();
            engine.running.store(false, Ordering::SeqCst);
            tracing::info!("reading engine stopped");
        }))
    }

    pub fn active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// stop scheduling and close every open sensor
    pub async fn close(&self) {
        self.shutdown.cancel();
        for sensor in self.register.snapshot() {
            if sensor.active() {
                if let Err(e) = sensor.close().await {
                    tracing::warn!(sensor = sensor.id(), error = %e, "close failed");
                }
            }
        }
    }

    async fn handle(self: Arc<Self>, request: ReadingRequest) {
        if request.cancel.is_cancelled() {
            return;
        }

        // first-match-wins: one sensor per metric, grouped by sensor
        let mut assignments: BTreeMap<String, (SharedSensor, Vec<Metric>)> = BTreeMap::new();
        for metric in &request.metrics {
            if assignments.values().any(|(_, metrics)| metrics.contains(metric)) {
                continue;
            }
            match self.register.first_supporting(metric) {
                Some(sensor) => {
                    assignments
                        .entry(sensor.id().to_string())
                        .or_insert_with(|| (sensor.clone(), Vec::new()))
                        .1
                        .push(metric.clone());
                }
                None => tracing::debug!(%metric, "no registered sensor supports metric"),
            }
        }

        let mut receivers = BTreeMap::new();
        let mut harvests = JoinSet::new();
        for (id, (sensor, metrics)) in assignments {
            let mut channels = HashMap::new();
            for metric in metrics {
                let (tx, rx) = mpsc::unbounded_channel();
                channels.insert(metric.clone(), tx);
                receivers.insert(metric, rx);
            }
            let writer = ReadingWriter::new(id, channels);
            let engine = self.clone();
            harvests.spawn(async move {
                if let Err(e) = engine.harvest(&sensor, &writer).await {
                    match e {
                        SensorError::Canceled { .. } => tracing::debug!(sensor = sensor.id(), "harvest canceled"),
                        e => tracing::warn!(sensor = sensor.id(), error = %e, "harvest failed"),
                    }
                }
            });
        }
        while let Some(joined) = harvests.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "harvest task panicked");
            }
        }

        // every writer is gone once its task finished, so draining terminates
        let mut results: BTreeMap<Metric, Vec<ReadingResult>> = BTreeMap::new();
        for (metric, mut rx) in receivers {
            let mut arrived = Vec::new();
            while let Some(result) = rx.recv().await {
                arrived.push(result);
            }
            results.insert(metric, arrived);
        }

        if request.cancel.is_cancelled() {
            return;
        }
        (request.handler)(select_values(results)).await;
    }

    fn init_guard(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.init_guards.lock().entry(id.to_string()).or_default().clone()
    }

    /// open `sensor` if it is in standby; concurrent requests for the same
    /// sensor wait for one init
    async fn ensure_active(&self, sensor: &SharedSensor) -> Result<(), SensorError> {
        let guard = self.init_guard(sensor.id());
        let _init = guard.lock().await;
        if sensor.active() {
            return Ok(());
        }
        sensor.init().await?;
        if let Err(e) = sensor.verify().await {
            let _ = sensor.close().await;
            return Err(e);
        }
        tracing::debug!(sensor = sensor.id(), "sensor initialized");
        Ok(())
    }

    async fn harvest(&self, sensor: &SharedSensor, writer: &ReadingWriter) -> Result<(), SensorError> {
        let work = async {
            self.ensure_active(sensor).await?;
            let _ = self.touches.send(sensor.id().to_string());
            sensor.harvest(writer).await
        };

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(SensorError::Canceled { sensor: sensor.id().to_string() }),
            res = tokio::time::timeout(self.harvest_timeout, work) => match res {
                Ok(outcome) => outcome,
                Err(_) => Err(SensorError::Timeout { sensor: sensor.id().to_string() }),
            },
        }
    }
}

/// per metric, keep the value with the greatest precision; the later result
/// wins on equal precision; metrics without results are omitted
pub fn select_values(results: BTreeMap<Metric, Vec<ReadingResult>>) -> MetricValues {
    select_results(results)
        .into_iter()
        .map(|(metric, best)| (metric, best.value.value()))
        .collect()
}

/// the winning result per metric
pub fn select_results(results: BTreeMap<Metric, Vec<ReadingResult>>) -> BTreeMap<Metric, ReadingResult> {
    let mut selected = BTreeMap::new();
    for (metric, arrived) in results {
        let mut best: Option<ReadingResult> = None;
        for result in arrived {
            let replace = match &best {
                Some(current) => result.value.precision() >= current.value.precision(),
                None => true,
            };
            if replace {
                best = Some(result);
            }
        }
        if let Some(best) = best {
            selected.insert(metric, best);
        }
    }
    selected
}

async fn standby_loop(
    register: Arc<SensorRegister>,
    mut touches: mpsc::UnboundedReceiver<String>,
    standby: Duration,
    shutdown: CancellationToken,
) {
    let mut deadlines: DelayQueue<String> = DelayQueue::new();
    let mut keys: HashMap<String, delay_queue::Key> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            touched = touches.recv() => match touched {
                Some(id) => match keys.get(&id) {
                    Some(key) => deadlines.reset(key, standby),
                    None => {
                        let key = deadlines.insert(id.clone(), standby);
                        keys.insert(id, key);
                    }
                },
                None => break,
            },
            Some(expired) = deadlines.next(), if !deadlines.is_empty() => {
                let id = expired.into_inner();
                keys.remove(&id);
                if let Some(sensor) = register.get(&id) {
                    if sensor.active() {
                        match sensor.close().await {
                            Ok(()) => tracing::debug!(sensor = %id, "sensor entered standby"),
                            Err(e) => tracing::warn!(sensor = %id, error = %e, "standby close failed"),
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Decimal;
    use crate::sensors::mock::MockSensor;
    use crate::sensors::Sensor;

    fn engine_with(sensors: Vec<Arc<MockSensor>>) -> Arc<ReadingEngine> {
        let register = Arc::new(SensorRegister::new());
        register.register(sensors.into_iter().map(|s| s as SharedSensor));
        Arc::new(ReadingEngine::new(register, Duration::from_secs(2), Duration::from_secs(30)))
    }

    fn channel_handler() -> (ResultHandler, mpsc::UnboundedReceiver<MetricValues>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = result_handler(move |values| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(values);
            }
        });
        (handler, rx)
    }

    fn metrics(names: &[&str]) -> Vec<Metric> {
        names.iter().map(|m| Metric::from(*m)).collect()
    }

    fn result(sensor: &str, text: &str) -> ReadingResult {
        ReadingResult { sensor_id: sensor.into(), value: Decimal::parse(text).unwrap() }
    }

    #[test]
    fn precision_beats_arrival_order() {
        let mut results = BTreeMap::new();
        results.insert(Metric::from("t"), vec![result("a", "1.25"), result("a", "1.5")]);
        results.insert(Metric::from("h"), vec![result("a", "1.5"), result("b", "1.7")]);
        results.insert(Metric::from("p"), vec![]);

        let values = select_values(results);
        assert_eq!(values[&Metric::from("t")], 1.25);
        assert_eq!(values[&Metric::from("h")], 1.7);
        assert!(!values.contains_key(&Metric::from("p")));
    }

    #[test]
    fn more_digits_win_in_either_order() {
        for order in [["1.0", "1.00"], ["1.00", "1.0"]] {
            let mut results = BTreeMap::new();
            let arrived: Vec<ReadingResult> = order.iter().enumerate().map(|(i, text)| result(&format!("s{}", i), text)).collect();
            results.insert(Metric::from("t"), arrived);

            let winner = &select_results(results)[&Metric::from("t")];
            assert_eq!(winner.value.precision(), 2, "order {:?}", order);
        }
    }

    #[test]
    fn equal_precision_goes_to_the_later_result() {
        let mut results = BTreeMap::new();
        results.insert(Metric::from("t"), vec![result("early", "2.5"), result("late", "2.5")]);
        assert_eq!(select_results(results)[&Metric::from("t")].sensor_id, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn disjoint_sensors_fill_only_successful_metrics() {
        crate::logging::init_test_logging();
        let temp = Arc::new(MockSensor::new("s1", &["temperature"]).with_value("temperature", "21.5"));
        let lux = Arc::new(MockSensor::new("s2", &["luminosity"]).with_value("luminosity", "300"));
        let broken = Arc::new(MockSensor::new("s3", &["humidity"]).failing_harvest());
        let engine = engine_with(vec![temp, lux, broken]);
        let scope = CancellationToken::new();
        engine.run(scope.clone());

        let (handler, mut rx) = channel_handler();
        engine.send_once(handler, metrics(&["temperature", "luminosity", "humidity", "pressure"]));

        let values = rx.recv().await.unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[&Metric::from("temperature")], 21.5);
        assert_eq!(values[&Metric::from("luminosity")], 300.0);
        scope.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn first_matching_sensor_serves_metric() {
        let a = Arc::new(MockSensor::new("a", &["temperature"]).with_value("temperature", "20.0"));
        let b = Arc::new(MockSensor::new("b", &["temperature"]).with_value("temperature", "30.000"));
        let engine = engine_with(vec![a.clone(), b.clone()]);
        engine.run(CancellationToken::new());

        let (handler, mut rx) = channel_handler();
        engine.send_once(handler, metrics(&["temperature"]));

        let values = rx.recv().await.unwrap();
        assert_eq!(values[&Metric::from("temperature")], 20.0);
        assert_eq!(b.harvests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fan_in_prefers_more_fractional_digits() {
        let sensor = Arc::new(
            MockSensor::new("s", &["temperature"])
                .with_value("temperature", "21.25")
                .with_value("temperature", "21.5"),
        );
        let engine = engine_with(vec![sensor]);
        engine.run(CancellationToken::new());

        let (handler, mut rx) = channel_handler();
        engine.send_once(handler, metrics(&["temperature"]));
        assert_eq!(rx.recv().await.unwrap()[&Metric::from("temperature")], 21.25);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_harvest_times_out_without_blocking_peers() {
        let slow = Arc::new(
            MockSensor::new("slow", &["humidity"])
                .with_value("humidity", "40.0")
                .with_delay(Duration::from_secs(10)),
        );
        let fast = Arc::new(MockSensor::new("fast", &["temperature"]).with_value("temperature", "19.0"));
        let engine = engine_with(vec![slow, fast]);
        engine.run(CancellationToken::new());

        let (handler, mut rx) = channel_handler();
        let started = tokio::time::Instant::now();
        engine.send_once(handler, metrics(&["humidity", "temperature"]));

        let values = rx.recv().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(values.len(), 1);
        assert!(values.contains_key(&Metric::from("temperature")));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_init_leaves_metric_out() {
        let sensor = Arc::new(MockSensor::new("s", &["temperature"]).failing_init());
        let engine = engine_with(vec![sensor.clone()]);
        engine.run(CancellationToken::new());

        let (handler, mut rx) = channel_handler();
        engine.send_once(handler, metrics(&["temperature"]));
        assert!(rx.recv().await.unwrap().is_empty());
        assert_eq!(sensor.harvests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_init_times_out_without_blocking_other_sensors() {
        let stuck = Arc::new(MockSensor::new("a", &["temperature"]).hanging_init());
        let other = Arc::new(MockSensor::new("b", &["humidity"]).with_value("humidity", "55.5"));
        let engine = engine_with(vec![stuck.clone(), other]);
        engine.run(CancellationToken::new());

        let (handler, mut rx) = channel_handler();
        let started = tokio::time::Instant::now();
        engine.send_once(handler.clone(), metrics(&["temperature"]));
        engine.send_once(handler.clone(), metrics(&["humidity"]));

        let mut delivered = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        assert!(started.elapsed() <= Duration::from_secs(3));
        delivered.sort_by_key(|values| values.len());
        assert!(delivered[0].is_empty());
        assert_eq!(delivered[1][&Metric::from("humidity")], 55.5);

        // the stuck init is retried, and bounded again, on the next request
        engine.send_once(handler, metrics(&["temperature"]));
        assert!(rx.recv().await.unwrap().is_empty());
        assert_eq!(stuck.inits.load(Ordering::SeqCst), 2);
        assert!(!stuck.active());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sensor_enters_standby_and_reinitializes() {
        let sensor = Arc::new(MockSensor::new("s", &["temperature"]).with_value("temperature", "20.0"));
        let engine = engine_with(vec![sensor.clone()]);
        engine.run(CancellationToken::new());

        let (handler, mut rx) = channel_handler();
        engine.send_once(handler.clone(), metrics(&["temperature"]));
        rx.recv().await.unwrap();
        assert!(sensor.active());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!sensor.active());
        assert_eq!(sensor.closes.load(Ordering::SeqCst), 1);

        engine.send_once(handler, metrics(&["temperature"]));
        assert_eq!(rx.recv().await.unwrap()[&Metric::from("temperature")], 20.0);
        assert_eq!(sensor.inits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reuse_before_expiry_keeps_sensor_open() {
        let sensor = Arc::new(MockSensor::new("s", &["temperature"]).with_value("temperature", "20.0"));
        let engine = engine_with(vec![sensor.clone()]);
        engine.run(CancellationToken::new());

        let (handler, mut rx) = channel_handler();
        for _ in 0..3 {
            engine.send_once(handler.clone(), metrics(&["temperature"]));
            rx.recv().await.unwrap();
            tokio::time::sleep(Duration::from_secs(20)).await;
        }
        assert!(sensor.active());
        assert_eq!(sensor.inits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_repeats_until_canceled() {
        let sensor = Arc::new(MockSensor::new("s", &["temperature"]).with_value("temperature", "20.0"));
        let engine = engine_with(vec![sensor]);
        engine.run(CancellationToken::new());

        let (handler, mut rx) = channel_handler();
        let token = engine.subscribe(handler, Duration::from_secs(5), metrics(&["temperature"]));
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        token.cancel();
        tokio::time::sleep(Duration::from_secs(20)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_starts_only_once() {
        let engine = engine_with(vec![]);
        let scope = CancellationToken::new();
        assert!(engine.run(scope.clone()).is_some());
        assert!(engine.run(scope.clone()).is_none());
        assert!(engine.active());
    }

    #[tokio::test]
    async fn scope_cancellation_stops_engine() {
        let engine = engine_with(vec![]);
        let scope = CancellationToken::new();
        let handle = engine.run(scope.clone()).unwrap();
        scope.cancel();
        handle.await.unwrap();
        assert!(!engine.active());
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_closes_active_sensor() {
        let sensor = Arc::new(MockSensor::new("s", &["temperature"]).with_value("temperature", "20.0"));
        let engine = engine_with(vec![sensor.clone()]);
        engine.run(CancellationToken::new());

        let (handler, mut rx) = channel_handler();
        engine.send_once(handler, metrics(&["temperature"]));
        rx.recv().await.unwrap();

        engine.unregister(&["s"]).await;
        assert!(!sensor.active());
        assert!(!engine.sensors().exists("s"));
    }
}
