use std::sync::Arc;

use async_trait::async_trait;
use plumline::broker::{Broker, MemoryBroker, OutgoingMessage, PublishOptions, QueueOptions};
use plumline::config::{TaskQueueConfig, UnhandledPolicy};
use plumline::process::builtin::{DUMMY_WITH_OUTPUT, ECHO, EXCEPTION, THREE_STEPS, WAIT_FOR_SIGNAL};
use plumline::process::{
    ProcessClass, ProcessHost, ProcessLogic, ProcessRegistry, ProcessSpec, ProcessState, Resume, RunContext, Step,
    ValueMap,
};
use plumline::promise::{Promise, TaskError};
use plumline::task::{CorrelationRegistry, ProcessLauncher, Received, TaskMessage, TaskPublisher, TaskReceiver, TaskSubscriber};
use serde_json::{Value, json};
use task_protocol::{JsonCodec, TaskBody, TaskResponse, codec};
use tokio::time::{Duration, sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

struct Worker {
    subscriber: Arc<TaskSubscriber>,
    host: ProcessHost,
}

fn config() -> TaskQueueConfig {
    TaskQueueConfig {
        prefetch: 4,
        ..TaskQueueConfig::testing()
    }
}

async fn start_worker(broker: &Arc<MemoryBroker>, config: &TaskQueueConfig, registry: ProcessRegistry) -> Worker {
    let host = ProcessHost::new(registry);
    let subscriber = TaskSubscriber::new(broker.clone(), Arc::new(JsonCodec), config);
    subscriber.add_task_receiver(Arc::new(ProcessLauncher::new(host.clone())));
    subscriber.start().await.unwrap();
    Worker { subscriber, host }
}

async fn publisher(broker: &Arc<MemoryBroker>, config: &TaskQueueConfig) -> Arc<TaskPublisher> {
    TaskPublisher::new(broker.clone(), Arc::new(JsonCodec), config, CorrelationRegistry::new())
        .await
        .unwrap()
}

async fn outcome(promise: Promise) -> Result<Value, TaskError> {
    timeout(WAIT, promise.wait()).await.expect("no response in time")
}

async fn launch(publisher: &TaskPublisher, class: &str, args: Vec<Value>, kwargs: Value, play: bool) -> Promise {
    TaskMessage::create_launch(class, args, kwargs, play)
        .unwrap()
        .send(publisher)
        .await
        .unwrap()
}

async fn continue_task(publisher: &TaskPublisher, pid: &str, play: bool) -> Promise {
    TaskMessage::create_continue(pid, None, play)
        .unwrap()
        .send(publisher)
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn launch_returns_the_process_outputs() {
    let broker = Arc::new(MemoryBroker::new());
    let config = config();
    let _worker = start_worker(&broker, &config, ProcessRegistry::with_builtins()).await;
    let publisher = publisher(&broker, &config).await;

    let promise = launch(&publisher, DUMMY_WITH_OUTPUT, vec![], json!({}), true).await;
    assert_eq!(outcome(promise).await.unwrap(), json!({"default": 5}));
    assert_eq!(publisher.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_answers_with_its_kwargs() {
    let broker = Arc::new(MemoryBroker::new());
    let config = config();
    let _worker = start_worker(&broker, &config, ProcessRegistry::with_builtins()).await;
    let publisher = publisher(&broker, &config).await;

    let promise = launch(&publisher, ECHO, vec![], json!({"x": 5}), true).await;
    assert_eq!(outcome(promise).await.unwrap(), json!({"x": 5}));
    assert_eq!(broker.ready_count(publisher.task_queue()), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn positional_arguments_bind_to_declared_inputs() {
    let broker = Arc::new(MemoryBroker::new());
    let config = config();
    let _worker = start_worker(&broker, &config, ProcessRegistry::with_builtins()).await;
    let publisher = publisher(&broker, &config).await;

    let promise = launch(&publisher, THREE_STEPS, vec![json!(3)], json!({}), true).await;
    assert_eq!(outcome(promise).await.unwrap(), json!({"v": 3, "w": 6, "x": 9}));

    let promise = launch(&publisher, THREE_STEPS, vec![json!(3)], json!({"a": 4}), true).await;
    let err = outcome(promise).await.unwrap_err();
    assert_eq!(err.kind(), "ValidationError");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_exception_fails_the_promise() {
    let broker = Arc::new(MemoryBroker::new());
    let config = config();
    let _worker = start_worker(&broker, &config, ProcessRegistry::with_builtins()).await;
    let publisher = publisher(&broker, &config).await;

    let promise = launch(&publisher, EXCEPTION, vec![], json!({}), true).await;
    assert_eq!(
        outcome(promise).await,
        Err(TaskError::failed("RuntimeError", "Great scott!"))
    );

    let promise = launch(&publisher, THREE_STEPS, vec![], json!({"a": "x"}), true).await;
    assert_eq!(outcome(promise).await.unwrap_err().kind(), "ValidationError");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn created_process_is_continued_by_pid() {
    let broker = Arc::new(MemoryBroker::new());
    let config = config();
    let _worker = start_worker(&broker, &config, ProcessRegistry::with_builtins()).await;
    let publisher = publisher(&broker, &config).await;

    let created = outcome(launch(&publisher, DUMMY_WITH_OUTPUT, vec![], json!({}), false).await)
        .await
        .unwrap();
    let pid = created["pid"].as_str().unwrap().to_string();

    let peek = outcome(continue_task(&publisher, &pid, false).await).await.unwrap();
    assert_eq!(peek, json!({"pid": pid, "state": "created"}));

    let done = outcome(continue_task(&publisher, &pid, true).await).await.unwrap();
    assert_eq!(done, json!({"default": 5}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiting_process_is_signalled_by_a_second_continue() {
    let broker = Arc::new(MemoryBroker::new());
    let config = config();
    let worker = start_worker(&broker, &config, ProcessRegistry::with_builtins()).await;
    let publisher = publisher(&broker, &config).await;

    let created = outcome(launch(&publisher, WAIT_FOR_SIGNAL, vec![], json!({}), false).await)
        .await
        .unwrap();
    let pid = created["pid"].as_str().unwrap().to_string();

    let first = continue_task(&publisher, &pid, true).await;
    timeout(WAIT, async {
        while !worker.host.control(&pid).is_some_and(|c| c.is_waiting()) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(!first.is_done());

    let second = continue_task(&publisher, &pid, true).await;
    assert_eq!(outcome(second).await.unwrap(), json!({"finished": true}));
    assert_eq!(outcome(first).await.unwrap(), json!({"finished": true}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn declined_task_is_requeued_to_a_capable_worker() {
    let broker = Arc::new(MemoryBroker::new());
    let config = config();
    let _empty = start_worker(&broker, &config, ProcessRegistry::new()).await;
    let _capable = start_worker(&broker, &config, ProcessRegistry::with_builtins()).await;
    let publisher = publisher(&broker, &config).await;

    for _ in 0..4 {
        let promise = launch(&publisher, DUMMY_WITH_OUTPUT, vec![], json!({}), true).await;
        assert_eq!(outcome(promise).await.unwrap(), json!({"default": 5}));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unhandled_task_can_be_discarded() {
    let broker = Arc::new(MemoryBroker::new());
    let config = TaskQueueConfig {
        unhandled: UnhandledPolicy::Discard,
        ..config()
    };
    let _worker = start_worker(&broker, &config, ProcessRegistry::with_builtins()).await;
    let publisher = publisher(&broker, &config).await;

    let promise = launch(&publisher, "no_such_class", vec![], json!({}), true).await;
    assert!(timeout(Duration::from_millis(200), promise.wait()).await.is_err());
    assert_eq!(broker.ready_count(publisher.task_queue()), 0);
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(publisher.pending_count(), 1);

    publisher.close().await;
    assert!(promise.is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn correlation_id_is_free_again_once_answered() {
    let broker = Arc::new(MemoryBroker::new());
    let config = config();
    let _worker = start_worker(&broker, &config, ProcessRegistry::with_builtins()).await;
    let publisher = publisher(&broker, &config).await;
    let body = TaskBody::launch(DUMMY_WITH_OUTPUT, vec![], json!({}), true).unwrap();

    for _ in 0..2 {
        let promise = publisher
            .send(TaskMessage::with_correlation_id(body.clone(), "job-1"))
            .await
            .unwrap();
        assert_eq!(outcome(promise).await.unwrap(), json!({"default": 5}));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_task_gets_an_exception_response() {
    let broker = Arc::new(MemoryBroker::new());
    let config = config();
    let worker = start_worker(&broker, &config, ProcessRegistry::with_builtins()).await;

    let replies = broker.declare_queue("", QueueOptions::reply_queue()).await.unwrap();
    let mut consumer = broker.consume(&replies, 1).await.unwrap();
    broker
        .declare_queue(&config.task_queue, QueueOptions::task_queue(true))
        .await
        .unwrap();
    broker
        .publish(
            &config.task_queue,
            OutgoingMessage::new(br#"{"task":"explode"}"#.to_vec())
                .correlation_id("bad-1")
                .reply_to(replies.clone()),
            PublishOptions::default(),
        )
        .await
        .unwrap();

    let delivery = timeout(WAIT, consumer.recv()).await.unwrap().unwrap();
    assert_eq!(delivery.message.correlation_id.as_deref(), Some("bad-1"));
    let response: TaskResponse = codec::decode_as(&JsonCodec, &delivery.message.body).unwrap();
    let exception = response.into_result().unwrap_err();
    assert_eq!(exception.kind, "MalformedTask");

    timeout(WAIT, async {
        while broker.unacked_count() > 1 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(broker.ready_count(&config.task_queue), 0);
    worker.subscriber.stop().await.unwrap();
}

struct Panics;

#[async_trait]
impl TaskReceiver for Panics {
    async fn on_task_received(&self, _task: &TaskBody) -> Received {
        panic!("receiver blew up")
    }

    fn name(&self) -> &str {
        "panics"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_receiver_answers_with_a_failure() {
    let broker = Arc::new(MemoryBroker::new());
    let config = config();
    let subscriber = TaskSubscriber::new(broker.clone(), Arc::new(JsonCodec), &config);
    subscriber.add_task_receiver(Arc::new(Panics));
    subscriber.start().await.unwrap();
    let publisher = publisher(&broker, &config).await;

    let promise = launch(&publisher, DUMMY_WITH_OUTPUT, vec![], json!({}), true).await;
    assert_eq!(outcome(promise).await.unwrap_err().kind(), "ReceiverPanicked");

    // The consumer survives the panic.
    let promise = launch(&publisher, DUMMY_WITH_OUTPUT, vec![], json!({}), true).await;
    assert_eq!(outcome(promise).await.unwrap_err().kind(), "ReceiverPanicked");

    // Both tasks were acknowledged exactly once and nothing is redelivered.
    timeout(WAIT, async {
        while broker.unacked_count() > 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.ready_count(publisher.task_queue()), 0);
    assert_eq!(publisher.pending_count(), 0);
}

struct IndexesEmpty;

impl ProcessLogic for IndexesEmpty {
    fn run(&mut self, _ctx: &mut RunContext<'_>, _resume: Option<Resume>) -> anyhow::Result<Step> {
        let steps: Vec<Step> = Vec::new();
        Ok(steps[0].clone())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_process_answers_with_a_failure() {
    let broker = Arc::new(MemoryBroker::new());
    let config = config();
    let registry = ProcessRegistry::with_builtins();
    registry.register(ProcessClass::new("indexes_empty", ProcessSpec::builder().build(), |_| {
        Box::new(IndexesEmpty)
    }));
    let worker = start_worker(&broker, &config, registry).await;
    let publisher = publisher(&broker, &config).await;

    let promise = launch(&publisher, "indexes_empty", vec![], json!({}), true).await;
    let err = outcome(promise).await.unwrap_err();
    assert_eq!(err.kind(), "Panic");

    timeout(WAIT, async {
        while broker.unacked_count() > 0 || worker.host.live_count() > 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("panicked task left behind");
    assert_eq!(broker.ready_count(publisher.task_queue()), 0);

    // The worker keeps serving.
    let promise = launch(&publisher, DUMMY_WITH_OUTPUT, vec![], json!({}), true).await;
    assert_eq!(outcome(promise).await.unwrap(), json!({"default": 5}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiting_continue_declined_everywhere_waits_for_a_capable_worker() {
    let broker = Arc::new(MemoryBroker::new());
    let config = config();

    // The waiting process lives only in the capable worker's store.
    let host = ProcessHost::new(ProcessRegistry::with_builtins());
    let mut waiting = host.create(WAIT_FOR_SIGNAL, ValueMap::new()).unwrap();
    let pid = waiting.pid().to_string();
    assert_eq!(waiting.play(), ProcessState::Waiting);
    drop(waiting);

    let declining = start_worker(&broker, &config, ProcessRegistry::new()).await;
    let replies = broker.declare_queue("", QueueOptions::reply_queue()).await.unwrap();
    let mut consumer = broker.consume(&replies, 4).await.unwrap();
    let body = TaskBody::continue_process(&pid, None, true).unwrap();
    broker
        .publish(
            &config.task_queue,
            OutgoingMessage::new(codec::encode_as(&JsonCodec, &body).unwrap())
                .correlation_id("c-wait")
                .reply_to(replies.clone()),
            PublishOptions::default(),
        )
        .await
        .unwrap();

    sleep(Duration::from_millis(100)).await;
    assert!(timeout(Duration::from_millis(100), consumer.recv()).await.is_err());
    assert_eq!(
        broker.ready_count(&config.task_queue) + broker.unacked_count(),
        1,
        "declined task must stay queued"
    );

    let capable = TaskSubscriber::new(broker.clone(), Arc::new(JsonCodec), &config);
    capable.add_task_receiver(Arc::new(ProcessLauncher::new(host.clone())));
    capable.start().await.unwrap();

    let delivery = timeout(WAIT, consumer.recv()).await.unwrap().unwrap();
    assert_eq!(delivery.message.correlation_id.as_deref(), Some("c-wait"));
    let response: TaskResponse = codec::decode_as(&JsonCodec, &delivery.message.body).unwrap();
    assert_eq!(response.into_result().unwrap(), json!({"finished": true}));
    broker.ack(delivery.delivery_tag).await.unwrap();

    assert!(timeout(Duration::from_millis(200), consumer.recv()).await.is_err());
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.ready_count(&config.task_queue), 0);

    declining.subscriber.stop().await.unwrap();
    capable.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_subscriber_leaves_tasks_queued() {
    let broker = Arc::new(MemoryBroker::new());
    let config = config();
    let worker = start_worker(&broker, &config, ProcessRegistry::with_builtins()).await;
    worker.subscriber.stop().await.unwrap();
    let publisher = publisher(&broker, &config).await;

    let promise = launch(&publisher, DUMMY_WITH_OUTPUT, vec![], json!({}), true).await;
    sleep(Duration::from_millis(50)).await;
    assert!(!promise.is_done());
    assert_eq!(broker.ready_count(publisher.task_queue()), 1);

    let _restarted = start_worker(&broker, &config, ProcessRegistry::with_builtins()).await;
    assert_eq!(outcome(promise).await.unwrap(), json!({"default": 5}));
}
