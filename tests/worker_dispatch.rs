//! Integration tests for the dispatch loop.
//!
//! Deliveries come from an in-memory stream and emails go to a recording
//! mailer, so the ack/dispatch contract is exercised without a broker or an
//! SMTP server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tokio::sync::oneshot;
use tokio::time::timeout;

use emailworker::broker::Delivery;
use emailworker::config::SmtpSettings;
use emailworker::error::{BindingError, ConnectionError, DeliveryError, DispatchError};
use emailworker::mailer::{DryRunMailer, Email, Mailer};
use emailworker::request::EmailRequest;
use emailworker::worker::{RunSummary, Worker, WorkerState};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const SMTP_HOST: &str = "smtp.test";

type AckLog = Arc<Mutex<Vec<u64>>>;

/// In-memory delivery that records its ack in a shared log.
struct MemoryDelivery {
    tag: u64,
    payload: Vec<u8>,
    acks: AckLog,
    fail_ack: bool,
}

impl MemoryDelivery {
    fn new(tag: u64, payload: impl Into<Vec<u8>>, acks: &AckLog) -> Self {
        Self {
            tag,
            payload: payload.into(),
            acks: Arc::clone(acks),
            fail_ack: false,
        }
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn delivery_tag(&self) -> u64 {
        self.tag
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<(), ConnectionError> {
        if self.fail_ack {
            return Err(ConnectionError::AckFailed {
                delivery_tag: self.tag,
                reason: "channel closed".into(),
            });
        }
        self.acks.lock().unwrap().push(self.tag);
        Ok(())
    }
}

/// A sent email plus how many acks had been recorded when it was sent.
struct Sent {
    host: String,
    email: Email,
    acks_at_send: usize,
}

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<Sent>>,
    acks: AckLog,
    /// Recipients for which delivery fails.
    reject: Option<String>,
    /// Fired on the first send.
    on_send: Mutex<Option<oneshot::Sender<()>>>,
}

impl RecordingMailer {
    fn new(acks: &AckLog) -> Self {
        Self {
            acks: Arc::clone(acks),
            ..Self::default()
        }
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Mailer for RecordingMailer {
    fn deliver(&self, host: &str, email: &Email) -> Result<(), DeliveryError> {
        if let Some(tx) = self.on_send.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if self.reject.as_deref() == Some(email.recipients().as_str()) {
            return Err(DeliveryError::Transport {
                host: host.to_string(),
                reason: "550 mailbox unavailable".into(),
            });
        }
        self.sent.lock().unwrap().push(Sent {
            host: host.to_string(),
            email: email.clone(),
            acks_at_send: self.acks.lock().unwrap().len(),
        });
        Ok(())
    }
}

fn smtp() -> SmtpSettings {
    SmtpSettings {
        host: SMTP_HOST.into(),
        port: 25,
        dry_run: false,
    }
}

fn worker(mailer: &Arc<RecordingMailer>) -> Worker {
    let mailer: Arc<dyn Mailer> = mailer.clone();
    Worker::new(smtp(), mailer)
}

fn hello_request() -> Vec<u8> {
    EmailRequest::new("a@x.com", "b@x.com", "hi")
        .with_subject("hello")
        .to_payload()
        .unwrap()
}

async fn run_all(
    worker: &mut Worker,
    deliveries: Vec<MemoryDelivery>,
) -> Result<RunSummary, ConnectionError> {
    let deliveries = stream::iter(deliveries.into_iter().map(Ok::<_, ConnectionError>));
    timeout(TEST_TIMEOUT, worker.run(deliveries, std::future::pending()))
        .await
        .expect("worker hung")
}

#[tokio::test]
async fn end_to_end_send() {
    let acks = AckLog::default();
    let mailer = Arc::new(RecordingMailer::new(&acks));
    let mut worker = worker(&mailer);

    let summary = run_all(&mut worker, vec![MemoryDelivery::new(1, hello_request(), &acks)])
        .await
        .unwrap();

    assert_eq!(summary, RunSummary { sent: 1, dropped: 0 });
    assert_eq!(*acks.lock().unwrap(), vec![1]);
    assert_eq!(worker.state(), WorkerState::Closing);

    let sent = mailer.sent.lock().unwrap();
    let Sent { host, email, .. } = &sent[0];
    assert_eq!(host, SMTP_HOST);
    assert_eq!(email.from.to_string(), "a@x.com");
    assert_eq!(email.recipients(), "b@x.com");
    assert_eq!(email.subject, "hello");
    assert_eq!(email.body, "hi");
}

#[tokio::test]
async fn ack_precedes_send() {
    let acks = AckLog::default();
    let mailer = Arc::new(RecordingMailer::new(&acks));
    let mut worker = worker(&mailer);

    run_all(
        &mut worker,
        vec![
            MemoryDelivery::new(1, hello_request(), &acks),
            MemoryDelivery::new(2, hello_request(), &acks),
        ],
    )
    .await
    .unwrap();

    let sent = mailer.sent.lock().unwrap();
    assert_eq!(sent[0].acks_at_send, 1);
    assert_eq!(sent[1].acks_at_send, 2);
}

#[tokio::test]
async fn missing_body_is_acked_and_dropped() {
    let acks = AckLog::default();
    let mailer = Arc::new(RecordingMailer::new(&acks));
    let mut worker = worker(&mailer);

    let missing_body = br#"{"fromaddr": "a@x.com", "toaddrs": "b@x.com"}"#.to_vec();
    let summary = run_all(
        &mut worker,
        vec![
            MemoryDelivery::new(1, missing_body, &acks),
            MemoryDelivery::new(2, hello_request(), &acks),
        ],
    )
    .await
    .unwrap();

    assert_eq!(summary, RunSummary { sent: 1, dropped: 1 });
    assert_eq!(*acks.lock().unwrap(), vec![1, 2]);
    assert_eq!(mailer.sent_count(), 1);
}

#[tokio::test]
async fn handle_reports_binding_error() {
    let acks = AckLog::default();
    let mailer = Arc::new(RecordingMailer::new(&acks));
    let worker = worker(&mailer);

    let payload = br#"{"fromaddr": "a@x.com", "toaddrs": "b@x.com"}"#;
    let delivery = MemoryDelivery::new(7, payload.to_vec(), &acks);
    let outcome = worker.handle(&delivery).await.unwrap();

    assert!(matches!(
        outcome,
        Err(DispatchError::Binding(BindingError::Missing(ref name))) if name == "body"
    ));
    assert_eq!(*acks.lock().unwrap(), vec![7]);
}

#[tokio::test]
async fn unknown_field_is_dropped() {
    let acks = AckLog::default();
    let mailer = Arc::new(RecordingMailer::new(&acks));
    let worker = worker(&mailer);

    let payload =
        br#"{"fromaddr": "a@x.com", "toaddrs": "b@x.com", "body": "hi", "cc": "c@x.com"}"#;
    let outcome = worker
        .handle(&MemoryDelivery::new(1, payload.to_vec(), &acks))
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        Err(DispatchError::Binding(BindingError::Unexpected(ref name))) if name == "cc"
    ));
    assert_eq!(mailer.sent_count(), 0);
}

#[tokio::test]
async fn malformed_payload_does_not_stop_the_worker() {
    let acks = AckLog::default();
    let mailer = Arc::new(RecordingMailer::new(&acks));
    let mut worker = worker(&mailer);

    let summary = run_all(
        &mut worker,
        vec![
            MemoryDelivery::new(1, b"{not json".to_vec(), &acks),
            MemoryDelivery::new(2, b"\"just a string\"".to_vec(), &acks),
            MemoryDelivery::new(3, hello_request(), &acks),
        ],
    )
    .await
    .unwrap();

    assert_eq!(summary, RunSummary { sent: 1, dropped: 2 });
    assert_eq!(*acks.lock().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn smtp_failure_is_isolated() {
    let acks = AckLog::default();
    let mailer = Arc::new(RecordingMailer {
        reject: Some("dead@x.com".into()),
        ..RecordingMailer::new(&acks)
    });
    let mut worker = worker(&mailer);

    let rejected = EmailRequest::new("a@x.com", "dead@x.com", "hi")
        .to_payload()
        .unwrap();
    let summary = run_all(
        &mut worker,
        vec![
            MemoryDelivery::new(1, rejected, &acks),
            MemoryDelivery::new(2, hello_request(), &acks),
        ],
    )
    .await
    .unwrap();

    assert_eq!(summary, RunSummary { sent: 1, dropped: 1 });
    assert_eq!(*acks.lock().unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn configured_host_wins_over_payload_host() {
    let acks = AckLog::default();
    let mailer = Arc::new(RecordingMailer::new(&acks));
    let worker = worker(&mailer);

    let payload =
        br#"{"host": "elsewhere", "fromaddr": "a@x.com", "toaddrs": "b@x.com", "body": "hi"}"#;
    worker
        .handle(&MemoryDelivery::new(1, payload.to_vec(), &acks))
        .await
        .unwrap()
        .unwrap();

    let sent = mailer.sent.lock().unwrap();
    assert_eq!(sent[0].host, SMTP_HOST);
    assert_eq!(sent[0].email.subject, "");
}

#[tokio::test]
async fn ack_failure_is_fatal() {
    let acks = AckLog::default();
    let mailer = Arc::new(RecordingMailer::new(&acks));
    let mut worker = worker(&mailer);

    let mut broken = MemoryDelivery::new(1, hello_request(), &acks);
    broken.fail_ack = true;
    let err = run_all(
        &mut worker,
        vec![broken, MemoryDelivery::new(2, hello_request(), &acks)],
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ConnectionError::AckFailed { delivery_tag: 1, .. }));
    assert_eq!(worker.state(), WorkerState::Faulted);
    assert_eq!(mailer.sent_count(), 0);
}

#[tokio::test]
async fn broker_error_on_stream_is_fatal() {
    let acks = AckLog::default();
    let mailer = Arc::new(RecordingMailer::new(&acks));
    let mut worker = worker(&mailer);

    let deliveries = stream::iter(vec![
        Ok(MemoryDelivery::new(1, hello_request(), &acks)),
        Err(ConnectionError::Nacked {
            routing_key: "emails".into(),
        }),
        Ok(MemoryDelivery::new(3, hello_request(), &acks)),
    ]);
    let result = timeout(TEST_TIMEOUT, worker.run(deliveries, std::future::pending()))
        .await
        .expect("worker hung");

    assert!(result.is_err());
    assert_eq!(worker.state(), WorkerState::Faulted);
    assert_eq!(*acks.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn shutdown_before_first_delivery() {
    let acks = AckLog::default();
    let mailer = Arc::new(RecordingMailer::new(&acks));
    let mut worker = worker(&mailer);

    let deliveries = stream::iter(vec![Ok::<_, ConnectionError>(MemoryDelivery::new(
        1,
        hello_request(),
        &acks,
    ))]);
    let summary = worker
        .run(deliveries, std::future::ready(()))
        .await
        .unwrap();

    assert_eq!(summary, RunSummary::default());
    assert!(acks.lock().unwrap().is_empty());
    assert_eq!(worker.state(), WorkerState::Closing);
}

#[tokio::test]
async fn in_flight_delivery_finishes_before_shutdown() {
    let acks = AckLog::default();
    let (tx, rx) = oneshot::channel();
    let mailer = Arc::new(RecordingMailer {
        on_send: Mutex::new(Some(tx)),
        ..RecordingMailer::new(&acks)
    });
    let mut worker = worker(&mailer);

    // Shutdown fires while the first email is being sent.
    let shutdown = async {
        let _ = rx.await;
    };
    let deliveries = stream::iter(vec![
        Ok::<_, ConnectionError>(MemoryDelivery::new(1, hello_request(), &acks)),
        Ok(MemoryDelivery::new(2, hello_request(), &acks)),
    ]);
    let summary = timeout(TEST_TIMEOUT, worker.run(deliveries, shutdown))
        .await
        .expect("worker hung")
        .unwrap();

    assert_eq!(summary, RunSummary { sent: 1, dropped: 0 });
    assert_eq!(*acks.lock().unwrap(), vec![1]);
    assert_eq!(mailer.sent_count(), 1);
}

#[tokio::test]
async fn dry_run_worker_sends_nothing() {
    let acks = AckLog::default();
    let settings = SmtpSettings {
        host: "unreachable.invalid".into(),
        port: 25,
        dry_run: true,
    };
    let mut worker = Worker::new(settings, Arc::new(DryRunMailer));

    let summary = run_all(&mut worker, vec![MemoryDelivery::new(1, hello_request(), &acks)])
        .await
        .unwrap();

    assert_eq!(summary, RunSummary { sent: 1, dropped: 0 });
}
