//! Operation dispatcher.
//!
//! Incoming operations are queued without blocking the service loop and run
//! one at a time by the operation consumer. Every status update goes through
//! a second queue drained by the response consumer, so a slow controller
//! never stalls the heartbeat. Admission never waits: when the operation
//! queue is full the controller is told so immediately. Execution results
//! wait for room in the response queue instead of being dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::AgentClient;
use crate::error::{AgentError, Result};
use crate::protocol::{OpStatus, OperationRequest, OperationResponse};
use crate::worker::Worker;

pub const QUEUE_FULL_INFO: &str = "agent operation queue full";
pub const STOPPED_INFO: &str = "agent stopped";

/// Response slots needed so every queued operation, plus the one being
/// executed, can have both its SCHEDULED and its result outstanding.
pub fn response_capacity(op_capacity: usize) -> usize {
    2 * (op_capacity + 1)
}

type OpReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<OperationRequest>>>;

pub struct Dispatcher {
    op_capacity: usize,
    ops: mpsc::Sender<OperationRequest>,
    op_rx: OpReceiver,
    responses: mpsc::Sender<OperationResponse>,
    // Held while admitting an operation so the capacity check and the push
    // see the same queue.
    admission: Mutex<()>,
    cancel: CancellationToken,
    closing: CancellationToken,
    stopped: AtomicBool,
    op_task: Mutex<Option<JoinHandle<()>>>,
    res_task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Operation queue of `capacity` slots; the response queue is sized with
    /// [`response_capacity`].
    pub fn new(client: Arc<dyn AgentClient>, worker: Worker, capacity: usize) -> Self {
        Self::with_capacities(client, worker, capacity, response_capacity(capacity))
    }

    /// A zero `response_capacity` is raised to one slot.
    pub fn with_capacities(
        client: Arc<dyn AgentClient>,
        worker: Worker,
        op_capacity: usize,
        response_capacity: usize,
    ) -> Self {
        let (dispatcher, response_rx) = Self::idle(op_capacity, response_capacity);

        let op_task = tokio::spawn(run_operations(
            dispatcher.op_rx.clone(),
            dispatcher.responses.clone(),
            worker,
            dispatcher.cancel.clone(),
            dispatcher.closing.clone(),
        ));
        let res_task = tokio::spawn(run_responses(response_rx, client, dispatcher.closing.clone()));

        *dispatcher.op_task.lock() = Some(op_task);
        *dispatcher.res_task.lock() = Some(res_task);
        dispatcher
    }

    /// Queues without consumers. The response receiver goes to the caller.
    fn idle(op_capacity: usize, response_capacity: usize) -> (Self, mpsc::Receiver<OperationResponse>) {
        // mpsc refuses zero capacity; a zero-slot queue is refused in dispatch.
        let (ops, op_rx) = mpsc::channel(op_capacity.max(1));
        let (responses, response_rx) = mpsc::channel(response_capacity.max(1));
        let dispatcher = Self {
            op_capacity,
            ops,
            op_rx: Arc::new(tokio::sync::Mutex::new(op_rx)),
            responses,
            admission: Mutex::new(()),
            cancel: CancellationToken::new(),
            closing: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            op_task: Mutex::new(None),
            res_task: Mutex::new(None),
        };
        (dispatcher, response_rx)
    }

    /// Queue `op` and report SCHEDULED, or report FAIL if it cannot be
    /// queued. Never waits.
    ///
    /// The immediate response is reserved up front. If the response queue
    /// itself is full the operation is refused without a report.
    pub fn dispatch(&self, op: OperationRequest) {
        let _admission = self.admission.lock();

        let permit = match self.responses.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                warn!(operation_id = %op.operation_id, "response queue full, refusing operation");
                return;
            }
            Err(TrySendError::Closed(())) => {
                warn!(operation_id = %op.operation_id, "response queue closed, refusing operation");
                return;
            }
        };

        if self.stopped.load(Ordering::SeqCst) {
            permit.send(OperationResponse::for_request(&op, OpStatus::Fail, STOPPED_INFO));
            return;
        }

        if self.op_capacity == 0 || self.ops.capacity() == 0 {
            debug!(operation_id = %op.operation_id, "operation queue full");
            permit.send(OperationResponse::for_request(&op, OpStatus::Fail, QUEUE_FULL_INFO));
            return;
        }

        // SCHEDULED is queued before the operation can be picked up, so the
        // result always follows it.
        permit.send(OperationResponse::for_request(&op, OpStatus::Scheduled, ""));
        match self.ops.try_send(op) {
            Ok(()) => {}
            Err(TrySendError::Full(op) | TrySendError::Closed(op)) => {
                // stop closed the queue after the flag check.
                let response = OperationResponse::for_request(&op, OpStatus::Fail, STOPPED_INFO);
                if self.responses.try_send(response).is_err() {
                    warn!(operation_id = %op.operation_id, "response queue unavailable, dropping response");
                }
            }
        }
    }

    pub fn queued_operations(&self) -> usize {
        self.ops.max_capacity() - self.ops.capacity()
    }

    pub fn queued_responses(&self) -> usize {
        self.responses.max_capacity() - self.responses.capacity()
    }

    /// Stop both consumers within `timeout`.
    ///
    /// Operations still queued are reported as FAIL without running.
    /// Responses already queued are still delivered.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("stopping operation dispatcher");
        let deadline = Instant::now() + timeout;

        self.cancel.cancel();
        let op_task = self.op_task.lock().take();
        let operations_done = async move {
            self.fail_queued().await;
            if let Some(task) = op_task {
                if let Err(e) = task.await {
                    warn!(error = %e, "operation worker ended abnormally");
                }
            }
        };
        if tokio::time::timeout_at(deadline, operations_done).await.is_err() {
            self.closing.cancel();
            return Err(AgentError::DeadlineExceeded(format!(
                "waiting for operation worker timed out after {:?}",
                timeout
            )));
        }

        self.closing.cancel();
        let res_task = self.res_task.lock().take();
        if let Some(task) = res_task {
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                return Err(AgentError::DeadlineExceeded(format!(
                    "waiting for response worker timed out after {:?}",
                    timeout
                )));
            }
        }

        info!("operation dispatcher stopped");
        Ok(())
    }

    /// Close the operation queue and report what is left in it as stopped.
    async fn fail_queued(&self) {
        let mut op_rx = self.op_rx.lock().await;
        op_rx.close();
        while let Ok(op) = op_rx.try_recv() {
            let response = OperationResponse::for_request(&op, OpStatus::Fail, STOPPED_INFO);
            respond(&self.responses, &self.closing, response).await;
        }
    }
}

/// Queue `response`, waiting for room until the response queue closes.
async fn respond(
    responses: &mpsc::Sender<OperationResponse>,
    closing: &CancellationToken,
    response: OperationResponse,
) {
    let operation_id = response.operation_id.clone();
    let status = response.status;
    tokio::select! {
        biased;
        sent = responses.send(response) => {
            if sent.is_err() {
                warn!(%operation_id, %status, "response queue closed, dropping response");
            }
        }
        _ = closing.cancelled() => {
            warn!(%operation_id, %status, "response queue closing, dropping response");
        }
    }
}

async fn run_operations(
    ops: OpReceiver,
    responses: mpsc::Sender<OperationResponse>,
    worker: Worker,
    cancel: CancellationToken,
    closing: CancellationToken,
) {
    debug!("starting operation worker");
    loop {
        let next = {
            let mut rx = ops.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                op = rx.recv() => op,
            }
        };
        let Some(op) = next else { break };

        debug!(
            operation_id = %op.operation_id,
            plugin = %op.plugin,
            operation = %op.operation,
            params = ?op.params,
            "executing operation request"
        );

        let result = worker
            .execute(cancel.child_token(), &op.plugin, &op.operation, op.params.clone())
            .await;
        let response = match result {
            Ok(info) => OperationResponse::for_request(&op, OpStatus::Success, info),
            Err(e) => {
                warn!(operation_id = %op.operation_id, error = %e, "failed executing operation");
                OperationResponse::for_request(&op, OpStatus::Fail, e.to_string())
            }
        };
        respond(&responses, &closing, response).await;
    }
    debug!("operation worker stopped");
}

async fn run_responses(
    mut responses: mpsc::Receiver<OperationResponse>,
    client: Arc<dyn AgentClient>,
    closing: CancellationToken,
) {
    debug!("starting operation response worker");
    loop {
        let next = tokio::select! {
            response = responses.recv() => response,
            _ = closing.cancelled() => {
                // No new responses; deliver what is already queued.
                responses.close();
                responses.recv().await
            }
        };
        let Some(response) = next else { break };

        let operation_id = response.operation_id.clone();
        if let Err(e) = client.callback_agent_operation(response).await {
            warn!(%operation_id, error = %e, "failed sending operation response to controller");
        }
    }
    debug!("operation response worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn op(id: &str) -> OperationRequest {
        OperationRequest::new(id, "asset", "ping", "ping")
    }

    fn drain(responses: &mut mpsc::Receiver<OperationResponse>) -> Vec<OperationResponse> {
        std::iter::from_fn(|| responses.try_recv().ok()).collect()
    }

    #[test]
    fn response_queue_fits_dispatch_and_results() {
        assert_eq!(response_capacity(0), 2);
        assert_eq!(response_capacity(32), 66);
    }

    #[test]
    fn zero_capacity_reports_queue_full() {
        let (dispatcher, mut responses) = Dispatcher::idle(0, response_capacity(0));
        dispatcher.dispatch(op("a"));

        let responses = drain(&mut responses);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, OpStatus::Fail);
        assert!(responses[0].info.contains("full"));
        assert_eq!(dispatcher.queued_operations(), 0);
    }

    #[test]
    fn accepted_operation_is_scheduled() {
        let (dispatcher, mut responses) = Dispatcher::idle(1, 1);
        dispatcher.dispatch(op("a"));

        let responses = drain(&mut responses);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, OpStatus::Scheduled);
        assert_eq!(responses[0].operation_id, "a");
        assert_eq!(dispatcher.queued_operations(), 1);
    }

    #[test]
    fn overflow_after_full_queue_still_reports() {
        let (dispatcher, mut responses) = Dispatcher::idle(2, response_capacity(2));
        for id in ["a", "b", "c"] {
            dispatcher.dispatch(op(id));
        }

        let responses = drain(&mut responses);
        let statuses: Vec<_> = responses.iter().map(|r| (r.operation_id.as_str(), r.status)).collect();
        assert_eq!(
            statuses,
            vec![("a", OpStatus::Scheduled), ("b", OpStatus::Scheduled), ("c", OpStatus::Fail)]
        );
        assert_eq!(dispatcher.queued_operations(), 2);
    }

    #[test]
    #[traced_test]
    fn full_response_queue_refuses_operation() {
        let (dispatcher, mut responses) = Dispatcher::idle(4, 1);
        dispatcher.dispatch(op("a"));
        dispatcher.dispatch(op("b"));

        // Nothing could be reported for b, so it was not queued either.
        assert_eq!(dispatcher.queued_operations(), 1);
        let responses = drain(&mut responses);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].operation_id, "a");
        assert!(logs_contain("response queue full"));
    }

    #[tokio::test]
    async fn stop_fails_queued_operations_in_order() {
        let (dispatcher, mut responses) = Dispatcher::idle(2, 4);
        dispatcher.dispatch(op("a"));
        dispatcher.dispatch(op("b"));
        drain(&mut responses);

        dispatcher.stop(Duration::from_secs(1)).await.unwrap();

        let responses = drain(&mut responses);
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].operation_id, "a");
        assert_eq!(responses[1].operation_id, "b");
        for r in &responses {
            assert_eq!(r.status, OpStatus::Fail);
            assert!(r.info.contains("stopped"));
        }
        assert_eq!(dispatcher.queued_operations(), 0);
    }

    #[tokio::test]
    async fn dispatch_after_stop_reports_stopped() {
        let (dispatcher, mut responses) = Dispatcher::idle(2, 2);
        dispatcher.stop(Duration::from_secs(1)).await.unwrap();
        // Second stop is a no-op.
        dispatcher.stop(Duration::from_secs(1)).await.unwrap();

        dispatcher.dispatch(op("late"));
        assert_eq!(dispatcher.queued_operations(), 0);
        let responses = drain(&mut responses);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, OpStatus::Fail);
        assert_eq!(responses[0].info, STOPPED_INFO);
    }
}
