use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, mpsc::error::TrySendError, oneshot},
    time::Instant,
};
use tracing::{debug, info};

use super::{IdleFirstSelector, SelectError};
use crate::data_model::{EndpointAddress, FunctionRef};

/// One caller parked on a function's queue, waiting for a replica to free.
pub struct QueuedRequest {
    pub request_id: String,
    pub function: FunctionRef,
    pub addresses: Vec<EndpointAddress>,
    pub enqueued_at: Instant,
    pub max_wait: Duration,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Reply slot. Single-use, so a reply into a channel whose caller gave
    /// up is harmless.
    pub reply: oneshot::Sender<Result<usize, SelectError>>,
}

impl IdleFirstSelector {
    /// Park the request on the function's queue and wait for the consumer's
    /// verdict. The enqueue never blocks: a full queue fails immediately.
    pub(crate) async fn queue_and_wait(
        self: &Arc<Self>,
        request_id: &str,
        function: &FunctionRef,
        addresses: &[EndpointAddress],
    ) -> Result<usize, SelectError> {
        let tx = self.queue_sender(function);
        self.metrics.update_queue_depth(
            &function.name,
            &function.namespace,
            tx.max_capacity() - tx.capacity(),
        );

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = QueuedRequest {
            request_id: request_id.to_string(),
            function: function.clone(),
            addresses: addresses.to_vec(),
            enqueued_at: Instant::now(),
            max_wait: self.config.queue_max_wait,
            retry_count: 0,
            max_retries: self.config.queue_max_retries,
            reply: reply_tx,
        };

        if let Err(err) = tx.try_send(request) {
            debug!(
                request_id,
                function = %function,
                "could not enqueue request: {}",
                match err {
                    TrySendError::Full(_) => "queue full",
                    TrySendError::Closed(_) => "queue closed",
                }
            );
            return Err(SelectError::QueueFull);
        }

        match tokio::time::timeout(self.config.queue_outer_deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            // Consumer went away without replying (shutdown).
            Ok(Err(_)) => Err(SelectError::Timeout {
                waited_ms: self.config.queue_outer_deadline.as_millis() as u64,
            }),
            Err(_) => Err(SelectError::Timeout {
                waited_ms: self.config.queue_outer_deadline.as_millis() as u64,
            }),
        }
    }

    /// The sender for a function's queue, creating the queue and spawning
    /// its consumer on first use. One consumer per function, alive until
    /// shutdown.
    fn queue_sender(self: &Arc<Self>, function: &FunctionRef) -> mpsc::Sender<QueuedRequest> {
        self.queues
            .entry(function.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.config.queue_capacity);
                let selector = Arc::clone(self);
                let consumer_tx = tx.clone();
                let function = function.clone();
                tokio::spawn(async move {
                    selector.run_queue_consumer(function, rx, consumer_tx).await;
                });
                tx
            })
            .clone()
    }

    async fn run_queue_consumer(
        self: Arc<Self>,
        function: FunctionRef,
        mut rx: mpsc::Receiver<QueuedRequest>,
        tx: mpsc::Sender<QueuedRequest>,
    ) {
        info!(function = %function, "started queue consumer");
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                maybe_request = rx.recv() => match maybe_request {
                    Some(request) => self.process_queued(&function, request, &tx).await,
                    None => break,
                },
                _ = shutdown_rx.changed() => {
                    debug!(function = %function, "stopping queue consumer");
                    break;
                }
            }
        }
    }

    /// One consumer turn for a queued request: expire it, or retry the
    /// immediate attempt and either reply or re-enqueue.
    async fn process_queued(
        &self,
        function: &FunctionRef,
        mut request: QueuedRequest,
        tx: &mpsc::Sender<QueuedRequest>,
    ) {
        let elapsed = request.enqueued_at.elapsed();
        if elapsed > request.max_wait {
            debug!(
                request_id = %request.request_id,
                function = %function,
                waited_ms = elapsed.as_millis() as u64,
                "queued request expired"
            );
            let _ = request.reply.send(Err(SelectError::Timeout {
                waited_ms: elapsed.as_millis() as u64,
            }));
            return;
        }

        // The ceiling may have appeared since the request was queued.
        let ceiling = self.function_ceiling(function).await;
        self.reconciler
            .prune_by_addresses(&request.request_id, function, Some(&request.addresses), ceiling)
            .await;

        match self
            .try_select_idle(&request.request_id, function, &request.addresses, ceiling)
            .await
        {
            Ok(index) if index < request.addresses.len() => {
                info!(
                    request_id = %request.request_id,
                    function = %function,
                    index,
                    waited_ms = elapsed.as_millis() as u64,
                    attempt = request.retry_count + 1,
                    "queued request got a replica"
                );
                let _ = request.reply.send(Ok(index));
            }
            Ok(index) => {
                let _ = request.reply.send(Err(SelectError::InvalidIndex { index }));
            }
            Err(_) => {
                if request.retry_count < request.max_retries && elapsed < request.max_wait {
                    request.retry_count += 1;
                    // Pace retries so a saturated function does not spin
                    // the consumer.
                    tokio::time::sleep(self.config.retry_backoff).await;
                    match tx.try_send(request) {
                        Ok(()) => {}
                        Err(TrySendError::Full(request)) => {
                            let _ = request.reply.send(Err(SelectError::QueueFullOnRetry {
                                attempts: request.retry_count,
                            }));
                        }
                        // Queue closed mid-shutdown; the caller's outer
                        // deadline reports the timeout.
                        Err(TrySendError::Closed(_)) => {}
                    }
                } else if request.retry_count >= request.max_retries {
                    let _ = request.reply.send(Err(SelectError::RetriesExhausted {
                        attempts: request.retry_count,
                    }));
                } else {
                    let _ = request.reply.send(Err(SelectError::Timeout {
                        waited_ms: elapsed.as_millis() as u64,
                    }));
                }
            }
        }
    }
}
