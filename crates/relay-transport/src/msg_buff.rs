//! Request/response buffer between a game-client socket handler and its worker
//!
//! The socket side calls [`BufferClient::exchange`] once per received message and gets
//! back the worker's answer. Every wait is bounded by the retry budget and aborted as
//! soon as either side raises the shared exit flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_common::QueueError;
use tokio::sync::mpsc::error::SendTimeoutError;

use crate::queue::{proxy_queue, QueueConfig, QueueReceiver, QueueSender};

/// Create a connected client/worker pair
pub fn message_buffer<Req, Resp>(
    config: QueueConfig,
) -> (BufferClient<Req, Resp>, BufferWorker<Req, Resp>) {
    let (req_tx, req_rx) = proxy_queue(config.clone());
    let (resp_tx, resp_rx) = proxy_queue(config.clone());
    let exit = Arc::new(AtomicBool::new(false));
    let poll = Duration::from_millis(config.poll_interval_ms.max(1));

    (
        BufferClient {
            requests: req_tx,
            responses: resp_rx,
            exit: exit.clone(),
            retry_times: config.retry_times,
            poll,
        },
        BufferWorker {
            requests: req_rx,
            responses: resp_tx,
            exit,
            retry_times: config.retry_times,
            poll,
        },
    )
}

/// Socket-handler half
pub struct BufferClient<Req, Resp> {
    requests: QueueSender<Req>,
    responses: QueueReceiver<Resp>,
    exit: Arc<AtomicBool>,
    retry_times: usize,
    poll: Duration,
}

/// Worker half
pub struct BufferWorker<Req, Resp> {
    requests: QueueReceiver<Req>,
    responses: QueueSender<Resp>,
    exit: Arc<AtomicBool>,
    retry_times: usize,
    poll: Duration,
}

async fn put_with_retries<T>(
    tx: &QueueSender<T>,
    mut item: T,
    exit: &AtomicBool,
    retry_times: usize,
    poll: Duration,
) -> Result<(), QueueError> {
    for _ in 0..retry_times {
        if exit.load(Ordering::Acquire) {
            return Err(QueueError::Exiting);
        }
        match tx.send_within(item, poll).await {
            Ok(()) => return Ok(()),
            Err(SendTimeoutError::Timeout(returned)) => item = returned,
            Err(SendTimeoutError::Closed(_)) => return Err(QueueError::Closed),
        }
    }
    Err(QueueError::Full)
}

async fn get_with_retries<T>(
    rx: &mut QueueReceiver<T>,
    exit: &AtomicBool,
    retry_times: usize,
    poll: Duration,
) -> Result<T, QueueError> {
    for _ in 0..retry_times {
        if exit.load(Ordering::Acquire) {
            return Err(QueueError::Exiting);
        }
        match rx.get_within(poll, retry_times).await {
            Ok(item) => return Ok(item),
            Err(QueueError::Empty { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(QueueError::Empty {
        retries: retry_times,
    })
}

impl<Req, Resp> BufferClient<Req, Resp> {
    /// Hand a request to the worker and wait for its reply
    pub async fn exchange(&mut self, request: Req) -> Result<Resp, QueueError> {
        put_with_retries(
            &self.requests,
            request,
            &self.exit,
            self.retry_times,
            self.poll,
        )
        .await?;
        get_with_retries(&mut self.responses, &self.exit, self.retry_times, self.poll).await
    }

    /// Raise the shared exit flag
    pub fn stop(&self) {
        self.exit.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }
}

impl<Req, Resp> BufferWorker<Req, Resp> {
    /// Next request from the socket side
    pub async fn next_request(&mut self) -> Result<Req, QueueError> {
        get_with_retries(&mut self.requests, &self.exit, self.retry_times, self.poll).await
    }

    /// Answer the oldest outstanding request
    pub async fn reply(&self, response: Resp) -> Result<(), QueueError> {
        put_with_retries(
            &self.responses,
            response,
            &self.exit,
            self.retry_times,
            self.poll,
        )
        .await
    }

    pub fn stop(&self) {
        self.exit.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }
}
