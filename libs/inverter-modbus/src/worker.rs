//! Serialized access to the bus
//!
//! The half-duplex link allows one outstanding exchange. Rather than locking
//! the client, every caller pushes a job onto a bounded FIFO queue and a
//! single worker task drains it.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::Client;
use crate::codec::{Request, Response};
use crate::error::ClientError;
use crate::transport::Transport;

/// Result delivered to the submitter of a request
pub type Outcome = Result<Response, ClientError>;

struct Job {
    request: Request,
    reply: oneshot::Sender<Outcome>,
}

/// Sole owner of the [`Client`] and, through it, the transport
pub struct ModbusWorker<T: Transport> {
    client: Client<T>,
    jobs: mpsc::Receiver<Job>,
    cancel: CancellationToken,
}

/// Cloneable submitter for the worker queue
#[derive(Clone, Debug)]
pub struct ModbusHandle {
    jobs: mpsc::Sender<Job>,
    unit_id: u8,
}

impl<T: Transport> ModbusWorker<T> {
    /// Create a worker and its handle. `queue_depth` bounds pending jobs.
    pub fn new(
        client: Client<T>,
        unit_id: u8,
        queue_depth: usize,
        cancel: CancellationToken,
    ) -> (Self, ModbusHandle) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        (
            Self {
                client,
                jobs: rx,
                cancel,
            },
            ModbusHandle { jobs: tx, unit_id },
        )
    }

    /// Process jobs in arrival order until cancelled or every handle is gone.
    ///
    /// Cancellation also cuts short the exchange in progress: its submitter
    /// gets `TransportUnavailable` and the link is closed.
    pub async fn run(mut self) {
        info!("Modbus worker started");
        let mut abandoned = 0usize;
        loop {
            let job = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                job = self.jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                outcome = self.client.execute(&job.request) => Some(outcome),
            };
            let Some(outcome) = outcome else {
                debug!("Exchange for {:?} interrupted by shutdown", job.request);
                let _ = job.reply.send(Err(stopped()));
                abandoned += 1;
                break;
            };
            if job.reply.send(outcome).is_err() {
                debug!("Submitter of {:?} went away before the reply", job.request);
            }
        }

        self.client.close().await;

        // Anything still queued will never reach the bus
        self.jobs.close();
        while let Ok(job) = self.jobs.try_recv() {
            let _ = job.reply.send(Err(stopped()));
            abandoned += 1;
        }
        info!("Modbus worker stopped ({} queued requests abandoned)", abandoned);
    }
}

fn stopped() -> ClientError {
    ClientError::TransportUnavailable("modbus worker stopped".to_string())
}

impl ModbusHandle {
    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    /// True once the worker has stopped accepting jobs
    pub fn is_closed(&self) -> bool {
        self.jobs.is_closed()
    }

    /// Queue a request and wait for its outcome
    pub async fn submit(&self, request: Request) -> Outcome {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job { request, reply })
            .await
            .map_err(|_| ClientError::TransportUnavailable("request queue closed".to_string()))?;
        rx.await.map_err(|_| {
            ClientError::TransportUnavailable("worker dropped the request".to_string())
        })?
    }

    /// FC 0x03 for `count` registers from `start`
    pub async fn read_holding(&self, start: u16, count: u16) -> Result<Vec<u16>, ClientError> {
        let request = Request::ReadHolding {
            unit_id: self.unit_id,
            start,
            count,
        };
        match self.submit(request).await? {
            Response::Registers(words) => Ok(words),
            other => Err(ClientError::TransportUnavailable(format!(
                "unexpected response to read: {other:?}"
            ))),
        }
    }

    /// FC 0x06, confirmed by the device echo
    pub async fn write_single(&self, address: u16, value: u16) -> Result<(), ClientError> {
        let request = Request::WriteSingle {
            unit_id: self.unit_id,
            address,
            value,
        };
        match self.submit(request).await? {
            Response::Written { .. } => Ok(()),
            other => Err(ClientError::TransportUnavailable(format!(
                "unexpected response to write: {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::client::RetryPolicy;
    use crate::mock::{MockTransport, SimulatedDevice};
    use std::time::Duration;

    fn spawn_device(device: SimulatedDevice) -> (ModbusHandle, crate::mock::MockHandle, CancellationToken) {
        let transport = MockTransport::with_device(device);
        let mock = transport.handle();
        let cancel = CancellationToken::new();
        let client = Client::new(transport, Duration::from_millis(500), RetryPolicy::default());
        let (worker, handle) = ModbusWorker::new(client, 1, 8, cancel.clone());
        tokio::spawn(worker.run());
        (handle, mock, cancel)
    }

    #[tokio::test]
    async fn test_read_and_write_through_queue() {
        let mut device = SimulatedDevice::new(1);
        device.registers.insert(184, 87);
        let (handle, mock, _cancel) = spawn_device(device);

        assert_eq!(handle.read_holding(184, 1).await.unwrap(), vec![87]);
        handle.write_single(245, 5000).await.unwrap();
        assert_eq!(
            mock.with_device(|d| d.registers.get(&245).copied()),
            Some(Some(5000))
        );
    }

    #[tokio::test]
    async fn test_concurrent_submitters_are_serialized_in_order() {
        let mut device = SimulatedDevice::new(1);
        for a in 0..10u16 {
            device.registers.insert(a, a * 10);
        }
        let (handle, mock, _cancel) = spawn_device(device);

        let tasks: Vec<_> = (0..10u16)
            .map(|a| {
                let h = handle.clone();
                tokio::spawn(async move { h.read_holding(a, 1).await })
            })
            .collect();
        for (a, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap().unwrap(), vec![a as u16 * 10]);
        }
        assert_eq!(mock.attempts(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_exchange_in_flight() {
        let mut device = SimulatedDevice::new(1);
        device.silent.push(603..=603);
        let transport = MockTransport::with_device(device);
        let mock = transport.handle();
        let cancel = CancellationToken::new();
        let client = Client::new(transport, Duration::from_secs(1), RetryPolicy::default());
        let (worker, handle) = ModbusWorker::new(client, 1, 8, cancel.clone());
        let worker = tokio::spawn(worker.run());

        let read = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.read_holding(603, 1).await })
        };
        let queued = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.read_holding(184, 1).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = tokio::time::Instant::now();
        cancel.cancel();

        assert!(matches!(
            read.await.unwrap(),
            Err(ClientError::TransportUnavailable(_))
        ));
        assert!(matches!(
            queued.await.unwrap(),
            Err(ClientError::TransportUnavailable(_))
        ));
        worker.await.unwrap();
        // Well inside a single reply timeout
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(mock.attempts(), 1);
        assert_eq!(mock.close_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_worker_closes_transport_and_queue() {
        let (handle, mock, cancel) = spawn_device(SimulatedDevice::new(1));
        cancel.cancel();

        // Wait for the worker to drop its receiver
        for _ in 0..100 {
            if handle.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(handle.is_closed());
        assert_eq!(mock.close_count(), 1);
        assert!(matches!(
            handle.read_holding(0, 1).await,
            Err(ClientError::TransportUnavailable(_))
        ));
    }
}
