use async_trait::async_trait;
use model::binlog::event::BinlogEvent;
use model::binlog::position::BinlogPosition;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("connect to binlog source failed: {0}")]
    Connect(String),

    #[error("producer is already running")]
    AlreadyRunning,

    #[error("producer error: {0}")]
    Other(String),
}

/// The binlog client seam. The concrete client library is an external
/// collaborator; the pipeline only relies on this surface plus the event
/// channel handed to the producer at construction.
#[async_trait]
pub trait BinlogProducer: Send + Sync {
    fn is_running(&self) -> bool;

    /// Starts streaming from an explicit position.
    async fn start(&self, from: BinlogPosition) -> Result<(), ProducerError>;

    /// Restarts streaming from the last recorded TableMap position; used by
    /// the overseer during recovery.
    async fn start_from_last_map_event(&self) -> Result<(), ProducerError>;

    fn binlog_file_name(&self) -> String;
    fn binlog_position(&self) -> u64;
}

#[derive(Debug, Default)]
struct ProducerState {
    running: AtomicBool,
    restarts: AtomicUsize,
    file: Mutex<String>,
    offset: AtomicU64,
}

/// Feeds a pre-recorded event trace through the producer seam. Backs the
/// CLI's `replay` subcommand and the test suite. Once the trace is
/// delivered the event channel closes and the producer reports itself as
/// still running (an idle stream, not a dead one).
pub struct ScriptedProducer {
    events: Mutex<Option<Vec<BinlogEvent>>>,
    tx: Mutex<Option<mpsc::Sender<BinlogEvent>>>,
    state: Arc<ProducerState>,
}

impl ScriptedProducer {
    pub fn new(events: Vec<BinlogEvent>) -> (Arc<Self>, mpsc::Receiver<BinlogEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let producer = Arc::new(Self {
            events: Mutex::new(Some(events)),
            tx: Mutex::new(Some(tx)),
            state: Arc::new(ProducerState::default()),
        });
        (producer, rx)
    }

    pub fn restarts(&self) -> usize {
        self.state.restarts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BinlogProducer for ScriptedProducer {
    fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    async fn start(&self, from: BinlogPosition) -> Result<(), ProducerError> {
        if self.is_running() {
            return Err(ProducerError::AlreadyRunning);
        }
        let events = self
            .events
            .lock()
            .expect("producer lock poisoned")
            .take()
            .ok_or(ProducerError::AlreadyRunning)?;
        let tx = self
            .tx
            .lock()
            .expect("producer lock poisoned")
            .take()
            .ok_or(ProducerError::AlreadyRunning)?;

        *self.state.file.lock().expect("producer lock poisoned") = from.file;
        self.state.offset.store(from.offset, Ordering::SeqCst);
        self.state.running.store(true, Ordering::SeqCst);

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            for event in events {
                if let BinlogEvent::Rotate { next_file, .. } = &event {
                    *state.file.lock().expect("producer lock poisoned") = next_file.clone();
                }
                state
                    .offset
                    .store(event.header().next_position, Ordering::SeqCst);
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            info!("scripted producer delivered its whole trace");
            // The sender drops here, closing the event channel.
        });
        Ok(())
    }

    async fn start_from_last_map_event(&self) -> Result<(), ProducerError> {
        self.state.restarts.fetch_add(1, Ordering::SeqCst);
        self.state.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn binlog_file_name(&self) -> String {
        self.state.file.lock().expect("producer lock poisoned").clone()
    }

    fn binlog_position(&self) -> u64 {
        self.state.offset.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::binlog::event::EventHeader;

    fn xid_event(xid: u64) -> BinlogEvent {
        BinlogEvent::Xid {
            header: EventHeader {
                timestamp: 100,
                next_position: 200 + xid,
            },
            xid,
        }
    }

    #[tokio::test]
    async fn delivers_the_trace_then_closes_the_channel() {
        let (producer, mut rx) = ScriptedProducer::new(vec![xid_event(1), xid_event(2)]);
        producer
            .start(BinlogPosition::new("mysql-bin.000001", 4))
            .await
            .unwrap();
        assert!(producer.is_running());

        assert!(matches!(rx.recv().await, Some(BinlogEvent::Xid { xid: 1, .. })));
        assert!(matches!(rx.recv().await, Some(BinlogEvent::Xid { xid: 2, .. })));
        assert!(rx.recv().await.is_none());
        assert_eq!(producer.binlog_position(), 202);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (producer, _rx) = ScriptedProducer::new(vec![]);
        producer
            .start(BinlogPosition::new("mysql-bin.000001", 4))
            .await
            .unwrap();
        let err = producer
            .start(BinlogPosition::new("mysql-bin.000001", 4))
            .await
            .unwrap_err();
        assert!(matches!(err, ProducerError::AlreadyRunning));
    }
}
