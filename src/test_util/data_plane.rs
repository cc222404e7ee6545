use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::frame::frame::Frame;
use crate::transport::data_plane::{DataPlane, DataPlaneFactory};

/// An in-memory data plane: sent datagrams are recorded, and received datagrams are fed in by
///  test code.
pub struct RecordingDataPlane {
    sent: RwLock<Vec<Bytes>>,
    inbound_sender: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    left: AtomicBool,
}
impl RecordingDataPlane {
    pub fn new() -> Arc<RecordingDataPlane> {
        let (inbound_sender, inbound) = mpsc::unbounded_channel();
        Arc::new(RecordingDataPlane {
            sent: Default::default(),
            inbound_sender,
            inbound: Mutex::new(inbound),
            left: AtomicBool::new(false),
        })
    }

    /// returns sent datagrams, clearing the internal buffer
    pub async fn sent_datagrams(&self) -> Vec<Bytes> {
        let mut lock = self.sent.write().await;
        std::mem::take(&mut *lock)
    }

    /// returns sent frames, clearing the internal buffer
    pub async fn sent_frames(&self) -> Vec<Frame> {
        self.sent_datagrams().await
            .iter()
            .map(|buf| Frame::decode(buf).expect("only valid frames should be sent"))
            .collect()
    }

    pub async fn assert_no_remaining_frames(&self) {
        let remaining = self.sent_frames().await;
        assert!(remaining.is_empty(), "unexpected frames: {:?}", remaining);
    }

    /// makes a frame available to [DataPlane::recv]
    pub fn push_inbound(&self, frame: &Frame) {
        let buf = frame.encode().expect("test frames should be valid");
        self.push_inbound_raw(&buf);
    }

    pub fn push_inbound_raw(&self, buf: &[u8]) {
        let _ = self.inbound_sender.send(buf.to_vec());
    }

    pub fn has_left(&self) -> bool {
        self.left.load(Ordering::Acquire)
    }
}

#[async_trait]
impl DataPlane for RecordingDataPlane {
    async fn send(&self, buf: &[u8]) -> anyhow::Result<()> {
        self.sent.write().await.push(Bytes::copy_from_slice(buf));
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let datagram = self.inbound.lock().await
            .recv().await
            .ok_or_else(|| anyhow!("data plane closed"))?;
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok(len)
    }

    async fn leave(&self) -> anyhow::Result<()> {
        self.left.store(true, Ordering::Release);
        Ok(())
    }
}

/// Hands out the same [RecordingDataPlane] for every session, recording the groups it was
///  asked to open.
pub struct RecordingDataPlaneFactory {
    pub data_plane: Arc<RecordingDataPlane>,
    opened: RwLock<Vec<(Ipv4Addr, u16)>>,
}
impl RecordingDataPlaneFactory {
    pub fn new(data_plane: Arc<RecordingDataPlane>) -> RecordingDataPlaneFactory {
        RecordingDataPlaneFactory {
            data_plane,
            opened: Default::default(),
        }
    }

    pub async fn opened(&self) -> Vec<(Ipv4Addr, u16)> {
        self.opened.read().await.clone()
    }
}

#[async_trait]
impl DataPlaneFactory for RecordingDataPlaneFactory {
    async fn open(&self, group: Ipv4Addr, port: u16) -> anyhow::Result<Arc<dyn DataPlane>> {
        self.opened.write().await.push((group, port));
        Ok(self.data_plane.clone())
    }
}
