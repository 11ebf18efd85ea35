use crate::error::LinkError;
use std::future::Future;
use tokio::sync::mpsc;

/// Physical byte pipe to the device: frames go out as writes, responses come
/// back as notifications.
///
/// Framing, spacing and timeouts live in [`crate::transport::Transport`].
pub trait Link: Send + Sync {
    /// Establish the connection and subscribe to notifications.
    ///
    /// The returned receiver yields raw notification payloads and closes when
    /// the link drops.
    fn open(&mut self) -> impl Future<Output = Result<mpsc::Receiver<Vec<u8>>, LinkError>> + Send;

    fn write(&mut self, frame: &[u8]) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}
