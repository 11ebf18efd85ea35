use crate::error::{CodecError, TransportError};
use crate::link::Link;
use crate::pdu::{self, Decoded};
use crate::timing::{OpKind, TimingCollector};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Request/response framing over a [`Link`].
///
/// Holds at most one operation in flight, keeps consecutive sends at least
/// `min_spacing` apart, and times every exchange.
pub struct Transport<L> {
    link: L,
    state: LinkState,
    notify_rx: Option<mpsc::Receiver<Vec<u8>>>,
    min_spacing: Duration,
    last_send: Option<Instant>,
    consecutive_timeouts: u32,
    max_consecutive_timeouts: u32,
    timing: TimingCollector,
    cancel: CancellationToken,
    session_id: u64,
}

impl<L: Link> Transport<L> {
    pub fn new(
        link: L,
        min_spacing: Duration,
        max_consecutive_timeouts: u32,
        timing: TimingCollector,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            link,
            state: LinkState::Disconnected,
            notify_rx: None,
            min_spacing,
            last_send: None,
            consecutive_timeouts: 0,
            max_consecutive_timeouts: max_consecutive_timeouts.max(1),
            timing,
            cancel,
            session_id: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Increments on every successful connect.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn timing(&self) -> &TimingCollector {
        &self.timing
    }

    pub fn timing_mut(&mut self) -> &mut TimingCollector {
        &mut self.timing
    }

    pub async fn connect(&mut self, timeout: Duration) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        self.state = LinkState::Connecting;
        let started = Instant::now();

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.state = LinkState::Disconnected;
                return Err(TransportError::Cancelled);
            }
            outcome = tokio::time::timeout(timeout, self.link.open()) => outcome,
        };

        match outcome {
            Ok(Ok(notify_rx)) => {
                self.timing.record(OpKind::Connect, started.elapsed(), true);
                self.notify_rx = Some(notify_rx);
                self.state = LinkState::Connected;
                self.consecutive_timeouts = 0;
                self.session_id += 1;
                tracing::info!(
                    "Link up in {:?} (session {})",
                    started.elapsed(),
                    self.session_id
                );
                Ok(())
            }
            Ok(Err(e)) => {
                self.timing.record(OpKind::Connect, started.elapsed(), false);
                // A half-open link may still hold the device connection.
                self.link.close().await;
                self.state = LinkState::Disconnected;
                Err(e.into())
            }
            Err(_) => {
                self.timing.record(OpKind::Connect, started.elapsed(), false);
                self.link.close().await;
                self.state = LinkState::Disconnected;
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    pub async fn disconnect(&mut self) {
        if self.state != LinkState::Disconnected {
            tracing::info!("Closing link (session {})", self.session_id);
            self.link.close().await;
        }
        self.notify_rx = None;
        self.state = LinkState::Disconnected;
    }

    async fn wait_for_spacing(&self) -> Result<(), TransportError> {
        let Some(last_send) = self.last_send else {
            return Ok(());
        };
        let ready = last_send + self.min_spacing;
        if ready <= Instant::now() {
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Cancelled),
            _ = tokio::time::sleep_until(ready) => Ok(()),
        }
    }

    /// Discard notifications that arrived after an earlier exchange gave up.
    fn drain_stale(&mut self) -> Result<(), TransportError> {
        let rx = self.notify_rx.as_mut().ok_or(TransportError::NotConnected)?;
        loop {
            match rx.try_recv() {
                Ok(stale) => tracing::debug!("Dropping stale notification {:02X?}", stale),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    return Err(TransportError::ConnectionLost(
                        "notification channel closed".into(),
                    ));
                }
            }
        }
    }

    async fn lose_connection(&mut self, reason: String) -> TransportError {
        tracing::warn!("Connection lost: {}", reason);
        self.disconnect().await;
        TransportError::ConnectionLost(reason)
    }

    /// Send one frame and wait up to `timeout` for the decoded response.
    pub async fn send_and_wait(
        &mut self,
        frame: &[u8],
        op: OpKind,
        timeout: Duration,
    ) -> Result<Decoded, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.wait_for_spacing().await?;
        if let Err(e) = self.drain_stale() {
            let reason = e.to_string();
            return Err(self.lose_connection(reason).await);
        }

        let started = Instant::now();
        self.last_send = Some(started);
        tracing::trace!("TX {}: {:02X?}", op, frame);
        if let Err(e) = self.link.write(frame).await {
            self.timing.record(op, started.elapsed(), false);
            self.disconnect().await;
            return Err(e.into());
        }

        let Some(rx) = self.notify_rx.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        let received = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.timing.record(op, started.elapsed(), false);
                return Err(TransportError::Cancelled);
            }
            received = tokio::time::timeout(timeout, rx.recv()) => received,
        };
        let elapsed = started.elapsed();

        match received {
            Ok(Some(raw)) => {
                tracing::trace!("RX {} in {:?}: {:02X?}", op, elapsed, raw);
                self.consecutive_timeouts = 0;
                match pdu::decode(&raw) {
                    Ok(decoded) => {
                        self.timing.record(op, elapsed, true);
                        Ok(decoded)
                    }
                    // The device answered; only the request was unsuitable.
                    Err(CodecError::Rejected) => {
                        self.timing.record(op, elapsed, true);
                        Err(CodecError::Rejected.into())
                    }
                    Err(e) => {
                        tracing::debug!("Undecodable response to {}: {}", op, e);
                        self.timing.record(op, elapsed, false);
                        Err(e.into())
                    }
                }
            }
            Ok(None) => {
                self.timing.record(op, elapsed, false);
                Err(self
                    .lose_connection("notification channel closed".into())
                    .await)
            }
            Err(_) => {
                self.timing.record(op, elapsed, false);
                self.consecutive_timeouts += 1;
                tracing::debug!(
                    "{} timed out after {:?} ({} consecutive)",
                    op,
                    timeout,
                    self.consecutive_timeouts
                );
                if self.consecutive_timeouts >= self.max_consecutive_timeouts {
                    let reason = format!("{} consecutive timeouts", self.consecutive_timeouts);
                    return Err(self.lose_connection(reason).await);
                }
                Err(TransportError::Timeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolException;
    use crate::mock_link::MockInverter;

    fn transport(device: &MockInverter, spacing_ms: u64) -> Transport<crate::mock_link::MockLink> {
        Transport::new(
            device.link(),
            Duration::from_millis(spacing_ms),
            3,
            TimingCollector::new(100),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let device = MockInverter::new();
        let mut transport = transport(&device, 50);
        let result = transport
            .send_and_wait(&pdu::encode_read(1, 0x0100, 1), OpKind::ReadRegister, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
        assert!(device.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_sends_respect_spacing() {
        let device = MockInverter::new();
        device.set_register(0x0100, 87);
        let mut transport = transport(&device, 200);
        transport.connect(Duration::from_secs(1)).await.unwrap();

        for _ in 0..5 {
            let decoded = transport
                .send_and_wait(&pdu::encode_read(1, 0x0100, 1), OpKind::ReadRegister, Duration::from_secs(1))
                .await
                .unwrap();
            let Decoded::Data(pdu) = decoded else {
                panic!("expected data");
            };
            assert_eq!(pdu.register_values().unwrap(), vec![87]);
        }

        let sent: Vec<Instant> = device.requests().iter().map(|(at, _)| *at).collect();
        assert_eq!(sent.len(), 5);
        for pair in sent.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
        assert_eq!(transport.timing().sample_count(OpKind::ReadRegister), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn exceptions_decode_and_count_as_success() {
        let device = MockInverter::new();
        device.mark_unsupported(0x0105);
        let mut transport = transport(&device, 0);
        transport.connect(Duration::from_secs(1)).await.unwrap();

        let decoded = transport
            .send_and_wait(&pdu::encode_read(1, 0x0105, 1), OpKind::ReadRegister, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(
            decoded,
            Decoded::Exception { exception: ProtocolException::IllegalAddress, .. }
        ));
        let stats = transport.timing().stats(OpKind::ReadRegister).unwrap();
        assert_eq!(stats.success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_trip_circuit_breaker() {
        let device = MockInverter::new();
        device.silence(0x0100);
        let mut transport = transport(&device, 0);
        transport.connect(Duration::from_secs(1)).await.unwrap();
        let frame = pdu::encode_read(1, 0x0100, 1);

        for _ in 0..2 {
            let result = transport
                .send_and_wait(&frame, OpKind::ReadRegister, Duration::from_millis(500))
                .await;
            assert!(matches!(result, Err(TransportError::Timeout(_))));
        }
        let result = transport
            .send_and_wait(&frame, OpKind::ReadRegister, Duration::from_millis(500))
            .await;
        assert!(matches!(result, Err(TransportError::ConnectionLost(_))));
        assert_eq!(transport.state(), LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_is_not_mistaken_for_next() {
        let device = MockInverter::new();
        device.set_register(0x0100, 1);
        device.set_register(0x0101, 2);
        device.set_latency(Duration::from_millis(800));
        let mut transport = transport(&device, 0);
        transport.connect(Duration::from_secs(1)).await.unwrap();

        let first = transport
            .send_and_wait(&pdu::encode_read(1, 0x0100, 1), OpKind::ReadRegister, Duration::from_millis(500))
            .await;
        assert!(matches!(first, Err(TransportError::Timeout(_))));

        tokio::time::sleep(Duration::from_millis(500)).await;
        device.set_latency(Duration::ZERO);
        let Decoded::Data(pdu) = transport
            .send_and_wait(&pdu::encode_read(1, 0x0101, 1), OpKind::ReadRegister, Duration::from_millis(500))
            .await
            .unwrap()
        else {
            panic!("expected data");
        };
        assert_eq!(pdu.register_values().unwrap(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_releases_link() {
        let device = MockInverter::new();
        device.fail_opens(1);
        let mut transport = transport(&device, 0);

        let result = transport.connect(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TransportError::Link(_))));
        assert_eq!(transport.state(), LinkState::Disconnected);
        assert_eq!(device.closes(), 1);

        transport.connect(Duration::from_secs(1)).await.unwrap();
        assert_eq!(transport.session_id(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_starts_new_session() {
        let device = MockInverter::new();
        let mut transport = transport(&device, 0);
        transport.connect(Duration::from_secs(1)).await.unwrap();
        assert_eq!(transport.session_id(), 1);
        transport.disconnect().await;
        assert!(!transport.is_connected());
        transport.connect(Duration::from_secs(1)).await.unwrap();
        assert_eq!(transport.session_id(), 2);
        assert_eq!(device.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_spacing_wait() {
        let device = MockInverter::new();
        let cancel = CancellationToken::new();
        let mut transport = Transport::new(
            device.link(),
            Duration::from_secs(60),
            3,
            TimingCollector::new(10),
            cancel.clone(),
        );
        transport.connect(Duration::from_secs(1)).await.unwrap();
        let frame = pdu::encode_read(1, 0x0100, 1);
        transport
            .send_and_wait(&frame, OpKind::ReadRegister, Duration::from_secs(1))
            .await
            .unwrap();

        cancel.cancel();
        let result = transport
            .send_and_wait(&frame, OpKind::ReadRegister, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
        assert_eq!(device.requests().len(), 1);
    }
}
