//! In-process inverter simulator behind the [`Link`] trait.

use crate::error::{LinkError, ProtocolException};
use crate::link::Link;
use crate::pdu::{self, Decoded, FunctionCode, NOTIFY_PREAMBLE_LEN, Pdu};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectStyle {
    /// Exception frame carrying IllegalAddress.
    Exception,
    /// The bridge's bare "----" notification.
    Dash,
}

struct DeviceState {
    unit_id: u8,
    registers: BTreeMap<u16, u16>,
    unsupported: BTreeSet<u16>,
    reject_style: RejectStyle,
    protected: RangeInclusive<u16>,
    auth_address: u16,
    password: u16,
    unlocked: bool,
    latency: Duration,
    requests: Vec<(Instant, Vec<u8>)>,
    opens: u32,
    closes: u32,
    failing_opens: u32,
    drop_after: Option<usize>,
    silent: BTreeSet<u16>,
    ignored_writes: BTreeSet<u16>,
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

/// Shared handle to the simulated device; clones observe the same state.
#[derive(Clone)]
pub struct MockInverter {
    state: Arc<Mutex<DeviceState>>,
}

impl MockInverter {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                unit_id: 1,
                registers: BTreeMap::new(),
                unsupported: BTreeSet::new(),
                reject_style: RejectStyle::Exception,
                protected: 0xE000..=0xE0FF,
                auth_address: 0xE203,
                password: 4321,
                unlocked: false,
                latency: Duration::ZERO,
                requests: Vec::new(),
                opens: 0,
                closes: 0,
                failing_opens: 0,
                drop_after: None,
                silent: BTreeSet::new(),
                ignored_writes: BTreeSet::new(),
                tx: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    pub fn link(&self) -> MockLink {
        MockLink {
            device: self.clone(),
        }
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.lock().registers.insert(address, value);
    }

    pub fn register(&self, address: u16) -> Option<u16> {
        self.lock().registers.get(&address).copied()
    }

    pub fn mark_unsupported(&self, address: u16) {
        self.lock().unsupported.insert(address);
    }

    pub fn set_reject_style(&self, style: RejectStyle) {
        self.lock().reject_style = style;
    }

    pub fn set_password(&self, password: u16) {
        self.lock().password = password;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Reads starting at `address` get no response.
    pub fn silence(&self, address: u16) {
        self.lock().silent.insert(address);
    }

    /// Acknowledge writes to `address` without applying them.
    pub fn ignore_writes(&self, address: u16) {
        self.lock().ignored_writes.insert(address);
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_opens(&self, count: u32) {
        self.lock().failing_opens = count;
    }

    /// Drop the link when the request after the next `requests` arrives.
    pub fn drop_after(&self, requests: usize) {
        self.lock().drop_after = Some(requests);
    }

    pub fn opens(&self) -> u32 {
        self.lock().opens
    }

    pub fn closes(&self) -> u32 {
        self.lock().closes
    }

    pub fn requests(&self) -> Vec<(Instant, Vec<u8>)> {
        self.lock().requests.clone()
    }

    /// `(function code, address)` of every request received.
    pub fn request_log(&self) -> Vec<(u8, u16)> {
        self.lock()
            .requests
            .iter()
            .filter_map(|(_, frame)| match pdu::decode(frame) {
                Ok(Decoded::Data(pdu)) => pdu
                    .address_and_word()
                    .ok()
                    .map(|(address, _)| (pdu.function_code as u8, address)),
                _ => None,
            })
            .collect()
    }

    /// Start addresses of read requests, in order.
    pub fn reads(&self) -> Vec<u16> {
        self.request_log()
            .into_iter()
            .filter(|(fc, _)| *fc == FunctionCode::ReadHoldingRegisters as u8)
            .map(|(_, address)| address)
            .collect()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }
}

impl DeviceState {
    fn exception(&self, function_code: FunctionCode, exception: ProtocolException) -> Vec<u8> {
        pdu::encode_exception(self.unit_id, function_code as u8, exception)
    }

    fn reject(&self) -> Vec<u8> {
        match self.reject_style {
            RejectStyle::Exception => self.exception(
                FunctionCode::ReadHoldingRegisters,
                ProtocolException::IllegalAddress,
            ),
            RejectStyle::Dash => vec![0x2D; 16],
        }
    }

    fn write(&mut self, address: u16, values: &[u16], function_code: FunctionCode) -> Option<Vec<u8>> {
        if address == self.auth_address {
            if values.first() == Some(&self.password) {
                self.unlocked = true;
                return None;
            }
            return Some(self.exception(function_code, ProtocolException::IncorrectPassword));
        }
        let end = address + values.len() as u16 - 1;
        if (address..=end).any(|a| self.unsupported.contains(&a)) {
            return Some(self.exception(function_code, ProtocolException::IllegalAddress));
        }
        if (address..=end).any(|a| self.protected.contains(&a)) && !self.unlocked {
            return Some(self.exception(function_code, ProtocolException::PermissionDenied));
        }
        for (offset, value) in values.iter().enumerate() {
            let target = address + offset as u16;
            if !self.ignored_writes.contains(&target) {
                self.registers.insert(target, *value);
            }
        }
        None
    }

    fn respond(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let Ok(Decoded::Data(request)) = pdu::decode(frame) else {
            return None;
        };
        let (address, word) = request.address_and_word().ok()?;
        match request.function_code {
            FunctionCode::ReadHoldingRegisters => {
                if self.silent.contains(&address) {
                    return None;
                }
                let range = address..address.saturating_add(word);
                if range.clone().any(|a| self.unsupported.contains(&a)) {
                    return Some(self.reject());
                }
                let values: Vec<u16> = range
                    .map(|a| self.registers.get(&a).copied().unwrap_or(0))
                    .collect();
                Some(pdu::encode_read_response(self.unit_id, &values))
            }
            FunctionCode::WriteSingleRegister => Some(
                self.write(address, &[word], request.function_code)
                    .unwrap_or_else(|| frame.to_vec()),
            ),
            FunctionCode::WriteMultipleRegisters => {
                let values: Vec<u16> = request.payload[5..]
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                Some(
                    self.write(address, &values, request.function_code)
                        .unwrap_or_else(|| {
                            Pdu::new(
                                self.unit_id,
                                FunctionCode::WriteMultipleRegisters,
                                request.payload[..4].to_vec(),
                            )
                            .encode()
                        }),
                )
            }
        }
    }
}

pub struct MockLink {
    device: MockInverter,
}

impl Link for MockLink {
    async fn open(&mut self) -> Result<mpsc::Receiver<Vec<u8>>, LinkError> {
        let mut state = self.device.lock();
        state.opens += 1;
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(LinkError::Io(std::io::Error::other("device unreachable")));
        }
        let (tx, rx) = mpsc::channel(16);
        state.tx = Some(tx);
        state.unlocked = false;
        Ok(rx)
    }

    async fn write(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let (tx, response, latency) = {
            let mut state = self.device.lock();
            let Some(tx) = state.tx.clone() else {
                return Err(LinkError::Closed);
            };
            state.requests.push((Instant::now(), frame.to_vec()));
            match state.drop_after {
                Some(0) => {
                    state.drop_after = None;
                    state.tx = None;
                    return Ok(());
                }
                Some(n) => state.drop_after = Some(n - 1),
                None => {}
            }
            (tx, state.respond(frame), state.latency)
        };

        if let Some(response) = response {
            let mut raw = vec![0u8; NOTIFY_PREAMBLE_LEN];
            raw.extend(response);
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                let _ = tx.send(raw).await;
            });
        }
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.device.lock();
        state.closes += 1;
        state.tx = None;
    }
}
