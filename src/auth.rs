use crate::error::{
    AuthenticationError, CodecError, Error, ProtocolException, Result, TransportError,
};
use crate::pdu::{self, Decoded, FunctionCode};
use crate::timing::OpKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;

/// Address range that accepts writes only after a password write to `auth_address`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedRange {
    pub start: u16,
    pub end: u16,
    pub auth_address: u16,
    /// Candidates tried in order until one is accepted.
    pub passwords: Vec<u16>,
}

impl ProtectedRange {
    pub fn contains(&self, address: u16) -> bool {
        (self.start..=self.end).contains(&address)
    }
}

/// Battery and charge parameters of the HF series.
pub fn default_protected_ranges() -> Vec<ProtectedRange> {
    vec![ProtectedRange {
        start: 0xE000,
        end: 0xE0FF,
        auth_address: 0xE203,
        passwords: vec![4321, 0, 1111],
    }]
}

/// One request/response round trip within a connection session.
pub trait Exchange: Send {
    /// Identifies the current connection; changes on every reconnect.
    fn session_id(&self) -> u64;

    fn exchange(
        &mut self,
        request: &[u8],
        op: OpKind,
    ) -> impl Future<Output = std::result::Result<Decoded, TransportError>> + Send;
}

/// Tracks which protected ranges are unlocked for the current session.
pub struct AuthGate {
    ranges: Vec<ProtectedRange>,
    authorized: HashMap<usize, u64>,
}

impl AuthGate {
    pub fn new(ranges: Vec<ProtectedRange>) -> Self {
        Self {
            ranges,
            authorized: HashMap::new(),
        }
    }

    pub fn ranges(&self) -> &[ProtectedRange] {
        &self.ranges
    }

    fn range_index(&self, address: u16) -> Option<usize> {
        self.ranges.iter().position(|r| r.contains(address))
    }

    pub fn requires_auth(&self, address: u16) -> bool {
        self.range_index(address).is_some()
    }

    pub fn is_authorized(&self, address: u16, session_id: u64) -> bool {
        self.range_index(address)
            .is_some_and(|i| self.authorized.get(&i) == Some(&session_id))
    }

    /// Forget every grant. Grants are also ignored once the session id changes.
    pub fn revoke_all(&mut self) {
        if !self.authorized.is_empty() {
            tracing::debug!("Revoking {} authorized ranges", self.authorized.len());
            self.authorized.clear();
        }
    }

    /// Send one password candidate for the range at `index`.
    pub async fn authenticate<X: Exchange>(
        &mut self,
        exchange: &mut X,
        unit_id: u8,
        index: usize,
        password: u16,
    ) -> Result<()> {
        let range = &self.ranges[index];
        let (start, end) = (range.start, range.end);
        let auth_address = range.auth_address;
        let request = pdu::encode_write_single(unit_id, auth_address, password);

        match exchange.exchange(&request, OpKind::Authenticate).await? {
            Decoded::Data(echo)
                if !echo.echoes(unit_id, FunctionCode::WriteSingleRegister, auth_address) =>
            {
                Err(TransportError::Codec(CodecError::Mismatch).into())
            }
            Decoded::Data(_) => {
                tracing::info!("Unlocked protected range {:04X}h-{:04X}h", start, end);
                self.authorized.insert(index, exchange.session_id());
                Ok(())
            }
            Decoded::Exception { exception, .. } => {
                tracing::debug!(
                    "Password rejected for range {:04X}h-{:04X}h: {}",
                    start,
                    end,
                    exception
                );
                Err(AuthenticationError::Rejected { start, end }.into())
            }
        }
    }

    async fn authorize<X: Exchange>(
        &mut self,
        exchange: &mut X,
        unit_id: u8,
        index: usize,
    ) -> Result<()> {
        let range = &self.ranges[index];
        let (start, end) = (range.start, range.end);
        let candidates = range.passwords.clone();
        if candidates.is_empty() {
            return Err(AuthenticationError::NoCandidates { start, end }.into());
        }

        for password in candidates {
            match self.authenticate(exchange, unit_id, index, password).await {
                Ok(()) => return Ok(()),
                Err(Error::Authentication(AuthenticationError::Rejected { .. })) => continue,
                Err(e) => return Err(e),
            }
        }
        tracing::warn!("No password accepted for range {:04X}h-{:04X}h", start, end);
        Err(AuthenticationError::Rejected { start, end }.into())
    }

    /// Write `words` at `address`, unlocking its protected range first if needed.
    ///
    /// A permission-denied reply to a protected write re-authenticates and
    /// retries exactly once.
    pub async fn guard_write<X: Exchange>(
        &mut self,
        exchange: &mut X,
        unit_id: u8,
        address: u16,
        words: &[u16],
    ) -> Result<()> {
        let index = self.range_index(address);
        if let Some(i) = index {
            if self.authorized.get(&i) != Some(&exchange.session_id()) {
                self.authorize(exchange, unit_id, i).await?;
            }
        }

        match write(exchange, unit_id, address, words).await {
            Err(Error::Protocol(ProtocolException::PermissionDenied)) => {
                let Some(i) = index else {
                    return Err(ProtocolException::PermissionDenied.into());
                };
                tracing::warn!("Write to {:04X}h denied, re-authenticating", address);
                self.authorized.remove(&i);
                self.authorize(exchange, unit_id, i).await?;
                match write(exchange, unit_id, address, words).await {
                    Err(Error::Protocol(ProtocolException::PermissionDenied)) => {
                        Err(AuthenticationError::DeniedAfterAuth(address).into())
                    }
                    other => other,
                }
            }
            other => other,
        }
    }
}

async fn write<X: Exchange>(
    exchange: &mut X,
    unit_id: u8,
    address: u16,
    words: &[u16],
) -> Result<()> {
    let (request, function_code) = match words {
        [value] => (
            pdu::encode_write_single(unit_id, address, *value),
            FunctionCode::WriteSingleRegister,
        ),
        _ => (
            pdu::encode_write_multiple(unit_id, address, words),
            FunctionCode::WriteMultipleRegisters,
        ),
    };
    match exchange.exchange(&request, OpKind::WriteRegister).await? {
        Decoded::Data(echo) if echo.echoes(unit_id, function_code, address) => Ok(()),
        Decoded::Data(_) => Err(TransportError::Codec(CodecError::Mismatch).into()),
        Decoded::Exception { exception, .. } => Err(exception.into()),
    }
}
