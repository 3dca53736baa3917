//! Modbus/TCP transport and the breaker-guarded client.
//!
//! The transport is injectable so the client's resilience behavior is
//! testable without a device on the wire.

use crate::core::breaker::{BreakerConfig, CircuitBreaker};
use crate::core::codec::{combine_int32, to_signed_32, ByteOrder};
use crate::core::status::StatusSurface;
use crate::{BridgeError, BridgeResult};
use async_trait::async_trait;
use common::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// MBAP header: transaction id (2) + protocol id (2) + length (2).
const MBAP_HEADER_LEN: usize = 6;

/// Function codes this bridge uses.
const FC_READ_HOLDING: u8 = 0x03;
const FC_WRITE_SINGLE: u8 = 0x06;

/// Read retry budget of the guarded client.
const READ_ATTEMPTS: u32 = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Raw register transport.
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> BridgeResult<Vec<u16>>;

    async fn write_register(&mut self, address: u16, value: u16) -> BridgeResult<()>;
}

/// Plain Modbus/TCP transport with MBAP framing.
pub struct TcpTransport {
    addr: String,
    unit_id: u8,
    stream: Option<TcpStream>,
    transaction_id: u16,
}

impl TcpTransport {
    pub fn new(host: &str, port: u16, unit_id: u8) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            unit_id,
            stream: None,
            transaction_id: 0,
        }
    }

    async fn connected(&mut self) -> BridgeResult<&mut TcpStream> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| BridgeError::network(format!("Connect {}: {e}", self.addr)))?;
            stream.set_nodelay(true)?;
            tracing::info!(addr = %self.addr, "Modbus connection established");
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().unwrap_or_else(|| unreachable!()))
    }

    /// Send one PDU and return the response PDU (function code + data).
    async fn transact(&mut self, pdu: &[u8]) -> BridgeResult<Vec<u8>> {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let tid = self.transaction_id;
        let unit_id = self.unit_id;

        let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
        frame.extend_from_slice(&tid.to_be_bytes());
        frame.extend_from_slice(&0u16.to_be_bytes());
        frame.extend_from_slice(&((pdu.len() as u16 + 1).to_be_bytes()));
        frame.push(unit_id);
        frame.extend_from_slice(pdu);

        let result = async {
            let stream = self.connected().await?;
            stream
                .write_all(&frame)
                .await
                .map_err(|e| BridgeError::network(format!("Write: {e}")))?;

            let mut header = [0u8; MBAP_HEADER_LEN];
            stream
                .read_exact(&mut header)
                .await
                .map_err(|e| BridgeError::network(format!("Read header: {e}")))?;
            let resp_tid = u16::from_be_bytes([header[0], header[1]]);
            if resp_tid != tid {
                return Err(BridgeError::protocol(format!(
                    "Transaction id mismatch: sent {tid}, got {resp_tid}"
                )));
            }
            let length = u16::from_be_bytes([header[4], header[5]]) as usize;
            if length < 2 {
                return Err(BridgeError::protocol("Response shorter than unit id + function code"));
            }
            let mut body = vec![0u8; length];
            stream
                .read_exact(&mut body)
                .await
                .map_err(|e| BridgeError::network(format!("Read body: {e}")))?;
            // body[0] is the unit id echo.
            Ok(body.split_off(1))
        }
        .await;

        if result.is_err() {
            // Drop the stream; the next call reconnects fresh.
            self.stream = None;
        }
        result
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> BridgeResult<Vec<u16>> {
        let mut pdu = Vec::with_capacity(5);
        pdu.push(FC_READ_HOLDING);
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());

        let response = self.transact(&pdu).await?;
        if response.first() == Some(&(FC_READ_HOLDING | 0x80)) {
            let code = response.get(1).copied().unwrap_or(0);
            return Err(BridgeError::protocol(format!(
                "Read exception 0x{code:02X} at address {address}"
            )));
        }
        let byte_count = response.get(1).copied().unwrap_or(0) as usize;
        let data = response.get(2..2 + byte_count).ok_or_else(|| {
            BridgeError::protocol(format!("Truncated read response at address {address}"))
        })?;
        Ok(data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    async fn write_register(&mut self, address: u16, value: u16) -> BridgeResult<()> {
        let mut pdu = Vec::with_capacity(5);
        pdu.push(FC_WRITE_SINGLE);
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&value.to_be_bytes());

        let response = self.transact(&pdu).await?;
        if response.first() == Some(&(FC_WRITE_SINGLE | 0x80)) {
            let code = response.get(1).copied().unwrap_or(0);
            return Err(BridgeError::protocol(format!(
                "Write exception 0x{code:02X} at address {address}"
            )));
        }
        Ok(())
    }
}

/// Breaker-guarded Modbus client.
///
/// Every operation is bounded by a per-operation timeout; a timeout is a
/// network-class failure. Reads retry within a small budget, writes do not.
pub struct GuardedClient {
    transport: tokio::sync::Mutex<Box<dyn ModbusTransport>>,
    breaker: parking_lot::Mutex<CircuitBreaker>,
    status: StatusSurface,
    op_timeout: Duration,
    retry_delay: Duration,
    byte_order: ByteOrder,
}

impl GuardedClient {
    /// Bind a client. The byte order is resolved here, once, and never per
    /// read.
    pub fn new(
        transport: Box<dyn ModbusTransport>,
        breaker_config: BreakerConfig,
        clock: Arc<dyn Clock>,
        status: StatusSurface,
        op_timeout: Duration,
        byte_order: ByteOrder,
    ) -> Self {
        let breaker = CircuitBreaker::new(breaker_config, clock);
        status.update_breaker(breaker.snapshot());
        Self {
            transport: tokio::sync::Mutex::new(transport),
            breaker: parking_lot::Mutex::new(breaker),
            status,
            op_timeout,
            retry_delay: READ_RETRY_DELAY,
            byte_order,
        }
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Read holding registers with retry.
    pub async fn read_registers(&self, address: u16, count: u16) -> BridgeResult<Vec<u16>> {
        self.check_gate()?;

        let mut last_error = None;
        for attempt in 1..=READ_ATTEMPTS {
            let result = {
                let mut transport = self.transport.lock().await;
                tokio::time::timeout(
                    self.op_timeout,
                    transport.read_holding_registers(address, count),
                )
                .await
            };
            let result = flatten_timeout(result, address);
            match result {
                Ok(words) => {
                    self.record_success();
                    return Ok(words);
                }
                Err(e) => {
                    tracing::warn!(address, attempt, error = %e, "Register read failed");
                    // A protocol exception will not heal on retry.
                    let fatal = matches!(e, BridgeError::Protocol(_));
                    last_error = Some(e);
                    if fatal {
                        break;
                    }
                    if attempt < READ_ATTEMPTS {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        let error = last_error.unwrap_or_else(|| BridgeError::network("Read failed"));
        self.record_failure(&error);
        Err(error)
    }

    /// Read a two-register value and sign-extend it.
    pub async fn read_int32(&self, address: u16) -> BridgeResult<i32> {
        let words = self.read_registers(address, 2).await?;
        Ok(to_signed_32(combine_int32(&words, self.byte_order)?))
    }

    /// Write one register. No retry: the breaker decides when to give up.
    pub async fn write_register(&self, address: u16, value: u16) -> BridgeResult<()> {
        self.check_gate()?;

        let result = {
            let mut transport = self.transport.lock().await;
            tokio::time::timeout(self.op_timeout, transport.write_register(address, value)).await
        };
        match flatten_timeout(result, address) {
            Ok(()) => {
                self.record_success();
                Ok(())
            }
            Err(e) => {
                self.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Manually reset the breaker (operator action after a protocol fault).
    pub fn reset_breaker(&self) {
        let mut breaker = self.breaker.lock();
        breaker.reset();
        self.status.update_breaker(breaker.snapshot());
    }

    fn check_gate(&self) -> BridgeResult<()> {
        let mut breaker = self.breaker.lock();
        let allowed = breaker.can_execute();
        self.status.update_breaker(breaker.snapshot());
        if allowed {
            Ok(())
        } else {
            Err(BridgeError::network("Circuit breaker open, call rejected"))
        }
    }

    fn record_success(&self) {
        let mut breaker = self.breaker.lock();
        breaker.record_success();
        self.status.update_breaker(breaker.snapshot());
    }

    fn record_failure(&self, error: &BridgeError) {
        let mut breaker = self.breaker.lock();
        breaker.record_failure(error.failure_kind());
        self.status.update_breaker(breaker.snapshot());
    }
}

fn flatten_timeout<T>(
    result: Result<BridgeResult<T>, tokio::time::error::Elapsed>,
    address: u16,
) -> BridgeResult<T> {
    match result {
        Ok(inner) => inner,
        Err(_) => Err(BridgeError::timeout(format!(
            "Modbus operation at address {address} timed out"
        ))),
    }
}
