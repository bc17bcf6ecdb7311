//! Vendor control-request protocol.
//!
//! A request is a short conversation of vendor control transfers addressed
//! to the device, with the service type in `bRequest`:
//!
//! 1. `INIT` (IN): `wIndex` = request type, `wValue` = payload size. The
//!    reply carries the request id.
//! 2. `CHECK` (IN) until the payload buffer is allocated, then `SEND` (OUT)
//!    with the payload, when there is one.
//! 3. `CHECK` (IN) until the device stops answering `PENDING`. The final
//!    reply carries the result code and the size of the reply payload.
//! 4. `RECV` (IN) to drain the reply payload, when there is one.
//!
//! Every IN transfer to a service returns a reply frame: little-endian
//! field flags (`u32`) and status (`u16`), followed by the optional id
//! (`u16`), size (`u32`) and result (`i32`) fields the flags announce.

use std::io::Cursor;
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt};

use super::traits::TransportError;

/// Service types, sent as `bRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceType {
    Init = 1,
    Check = 2,
    Send = 3,
    Recv = 4,
}

/// Smallest `wLength` a service IN transfer may use.
pub const MIN_REPLY_LENGTH: u16 = 64;

const FIELD_ID: u32 = 0x02;
const FIELD_SIZE: u32 = 0x04;
const FIELD_RESULT: u32 = 0x08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error,
    Pending,
    Busy,
    NoMemory,
    NotFound,
    Unknown(u16),
}

impl From<u16> for ReplyStatus {
    fn from(raw: u16) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::Error,
            2 => Self::Pending,
            3 => Self::Busy,
            4 => Self::NoMemory,
            5 => Self::NotFound,
            other => Self::Unknown(other),
        }
    }
}

/// Decoded service reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceReply {
    pub status: ReplyStatus,
    pub id: Option<u16>,
    pub size: Option<u32>,
    pub result: Option<i32>,
}

impl ServiceReply {
    pub fn parse(data: &[u8]) -> std::io::Result<Self> {
        let mut cursor = Cursor::new(data);
        let flags = cursor.read_u32::<LittleEndian>()?;
        let status = ReplyStatus::from(cursor.read_u16::<LittleEndian>()?);
        let id = (flags & FIELD_ID != 0)
            .then(|| cursor.read_u16::<LittleEndian>())
            .transpose()?;
        let size = (flags & FIELD_SIZE != 0)
            .then(|| cursor.read_u32::<LittleEndian>())
            .transpose()?;
        let result = (flags & FIELD_RESULT != 0)
            .then(|| cursor.read_i32::<LittleEndian>())
            .transpose()?;
        Ok(Self {
            status,
            id,
            size,
            result,
        })
    }
}

/// Blocking vendor control transfers to the device recipient.
pub trait ControlPipe {
    fn vendor_in(&mut self, service: ServiceType, value: u16, index: u16, length: u16)
    -> Result<Vec<u8>, String>;

    fn vendor_out(&mut self, service: ServiceType, value: u16, index: u16, data: &[u8]) -> Result<(), String>;
}

/// Polling cadence and deadline for one request.
#[derive(Debug, Clone, Copy)]
pub struct ServiceTiming {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for ServiceTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Run one request to completion. Returns the reply payload, if any.
pub fn send_service_request<P: ControlPipe>(
    pipe: &mut P,
    request_type: u16,
    payload: &[u8],
    timing: ServiceTiming,
) -> Result<Vec<u8>, TransportError> {
    let fail = |message: String| TransportError::ControlFailed {
        request_type,
        message,
    };
    let size = u16::try_from(payload.len()).map_err(|_| fail(format!("payload too large: {}", payload.len())))?;
    let deadline = Instant::now() + timing.timeout;

    let exchange = |pipe: &mut P, service, value, index| -> Result<ServiceReply, TransportError> {
        let data = pipe.vendor_in(service, value, index, MIN_REPLY_LENGTH).map_err(&fail)?;
        ServiceReply::parse(&data).map_err(|e| fail(format!("malformed {service:?} reply: {e}")))
    };

    let init = exchange(pipe, ServiceType::Init, size, request_type)?;
    let id = init.id.ok_or_else(|| fail("INIT reply without request id".into()))?;
    let mut reply = init;

    if size > 0 {
        while reply.status == ReplyStatus::Pending {
            wait_for_poll(deadline, timing, &fail)?;
            reply = exchange(pipe, ServiceType::Check, 0, id)?;
        }
        check_status(reply.status, &fail)?;
        pipe.vendor_out(ServiceType::Send, 0, id, payload).map_err(&fail)?;
        reply = exchange(pipe, ServiceType::Check, 0, id)?;
    } else {
        check_status(reply.status, &fail)?;
        reply = exchange(pipe, ServiceType::Check, 0, id)?;
    }

    while reply.status == ReplyStatus::Pending {
        wait_for_poll(deadline, timing, &fail)?;
        reply = exchange(pipe, ServiceType::Check, 0, id)?;
    }
    check_status(reply.status, &fail)?;

    let reply_size = reply.size.unwrap_or(0);
    let data = if reply_size > 0 {
        let length = u16::try_from(reply_size).map_err(|_| fail(format!("reply too large: {reply_size}")))?;
        pipe.vendor_in(ServiceType::Recv, 0, id, length).map_err(&fail)?
    } else {
        Vec::new()
    };

    match reply.result.unwrap_or(0) {
        0 => Ok(data),
        code => Err(fail(format!("device returned result {code}"))),
    }
}

fn check_status(status: ReplyStatus, fail: &impl Fn(String) -> TransportError) -> Result<(), TransportError> {
    match status {
        ReplyStatus::Ok => Ok(()),
        other => Err(fail(format!("device replied {other:?}"))),
    }
}

fn wait_for_poll(
    deadline: Instant,
    timing: ServiceTiming,
    fail: &impl Fn(String) -> TransportError,
) -> Result<(), TransportError> {
    if Instant::now() >= deadline {
        return Err(fail("timed out waiting for the device".into()));
    }
    std::thread::sleep(timing.poll_interval);
    Ok(())
}
