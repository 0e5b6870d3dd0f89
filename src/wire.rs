//! Newline-delimited JSON protocol.
//!
//! Each line from the client is one request object tagged by `op`:
//!
//! ```text
//! {"op":"get_free_slots","subject":"alice","from":1704067200000,"to":1704153600000}
//! ```
//!
//! Each request gets exactly one response line, in order:
//!
//! ```text
//! {"ok":true,"data":[{"start_at":1704099600000,"end_at":1704101400000}]}
//! {"ok":false,"error":{"code":"slot_taken","class":"conflict","message":"slot already booked"}}
//! ```

use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability;
use crate::request::{BookingRequest, RangeQuery, RuleRequest};
use crate::scheduler::Scheduler;
use crate::store::{BookingStore, RuleStore};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    SetAvailability {
        subject: String,
        rules: Vec<RuleRequest>,
    },
    UpdateAvailability {
        subject: String,
        rule_id: Ulid,
        patch: RulePatch,
    },
    ListAvailability {
        subject: String,
    },
    GetFreeSlots {
        subject: String,
        from: Ms,
        to: Ms,
    },
    CreateBooking {
        subject: String,
        booking: BookingRequest,
    },
    ListBookings {
        subject: String,
        #[serde(default)]
        range: Option<RangeQuery>,
    },
    CancelBooking {
        booking_id: Ulid,
    },
}

impl Request {
    /// Short label for metrics and logs.
    pub fn op(&self) -> &'static str {
        match self {
            Request::SetAvailability { .. } => "set_availability",
            Request::UpdateAvailability { .. } => "update_availability",
            Request::ListAvailability { .. } => "list_availability",
            Request::GetFreeSlots { .. } => "get_free_slots",
            Request::CreateBooking { .. } => "create_booking",
            Request::ListBookings { .. } => "list_bookings",
            Request::CancelBooking { .. } => "cancel_booking",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Rules(Vec<AvailabilityRule>),
    Rule(AvailabilityRule),
    Slots(Vec<Slot>),
    Bookings(Vec<Booking>),
    Booking(Booking),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub class: &'static str,
    pub message: String,
}

impl From<&EngineError> for ErrorBody {
    fn from(e: &EngineError) -> Self {
        Self {
            code: e.code(),
            class: e.class().as_str(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Reply>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn error(e: &EngineError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(ErrorBody::from(e)),
        }
    }
}

impl From<Result<Reply, EngineError>> for Response {
    fn from(result: Result<Reply, EngineError>) -> Self {
        match result {
            Ok(data) => Self {
                ok: true,
                data: Some(data),
                error: None,
            },
            Err(e) => Self::error(&e),
        }
    }
}

/// Run one request against the scheduler.
pub async fn dispatch<S: RuleStore + BookingStore>(
    scheduler: &Scheduler<S>,
    request: Request,
) -> Result<Reply, EngineError> {
    match request {
        Request::SetAvailability { subject, rules } => scheduler
            .set_availability(&subject, rules)
            .await
            .map(Reply::Rules),
        Request::UpdateAvailability {
            subject,
            rule_id,
            patch,
        } => scheduler
            .update_availability(&subject, rule_id, patch)
            .await
            .map(Reply::Rule),
        Request::ListAvailability { subject } => scheduler
            .list_availability(&subject)
            .await
            .map(Reply::Rules),
        Request::GetFreeSlots { subject, from, to } => scheduler
            .get_free_slots(&subject, from, to)
            .await
            .map(Reply::Slots),
        Request::CreateBooking { subject, booking } => scheduler
            .create_booking(&subject, booking)
            .await
            .map(Reply::Booking),
        Request::ListBookings { subject, range } => scheduler
            .list_bookings(&subject, range)
            .await
            .map(Reply::Bookings),
        Request::CancelBooking { booking_id } => scheduler
            .cancel_booking(booking_id)
            .await
            .map(Reply::Booking),
    }
}

/// Parse, execute and answer one request line.
pub async fn handle_line<S: RuleStore + BookingStore>(scheduler: &Scheduler<S>, line: &str) -> Response {
    let request = match serde_json::from_str::<Request>(line) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!("malformed request: {e}");
            return Response::error(&EngineError::InvalidRequest(e.to_string()));
        }
    };

    let op = request.op();
    let start = Instant::now();
    let result = dispatch(scheduler, request).await;
    let status = match &result {
        Ok(_) => "ok",
        Err(e) => e.class().as_str(),
    };
    observability::record_operation(op, status, start.elapsed());
    result.into()
}

fn codec_to_io(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection<S>(socket: TcpStream, scheduler: Arc<Scheduler<S>>) -> io::Result<()>
where
    S: RuleStore + BookingStore,
{
    let mut lines = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    let mut after_error = false;
    loop {
        let frame = match lines.next().await {
            Some(frame) => frame,
            // The framed stream yields one `None` after a decode error, then resumes.
            None if after_error => {
                after_error = false;
                continue;
            }
            None => break,
        };
        after_error = frame.is_err();
        let response = match frame {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => handle_line(&scheduler, &line).await,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                tracing::warn!("request line exceeds {MAX_LINE_LEN} bytes");
                Response::error(&EngineError::LimitExceeded("request line too long"))
            }
            Err(LinesCodecError::Io(e)) => return Err(e),
        };
        let encoded = serde_json::to_string(&response)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        lines.send(encoded).await.map_err(codec_to_io)?;
    }
    Ok(())
}
