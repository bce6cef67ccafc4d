//! Newline-delimited JSON protocol.
//!
//! Each request is one line:
//!
//! ```text
//! {"user_id":"u1","manager":false,"op":"create_booking","room_id":"01J...","date":"07-01","start":"09:00","end":"10:00"}
//! ```
//!
//! and gets exactly one line back, either `{"ok":true,"data":...}` or
//! `{"ok":false,"error":{"kind":"conflict","message":"..."}}`. The caller's
//! identity and manager flag are trusted as sent; authenticating them is the
//! job of whatever fronts this listener.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability::{command_label, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};
use crate::service::{BookingService, EngineError};

#[derive(Debug, Deserialize)]
pub struct Request {
    pub user_id: String,
    #[serde(default)]
    pub manager: bool,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    CreateRoom {
        name: String,
        room_type: RoomType,
    },
    DeleteRoom {
        room_id: Ulid,
    },
    CreateBooking {
        room_id: Ulid,
        #[serde(default)]
        user_name: String,
        date: String,
        start: String,
        end: String,
    },
    CancelBooking {
        room_id: Ulid,
        booking_id: Ulid,
    },
    RescheduleBooking {
        booking_id: Ulid,
        date: String,
        start: String,
        end: String,
    },
    ApproveBooking {
        booking_id: Ulid,
    },
    DeclineBooking {
        booking_id: Ulid,
    },
    CancelBookingWithReason {
        booking_id: Ulid,
        #[serde(default)]
        reason: String,
    },
    GetRoom {
        room_id: Ulid,
    },
    AllRooms,
    RoomsByType {
        room_type: RoomType,
    },
    AvailableRooms {
        room_type: RoomType,
        date: String,
        start: String,
        end: String,
    },
    /// The caller's own bookings, or `owner`'s when the caller is a manager.
    BookingsByUser {
        #[serde(default)]
        owner: Option<String>,
    },
    GetBooking {
        booking_id: Ulid,
    },
}

impl Command {
    pub fn requires_manager(&self) -> bool {
        matches!(
            self,
            Command::CreateRoom { .. }
                | Command::DeleteRoom { .. }
                | Command::ApproveBooking { .. }
                | Command::DeclineBooking { .. }
                | Command::CancelBookingWithReason { .. }
        )
    }
}

/// Error body sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WireError {
    pub kind: &'static str,
    pub message: String,
}

impl WireError {
    fn bad_request(message: impl fmt::Display) -> Self {
        Self {
            kind: "bad_request",
            message: message.to_string(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            kind: "forbidden",
            message: message.into(),
        }
    }

    fn internal(message: impl fmt::Display) -> Self {
        Self {
            kind: "internal",
            message: message.to_string(),
        }
    }
}

impl From<EngineError> for WireError {
    fn from(e: EngineError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Response {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<WireError>,
}

impl Response {
    fn encode(result: Result<Value, WireError>) -> String {
        let response = match result {
            Ok(data) => Response {
                ok: true,
                data: Some(data),
                error: None,
            },
            Err(error) => Response {
                ok: false,
                data: None,
                error: Some(error),
            },
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(r#"{{"ok":false,"error":{{"kind":"internal","message":"{e}"}}}}"#)
        })
    }
}

fn json<T: Serialize>(value: T) -> Result<Value, WireError> {
    serde_json::to_value(value).map_err(WireError::internal)
}

async fn execute(service: &BookingService, request: Request) -> Result<Value, WireError> {
    let Request {
        user_id,
        manager,
        command,
    } = request;
    if command.requires_manager() && !manager {
        return Err(WireError::forbidden("manager role required"));
    }

    match command {
        Command::CreateRoom { name, room_type } => json(service.create_room(name, room_type).await?),
        Command::DeleteRoom { room_id } => {
            let deleted = service.delete_room(room_id).await?;
            Ok(serde_json::json!({ "deleted": deleted }))
        }
        Command::CreateBooking {
            room_id,
            user_name,
            date,
            start,
            end,
        } => {
            let slot = TimeRange::parse(&date, &start, &end)?;
            let request = BookingRequest {
                user_id,
                user_name,
                slot,
            };
            json(service.create_booking(room_id, request).await?)
        }
        Command::CancelBooking { room_id, booking_id } => {
            json(service.cancel_booking(room_id, booking_id, &user_id).await?)
        }
        Command::RescheduleBooking {
            booking_id,
            date,
            start,
            end,
        } => {
            let slot = TimeRange::parse(&date, &start, &end)?;
            json(service.reschedule_booking(booking_id, &user_id, slot).await?)
        }
        Command::ApproveBooking { booking_id } => json(service.approve_booking(booking_id).await?),
        Command::DeclineBooking { booking_id } => json(service.decline_booking(booking_id).await?),
        Command::CancelBookingWithReason { booking_id, reason } => {
            json(service.cancel_booking_with_reason(booking_id, reason).await?)
        }
        Command::GetRoom { room_id } => json(service.get_room(room_id).await?),
        Command::AllRooms => json(service.all_rooms().await),
        Command::RoomsByType { room_type } => json(service.rooms_by_type(room_type).await),
        Command::AvailableRooms {
            room_type,
            date,
            start,
            end,
        } => {
            let slot = TimeRange::parse(&date, &start, &end)?;
            json(service.available_rooms(room_type, &slot).await)
        }
        Command::BookingsByUser { owner } => {
            let owner = match owner {
                Some(owner) if owner != user_id && !manager => {
                    return Err(WireError::forbidden("only managers may list other users' bookings"));
                }
                Some(owner) => owner,
                None => user_id,
            };
            json(service.bookings_by_user(&owner).await)
        }
        Command::GetBooking { booking_id } => json(service.get_booking(booking_id).await?),
    }
}

/// Decode, run and encode one request line.
pub async fn handle_line(service: &BookingService, line: &str) -> String {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            metrics::counter!(REQUESTS_TOTAL, "command" => "unknown", "status" => "error").increment(1);
            return Response::encode(Err(WireError::bad_request(e)));
        }
    };

    let command = command_label(&request.command);
    let started = Instant::now();
    let result = execute(service, request).await;
    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(REQUESTS_TOTAL, "command" => command, "status" => status).increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS, "command" => command)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        debug!(command, kind = e.kind, "request failed: {}", e.message);
    }
    Response::encode(result)
}

fn into_io(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "line too long")
        }
    }
}

/// Serve one client until it hangs up. Requests on a connection run in order.
pub async fn process_connection(socket: TcpStream, service: Arc<BookingService>) -> io::Result<()> {
    let mut lines = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    while let Some(next) = lines.next().await {
        let line = match next {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!("request line over {MAX_LINE_LEN} bytes discarded");
                let reply = Response::encode(Err(WireError {
                    kind: "limit_exceeded",
                    message: format!("request line longer than {MAX_LINE_LEN} bytes"),
                }));
                lines.send(reply).await.map_err(into_io)?;
                continue;
            }
            Err(LinesCodecError::Io(e)) => return Err(e),
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_line(&service, &line).await;
        lines.send(reply).await.map_err(into_io)?;
    }
    Ok(())
}
