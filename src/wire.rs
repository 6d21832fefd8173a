use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::directory::AuthContext;
use crate::engine::{Engine, EngineError, ValidationErrors};
use crate::limits::MAX_LINE_LEN;
use crate::model::{BookingRequest, Room};
use crate::observability::{REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};
use crate::pricing::PricingContext;
use crate::property::{Properties, PropertyError};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("connection i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Which property a request line is addressed to.
#[derive(Deserialize)]
struct Target {
    property: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    RegisterRoom {
        room: Room,
    },
    CreateBooking {
        booking: BookingRequest,
        auth: AuthContext,
        #[serde(default)]
        pricing: PricingContext,
    },
    UpdateBooking {
        id: Ulid,
        booking: BookingRequest,
        auth: AuthContext,
        #[serde(default)]
        pricing: PricingContext,
    },
    DeleteBooking {
        id: Ulid,
    },
    GetBooking {
        id: Ulid,
    },
    Price {
        id: Ulid,
        #[serde(default)]
        pricing: PricingContext,
    },
    AddBlock {
        room_id: Ulid,
        from: String,
        to: String,
    },
    RemoveBlock {
        id: Ulid,
    },
    AvailableRooms {
        from: String,
        to: String,
    },
}

impl Request {
    fn label(&self) -> &'static str {
        match self {
            Request::RegisterRoom { .. } => "register_room",
            Request::CreateBooking { .. } => "create_booking",
            Request::UpdateBooking { .. } => "update_booking",
            Request::DeleteBooking { .. } => "delete_booking",
            Request::GetBooking { .. } => "get_booking",
            Request::Price { .. } => "price",
            Request::AddBlock { .. } => "add_block",
            Request::RemoveBlock { .. } => "remove_block",
            Request::AvailableRooms { .. } => "available_rooms",
        }
    }
}

/// Error body of a response line.
#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<ValidationErrors>,
}

impl From<EngineError> for ErrorBody {
    fn from(e: EngineError) -> Self {
        let message = e.to_string();
        let kind = e.label();
        let fields = match e {
            EngineError::Invalid(report) | EngineError::Conflict(report) => Some(report),
            _ => None,
        };
        Self { kind, message, fields }
    }
}

impl From<PropertyError> for ErrorBody {
    fn from(e: PropertyError) -> Self {
        Self {
            kind: "property",
            message: e.to_string(),
            fields: None,
        }
    }
}

impl ErrorBody {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            kind: "bad_request",
            message: message.into(),
            fields: None,
        }
    }
}

fn respond(result: Result<Value, ErrorBody>) -> String {
    match result {
        Ok(value) => json!({ "ok": value }).to_string(),
        Err(body) => json!({ "error": body }).to_string(),
    }
}

fn to_value(value: impl Serialize) -> Result<Value, ErrorBody> {
    serde_json::to_value(value).map_err(|e| ErrorBody::bad_request(e.to_string()))
}

async fn execute(engine: &Engine, request: Request) -> Result<Value, ErrorBody> {
    match request {
        Request::RegisterRoom { room } => {
            engine.register_room(room.clone()).await?;
            to_value(room)
        }
        Request::CreateBooking { booking, auth, mut pricing } => {
            to_value(engine.create_booking(booking, &auth, &mut pricing).await?)
        }
        Request::UpdateBooking { id, booking, auth, mut pricing } => {
            to_value(engine.update_booking(id, booking, &auth, &mut pricing).await?)
        }
        Request::DeleteBooking { id } => to_value(engine.delete_booking(id).await?),
        Request::GetBooking { id } => {
            let booking = engine.booking(&id).await?;
            let periods = engine.booking_periods(&id).await?;
            Ok(json!({
                "status_label": booking.status_label(),
                "booking": to_value(booking)?,
                "periods": to_value(periods)?,
            }))
        }
        Request::Price { id, mut pricing } => {
            let subtotal = engine.subtotal_price(&id).await?;
            let total = engine.total_price(&id, &mut pricing).await?;
            Ok(json!({ "subtotal": subtotal, "total": total }))
        }
        Request::AddBlock { room_id, from, to } => to_value(engine.add_block(room_id, &from, &to).await?),
        Request::RemoveBlock { id } => to_value(engine.remove_block(id).await?),
        Request::AvailableRooms { from, to } => {
            let (from, to) = engine.parse_range(&from, &to)?;
            to_value(engine.available_rooms(from, to).await?)
        }
    }
}

/// Decode one request line, run it, and encode the response line.
pub async fn handle_line(properties: &Properties, line: &str) -> String {
    let parsed = serde_json::from_str::<Value>(line).and_then(|value| {
        let target = Target::deserialize(&value)?;
        let request = Request::deserialize(value)?;
        Ok((target, request))
    });
    let (target, request) = match parsed {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("malformed request: {e}");
            metrics::counter!(REQUESTS_TOTAL, "op" => "unknown", "status" => "bad_request").increment(1);
            return respond(Err(ErrorBody::bad_request(e.to_string())));
        }
    };

    let op = request.label();
    let started = Instant::now();
    let result = match properties.get_or_open(&target.property) {
        Ok(engine) => execute(&engine, request).await,
        Err(e) => Err(e.into()),
    };
    let status = match &result {
        Ok(_) => "ok",
        Err(body) => body.kind,
    };
    metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op).record(started.elapsed().as_secs_f64());
    respond(result)
}

/// Serve newline-delimited JSON requests until the peer hangs up.
pub async fn process_connection(socket: TcpStream, properties: Arc<Properties>) -> Result<(), WireError> {
    let mut lines = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    while let Some(frame) = lines.next().await {
        let response = match frame {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => handle_line(&properties, &line).await,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!("request line over {MAX_LINE_LEN} bytes dropped");
                respond(Err(ErrorBody::bad_request("request line too long")))
            }
            Err(LinesCodecError::Io(e)) => return Err(e.into()),
        };
        lines
            .send(response)
            .await
            .map_err(|e| match e {
                LinesCodecError::Io(io) => io,
                other => std::io::Error::other(other.to_string()),
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Collaborators;

    fn test_properties(name: &str) -> Properties {
        let dir = std::env::temp_dir().join("innkeep_test_wire").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        Properties::new(dir, 1000, Collaborators::default())
    }

    fn parse(response: &str) -> Value {
        serde_json::from_str(response).unwrap()
    }

    #[tokio::test]
    async fn malformed_line_is_a_bad_request() {
        let props = test_properties("malformed");
        let reply = parse(&handle_line(&props, "{not json").await);
        assert_eq!(reply["error"]["kind"], "bad_request");

        let reply = parse(&handle_line(&props, r#"{"property":"inn","op":"teleport"}"#).await);
        assert_eq!(reply["error"]["kind"], "bad_request");
    }

    #[tokio::test]
    async fn unknown_booking_is_not_found() {
        let props = test_properties("not_found");
        let line = json!({ "property": "inn", "op": "get_booking", "id": Ulid::new() }).to_string();
        let reply = parse(&handle_line(&props, &line).await);
        assert_eq!(reply["error"]["kind"], "not_found");
    }

    #[tokio::test]
    async fn occupancy_rejection_carries_fields() {
        let props = test_properties("fields");
        let room = Ulid::new();
        let register = json!({
            "property": "inn", "op": "register_room",
            "room": { "id": room, "title": "Twin", "max_occupancy": 2 }
        });
        let reply = parse(&handle_line(&props, &register.to_string()).await);
        assert_eq!(reply["ok"]["title"], "Twin");

        let create = json!({
            "property": "inn", "op": "create_booking",
            "auth": { "user_id": Ulid::new(), "role": 29 },
            "booking": {
                "guests": [{ "guest_id": Ulid::new() }],
                "rooms": [{ "kind": "new", "room_id": room, "guests_count": 2,
                            "from": "2024-05-01", "to": "2024-05-03" }]
            }
        });
        let reply = parse(&handle_line(&props, &create.to_string()).await);
        assert_eq!(reply["error"]["kind"], "invalid");
        assert_eq!(reply["error"]["fields"]["rooms"][0]["kind"], "occupancy_exceeded");
    }

    #[tokio::test]
    async fn bad_property_name_is_reported() {
        let props = test_properties("bad_property");
        let line = json!({ "property": "///", "op": "get_booking", "id": Ulid::new() }).to_string();
        let reply = parse(&handle_line(&props, &line).await);
        assert_eq!(reply["error"]["kind"], "property");
    }
}
