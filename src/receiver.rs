//! Request handlers for the log receiver.
//!
//! `handle` is a plain function from a parsed request to a response, so the
//! routing and payload handling can be exercised without a socket.

use std::fmt;

use chrono::{Local, Utc};
use http::{header, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;

use crate::errors::*;
use crate::{Request, Response};

pub const RECEIVE_PATH: &str = "/api/logs/receive";
pub const HEALTH_PATH: &str = "/health";
pub const SERVICE_NAME: &str = "HTTP Log Server";
pub const ACK_MESSAGE: &str = "日志接收成功";
pub const PARSE_FAILURE_PREFIX: &str = "解析失败: ";
pub const UNKNOWN_SOURCE: &str = "Unknown";
pub const NOT_FOUND_BODY: &[u8] = b"Not Found";

const LOG_SOURCE_HEADER: &str = "x-log-source";
const ENTITY_TYPE_HEADER: &str = "x-entity-type";

pub(crate) const RULE: &str =
    "============================================================";

/// Body of a 200 from the receive endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgment<'a> {
    pub success: bool,
    pub message: &'a str,
    pub timestamp: i64,
    pub received_data: &'a Value,
}

/// Body of a 400 from the receive endpoint
#[derive(Debug, Serialize)]
pub struct ParseFailure {
    pub success: bool,
    pub message: String,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct Health<'a> {
    pub status: &'a str,
    pub service: &'a str,
    pub timestamp: i64,
}

/// Console block printed for every accepted payload
pub struct Receipt<'a> {
    pub time: String,
    pub source: &'a str,
    pub entity_type: Option<&'a str>,
    pub path: &'a str,
    pub payload: &'a Value,
}

impl<'a> fmt::Display for Receipt<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let pretty = serde_json::to_string_pretty(self.payload).map_err(|_| fmt::Error)?;
        writeln!(f, "{}", RULE)?;
        writeln!(f, "received HTTP log - {}", self.time)?;
        writeln!(f, "   source: {}", self.source)?;
        if let Some(entity_type) = self.entity_type {
            writeln!(f, "   entity: {}", entity_type)?;
        }
        writeln!(f, "   path: {}", self.path)?;
        writeln!(f, "   content: {}", pretty)?;
        write!(f, "{}", RULE)
    }
}

/// Milliseconds since the unix epoch, read fresh for every response
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Decode `body` as UTF-8 and parse it as JSON, keeping object key order
pub fn parse_payload(body: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(body)?;
    Ok(serde_json::from_str(text)?)
}

/// Route a request by method and full request target
pub fn handle(request: Request) -> Response<Vec<u8>> {
    // absolute-form targets keep their scheme and authority and so never match
    let target = request.uri().to_string();
    match (request.method(), target.as_str()) {
        (&Method::POST, RECEIVE_PATH) => receive_log(&request),
        (&Method::GET, HEALTH_PATH) => health(),
        _ => not_found(),
    }
}

fn receive_log(request: &Request) -> Response<Vec<u8>> {
    match parse_payload(request.body()) {
        Ok(payload) => {
            let receipt = Receipt {
                time: Local::now().format("%H:%M:%S").to_string(),
                source: header_str(request, LOG_SOURCE_HEADER).unwrap_or(UNKNOWN_SOURCE),
                entity_type: header_str(request, ENTITY_TYPE_HEADER),
                path: request.uri().path(),
                payload: &payload,
            };
            info!("\n{}", receipt);

            json_response(
                StatusCode::OK,
                &Acknowledgment {
                    success: true,
                    message: ACK_MESSAGE,
                    timestamp: now_millis(),
                    received_data: &payload,
                },
            )
        }
        Err(e) => {
            error!("failed to parse log payload: {}", e);
            json_response(
                StatusCode::BAD_REQUEST,
                &ParseFailure {
                    success: false,
                    message: format!("{}{}", PARSE_FAILURE_PREFIX, e),
                    timestamp: now_millis(),
                },
            )
        }
    }
}

fn health() -> Response<Vec<u8>> {
    json_response(
        StatusCode::OK,
        &Health {
            status: "UP",
            service: SERVICE_NAME,
            timestamp: now_millis(),
        },
    )
}

fn not_found() -> Response<Vec<u8>> {
    let mut resp = Response::new(NOT_FOUND_BODY.to_vec());
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}

fn header_str<'r>(request: &'r Request, name: &str) -> Option<&'r str> {
    request
        .headers()
        .get(name)
        .map(|v| v.to_str().unwrap_or("<non-utf8>"))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Vec<u8>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut resp = Response::new(bytes);
            *resp.status_mut() = status;
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/json"),
            );
            resp
        }
        Err(e) => {
            error!("failed to serialize response body: {}", e);
            let mut resp = Response::new(Vec::new());
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        }
    }
}
