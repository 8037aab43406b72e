//! Wire envelopes and the shared request/reply transport client.
//!
//! Both services speak newline-delimited JSON envelopes over TCP: one
//! request frame in, one reply frame out, strictly alternating. The
//! scheduler and the agent each own a distinct message-type enumeration;
//! the two tag spaces are never interchanged on the wire.
//!
//! Frame shape (scheduler family):
//!   → `{"MsgType": 0, "AppID": "alice", "Address": "", "Error": ""}`
//!   ← `{"MsgType": 1, "AppID": "alice", "Address": "tcp://h:9924", "Error": ""}`
//!
//! Tags are small integers for compatibility with the deployed registry
//! files and clients; out-of-range tags fail decode.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::AppError;

// ── message types ─────────────────────────────────────────────────────────

/// Scheduler request/reply tags.
///
/// `Set` and `Ok` are reserved: they decode but have no server-side
/// handler and are answered with `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SchedMsgType {
    Lookup = 0,
    Reply = 1,
    Set = 2,
    Ok = 3,
    Error = 4,
    Unknown = 5,
    NotFound = 6,
    Ping = 7,
    PingReply = 8,
}

impl From<SchedMsgType> for u8 {
    fn from(t: SchedMsgType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for SchedMsgType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, String> {
        Ok(match v {
            0 => Self::Lookup,
            1 => Self::Reply,
            2 => Self::Set,
            3 => Self::Ok,
            4 => Self::Error,
            5 => Self::Unknown,
            6 => Self::NotFound,
            7 => Self::Ping,
            8 => Self::PingReply,
            other => return Err(format!("unknown scheduler message type {other}")),
        })
    }
}

/// Agent request/reply tags.
///
/// `ForceKillPid` is reserved: it decodes but is answered as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum AgentMsgType {
    StartApp = 0,
    StopApp = 1,
    Ps = 2,
    Ping = 3,
    PingReply = 4,
    KillPid = 5,
    ForceKillPid = 6,
    Error = 7,
}

impl From<AgentMsgType> for u8 {
    fn from(t: AgentMsgType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for AgentMsgType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, String> {
        Ok(match v {
            0 => Self::StartApp,
            1 => Self::StopApp,
            2 => Self::Ps,
            3 => Self::Ping,
            4 => Self::PingReply,
            5 => Self::KillPid,
            6 => Self::ForceKillPid,
            7 => Self::Error,
            other => return Err(format!("unknown agent message type {other}")),
        })
    }
}

// ── envelopes ─────────────────────────────────────────────────────────────

/// Scheduler envelope, symmetric for requests and replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMsg {
    #[serde(rename = "MsgType")]
    pub msg_type: SchedMsgType,
    #[serde(rename = "AppID", default)]
    pub app_id: String,
    #[serde(rename = "Address", default)]
    pub address: String,
    #[serde(rename = "Error", default)]
    pub error: String,
}

impl SchedulerMsg {
    pub fn new(msg_type: SchedMsgType) -> Self {
        Self {
            msg_type,
            app_id: String::new(),
            address: String::new(),
            error: String::new(),
        }
    }

    pub fn lookup(app_id: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            ..Self::new(SchedMsgType::Lookup)
        }
    }

    pub fn error(detail: String) -> Self {
        Self {
            error: detail,
            ..Self::new(SchedMsgType::Error)
        }
    }
}

/// Agent envelope. `msg_data` is operation-specific: a pid as text in a
/// kill request, captured command output in a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMsg {
    #[serde(rename = "MsgType")]
    pub msg_type: AgentMsgType,
    #[serde(rename = "AppID", default)]
    pub app_id: String,
    #[serde(rename = "MsgData", default)]
    pub msg_data: String,
    #[serde(rename = "Error", default)]
    pub error: String,
}

impl AgentMsg {
    pub fn new(msg_type: AgentMsgType) -> Self {
        Self {
            msg_type,
            app_id: String::new(),
            msg_data: String::new(),
            error: String::new(),
        }
    }

    pub fn request(msg_type: AgentMsgType, app_id: &str, msg_data: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            msg_data: msg_data.to_string(),
            ..Self::new(msg_type)
        }
    }

    pub fn error(detail: String) -> Self {
        Self {
            error: detail,
            ..Self::new(AgentMsgType::Error)
        }
    }
}

// ── endpoints ─────────────────────────────────────────────────────────────

/// Resolve a `tcp://host:port` connect endpoint to `host:port`.
/// Plain `host:port` is tolerated.
pub fn connect_addr(endpoint: &str) -> Result<String, AppError> {
    let addr = strip_scheme(endpoint)?;
    if addr.contains('*') {
        return Err(AppError::Transport(format!(
            "cannot connect to wildcard endpoint '{endpoint}'"
        )));
    }
    Ok(addr)
}

/// Resolve a listen endpoint; `tcp://*:port` binds the wildcard address.
pub fn listen_addr(endpoint: &str) -> Result<String, AppError> {
    Ok(strip_scheme(endpoint)?.replacen('*', "0.0.0.0", 1))
}

fn strip_scheme(endpoint: &str) -> Result<String, AppError> {
    let addr = match endpoint.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(AppError::Transport(format!(
                "unsupported endpoint scheme '{scheme}' in '{endpoint}'"
            )))
        }
        None => endpoint,
    };
    if addr.is_empty() {
        return Err(AppError::Transport(format!("empty endpoint '{endpoint}'")));
    }
    Ok(addr.to_string())
}

// ── client transport ──────────────────────────────────────────────────────

/// One request/reply round trip against `endpoint`, bounded by `timeout`.
///
/// Opens a fresh connection per call, sends the encoded envelope and waits
/// for exactly one reply frame. No retries at this layer; the whole
/// connect/send/receive sequence shares the single bound so a black-hole
/// endpoint fails with [`AppError::Timeout`] rather than hanging.
pub async fn roundtrip<Req, Rep>(
    endpoint: &str,
    request: &Req,
    timeout: Duration,
) -> Result<Rep, AppError>
where
    Req: Serialize,
    Rep: DeserializeOwned,
{
    let addr = connect_addr(endpoint)?;
    let mut frame = serde_json::to_string(request)
        .map_err(|e| AppError::Decode(format!("encode request: {e}")))?;
    frame.push('\n');

    let exchange = async {
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| AppError::Transport(format!("connect {addr}: {e}")))?;
        let (reader, mut writer) = stream.into_split();

        writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| AppError::Transport(format!("send to {addr}: {e}")))?;

        let mut lines = BufReader::new(reader).lines();
        let line = lines
            .next_line()
            .await
            .map_err(|e| AppError::Transport(format!("recv from {addr}: {e}")))?
            .ok_or_else(|| {
                AppError::Transport(format!("{addr} closed connection without replying"))
            })?;

        serde_json::from_str::<Rep>(&line).map_err(|e| AppError::Decode(format!("decode reply: {e}")))
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn scheduler_tags_match_wire_values() {
        assert_eq!(u8::from(SchedMsgType::Lookup), 0);
        assert_eq!(u8::from(SchedMsgType::Reply), 1);
        assert_eq!(u8::from(SchedMsgType::NotFound), 6);
        assert_eq!(u8::from(SchedMsgType::PingReply), 8);
        assert_eq!(SchedMsgType::try_from(7).unwrap(), SchedMsgType::Ping);
        assert!(SchedMsgType::try_from(9).is_err());
    }

    #[test]
    fn agent_tags_match_wire_values() {
        assert_eq!(u8::from(AgentMsgType::StartApp), 0);
        assert_eq!(u8::from(AgentMsgType::KillPid), 5);
        assert_eq!(u8::from(AgentMsgType::Error), 7);
        assert!(AgentMsgType::try_from(8).is_err());
    }

    #[test]
    fn scheduler_envelope_wire_field_names() {
        let msg = SchedulerMsg::lookup("alice");
        let v: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["MsgType"], 0);
        assert_eq!(v["AppID"], "alice");
        assert_eq!(v["Address"], "");
        assert_eq!(v["Error"], "");
    }

    #[test]
    fn missing_string_fields_default_empty() {
        let msg: SchedulerMsg = serde_json::from_str(r#"{"MsgType": 7}"#).unwrap();
        assert_eq!(msg.msg_type, SchedMsgType::Ping);
        assert_eq!(msg.app_id, "");
    }

    #[test]
    fn reserved_tags_decode() {
        let msg: SchedulerMsg = serde_json::from_str(r#"{"MsgType": 2, "AppID": "x"}"#).unwrap();
        assert_eq!(msg.msg_type, SchedMsgType::Set);
        let msg: AgentMsg = serde_json::from_str(r#"{"MsgType": 6}"#).unwrap();
        assert_eq!(msg.msg_type, AgentMsgType::ForceKillPid);
    }

    #[test]
    fn out_of_range_tag_fails_decode() {
        assert!(serde_json::from_str::<SchedulerMsg>(r#"{"MsgType": 42}"#).is_err());
        assert!(serde_json::from_str::<AgentMsg>(r#"{"MsgType": 200}"#).is_err());
    }

    #[test]
    fn connect_addr_strips_scheme() {
        assert_eq!(connect_addr("tcp://localhost:9912").unwrap(), "localhost:9912");
        assert_eq!(connect_addr("127.0.0.1:9912").unwrap(), "127.0.0.1:9912");
        assert!(connect_addr("tcp://*:9912").is_err());
        assert!(connect_addr("ipc:///tmp/x").is_err());
    }

    #[test]
    fn listen_addr_expands_wildcard() {
        assert_eq!(listen_addr("tcp://*:9912").unwrap(), "0.0.0.0:9912");
        assert_eq!(listen_addr("tcp://127.0.0.1:9924").unwrap(), "127.0.0.1:9924");
    }

    #[tokio::test]
    async fn roundtrip_against_echo_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let mut req: SchedulerMsg = serde_json::from_str(&line).unwrap();
            req.msg_type = SchedMsgType::PingReply;
            let mut out = serde_json::to_string(&req).unwrap();
            out.push('\n');
            writer.write_all(out.as_bytes()).await.unwrap();
        });

        let reply: SchedulerMsg = roundtrip(
            &format!("tcp://{addr}"),
            &SchedulerMsg::new(SchedMsgType::Ping),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(reply.msg_type, SchedMsgType::PingReply);
    }

    #[tokio::test]
    async fn roundtrip_times_out_against_black_hole() {
        // Listener accepts nothing and never replies.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let started = std::time::Instant::now();
        let result: Result<SchedulerMsg, _> = roundtrip(
            &addr.to_string(),
            &SchedulerMsg::new(SchedMsgType::Ping),
            Duration::from_millis(200),
        )
        .await;

        assert!(matches!(result, Err(AppError::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(listener);
    }

    #[tokio::test]
    async fn connection_refused_is_transport_error() {
        // Bind then drop to get a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result: Result<SchedulerMsg, _> = roundtrip(
            &addr.to_string(),
            &SchedulerMsg::new(SchedMsgType::Ping),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(AppError::Transport(_))));
    }
}
