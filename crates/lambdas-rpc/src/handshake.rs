//! Connection handshake: the app presents its session token in the first
//! frame and the host answers before any RPC traffic flows.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};

use crate::error::RpcError;
use crate::wire::write_line;

pub const PROTOCOL_VERSION: u8 = 1;

/// Close code sent when a token does not match a provisioned app.
pub const POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub v: u8,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HelloReply {
    Accepted,
    Rejected { code: u16, reason: String },
}

async fn read_frame<R, T>(reader: &mut R) -> Result<T, RpcError>
where
    R: AsyncBufRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(RpcError::Closed);
    }
    serde_json::from_str(&line).map_err(|e| RpcError::Protocol(format!("bad handshake frame: {e}")))
}

/// Host side: read the app's opening frame.
pub async fn read_hello<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Hello, RpcError> {
    let hello: Hello = read_frame(reader).await?;
    if hello.v != PROTOCOL_VERSION {
        return Err(RpcError::Protocol(format!(
            "unsupported protocol version {}",
            hello.v
        )));
    }
    Ok(hello)
}

pub async fn accept<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), RpcError> {
    write_line(writer, &HelloReply::Accepted).await
}

pub async fn reject<W: AsyncWrite + Unpin>(
    writer: &mut W,
    code: u16,
    reason: impl Into<String>,
) -> Result<(), RpcError> {
    write_line(
        writer,
        &HelloReply::Rejected {
            code,
            reason: reason.into(),
        },
    )
    .await
}

/// App side: present `token` and wait for the host's verdict.
pub async fn connect<R, W>(reader: &mut R, writer: &mut W, token: &str) -> Result<(), RpcError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_line(
        writer,
        &Hello {
            v: PROTOCOL_VERSION,
            token: token.to_string(),
        },
    )
    .await?;
    match read_frame(reader).await? {
        HelloReply::Accepted => Ok(()),
        HelloReply::Rejected { code, reason } => Err(RpcError::Rejected { code, reason }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{BufReader, duplex};

    #[tokio::test]
    async fn rejected_token_surfaces_close_code() {
        let (app, host) = duplex(1024);
        let (ar, mut aw) = tokio::io::split(app);
        let (hr, mut hw) = tokio::io::split(host);

        let host_task = tokio::spawn(async move {
            let mut reader = BufReader::new(hr);
            let hello = read_hello(&mut reader).await.unwrap();
            assert_eq!(hello.token, "stale");
            reject(&mut hw, POLICY_VIOLATION, "unknown session token").await.unwrap();
        });

        let err = connect(&mut BufReader::new(ar), &mut aw, "stale").await.unwrap_err();
        assert!(matches!(err, RpcError::Rejected { code: POLICY_VIOLATION, .. }));
        host_task.await.unwrap();
    }
}
