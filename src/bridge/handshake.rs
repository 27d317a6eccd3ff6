//! Line-based protocol version exchange preceding framed traffic
//!
//! ```text
//! peer   -> ZEPHYR <version>\n
//! server -> OK <version>\n | ERR <reason>\n
//! ```

use super::frame::FrameError;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HANDSHAKE_MAGIC: &str = "ZEPHYR";

const MAX_HANDSHAKE_LINE: usize = 128;

/// Read one `\n`-terminated line byte by byte so no framed bytes are buffered
async fn read_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, FrameError> {
    let mut line = Vec::with_capacity(32);
    loop {
        let byte = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::Handshake("connection closed during handshake".to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if byte == b'\n' {
            break;
        }
        if line.len() >= MAX_HANDSHAKE_LINE {
            return Err(FrameError::Handshake("handshake line too long".to_string()));
        }
        line.push(byte);
    }

    let line = String::from_utf8(line)
        .map_err(|_| FrameError::Handshake("handshake line is not UTF-8".to_string()))?;
    Ok(line.trim_end_matches('\r').to_string())
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<(), FrameError> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Server side: accept only `expected_version`, answering the peer either way
pub async fn accept<S>(stream: &mut S, expected_version: &str, timeout: Duration) -> Result<String, FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = tokio::time::timeout(timeout, read_line(stream))
        .await
        .map_err(|_| FrameError::Handshake("timed out waiting for handshake".to_string()))??;

    let version = match line.split_once(' ') {
        Some((HANDSHAKE_MAGIC, version)) if !version.is_empty() => version.to_string(),
        _ => {
            write_line(stream, "ERR malformed handshake").await?;
            return Err(FrameError::Handshake(format!("malformed handshake line {line:?}")));
        }
    };

    if version != expected_version {
        write_line(
            stream,
            &format!("ERR unsupported protocol version {version}, expected {expected_version}"),
        )
        .await?;
        return Err(FrameError::Handshake(format!(
            "peer offered protocol version {version}, expected {expected_version}"
        )));
    }

    write_line(stream, &format!("OK {expected_version}")).await?;
    Ok(version)
}

/// Client side: offer `version` and wait for the verdict
pub async fn initiate<S>(stream: &mut S, version: &str, timeout: Duration) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_line(stream, &format!("{HANDSHAKE_MAGIC} {version}")).await?;

    let line = tokio::time::timeout(timeout, read_line(stream))
        .await
        .map_err(|_| FrameError::Handshake("timed out waiting for handshake answer".to_string()))??;

    match line.split_once(' ') {
        Some(("OK", accepted)) if accepted == version => Ok(()),
        Some(("ERR", reason)) => Err(FrameError::Handshake(reason.to_string())),
        _ => Err(FrameError::Handshake(format!("unexpected handshake answer {line:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_matching_versions_agree() {
        let (mut client, mut server) = tokio::io::duplex(256);

        let (client_result, server_result) = tokio::join!(
            initiate(&mut client, "1", TIMEOUT),
            accept(&mut server, "1", TIMEOUT)
        );
        client_result.unwrap();
        assert_eq!(server_result.unwrap(), "1");
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected_on_both_sides() {
        let (mut client, mut server) = tokio::io::duplex(256);

        let (client_result, server_result) = tokio::join!(
            initiate(&mut client, "2", TIMEOUT),
            accept(&mut server, "1", TIMEOUT)
        );
        let client_err = client_result.unwrap_err().to_string();
        assert!(client_err.contains("unsupported protocol version 2"), "{client_err}");
        assert!(matches!(server_result, Err(FrameError::Handshake(_))));
    }

    #[tokio::test]
    async fn test_garbage_line_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(b"HELLO there\n").await.unwrap();

        let err = accept(&mut server, "1", TIMEOUT).await.unwrap_err();
        assert!(err.to_string().contains("malformed"));

        let answer = read_line(&mut client).await.unwrap();
        assert_eq!(answer, "ERR malformed handshake");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (_client, mut server) = tokio::io::duplex(256);
        let err = accept(&mut server, "1", TIMEOUT).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
