//! TCP JSON-RPC server.
//!
//! Transport is newline-delimited JSON objects or batch arrays on a
//! loopback TCP socket, with an optional HTTP POST wrapping at `/rpc` for
//! clients that prefer request/response over a stream.
//!
//! The server does no dispatching of its own: every complete request line
//! is forwarded to the main loop over the command queue and the reply is
//! awaited before the next line is read. That keeps handler execution
//! strictly serialised against engine mutations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use lfc_protocol::MAX_MESSAGE_SIZE;

use crate::daemon::DaemonCommand;

/// Maximum concurrent client connections
const MAX_CONNECTIONS: usize = 32;

/// Idle read timeout per connection
const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Write timeout per response
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

static ACTIVE_CONNECTIONS: AtomicUsize = AtomicUsize::new(0);

/// Accept loop. Runs until the task is aborted by the daemon shutdown.
pub async fn run_server(
    host: &str,
    port: u16,
    commands: mpsc::Sender<DaemonCommand>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    info!(host, port, "RPC server listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let current = ACTIVE_CONNECTIONS.load(Ordering::SeqCst);
        if current >= MAX_CONNECTIONS {
            warn!(peer = %peer, current, "connection limit reached, rejecting");
            drop(stream);
            continue;
        }

        ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst);
        let commands = commands.clone();
        tokio::spawn(async move {
            debug!(peer = %peer, "client connected");
            if let Err(e) = handle_client(stream, commands).await {
                debug!(peer = %peer, error = %e, "client closed with error");
            }
            ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

/// Forward one raw request line to the main loop and await the response.
async fn roundtrip(
    commands: &mpsc::Sender<DaemonCommand>,
    line: String,
) -> std::io::Result<Option<String>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    commands
        .send(DaemonCommand::RpcLine {
            line,
            reply: reply_tx,
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "daemon stopped"))?;
    reply_rx
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "daemon stopped"))
}

async fn handle_client(
    stream: TcpStream,
    commands: mpsc::Sender<DaemonCommand>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line_buf = Vec::with_capacity(1024);

    loop {
        let read = timeout(
            READ_TIMEOUT,
            read_request_line(&mut reader, &mut line_buf, MAX_MESSAGE_SIZE),
        )
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timeout"))??;
        if read == 0 {
            return Ok(()); // clean EOF
        }

        let first_line = String::from_utf8_lossy(&line_buf).trim_end().to_string();
        if first_line.is_empty() {
            continue;
        }

        // HTTP POST wrapping: one request per connection, then close.
        if first_line.starts_with("POST ") || first_line.starts_with("GET ") {
            return handle_http(&first_line, &mut reader, &mut write_half, &commands).await;
        }

        let response = roundtrip(&commands, first_line).await?;
        if let Some(response) = response {
            let mut payload = response.into_bytes();
            payload.push(b'\n');
            timeout(WRITE_TIMEOUT, write_half.write_all(&payload))
                .await
                .map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout")
                })??;
        }
    }
}

/// Minimal HTTP POST /rpc handling for request/response clients.
async fn handle_http<R: AsyncBufRead + Unpin>(
    request_line: &str,
    reader: &mut R,
    writer: &mut (impl AsyncWriteExt + Unpin),
    commands: &mpsc::Sender<DaemonCommand>,
) -> std::io::Result<()> {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    if method != "POST" || path != "/rpc" {
        return write_http(writer, 404, "not found", "text/plain").await;
    }

    // Headers: only Content-Length matters.
    let mut content_length: usize = 0;
    let mut header = String::new();
    loop {
        header.clear();
        if reader.read_line(&mut header).await? == 0 {
            return Ok(());
        }
        let trimmed = header.trim();
        if trimmed.is_empty() {
            break;
        }
        if let Some(value) = trimmed
            .to_ascii_lowercase()
            .strip_prefix("content-length:")
            .map(str::trim)
            .and_then(|v| v.parse::<usize>().ok())
        {
            content_length = value;
        }
    }

    if content_length == 0 || content_length > MAX_MESSAGE_SIZE {
        return write_http(writer, 400, "bad content length", "text/plain").await;
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;
    let body = String::from_utf8_lossy(&body).to_string();

    match roundtrip(commands, body).await? {
        Some(response) => write_http(writer, 200, &response, "application/json").await,
        None => write_http(writer, 204, "", "application/json").await,
    }
}

async fn write_http(
    writer: &mut (impl AsyncWriteExt + Unpin),
    status: u16,
    body: &str,
    content_type: &str,
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        _ => "Not Found",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        content_type,
        body.len(),
        body
    );
    timeout(WRITE_TIMEOUT, writer.write_all(response.as_bytes()))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout"))??;
    writer.flush().await
}

/// Read one `\n`-terminated request line, capped at `max_len` bytes.
///
/// The reader is wrapped in a byte-limited `Take` for the duration of the
/// read, so a client streaming an endless line can never grow the buffer
/// past the cap. An over-long line is a protocol violation; the resulting
/// error tears the connection down rather than trying to resynchronise on
/// the remainder.
async fn read_request_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<usize> {
    out.clear();

    // One extra byte of headroom distinguishes "exactly max_len" from
    // "still no newline after max_len".
    let mut capped = reader.take(max_len as u64 + 1);
    let read = capped.read_until(b'\n', out).await?;
    if read > max_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("request line exceeds {} bytes", max_len),
        ));
    }
    // 0 = EOF; a non-terminated tail before EOF still counts as a line.
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader as TokioBufReader;

    #[tokio::test]
    async fn request_lines_are_read_one_at_a_time() {
        let data: &[u8] = b"{\"a\":1}\n{\"b\":2}\n";
        let mut reader = TokioBufReader::new(data);
        let mut buf = Vec::new();

        let n = read_request_line(&mut reader, &mut buf, 64).await.unwrap();
        assert_eq!(&buf[..n], b"{\"a\":1}\n");
        let n = read_request_line(&mut reader, &mut buf, 64).await.unwrap();
        assert_eq!(&buf[..n], b"{\"b\":2}\n");
        let n = read_request_line(&mut reader, &mut buf, 64).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn line_at_the_cap_is_accepted() {
        // 63 payload bytes plus the newline lands exactly on the cap.
        let mut data = vec![b'x'; 63];
        data.push(b'\n');
        let mut reader = TokioBufReader::new(&data[..]);
        let mut buf = Vec::new();
        let n = read_request_line(&mut reader, &mut buf, 64).await.unwrap();
        assert_eq!(n, 64);
    }

    #[tokio::test]
    async fn overlong_line_is_rejected() {
        let long = vec![b'x'; 128];
        let mut reader = TokioBufReader::new(&long[..]);
        let mut buf = Vec::new();
        let result = read_request_line(&mut reader, &mut buf, 64).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unterminated_tail_counts_as_a_line() {
        let data: &[u8] = b"{\"a\":1}";
        let mut reader = TokioBufReader::new(data);
        let mut buf = Vec::new();
        let n = read_request_line(&mut reader, &mut buf, 64).await.unwrap();
        assert_eq!(&buf[..n], b"{\"a\":1}");
    }
}
