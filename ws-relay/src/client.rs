use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message as Frame, Utf8Bytes},
};
use tracing::{info, warn};

use crate::cli::ConnectArgs;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub async fn run(args: ConnectArgs) -> Result<()> {
    let mut socket = establish_connection(&args).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(&mut socket, &mut stdin, &mut input).await?;
    shutdown_connection(&mut socket).await;

    Ok(())
}

async fn establish_connection(args: &ConnectArgs) -> Result<Socket> {
    let (socket, _response) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.url))?;

    info!("connected to {}", args.url);
    write_stdout(&format!("*** connected to {}", args.url)).await?;

    Ok(socket)
}

async fn run_client_loop(
    socket: &mut Socket,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            relay_frame = socket.next() => {
                if !handle_relay_frame(relay_frame).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, socket).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_relay_frame(frame: Option<Result<Frame, tungstenite::Error>>) -> Result<bool> {
    match frame {
        Some(Ok(Frame::Text(text))) => {
            write_stdout(text.as_str()).await?;
            Ok(true)
        }
        Some(Ok(Frame::Binary(bytes))) => {
            write_stdout(&String::from_utf8_lossy(&bytes)).await?;
            Ok(true)
        }
        Some(Ok(Frame::Close(_))) | None => {
            write_stdout("*** relay closed the connection").await?;
            Ok(false)
        }
        Some(Ok(_)) => Ok(true),
        Some(Err(err)) => Err(err).context("connection to relay failed"),
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    socket: &mut Socket,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving relay").await?;
        return Ok(false);
    }

    socket
        .send(Frame::Text(Utf8Bytes::from(text.to_string())))
        .await
        .context("failed to send message")?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(socket: &mut Socket) {
    if let Err(error) = socket.close(None).await {
        warn!(?error, "failed to close relay connection cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
