use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::TcpStream,
    select,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    config::{ClientConfig, PASSWORD_HEADER},
    message::{self, ChatMessage},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ERROR_NICK: &str = "<ERROR>";

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut config = ClientConfig::from(args);
    // `next_line` is cancel-safe, so a partial line survives a select wakeup.
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let nick = match config.nick.take() {
        Some(nick) => nick,
        None => prompt_nick(&mut stdin).await?,
    };

    let socket = establish_connection(&config).await?;
    write_stdout(&format!("*** connected to {} as {nick}", config.url())).await?;

    run_client_loop(socket, &mut stdin, &nick).await
}

async fn prompt_nick<R: AsyncBufRead + Unpin>(stdin: &mut Lines<R>) -> Result<String> {
    loop {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(b"Enter your nick: ").await?;
        stdout.flush().await?;

        let Some(line) = stdin.next_line().await? else {
            bail!("stdin closed before a nickname was entered");
        };

        let nick = line.trim();
        if !nick.is_empty() {
            return Ok(nick.to_string());
        }
    }
}

async fn establish_connection(config: &ClientConfig) -> Result<Socket> {
    let url = config.url();
    let mut request = url
        .as_str()
        .into_client_request()
        .with_context(|| format!("invalid server address {url}"))?;
    if let Some(password) = &config.password {
        let value = HeaderValue::from_str(password).context("password is not a valid header")?;
        request.headers_mut().insert(PASSWORD_HEADER, value);
    }

    let (socket, _response) = connect_async(request)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    info!("connected to {url}");

    Ok(socket)
}

async fn run_client_loop<R: AsyncBufRead + Unpin>(
    socket: Socket,
    stdin: &mut Lines<R>,
    nick: &str,
) -> Result<()> {
    let (mut writer, mut reader) = socket.split();

    loop {
        select! {
            frame = reader.next() => {
                if !handle_frame(frame).await? {
                    break;
                }
            }
            line = stdin.next_line() => {
                let Some(text) = handle_stdin_input(line).await? else {
                    break;
                };
                if text.is_empty() {
                    continue;
                }

                let message = ChatMessage::new(nick, text);
                if let Err(err) = send_message(&mut writer, &message).await {
                    write_stdout(&format_entry(message.time(), ERROR_NICK, &err.to_string())).await?;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    if let Err(error) = writer.close().await {
        warn!(?error, "failed to close connection cleanly");
    }
    Ok(())
}

async fn send_message<S>(writer: &mut S, message: &ChatMessage) -> Result<()>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = message::encode_text(message)?;
    writer.send(Message::text(text)).await?;
    Ok(())
}

/// Returns `Ok(false)` when the connection is gone.
async fn handle_frame(
    frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
) -> io::Result<bool> {
    let frame = match frame {
        Some(Ok(frame)) => frame,
        Some(Err(err)) => {
            write_stdout(&format_entry(Utc::now(), ERROR_NICK, &err.to_string())).await?;
            return Ok(false);
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        }
    };

    let decoded = match frame {
        Message::Text(text) => message::decode(text.as_bytes()),
        Message::Binary(bytes) => message::decode(&bytes),
        Message::Close(_) => {
            write_stdout("*** server closed the connection").await?;
            return Ok(false);
        }
        _ => return Ok(true),
    };

    match decoded {
        Ok(message) => {
            write_stdout(&format_entry(message.time(), message.nick(), message.text())).await?
        }
        Err(err) => write_stdout(&format_entry(Utc::now(), ERROR_NICK, &err.to_string())).await?,
    }
    Ok(true)
}

/// Returns the trimmed line to send, or `None` when the user is leaving.
async fn handle_stdin_input(line: io::Result<Option<String>>) -> Result<Option<String>> {
    let Some(line) = line? else {
        return Ok(None);
    };

    let text = line.trim_end();
    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(None);
    }

    Ok(Some(text.to_string()))
}

/// One history line: `15:04:05 alice: hi`, in local time.
pub fn format_entry(time: DateTime<Utc>, nick: &str, text: &str) -> String {
    let local: DateTime<Local> = time.with_timezone(&Local);
    format!("{} {nick}: {text}", local.format("%H:%M:%S"))
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
