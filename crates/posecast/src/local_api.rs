use crate::cascade::CascadeStatus;
use crate::forward::ForwardedSample;
use crate::peer::{PeerHandle, PeerStatus};
use crate::relay::{LinkStatus, RelayHandle};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Maximum command line length (64 KiB). Longer lines are answered with an
/// error instead of being buffered.
const MAX_CMD_LEN: usize = 65_536;

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum ApiCommand {
    Status,
    Subscribe,
    SelectExercise { exercise: String },
    Reconnect,
}

#[derive(Debug, Clone, Serialize)]
struct LinkView {
    #[serde(flatten)]
    status: LinkStatus,
    text: String,
    device_id: String,
}

#[derive(Debug, Clone, Serialize)]
struct StatusResponse {
    link: LinkView,
    peer: Option<PeerStatus>,
    source: CascadeStatus,
}

/// Everything the local API reads from or drives.
#[derive(Debug, Clone)]
pub struct ApiContext {
    /// Relay link.
    pub relay: RelayHandle,
    /// Peer acquisition, when enabled.
    pub peer: Option<PeerHandle>,
    /// Cascade arbitration status.
    pub cascade: watch::Receiver<CascadeStatus>,
    /// Forwarded samples.
    pub samples: broadcast::Sender<ForwardedSample>,
}

/// # Errors
///
/// Returns an error if binding the local API listener fails.
pub async fn start_local_api(listen: &str, ctx: ApiContext) -> anyhow::Result<()> {
    let Some(addr) = listen.strip_prefix("tcp://") else {
        anyhow::bail!("Invalid listen address format: {listen}. Use tcp://addr:port");
    };
    let listener = TcpListener::bind(addr).await?;
    info!("Local API listening on TCP: {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let ctx = ctx.clone();
        let (reader, writer) = stream.into_split();

        tokio::spawn(async move {
            if let Err(e) = handle_local_client(reader, writer, ctx).await {
                debug!("Client handler error: {}", e);
            }
        });
    }
}

fn json_line(value: &impl Serialize) -> anyhow::Result<String> {
    Ok(serde_json::to_string(value)? + "\n")
}

fn error_line(message: impl std::fmt::Display) -> anyhow::Result<String> {
    json_line(&serde_json::json!({"error": message.to_string()}))
}

async fn handle_local_client<R, W>(reader: R, mut writer: W, ctx: ApiContext) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_CMD_LEN as u64 + 1);
        match tokio::io::AsyncBufReadExt::read_line(&mut limited, &mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }
        if line.len() > MAX_CMD_LEN {
            let error =
                error_line(format!("command exceeds maximum length ({MAX_CMD_LEN} bytes)"))?;
            writer.write_all(error.as_bytes()).await?;
            continue;
        }

        let cmd: ApiCommand = match serde_json::from_str(&line) {
            Ok(cmd) => cmd,
            Err(e) => {
                writer.write_all(error_line(e)?.as_bytes()).await?;
                continue;
            }
        };

        let response = match cmd {
            ApiCommand::Status => {
                let status = ctx.relay.current();
                let resp = StatusResponse {
                    link: LinkView {
                        text: status.text(),
                        status,
                        device_id: ctx.relay.device_id().to_string(),
                    },
                    peer: ctx.peer.as_ref().map(PeerHandle::current),
                    source: ctx.cascade.borrow().clone(),
                };
                json_line(&resp)?
            }
            ApiCommand::Subscribe => {
                handle_subscribe(ctx.samples.subscribe(), &mut writer).await?;
                return Ok(());
            }
            ApiCommand::SelectExercise { exercise } => {
                let exercise = exercise.trim().to_string();
                if exercise.is_empty() {
                    error_line("exercise must not be empty")?
                } else {
                    match ctx.relay.select_exercise(exercise.clone()).await {
                        Ok(()) => json_line(&serde_json::json!({"exercise": exercise}))?,
                        Err(e) => error_line(e)?,
                    }
                }
            }
            ApiCommand::Reconnect => {
                let result = match ctx.relay.disconnect().await {
                    Ok(()) => ctx.relay.connect().await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => json_line(&serde_json::json!({"status": "reconnecting"}))?,
                    Err(e) => error_line(e)?,
                }
            }
        };

        writer.write_all(response.as_bytes()).await?;
    }

    Ok(())
}

async fn handle_subscribe<W>(
    mut samples: broadcast::Receiver<ForwardedSample>,
    writer: &mut W,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        match samples.recv().await {
            Ok(sample) => {
                if let Ok(json) = serde_json::to_string(&sample) {
                    if writer.write_all((json + "\n").as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(dropped = n, "subscribe stream lagged, samples dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    Ok(())
}
