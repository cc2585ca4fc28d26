//! Client side: control session, reconnect loop, side-channel dialing
//!
//! The client keeps one control connection to the server. `NEWSOCKET`
//! notifications fan out into side-channel tasks, each relaying one
//! external connection to its mapped inner target through the cipher.
//! Transport failures reconnect after a short delay; a rejection from the
//! server stops the client for good.

use std::collections::HashMap;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::crypto::{self, derive_key_iv, IV_LEN, KEY_LEN};
use crate::protocol::{self, ConnId, Tag};

/// Delay between reconnect attempts
pub const RETRY_TIME: Duration = Duration::from_secs(1);

/// TCP keepalive period on the control connection
pub const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Why a session ended.
enum SessionEnd {
    /// Transport-level failure; retry after [`RETRY_TIME`].
    Retry,
    /// The server rejected the configuration; retrying cannot help.
    Fatal,
}

/// Run the client half: keep one control session alive, reconnecting
/// after transport failures, until `shutdown` fires or the server rejects
/// the configuration.
pub async fn run(config: ClientConfig, shutdown: CancellationToken) {
    let (key, iv) = derive_key_iv(config.key.as_bytes());
    let mappings: HashMap<u16, String> = config
        .map
        .iter()
        .map(|m| (m.outer, m.inner.clone()))
        .collect();

    loop {
        let end = tokio::select! {
            _ = shutdown.cancelled() => break,
            end = run_session(&config, &mappings, &key, &iv) => end,
        };
        if matches!(end, SessionEnd::Fatal) {
            break;
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(RETRY_TIME) => {}
        }
    }
}

/// One connect-authenticate-serve cycle.
async fn run_session(
    config: &ClientConfig,
    mappings: &HashMap<u16, String>,
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
) -> SessionEnd {
    info!(server = %config.server, "connecting to server");
    let mut control = match TcpStream::connect(&config.server).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("cannot reach server: {}", e);
            return SessionEnd::Retry;
        }
    };
    if let Err(e) = set_keepalive(&control) {
        debug!("could not enable keepalive: {}", e);
    }

    if let Err(e) = protocol::write_start(&mut control, config).await {
        warn!("handshake send failed: {}", e);
        return SessionEnd::Retry;
    }

    let mut reply = [0u8; 1];
    if control.read_exact(&mut reply).await.is_err() {
        warn!("server closed during handshake");
        return SessionEnd::Retry;
    }
    match Tag::try_from(reply[0]) {
        Ok(Tag::Success) => {}
        Ok(Tag::ErrorPwd) => {
            error!("wrong password");
            return SessionEnd::Fatal;
        }
        Ok(Tag::ErrorBusy) => {
            error!("outer port is occupied");
            return SessionEnd::Fatal;
        }
        Ok(Tag::ErrorLimitPort) => {
            error!("outer port out of the allowed range");
            return SessionEnd::Fatal;
        }
        _ => {
            error!("unknown handshake reply");
            return SessionEnd::Fatal;
        }
    }

    info!("authenticated");
    for mapping in &config.map {
        info!("{} -> :{}", mapping.inner, mapping.outer);
    }

    loop {
        let mut tag = [0u8; 1];
        if control.read_exact(&mut tag).await.is_err() {
            warn!("control connection lost");
            return SessionEnd::Retry;
        }
        match Tag::try_from(tag[0]) {
            Ok(Tag::NewSocket) => {
                let id = match protocol::read_conn_id(&mut control).await {
                    Ok(id) => id,
                    Err(_) => return SessionEnd::Retry,
                };
                let side = match TcpStream::connect(&config.server).await {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("cannot open side-channel: {}", e);
                        return SessionEnd::Retry;
                    }
                };
                let inner = mappings.get(&id.port).cloned();
                let key = *key;
                let iv = *iv;
                tokio::spawn(async move {
                    open_side_channel(side, id, inner, &key, &iv).await;
                });
            }
            Ok(Tag::Idle) => {
                if protocol::write_tag(&mut control, Tag::Success).await.is_err() {
                    warn!("heartbeat reply failed");
                    return SessionEnd::Retry;
                }
            }
            _ => {
                warn!("unexpected control tag, dropping session");
                return SessionEnd::Retry;
            }
        }
    }
}

/// Serve one relayed connection: send the plaintext `NEWCONN` preamble on
/// the side-channel, dial the mapped inner target, then splice the two
/// through the cipher. Any failure drops the side-channel, which the
/// server observes as a close.
async fn open_side_channel(
    mut side: TcpStream,
    id: ConnId,
    inner: Option<String>,
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
) {
    let preamble = id.encode(Tag::NewConn);
    if let Err(e) = side.write_all(&preamble).await {
        debug!("side-channel preamble failed: {}", e);
        return;
    }

    let Some(inner) = inner else {
        warn!(port = id.port, "server referenced an unmapped port");
        return;
    };
    let inner_conn = match TcpStream::connect(&inner).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(addr = %inner, "cannot reach inner target: {}", e);
            return;
        }
    };

    debug!(port = id.port, slot = id.slot, addr = %inner, "relaying connection");
    crypto::splice(inner_conn, side, key, iv).await;
}

fn set_keepalive(conn: &TcpStream) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE);
    SockRef::from(conn).set_tcp_keepalive(&keepalive)
}
