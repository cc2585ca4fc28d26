//! Server side: control sessions, outer-port listeners, side-channel
//! pairing
//!
//! Every inbound connection on the control port is classified by its
//! first tag byte: `START` begins a control session, `NEWCONN` is a
//! side-channel claiming a pending slot, anything else is dropped. One
//! authenticated session owns a set of outer-port listeners; all of them,
//! plus their pending slots, are torn down when the session ends.

mod slots;

pub use slots::{SlotTable, WAIT_MAX, WAIT_TIMEOUT};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::crypto::{self, derive_key_iv, IV_LEN, KEY_LEN};
use crate::protocol::{self, ConnId, ProtocolError, Tag};

/// State shared by the control accept loop, the active session, and
/// side-channel handoffs.
struct ServerState {
    key: String,
    cipher_key: [u8; KEY_LEN],
    cipher_iv: [u8; IV_LEN],
    limit: Option<(u16, u16)>,
    resources: Mutex<HashMap<u16, Arc<Resource>>>,
}

/// Per-outer-port resources owned by the active session
struct Resource {
    port: u16,
    slots: SlotTable<TcpStream>,
}

/// Writer side of the control connection, shared by the per-port accept
/// loops. The lock keeps concurrent `NEWSOCKET` frames whole.
type ControlWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Run the server half: accept control connections and side-channels on
/// the configured control port until `shutdown` fires.
pub async fn run(config: ServerConfig, shutdown: CancellationToken) -> crate::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "control listener ready");

    let (cipher_key, cipher_iv) = derive_key_iv(config.key.as_bytes());
    let state = Arc::new(ServerState {
        limit: config.limit_range(),
        key: config.key,
        cipher_key,
        cipher_iv,
        resources: Mutex::new(HashMap::new()),
    });

    loop {
        let conn = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((conn, _)) => conn,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            },
        };

        let state = Arc::clone(&state);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(state, conn, shutdown).await {
                debug!("connection ended: {}", e);
            }
        });
    }
    Ok(())
}

/// Classify an inbound connection by its first tag byte.
async fn handle_connection(
    state: Arc<ServerState>,
    mut conn: TcpStream,
    shutdown: CancellationToken,
) -> Result<(), ProtocolError> {
    let mut first = [0u8; 1];
    conn.read_exact(&mut first).await?;
    match Tag::try_from(first[0]) {
        Ok(Tag::Start) => run_session(state, conn, shutdown).await,
        Ok(Tag::NewConn) => handle_side_channel(state, conn).await,
        // Anything else is not ours to serve.
        _ => Ok(()),
    }
}

/// Drive one control session: authenticate, open the requested outer
/// ports, then sit in the heartbeat loop until the connection dies.
async fn run_session(
    state: Arc<ServerState>,
    conn: TcpStream,
    shutdown: CancellationToken,
) -> Result<(), ProtocolError> {
    let (mut reader, writer) = conn.into_split();

    let client = match protocol::read_start(&mut reader).await {
        Ok(client) => client,
        Err(e) => {
            // Malformed or oversize START: close without a reply.
            debug!("rejected start frame: {}", e);
            return Ok(());
        }
    };

    let control_writer: ControlWriter = Arc::new(tokio::sync::Mutex::new(writer));

    if client.key != state.key {
        warn!("client authentication failed");
        return reply(&control_writer, Tag::ErrorPwd).await;
    }

    // Session scope: cancelling it tears down every per-port listener and
    // its pending slots, on every exit path out of this function.
    let session = shutdown.child_token();
    let _teardown = session.clone().drop_guard();

    for mapping in &client.map {
        if let Some((min, max)) = state.limit {
            if mapping.outer < min || mapping.outer > max {
                warn!(
                    port = mapping.outer,
                    "requested port outside allowed range [{}, {}]", min, max
                );
                return reply(&control_writer, Tag::ErrorLimitPort).await;
            }
        }

        let listener = match TcpListener::bind(("0.0.0.0", mapping.outer)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(port = mapping.outer, "outer port is occupied: {}", e);
                // The drop guard cancels the session, releasing any ports
                // already opened for it.
                return reply(&control_writer, Tag::ErrorBusy).await;
            }
        };

        let resource = Arc::new(Resource {
            port: mapping.outer,
            slots: SlotTable::new(),
        });
        state
            .resources
            .lock()
            .unwrap()
            .insert(mapping.outer, Arc::clone(&resource));
        tokio::spawn(port_accept_loop(
            Arc::clone(&state),
            resource,
            listener,
            Arc::clone(&control_writer),
            session.clone(),
        ));
    }

    reply(&control_writer, Tag::Success).await?;
    let ports: Vec<u16> = client.map.iter().map(|m| m.outer).collect();
    info!(?ports, "session established");

    session_read_loop(&mut reader, &session).await;
    Ok(())
}

/// Send one payload-less reply frame on the shared control writer.
async fn reply(writer: &ControlWriter, tag: Tag) -> Result<(), ProtocolError> {
    let mut writer = writer.lock().await;
    protocol::write_tag(&mut *writer, tag).await?;
    Ok(())
}

/// Post-auth control loop: tolerate heartbeats, end on `KILL`, a read
/// error, or session cancellation.
async fn session_read_loop(reader: &mut OwnedReadHalf, session: &CancellationToken) {
    let mut tag = [0u8; 1];
    loop {
        tokio::select! {
            _ = session.cancelled() => return,
            read = reader.read_exact(&mut tag) => {
                if read.is_err() {
                    info!("control connection lost");
                    return;
                }
                match Tag::try_from(tag[0]) {
                    Ok(Tag::Kill) => {
                        info!("session ended by client");
                        return;
                    }
                    // IDLE keeps the session alive; the client's SUCCESS
                    // heartbeat acks land here too.
                    _ => continue,
                }
            }
        }
    }
}

/// Accept external connections on one outer port until the session ends,
/// then tear the port down.
async fn port_accept_loop(
    state: Arc<ServerState>,
    resource: Arc<Resource>,
    listener: TcpListener,
    control_writer: ControlWriter,
    session: CancellationToken,
) {
    info!(port = resource.port, "opened outer port");
    loop {
        let external = tokio::select! {
            _ = session.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((conn, _)) => conn,
                Err(e) => {
                    warn!(port = resource.port, "outer accept failed: {}", e);
                    break;
                }
            },
        };

        match resource.slots.insert(external) {
            Some(slot) => {
                let frame = ConnId {
                    port: resource.port,
                    slot,
                }
                .encode(Tag::NewSocket);
                let mut writer = control_writer.lock().await;
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
            None => {
                // Table full of live pending connections; the new one was
                // dropped by insert. Backpressure by refusal.
                debug!(port = resource.port, "pending slots exhausted");
            }
        }
    }

    // Unregister before the listener drops so a successor session cannot
    // bind the port and get its fresh resource entry removed by us.
    state.resources.lock().unwrap().remove(&resource.port);
    resource.slots.clear();
    drop(listener);
    info!(port = resource.port, "closed outer port");
}

/// Pair a `NEWCONN` side-channel with its pending external connection and
/// splice the two through the cipher.
async fn handle_side_channel(
    state: Arc<ServerState>,
    mut conn: TcpStream,
) -> Result<(), ProtocolError> {
    let id = protocol::read_conn_id(&mut conn).await?;

    let resource = state.resources.lock().unwrap().get(&id.port).cloned();
    let Some(resource) = resource else {
        debug!(port = id.port, "side-channel for unknown port");
        return Ok(());
    };
    let Some(external) = resource.slots.take(id.slot) else {
        debug!(
            port = id.port,
            slot = id.slot,
            "side-channel for vacant or expired slot"
        );
        return Ok(());
    };

    debug!(port = id.port, slot = id.slot, "paired side-channel");
    crypto::splice(external, conn, &state.cipher_key, &state.cipher_iv).await;
    Ok(())
}
