use std::sync::Arc;

use dpm::config::{RX_BUFFER_SIZE, SessionConfig};
use dpm::error::Result;

use tracing::info;

use crate::callbacks::SharedSessionCallbacks;
use crate::secure::{SecureProtocol, SecureRole};
use crate::transport::{DatagramSocket, DatagramStream, StreamSocket};

use super::{Command, Exit, RunStatus, Session, SessionEnv, bind_with_retry, lock};

pub(super) async fn run(
    session: &Arc<Session>,
    config: &SessionConfig,
    callbacks: &SharedSessionCallbacks,
    env: &SessionEnv,
) -> Result<()> {
    let socket = bind_with_retry(session, config.local_port, || {
        env.transport.bind_datagram(config.local_port)
    })
    .await?;

    session.observe_local_port(Some(socket.local_addr().port()));
    lock(&session.link).datagram = Some(socket.clone());
    session.set_status(RunStatus::WaitingAccept);
    info!("Session `{}` bound to `{}`", session.id, socket.local_addr());

    if config.secure {
        serve_secure(session, config, &socket, callbacks, env).await
    } else {
        serve_plain(session, config, &socket, callbacks, env).await
    }
}

async fn serve_plain(
    session: &Session,
    config: &SessionConfig,
    socket: &Arc<dyn DatagramSocket>,
    callbacks: &SharedSessionCallbacks,
    env: &SessionEnv,
) -> Result<()> {
    let timeout = config.receive_timeout();
    let mut buf = vec![0; RX_BUFFER_SIZE];

    loop {
        match session.take_command() {
            Command::None => {}
            Command::Stop => return Ok(()),
            Command::Restart => {
                session.release_peers();
                session.set_status(RunStatus::WaitingAccept);
            }
        }

        let received = tokio::select! {
            received = session.receive_from(socket.as_ref(), &mut buf, timeout) => received?,
            () = session.command_posted.notified() => continue,
        };
        let Some((size, peer)) = received else {
            continue;
        };

        session.admit(peer, None);
        session.observe_peer(peer);
        session.set_status(RunStatus::Running);
        session
            .dispatch_recv(callbacks, env, peer, buf[..size].to_vec())
            .await;
    }
}

// Serves one `DTLS` peer at a time: the first datagram of a new peer starts
// a handshake, and the peer is then served until a command arrives.
async fn serve_secure(
    session: &Session,
    config: &SessionConfig,
    socket: &Arc<dyn DatagramSocket>,
    callbacks: &SharedSessionCallbacks,
    env: &SessionEnv,
) -> Result<()> {
    let timeout = config.receive_timeout();
    let mut buf = vec![0; RX_BUFFER_SIZE];

    loop {
        match session.take_command() {
            Command::Stop => return Ok(()),
            Command::None | Command::Restart => {}
        }

        let received = tokio::select! {
            received = session.receive_from(socket.as_ref(), &mut buf, timeout) => received?,
            () = session.command_posted.notified() => continue,
        };
        let Some((size, peer)) = received else {
            continue;
        };

        let stream: Arc<dyn StreamSocket> = Arc::new(
            DatagramStream::new(socket.clone(), peer).first_datagram(buf[..size].to_vec()),
        );
        let secured = match session
            .secure(stream.clone(), SecureRole::Server, SecureProtocol::Dtls, callbacks, env)
            .await
        {
            Ok(secured) => secured,
            Err(e) => {
                stream.close();
                env.reporter
                    .report(&format!("Session `{}`", session.id), &e);
                session
                    .dispatch_connect(callbacks, env, Some(peer), Err(e))
                    .await;
                continue;
            }
        };

        session.admit(peer, Some(secured.clone()));
        session.observe_peer(peer);
        session.set_status(RunStatus::Running);
        session
            .dispatch_connect(callbacks, env, Some(peer), Ok(()))
            .await;

        let exit = session.stream_loop(&secured, timeout, callbacks, env).await;
        let _ = session.remove_sub(peer);
        secured.close();

        match exit {
            Exit::Command(Command::Restart) | Exit::PeerClosed => {
                session.set_status(RunStatus::WaitingAccept);
            }
            Exit::Command(_) => return Ok(()),
        }
    }
}
