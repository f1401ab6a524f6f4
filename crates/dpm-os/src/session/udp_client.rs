use std::sync::Arc;

use dpm::config::{RX_BUFFER_SIZE, SessionConfig};
use dpm::error::{DmError, Result};

use tracing::{debug, info};

use crate::callbacks::SharedSessionCallbacks;
use crate::secure::{SecureProtocol, SecureRole};
use crate::transport::{DatagramStream, StreamSocket};

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

    let server = env
        .transport
        .resolve(&config.server_addr, config.server_port)
        .await
        .map_err(|e| {
            DmError::ConnectFail(format!("cannot resolve `{}`: {e}", config.server_addr).into())
        })?;

    info!(
        "Session `{}` bound to `{}`, server `{server}`",
        session.id,
        socket.local_addr()
    );

    let timeout = config.receive_timeout();

    if config.secure {
        loop {
            session.set_status(RunStatus::Init);
            let stream: Arc<dyn StreamSocket> =
                Arc::new(DatagramStream::new(socket.clone(), server));

            let secured = match session
                .secure(stream.clone(), SecureRole::Client, SecureProtocol::Dtls, callbacks, env)
                .await
            {
                Ok(secured) => secured,
                Err(e) => {
                    stream.close();
                    session
                        .dispatch_connect(callbacks, env, Some(server), Err(e.clone()))
                        .await;
                    return Err(e);
                }
            };

            // The handshake heard from the server.
            session.observe_peer(server);
            lock(&session.link).stream = Some(secured.clone());
            session.set_status(RunStatus::Running);
            session
                .dispatch_connect(callbacks, env, Some(server), Ok(()))
                .await;

            let exit = session.stream_loop(&secured, timeout, callbacks, env).await;
            if let Some(stream) = lock(&session.link).stream.take() {
                stream.close();
            }

            match exit {
                Exit::Command(Command::Restart) => debug!("Session `{}` restarts", session.id),
                Exit::Command(_) => return Ok(()),
                Exit::PeerClosed => return Err(DmError::PeerClosedConnection),
            }
        }
    }

    session.set_status(RunStatus::Running);
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

        session.observe_peer(peer);
        session
            .dispatch_recv(callbacks, env, peer, buf[..size].to_vec())
            .await;
    }
}
