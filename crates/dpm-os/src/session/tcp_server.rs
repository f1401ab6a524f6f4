use std::sync::Arc;
use std::time::Duration;

use dpm::config::{RX_BUFFER_SIZE, SessionConfig};
use dpm::error::Result;

use tracing::{debug, info, warn};

use crate::callbacks::SharedSessionCallbacks;
use crate::secure::{SecureProtocol, SecureRole};
use crate::transport::StreamSocket;

use super::{Command, Poll, RunStatus, Session, SessionEnv, bind_with_retry, lock};

// Pause after a failed accept.
const ACCEPT_RETRY_WAIT: Duration = Duration::from_millis(100);

pub(super) async fn run(
    session: &Arc<Session>,
    config: &SessionConfig,
    callbacks: &SharedSessionCallbacks,
    env: &SessionEnv,
) -> Result<()> {
    let listener = bind_with_retry(session, config.local_port, || {
        env.transport.listen(config.local_port)
    })
    .await?;

    session.observe_local_port(Some(listener.local_addr().port()));
    lock(&session.link).listener = Some(listener.clone());
    session.set_status(RunStatus::WaitingAccept);
    session.arm_keepalive(config, callbacks, env);
    info!("Session `{}` listening on `{}`", session.id, listener.local_addr());

    let timeout = config.receive_timeout();

    loop {
        match session.take_command() {
            Command::None => {}
            Command::Stop => return Ok(()),
            Command::Restart => {
                info!("Session `{}` drops its peers", session.id);
                session.release_peers();
                session.set_status(RunStatus::WaitingAccept);
            }
        }

        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            // Use the command notification to stop waiting
            () = session.command_posted.notified() => continue,
        };

        let socket = match accepted {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Session `{}`: accept failed: {e}", session.id);
                if let Some(command) = session.pause(ACCEPT_RETRY_WAIT).await {
                    session.post(command);
                }
                continue;
            }
        };

        let peer = socket.peer_addr();
        debug!("Session `{}` accepted `{peer}`", session.id);

        let socket = if config.secure {
            match session
                .secure(socket.clone(), SecureRole::Server, SecureProtocol::Tls, callbacks, env)
                .await
            {
                Ok(secured) => secured,
                Err(e) => {
                    socket.close();
                    env.reporter
                        .report(&format!("Session `{}`", session.id), &e);
                    session
                        .dispatch_connect(callbacks, env, Some(peer), Err(e))
                        .await;
                    continue;
                }
            }
        } else {
            socket
        };

        session.admit(peer, Some(socket.clone()));
        let reader = tokio::spawn(serve_peer(
            session.clone(),
            socket,
            timeout,
            callbacks.clone(),
            env.clone(),
        ));
        session.set_reader(peer, reader);
        session.observe_peer(peer);
        session.set_status(RunStatus::Running);

        session
            .dispatch_connect(callbacks, env, Some(peer), Ok(()))
            .await;
    }
}

// Receives from one peer until it closes the connection.
async fn serve_peer(
    session: Arc<Session>,
    socket: Arc<dyn StreamSocket>,
    timeout: Duration,
    callbacks: SharedSessionCallbacks,
    env: SessionEnv,
) {
    let peer = socket.peer_addr();
    let mut buf = vec![0; RX_BUFFER_SIZE];

    loop {
        match session.receive(socket.as_ref(), &mut buf, timeout).await {
            Poll::Idle => {}
            Poll::Data(size) => {
                session.touch(peer);
                session
                    .dispatch_recv(&callbacks, &env, peer, buf[..size].to_vec())
                    .await;
            }
            Poll::Closed => {
                info!("Session `{}`: peer `{peer}` closed the connection", session.id);
                session.dispatch_recv(&callbacks, &env, peer, Vec::new()).await;

                if session.remove_sub(peer) == 0 && session.status() == RunStatus::Running {
                    session.set_status(RunStatus::WaitingAccept);
                }
                break;
            }
        }
    }
}
