use std::sync::Arc;

use dpm::config::SessionConfig;
use dpm::error::{DmError, Result};
use dpm::job::JobId;

use tracing::{info, warn};

use crate::callbacks::SharedSessionCallbacks;
use crate::secure::{SecureProtocol, SecureRole};
use crate::transport::StreamSocket;

use super::{
    Command, Exit, RECONNECT_WAIT, RunStatus, Session, SessionEnv, bind_with_retry, lock,
};

async fn try_connect(
    session: &Session,
    config: &SessionConfig,
    env: &SessionEnv,
) -> Result<Arc<dyn StreamSocket>> {
    let server = env
        .transport
        .resolve(&config.server_addr, config.server_port)
        .await
        .map_err(|e| {
            DmError::ConnectFail(format!("cannot resolve `{}`: {e}", config.server_addr).into())
        })?;

    let keepalive = config.keepalive_interval_s > 0;
    bind_with_retry(session, config.local_port, || {
        env.transport.connect(config.local_port, server, keepalive)
    })
    .await
    .map_err(|e| match e {
        DmError::SocketCreateFail(reason) => DmError::ConnectFail(reason),
        e => e,
    })
}

// Connects to the server, retrying as the reconnect policy says.
//
// The initial attempts hold the session job. With automatic reconnection the
// session then keeps retrying at the same pace without preventing sleep.
async fn connect(
    session: &Session,
    config: &SessionConfig,
    callbacks: &SharedSessionCallbacks,
    env: &SessionEnv,
) -> Result<Arc<dyn StreamSocket>> {
    let policy = config.reconnect;
    let mut job = Some(env.coordinator.start(JobId::Session(session.id)));
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);
        session.set_status(RunStatus::Init);

        match try_connect(session, config, env).await {
            Ok(socket) => return Ok(socket),
            Err(DmError::RestartRequest) => {
                attempt = 0;
                continue;
            }
            Err(e) if e.is_control() => return Err(e),
            Err(e) => {
                warn!(
                    "Session `{}`: connection attempt {attempt} to `{}:{}` failed: {e}",
                    session.id, config.server_addr, config.server_port
                );

                if attempt == policy.attempts() {
                    session
                        .dispatch_connect(callbacks, env, None, Err(e.clone()))
                        .await;
                    if !policy.auto_reconnect {
                        return Err(e);
                    }
                    env.reporter
                        .report(&format!("Session `{}`", session.id), &e);
                    drop(job.take());
                }
            }
        }

        match session.pause(policy.wait_time()).await {
            None => {}
            Some(Command::Restart) => attempt = 0,
            Some(command) => return Err(command.into_error()),
        }
    }
}

pub(super) async fn run(
    session: &Arc<Session>,
    config: &SessionConfig,
    callbacks: &SharedSessionCallbacks,
    env: &SessionEnv,
) -> Result<()> {
    let timeout = config.receive_timeout();

    loop {
        let socket = connect(session, config, callbacks, env).await?;
        let peer = socket.peer_addr();
        session.observe_local_port(Some(socket.local_addr().port()));
        session.observe_peer(peer);
        lock(&session.link).stream = Some(socket.clone());
        session.set_status(RunStatus::Connected);
        info!("Session `{}` connected to `{peer}`", session.id);

        let socket = if config.secure {
            match session
                .secure(socket.clone(), SecureRole::Client, SecureProtocol::Tls, callbacks, env)
                .await
            {
                Ok(secured) => {
                    lock(&session.link).stream = Some(secured.clone());
                    secured
                }
                Err(e) => {
                    socket.close();
                    session
                        .dispatch_connect(callbacks, env, Some(peer), Err(e.clone()))
                        .await;
                    return Err(e);
                }
            }
        } else {
            socket
        };

        session.set_status(RunStatus::Running);
        session.arm_keepalive(config, callbacks, env);
        session
            .dispatch_connect(callbacks, env, Some(peer), Ok(()))
            .await;

        let exit = session.stream_loop(&socket, timeout, callbacks, env).await;

        session.disarm_keepalive();
        if let Some(stream) = lock(&session.link).stream.take() {
            stream.close();
        }

        match exit {
            Exit::Command(Command::Restart) => {
                info!("Session `{}` restarts", session.id);
            }
            Exit::Command(_) => return Ok(()),
            Exit::PeerClosed if config.reconnect.auto_reconnect => {
                session.set_status(RunStatus::GoingStop);
                match session.pause(RECONNECT_WAIT).await {
                    None | Some(Command::Restart) => {}
                    Some(_) => return Ok(()),
                }
            }
            Exit::PeerClosed => return Err(DmError::PeerClosedConnection),
        }
    }
}
