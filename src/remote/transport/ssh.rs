//! SSH transport over russh.
//!
//! ## Connection Lifecycle
//!
//! 1. **Client configuration**: keepalive every 30 seconds (three misses close
//!    the connection) and optional zlib compression. Pooled connections are
//!    long-lived, so there is no inactivity timeout.
//! 2. **Handshake**: TCP connect plus key exchange, bounded by the request
//!    timeout. Running out of time here is reported as an authentication
//!    failure; refused or unreachable hosts are I/O failures.
//! 3. **Authentication**: the host's [`AuthChain`], bounded by the same timeout.
//! 4. **Sub-channels**: each pooled file channel is a session channel running
//!    the `sftp` subsystem; short commands use a throwaway `exec` channel.
//!
//! Host keys are accepted without verification.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::{ChannelMsg, Disconnect, client, keys};
use russh_sftp::client::SftpSession;
use tracing::{debug, info, warn};

use crate::remote::auth::{AuthChain, AuthStrategy};
use crate::remote::config::MuxConfig;
use crate::remote::credentials::AuthSettings;
use crate::remote::error::{ConnectFailure, ErrorKind, RemoteError, classify_io};
use crate::remote::host::HostId;
use crate::remote::transport::sftp::{SftpChannel, classify_sftp};
use crate::remote::transport::{ConnectRequest, Connection, ExecOutput, FileChannel, Transport};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_MAX: usize = 3;

/// russh client handler that accepts every server key, like
/// `StrictHostKeyChecking=no`.
pub struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Build the russh client configuration.
pub(crate) fn build_client_config(compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: KEEPALIVE_MAX,
        preferred,
        ..Default::default()
    })
}

/// Map a russh error onto the crate taxonomy.
pub(crate) fn classify_ssh(e: &russh::Error) -> ErrorKind {
    match e {
        russh::Error::Disconnect
        | russh::Error::HUP
        | russh::Error::ConnectionTimeout
        | russh::Error::KeepaliveTimeout
        | russh::Error::InactivityTimeout
        | russh::Error::SendError => ErrorKind::ChannelLost,
        russh::Error::Elapsed(_) => ErrorKind::Timeout,
        russh::Error::IO(io) => classify_io(io),
        _ => ErrorKind::Failure,
    }
}

fn ssh_error(op: &str, e: russh::Error) -> RemoteError {
    RemoteError::new(classify_ssh(&e), format!("{}: {}", op, e))
}

/// Opens russh connections.
pub struct SshTransport {
    compress: bool,
}

impl SshTransport {
    pub fn new(config: &MuxConfig) -> Self {
        Self {
            compress: config.compression,
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self, request: &ConnectRequest) -> Result<Arc<dyn Connection>, ConnectFailure> {
        let host = &request.host;
        let config = build_client_config(self.compress);
        let connect = client::connect(config, (host.address(), host.port()), SshClientHandler);

        let mut handle = match tokio::time::timeout(request.timeout, connect).await {
            Err(_) => {
                return Err(ConnectFailure::Authentication(format!(
                    "handshake with {} timed out after {:?}",
                    host, request.timeout
                )));
            }
            Ok(Err(e)) => return Err(ConnectFailure::Io(format!("{}: {}", host, e))),
            Ok(Ok(handle)) => handle,
        };

        let chain = AuthChain::from_settings(&request.auth, request.password.as_deref());
        debug!(%host, methods = ?chain.names(), "authenticating");
        let outcome = tokio::time::timeout(request.timeout, chain.authenticate(&mut handle, host.user())).await;
        match outcome {
            Err(_) => {
                return Err(ConnectFailure::Authentication(format!(
                    "authentication with {} timed out after {:?}",
                    host, request.timeout
                )));
            }
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                return Err(ConnectFailure::Authentication(
                    "no authentication method succeeded".to_string(),
                ));
            }
            Ok(Err(e)) => return Err(ConnectFailure::Authentication(e.to_string())),
        }

        info!(%host, "ssh session established");
        Ok(Arc::new(SshConnection {
            host: host.clone(),
            handle: Arc::new(handle),
            exec_timeout: request.timeout,
        }))
    }
}

/// One authenticated russh session.
pub struct SshConnection {
    host: HostId,
    handle: Arc<client::Handle<SshClientHandler>>,
    exec_timeout: Duration,
}

#[async_trait]
impl Connection for SshConnection {
    fn is_alive(&self) -> bool {
        !self.handle.is_closed()
    }

    async fn open_file_channel(&self) -> Result<Box<dyn FileChannel>, RemoteError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ssh_error("open channel", e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ssh_error("request sftp subsystem", e))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| RemoteError::new(classify_sftp(&e), format!("sftp init: {}", e)))?;
        debug!(host = %self.host, "sftp channel opened");
        Ok(Box::new(SftpChannel::new(sftp, self.handle.clone())))
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, RemoteError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ssh_error("open channel", e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ssh_error("exec", e))?;

        let mut stdout = Vec::with_capacity(1024);
        let mut stderr = Vec::new();
        let mut exit_code: Option<u32> = None;

        let collected = tokio::time::timeout(self.exec_timeout, async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                    // ext == 1 is stderr
                    Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                        stderr.extend_from_slice(&data)
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                    Some(ChannelMsg::Eof) if exit_code.is_some() => break,
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        })
        .await;

        let _ = channel.close().await;
        if collected.is_err() {
            warn!(host = %self.host, command, "remote command timed out");
            return Err(RemoteError::new(
                ErrorKind::Timeout,
                format!("command timed out after {:?}", self.exec_timeout),
            ));
        }

        Ok(ExecOutput {
            exit_code: exit_code.map(|c| c as i32).unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// An SSH server ignores user-auth requests once a session is
    /// authenticated, so nothing changes on this connection. New sub-channels
    /// keep the identity the session was opened with; the updated record is
    /// read from the credential store by the next handshake.
    fn apply_auth(&self, auth: &AuthSettings) {
        debug!(
            host = %self.host,
            kind = ?auth.kind,
            methods = ?auth.methods,
            "auth settings recorded; they apply from the next handshake"
        );
    }

    async fn disconnect(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(host = %self.host, "disconnect: {}", e);
        }
    }
}
