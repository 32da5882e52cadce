//! SSH session backend.

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use fleet_core::{Credential, ExecOutput, FleetConfig, RemoteShell, SessionError, Target};
use russh::{
    ChannelMsg, Disconnect,
    client::{self, Handle},
    keys::{PrivateKeyWithHashAlg, PublicKey},
};
use russh_sftp::client::SftpSession;
use tokio::{io::AsyncWriteExt, time::timeout};

use crate::{
    command::{CommandBuildError, LoginShell},
    keys::load_private_key,
    known_hosts::HostKeyVerifier,
};

/// Timeouts and shell used by every call.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// TCP connect, handshake and authentication.
    pub connect_timeout: Duration,
    /// Channel open through remote exit.
    pub exec_timeout: Duration,
    /// One SFTP upload or download.
    pub transfer_timeout: Duration,
    pub shell: LoginShell,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            exec_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(600),
            shell: LoginShell::default(),
        }
    }
}

impl SessionOptions {
    /// Build options from process configuration.
    ///
    /// # Errors
    /// Returns error if the configured login shell is unusable.
    pub fn from_config(config: &FleetConfig) -> Result<Self, CommandBuildError> {
        Ok(Self {
            connect_timeout: config.connect_timeout,
            exec_timeout: config.exec_timeout,
            transfer_timeout: config.transfer_timeout,
            shell: LoginShell::from_program(&config.login_shell)?,
        })
    }
}

/// russh client callbacks for one connection.
struct Client {
    host: String,
    port: u16,
    verifier: Arc<HostKeyVerifier>,
}

impl client::Handler for Client {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(self.verifier.verify(&self.host, self.port, server_public_key))
    }
}

/// Remote shell over SSH, one connection per call.
///
/// Holds no per-host state apart from the host-key memory inside the verifier.
#[derive(Clone)]
pub struct SshSession {
    options: SessionOptions,
    verifier: Arc<HostKeyVerifier>,
    config: Arc<client::Config>,
}

impl SshSession {
    /// Create a new session backend.
    #[must_use]
    pub fn new(options: SessionOptions, verifier: Arc<HostKeyVerifier>) -> Self {
        let config = client::Config {
            inactivity_timeout: Some(options.exec_timeout.max(options.transfer_timeout)),
            ..Default::default()
        };
        Self {
            options,
            verifier,
            config: Arc::new(config),
        }
    }

    /// Options in effect.
    #[must_use]
    pub const fn options(&self) -> &SessionOptions {
        &self.options
    }

    async fn connect(&self, target: &Target) -> Result<Handle<Client>, SessionError> {
        let handler = Client {
            host: target.host.clone(),
            port: target.port,
            verifier: Arc::clone(&self.verifier),
        };
        let connecting = async {
            let mut handle = client::connect(
                Arc::clone(&self.config),
                (target.host.as_str(), target.port),
                handler,
            )
            .await
            .map_err(|e| match e {
                russh::Error::UnknownKey => SessionError::HostKeyRejected(target.address()),
                other => SessionError::Connect(other.to_string()),
            })?;
            authenticate(&mut handle, target).await?;
            Ok::<_, SessionError>(handle)
        };

        let handle = timeout(self.options.connect_timeout, connecting)
            .await
            .map_err(|_| SessionError::Timeout {
                phase: SessionError::CONNECT_PHASE,
                after: self.options.connect_timeout,
            })??;
        tracing::debug!(host = %target.address(), user = %target.username, "SSH session established");
        Ok(handle)
    }

    async fn close(handle: Handle<Client>, target: &Target) {
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!(host = %target.address(), error = %e, "Disconnect failed");
        }
    }
}

#[async_trait]
impl RemoteShell for SshSession {
    async fn exec(
        &self,
        target: &Target,
        command: &str,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, SessionError> {
        let wrapped = self
            .options
            .shell
            .wrap(command)
            .map_err(|e| SessionError::InvalidCommand(e.to_string()))?;

        let handle = self.connect(target).await?;
        let outcome = timeout(self.options.exec_timeout, run_channel(&handle, &wrapped, stdin))
            .await
            .map_err(|_| SessionError::Timeout {
                phase: "command",
                after: self.options.exec_timeout,
            })
            .and_then(|r| r);
        Self::close(handle, target).await;

        if let Ok(output) = &outcome {
            tracing::debug!(
                host = %target.address(),
                exit_code = ?output.exit_code,
                "Remote command finished"
            );
        }
        outcome
    }

    async fn upload(
        &self,
        target: &Target,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<(), SessionError> {
        let handle = self.connect(target).await?;
        let outcome = timeout(
            self.options.transfer_timeout,
            put_file(&handle, local_path, remote_path),
        )
        .await
        .map_err(|_| SessionError::Timeout {
            phase: "upload",
            after: self.options.transfer_timeout,
        })
        .and_then(|r| r);
        Self::close(handle, target).await;
        outcome
    }

    async fn download(
        &self,
        target: &Target,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), SessionError> {
        let handle = self.connect(target).await?;
        let outcome = timeout(
            self.options.transfer_timeout,
            get_file(&handle, remote_path, local_path),
        )
        .await
        .map_err(|_| SessionError::Timeout {
            phase: "download",
            after: self.options.transfer_timeout,
        })
        .and_then(|r| r);
        Self::close(handle, target).await;
        outcome
    }
}

async fn authenticate(handle: &mut Handle<Client>, target: &Target) -> Result<(), SessionError> {
    let auth = match &target.credential {
        Credential::Password(password) => {
            handle
                .authenticate_password(target.username.clone(), password.clone())
                .await
        }
        Credential::PrivateKey { pem, passphrase } => {
            let (kind, key) = load_private_key(pem, passphrase.as_deref())?;
            tracing::trace!(?kind, host = %target.address(), "Using private key");
            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .map_err(|e| SessionError::Connect(e.to_string()))?
                .flatten();
            handle
                .authenticate_publickey(
                    target.username.clone(),
                    PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                )
                .await
        }
    }
    .map_err(|e| SessionError::Connect(e.to_string()))?;

    if auth.success() {
        Ok(())
    } else {
        Err(SessionError::Auth(format!(
            "{}@{}",
            target.username,
            target.address()
        )))
    }
}

async fn run_channel(
    handle: &Handle<Client>,
    command: &str,
    stdin: Option<&[u8]>,
) -> Result<ExecOutput, SessionError> {
    let channel_err = |e: russh::Error| SessionError::Channel(e.to_string());

    let mut channel = handle.channel_open_session().await.map_err(channel_err)?;
    channel.exec(true, command).await.map_err(channel_err)?;
    if let Some(input) = stdin {
        channel.data(input).await.map_err(channel_err)?;
    }
    channel.eof().await.map_err(channel_err)?;

    Ok(collect_output(&mut channel, EXIT_DRAIN_GRACE).await)
}

/// How long to keep reading once the exit status has arrived. A backgrounded
/// child can hold stdout open long after the command itself returned.
const EXIT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Source of channel messages; `None` once the server closes the channel.
#[async_trait]
trait MessageSource: Send {
    async fn next_message(&mut self) -> Option<ChannelMsg>;
}

#[async_trait]
impl MessageSource for russh::Channel<client::Msg> {
    async fn next_message(&mut self) -> Option<ChannelMsg> {
        self.wait().await
    }
}

/// Read output until the channel closes, or until `grace` passes without a
/// message after the exit status (or signal) was reported.
async fn collect_output<M: MessageSource>(source: &mut M, grace: Duration) -> ExecOutput {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;
    let mut exit_signal = None;

    loop {
        let next = if exit_code.is_some() || exit_signal.is_some() {
            match timeout(grace, source.next_message()).await {
                Ok(msg) => msg,
                Err(_) => {
                    tracing::debug!("Channel still open after exit; returning collected output");
                    break;
                }
            }
        } else {
            source.next_message().await
        };
        let Some(msg) = next else { break };
        match msg {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
            ChannelMsg::ExitSignal { signal_name, .. } => {
                exit_signal = Some(format!("{signal_name:?}"));
            }
            _ => {}
        }
    }

    ExecOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
        exit_signal,
    }
}

async fn open_sftp(handle: &Handle<Client>) -> Result<SftpSession, SessionError> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| SessionError::Channel(e.to_string()))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| SessionError::Channel(e.to_string()))?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| SessionError::Transfer(e.to_string()))
}

async fn put_file(
    handle: &Handle<Client>,
    local_path: &Path,
    remote_path: &str,
) -> Result<(), SessionError> {
    let mut local = tokio::fs::File::open(local_path).await?;
    let sftp = open_sftp(handle).await?;
    let mut remote = sftp
        .create(remote_path)
        .await
        .map_err(|e| SessionError::Transfer(format!("{remote_path}: {e}")))?;
    let bytes = tokio::io::copy(&mut local, &mut remote).await?;
    remote.shutdown().await?;
    sftp.close()
        .await
        .map_err(|e| SessionError::Transfer(e.to_string()))?;
    tracing::debug!(remote_path, bytes, "Upload finished");
    Ok(())
}

async fn get_file(
    handle: &Handle<Client>,
    remote_path: &str,
    local_path: &Path,
) -> Result<(), SessionError> {
    let sftp = open_sftp(handle).await?;
    let mut remote = sftp
        .open(remote_path)
        .await
        .map_err(|e| SessionError::Transfer(format!("{remote_path}: {e}")))?;
    let mut local = tokio::fs::File::create(local_path).await?;
    let bytes = tokio::io::copy(&mut remote, &mut local).await?;
    local.flush().await?;
    sftp.close()
        .await
        .map_err(|e| SessionError::Transfer(e.to_string()))?;
    tracing::debug!(remote_path, bytes, "Download finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    fn target(port: u16) -> Target {
        Target::new("127.0.0.1", port, "nobody", Credential::Password("pw".into()))
    }

    #[tokio::test]
    async fn test_refused_connection_is_connection_error() {
        // Bind then drop to find a port nothing listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let session = SshSession::new(
            SessionOptions {
                connect_timeout: Duration::from_secs(5),
                ..SessionOptions::default()
            },
            Arc::new(HostKeyVerifier::trust_on_first_use()),
        );

        let result = session.run_command(&target(port), "echo ok").await;
        assert!(!result.ok);
        assert!(result.exit_code.is_none());
        assert_eq!(result.error_kind, Some(fleet_core::FailureKind::Connection));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        // Accepts TCP but never speaks SSH.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let session = SshSession::new(
            SessionOptions {
                connect_timeout: Duration::from_millis(200),
                ..SessionOptions::default()
            },
            Arc::new(HostKeyVerifier::trust_on_first_use()),
        );

        let err = session.exec(&target(port), "true", None).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout { phase: SessionError::CONNECT_PHASE, .. }));
    }

    #[tokio::test]
    async fn test_blank_command_rejected_before_connecting() {
        let session = SshSession::new(
            SessionOptions::default(),
            Arc::new(HostKeyVerifier::trust_on_first_use()),
        );
        // Port 9 (discard) is never contacted: the command fails to build first.
        let err = session.exec(&target(9), "  ", None).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidCommand(_)));
    }

    /// Replays messages, then either closes or stays open forever.
    struct Replay {
        messages: std::collections::VecDeque<ChannelMsg>,
        close_at_end: bool,
    }

    #[async_trait]
    impl MessageSource for Replay {
        async fn next_message(&mut self) -> Option<ChannelMsg> {
            match self.messages.pop_front() {
                Some(msg) => Some(msg),
                None if self.close_at_end => None,
                None => std::future::pending().await,
            }
        }
    }

    fn data(text: &str) -> ChannelMsg {
        ChannelMsg::Data {
            data: russh::CryptoVec::from_slice(text.as_bytes()),
        }
    }

    #[tokio::test]
    async fn test_exit_status_kept_when_channel_stays_open() {
        // `nohup worker &` leaves stdout held by the child after the shell exits.
        let mut source = Replay {
            messages: vec![data("started\n"), ChannelMsg::ExitStatus { exit_status: 0 }].into(),
            close_at_end: false,
        };

        let output = timeout(
            Duration::from_secs(5),
            collect_output(&mut source, Duration::from_millis(50)),
        )
        .await
        .expect("collection must stop after the grace period");

        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout, "started\n");
    }

    #[tokio::test]
    async fn test_output_after_exit_status_is_collected() {
        let mut source = Replay {
            messages: vec![
                ChannelMsg::ExitStatus { exit_status: 3 },
                data("late"),
                ChannelMsg::ExtendedData {
                    data: russh::CryptoVec::from_slice(b"oops"),
                    ext: 1,
                },
                ChannelMsg::Eof,
            ]
            .into(),
            close_at_end: true,
        };

        let output = collect_output(&mut source, Duration::from_secs(1)).await;
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout, "late");
        assert_eq!(output.stderr, "oops");
        assert!(output.exit_signal.is_none());
    }
}
