//! ELM327-compatible adapter over TCP
//!
//! Wi-Fi OBD dongles expose the adapter's serial console on a TCP port.
//! Commands are written with a carriage return and the reply is complete
//! once the prompt character arrives.

use std::time::Duration;

use async_trait::async_trait;
use revflash_core::ConnectionState;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::{StatePublisher, TransportAdapter, TransportError};
use crate::config::TcpConfig;

/// Upper bound for one reply, well above any single-frame response
const MAX_RESPONSE_LEN: usize = 8192;

/// TCP transport for ELM327 Wi-Fi adapters
pub struct TcpAdapter {
    config: TcpConfig,
    stream: Mutex<Option<TcpStream>>,
    state: StatePublisher,
}

impl TcpAdapter {
    pub fn new(config: &TcpConfig) -> Self {
        Self {
            config: config.clone(),
            stream: Mutex::new(None),
            state: StatePublisher::new(),
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// Write one command and read until the prompt
    async fn exchange(
        stream: &mut TcpStream,
        command: &str,
        terminator: char,
    ) -> Result<String, TransportError> {
        stream
            .write_all(format!("{}\r", command).as_bytes())
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let mut buffer = Vec::with_capacity(64);
        let mut chunk = [0u8; 256];
        loop {
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
            if n == 0 {
                return Err(TransportError::ConnectionClosed);
            }
            buffer.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&buffer);
            if let Some(end) = text.find(terminator) {
                return Ok(strip_echo(&text[..end], command));
            }
            if buffer.len() > MAX_RESPONSE_LEN {
                return Err(TransportError::ReceiveFailed(
                    "response exceeded buffer without prompt".to_string(),
                ));
            }
        }
    }

    async fn fail(&self, reason: String) {
        self.stream.lock().await.take();
        self.state.publish(ConnectionState::Error(reason));
    }
}

/// Drop an echoed command line and join the remaining lines
fn strip_echo(text: &str, command: &str) -> String {
    text.split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.eq_ignore_ascii_case(command))
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl TransportAdapter for TcpAdapter {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.state.is_connected() {
            return Ok(());
        }
        self.state.publish(ConnectionState::Connecting);

        let address = self.address();
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let mut stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let reason = format!("{}: {}", address, e);
                self.state.publish(ConnectionState::Error(reason.clone()));
                return Err(TransportError::ConnectionFailed(reason));
            }
            Err(_) => {
                let reason = format!("{}: connect timed out", address);
                self.state.publish(ConnectionState::Error(reason.clone()));
                return Err(TransportError::Timeout(reason));
            }
        };
        let _ = stream.set_nodelay(true);

        let response_timeout = Duration::from_millis(self.config.response_timeout_ms);
        for command in &self.config.init_commands {
            let result = tokio::time::timeout(
                response_timeout,
                Self::exchange(&mut stream, command, self.config.terminator),
            )
            .await;
            match result {
                Ok(Ok(reply)) => debug!(%command, %reply, "Adapter init"),
                Ok(Err(e)) => {
                    self.state
                        .publish(ConnectionState::Error(format!("init '{}': {}", command, e)));
                    return Err(e);
                }
                Err(_) => {
                    let reason = format!("init '{}' timed out", command);
                    self.state.publish(ConnectionState::Error(reason.clone()));
                    return Err(TransportError::Timeout(reason));
                }
            }
        }

        *self.stream.lock().await = Some(stream);
        self.state.publish(ConnectionState::Connected);
        info!(%address, "TCP adapter connected");
        Ok(())
    }

    async fn disconnect(&self) {
        // Publish first so a send holding the stream lock gives up
        self.state.publish(ConnectionState::Disconnected);
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }

    async fn send(&self, command: &str) -> Result<String, TransportError> {
        if !self.state.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let response_timeout = Duration::from_millis(self.config.response_timeout_ms);
        let result = {
            let mut guard = self.stream.lock().await;
            let stream = guard.as_mut().ok_or(TransportError::NotConnected)?;
            tokio::select! {
                result = tokio::time::timeout(
                    response_timeout,
                    Self::exchange(stream, command, self.config.terminator),
                ) => result,
                _ = self.state.lost() => return Err(TransportError::ConnectionClosed),
            }
        };

        match result {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                warn!(%command, error = %e, "Adapter link failed");
                self.fail(e.to_string()).await;
                Err(e)
            }
            Err(_) => {
                // The adapter is still mid-reply; later reads would pair with the wrong command
                let reason = format!("no prompt after '{}'", command);
                warn!(%reason, "Adapter timed out");
                self.fail(reason.clone()).await;
                Err(TransportError::Timeout(reason))
            }
        }
    }

    fn state(&self) -> ConnectionState {
        self.state.current()
    }

    fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn describe(&self) -> String {
        format!("tcp {}", self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_echo() {
        assert_eq!(strip_echo("010C\r41 0C 1F 40\r\r", "010C"), "41 0C 1F 40");
        assert_eq!(strip_echo("\r\nELM327 v1.5\r\n", "ATZ"), "ELM327 v1.5");
        assert_eq!(strip_echo("41 0C\r1F 40\r", "010C"), "41 0C 1F 40");
    }
}
