//! Operator control channel: reload, skip, quit and continue.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Reload,
    Skip,
    Quit,
    Continue,
}

impl FromStr for OperatorCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reload" | "r" => Ok(OperatorCommand::Reload),
            "skip" | "s" => Ok(OperatorCommand::Skip),
            "quit" | "q" | "exit" => Ok(OperatorCommand::Quit),
            "continue" | "c" | "" => Ok(OperatorCommand::Continue),
            other => Err(format!("unknown command '{other}'")),
        }
    }
}

impl fmt::Display for OperatorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperatorCommand::Reload => "reload",
            OperatorCommand::Skip => "skip",
            OperatorCommand::Quit => "quit",
            OperatorCommand::Continue => "continue",
        };
        f.write_str(name)
    }
}

/// Sending half, held by whoever talks to the operator.
#[derive(Clone, Debug)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<OperatorCommand>,
    quit: CancellationToken,
}

impl ControlHandle {
    /// Returns false once the run has dropped its receiver.
    pub fn send(&self, command: OperatorCommand) -> bool {
        if command == OperatorCommand::Quit {
            self.quit.cancel();
        }
        self.tx.send(command).is_ok()
    }

    pub fn quit(&self) {
        self.send(OperatorCommand::Quit);
    }
}

/// Receiving half, owned by the run loop.
#[derive(Debug)]
pub struct ControlChannel {
    rx: mpsc::UnboundedReceiver<OperatorCommand>,
    quit: CancellationToken,
    disconnected: bool,
}

pub fn control_channel() -> (ControlHandle, ControlChannel) {
    let (tx, rx) = mpsc::unbounded_channel();
    let quit = CancellationToken::new();
    (
        ControlHandle {
            tx,
            quit: quit.clone(),
        },
        ControlChannel {
            rx,
            quit,
            disconnected: false,
        },
    )
}

impl ControlChannel {
    /// A channel nobody sends on.
    pub fn detached() -> Self {
        control_channel().1
    }

    /// Everything queued since the last drain, without waiting.
    pub fn drain(&mut self) -> Vec<OperatorCommand> {
        let mut commands = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(command) => commands.push(command),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    break;
                }
            }
        }
        if !commands.is_empty() {
            debug!("Drained operator commands: {:?}", commands);
        }
        commands
    }

    /// Wait for the next command. `None` on timeout or when no sender remains.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Option<OperatorCommand> {
        if self.disconnected {
            return None;
        }
        let next = async {
            let command = self.rx.recv().await;
            if command.is_none() {
                self.disconnected = true;
            }
            command
        };
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, next).await {
                Ok(command) => command,
                Err(_) => {
                    info!("No operator response within {:?}; resuming", limit);
                    None
                }
            },
            None => next.await,
        }
    }

    pub fn disconnected(&self) -> bool {
        self.disconnected
    }

    /// Cancelled as soon as a quit is sent, even before it is drained.
    pub fn quit_token(&self) -> CancellationToken {
        self.quit.clone()
    }

    pub fn quit_requested(&self) -> bool {
        self.quit.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!("Reload".parse::<OperatorCommand>(), Ok(OperatorCommand::Reload));
        assert_eq!(" q ".parse::<OperatorCommand>(), Ok(OperatorCommand::Quit));
        assert_eq!("".parse::<OperatorCommand>(), Ok(OperatorCommand::Continue));
        assert!("jump".parse::<OperatorCommand>().is_err());
    }

    #[tokio::test]
    async fn test_drain_and_quit_token() {
        let (handle, mut channel) = control_channel();
        handle.send(OperatorCommand::Skip);
        handle.quit();
        assert!(channel.quit_requested());
        assert_eq!(
            channel.drain(),
            vec![OperatorCommand::Skip, OperatorCommand::Quit]
        );
        assert!(channel.drain().is_empty());
        drop(handle);
        assert_eq!(channel.wait(Some(Duration::from_millis(10))).await, None);
        assert!(channel.disconnected());
    }

    #[test]
    fn test_wait_returns_the_next_command() {
        let (handle, mut channel) = control_channel();
        handle.send(OperatorCommand::Continue);
        let got = tokio_test::block_on(channel.wait(Some(Duration::from_secs(1))));
        assert_eq!(got, Some(OperatorCommand::Continue));
    }
}
