use crate::error::{EyecapError, Result};
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Operator request read from the terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCommand {
    /// Save the latest frame into the active session
    CaptureNow,
    /// Print a status line
    Status,
    /// Stop and package the active recording
    StopRecording,
    /// Leave the application
    Quit,
}

impl KeyCommand {
    pub fn from_key(code: KeyCode) -> Option<Self> {
        match code {
            KeyCode::Char(' ') => Some(KeyCommand::CaptureNow),
            KeyCode::Char('i') => Some(KeyCommand::Status),
            KeyCode::Char('s') => Some(KeyCommand::StopRecording),
            KeyCode::Char('q') | KeyCode::Esc => Some(KeyCommand::Quit),
            _ => None,
        }
    }
}

/// Raw-mode keyboard reader for operator control during a recording
pub struct KeyboardInputHandler {
    cancellation_token: CancellationToken,
}

impl Default for KeyboardInputHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyboardInputHandler {
    pub fn new() -> Self {
        Self {
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Start listening for keys. Commands arrive on the returned channel,
    /// which closes after `Quit` or `stop()`.
    pub fn start(&self) -> Result<mpsc::UnboundedReceiver<KeyCommand>> {
        info!("Keyboard control: SPACE capture, i status, s stop recording, q quit");

        let (tx, rx) = mpsc::unbounded_channel();
        let cancellation_token = self.cancellation_token.clone();

        enable_raw_mode()
            .map_err(|e| EyecapError::component("keyboard", format!("raw mode unavailable: {}", e)))?;

        task::spawn_blocking(move || {
            loop {
                if cancellation_token.is_cancelled() {
                    debug!("Keyboard input handler stopping");
                    break;
                }

                match event::poll(Duration::from_millis(100)) {
                    Ok(true) => {
                        let Ok(Event::Key(key_event)) = event::read() else {
                            continue;
                        };
                        // Only presses, not releases or repeats
                        if key_event.kind != KeyEventKind::Press {
                            continue;
                        }

                        match KeyCommand::from_key(key_event.code) {
                            Some(command) => {
                                debug!("Key command: {:?}", command);
                                if tx.send(command).is_err() || command == KeyCommand::Quit {
                                    break;
                                }
                            }
                            None => debug!("Key pressed: {:?}", key_event.code),
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Error polling for keyboard events: {}", e);
                    }
                }
            }

            if let Err(e) = disable_raw_mode() {
                error!("Failed to disable raw mode: {}", e);
            } else {
                debug!("Raw mode disabled");
            }
        });

        Ok(rx)
    }

    pub async fn stop(&self) {
        self.cancellation_token.cancel();

        // Give the poll loop a moment to restore the terminal itself
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _ = disable_raw_mode();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_mapping() {
        assert_eq!(
            KeyCommand::from_key(KeyCode::Char(' ')),
            Some(KeyCommand::CaptureNow)
        );
        assert_eq!(
            KeyCommand::from_key(KeyCode::Char('s')),
            Some(KeyCommand::StopRecording)
        );
        assert_eq!(KeyCommand::from_key(KeyCode::Esc), Some(KeyCommand::Quit));
        assert_eq!(KeyCommand::from_key(KeyCode::Char('x')), None);
    }

    #[tokio::test]
    async fn test_keyboard_handler_stop() {
        let handler = KeyboardInputHandler::new();

        handler.stop().await;
        assert!(handler.cancellation_token.is_cancelled());
    }
}
