//! Keyboard simulation through external tools
//!
//! Requires one of: wtype (Wayland), ydotool with ydotoold running, xdotool (X11).

use super::KeyboardBackend;
use crate::error::OutputError;
use std::process::{Command, Stdio};

/// ydotool keycodes (linux/input-event-codes.h)
const KEY_BACKSPACE: u16 = 14;
const KEY_LEFTCTRL: u16 = 29;
const KEY_V: u16 = 47;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyboardTool {
    Wtype,
    Ydotool,
    Xdotool,
}

impl KeyboardTool {
    pub fn binary(self) -> &'static str {
        match self {
            KeyboardTool::Wtype => "wtype",
            KeyboardTool::Ydotool => "ydotool",
            KeyboardTool::Xdotool => "xdotool",
        }
    }
}

/// Keyboard backend that shells out to a injection tool
pub struct CommandKeyboard {
    tool: KeyboardTool,
    /// Delay between keypresses in milliseconds
    delay_ms: u32,
}

impl CommandKeyboard {
    pub fn new(tool: KeyboardTool, delay_ms: u32) -> Self {
        Self { tool, delay_ms }
    }

    fn type_args(&self, text: &str) -> Vec<String> {
        let delay = self.delay_ms.to_string();
        let mut args: Vec<String> = Vec::new();
        match self.tool {
            KeyboardTool::Wtype => {
                if self.delay_ms > 0 {
                    args.extend(["-d".into(), delay]);
                }
            }
            KeyboardTool::Ydotool => {
                args.push("type".into());
                if self.delay_ms > 0 {
                    args.extend(["--key-delay".into(), delay.clone(), "--key-hold".into(), delay]);
                }
            }
            KeyboardTool::Xdotool => {
                args.extend(["type".into(), "--delay".into(), delay]);
            }
        }
        // The -- ensures text starting with - isn't treated as an option
        args.push("--".into());
        args.push(text.into());
        args
    }

    fn backspace_args(&self, count: usize) -> Vec<String> {
        match self.tool {
            KeyboardTool::Wtype => std::iter::repeat(["-k".to_string(), "BackSpace".to_string()])
                .take(count)
                .flatten()
                .collect(),
            KeyboardTool::Ydotool => std::iter::once("key".to_string())
                .chain(
                    std::iter::repeat([
                        format!("{}:1", KEY_BACKSPACE),
                        format!("{}:0", KEY_BACKSPACE),
                    ])
                    .take(count)
                    .flatten(),
                )
                .collect(),
            KeyboardTool::Xdotool => vec![
                "key".into(),
                "--repeat".into(),
                count.to_string(),
                "BackSpace".into(),
            ],
        }
    }

    fn paste_args(&self) -> Vec<String> {
        match self.tool {
            KeyboardTool::Wtype => ["-M", "ctrl", "v", "-m", "ctrl"]
                .into_iter()
                .map(String::from)
                .collect(),
            KeyboardTool::Ydotool => vec![
                "key".into(),
                format!("{}:1", KEY_LEFTCTRL),
                format!("{}:1", KEY_V),
                format!("{}:0", KEY_V),
                format!("{}:0", KEY_LEFTCTRL),
            ],
            KeyboardTool::Xdotool => vec!["key".into(), "ctrl+v".into()],
        }
    }

    fn run(&self, args: &[String]) -> Result<(), OutputError> {
        let output = Command::new(self.tool.binary())
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    OutputError::ToolNotFound(self.tool.binary().to_string())
                } else {
                    OutputError::InjectionFailed(e.to_string())
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if self.tool == KeyboardTool::Ydotool
                && (stderr.contains("socket")
                    || stderr.contains("connect")
                    || stderr.contains("daemon"))
            {
                return Err(OutputError::YdotoolNotRunning);
            }
            return Err(OutputError::InjectionFailed(format!(
                "{}: {}",
                self.tool.binary(),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

impl KeyboardBackend for CommandKeyboard {
    fn type_text(&self, text: &str) -> Result<(), OutputError> {
        if text.is_empty() {
            return Ok(());
        }
        self.run(&self.type_args(text))
    }

    fn backspace(&self, count: usize) -> Result<(), OutputError> {
        if count == 0 {
            return Ok(());
        }
        tracing::trace!("Sending {} backspaces via {}", count, self.tool.binary());
        self.run(&self.backspace_args(count))
    }

    fn paste_shortcut(&self) -> Result<(), OutputError> {
        self.run(&self.paste_args())
            .map_err(|e| OutputError::CtrlVFailed(e.to_string()))
    }

    fn name(&self) -> &'static str {
        self.tool.binary()
    }
}
