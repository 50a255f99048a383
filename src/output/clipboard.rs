//! Clipboard access through external tools
//!
//! Requires: wl-clipboard (Wayland), xclip (X11) or pbcopy/pbpaste (macOS)

use super::ClipboardBackend;
use crate::error::OutputError;
use std::io::Write;
use std::process::{Command, Stdio};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipboardTool {
    WlClipboard,
    Xclip,
    Pbcopy,
}

impl ClipboardTool {
    /// Binaries that must all be present: writer first, then reader
    pub fn binaries(self) -> &'static [&'static str] {
        match self {
            ClipboardTool::WlClipboard => &["wl-copy", "wl-paste"],
            ClipboardTool::Xclip => &["xclip"],
            ClipboardTool::Pbcopy => &["pbcopy", "pbpaste"],
        }
    }

    fn write_command(self) -> (&'static str, &'static [&'static str]) {
        match self {
            ClipboardTool::WlClipboard => ("wl-copy", &[]),
            ClipboardTool::Xclip => ("xclip", &["-selection", "clipboard"]),
            ClipboardTool::Pbcopy => ("pbcopy", &[]),
        }
    }

    fn read_command(self) -> (&'static str, &'static [&'static str]) {
        match self {
            ClipboardTool::WlClipboard => ("wl-paste", &["--no-newline"]),
            ClipboardTool::Xclip => ("xclip", &["-selection", "clipboard", "-o"]),
            ClipboardTool::Pbcopy => ("pbpaste", &[]),
        }
    }
}

fn spawn_error(program: &str, e: std::io::Error) -> OutputError {
    if e.kind() == std::io::ErrorKind::NotFound {
        OutputError::ToolNotFound(program.to_string())
    } else {
        OutputError::ClipboardFailed(format!("{}: {}", program, e))
    }
}

pub struct CommandClipboard {
    tool: ClipboardTool,
}

impl CommandClipboard {
    pub fn new(tool: ClipboardTool) -> Self {
        Self { tool }
    }
}

impl ClipboardBackend for CommandClipboard {
    fn read(&self) -> Result<String, OutputError> {
        let (program, args) = self.tool.read_command();
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| spawn_error(program, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // wl-paste exits non-zero on an empty clipboard
            if stderr.contains("No selection") || stderr.contains("Nothing is copied") {
                return Ok(String::new());
            }
            return Err(OutputError::ClipboardFailed(format!(
                "{}: {}",
                program,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn write(&self, text: &str) -> Result<(), OutputError> {
        let (program, args) = self.tool.write_command();
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(program, e))?;

        // Write text to stdin, then close it so the tool can take ownership
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .map_err(|e| OutputError::ClipboardFailed(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| OutputError::ClipboardFailed(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OutputError::ClipboardFailed(format!(
                "{}: {}",
                program,
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.tool.binaries()[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xclip_uses_clipboard_selection() {
        let (program, args) = ClipboardTool::Xclip.write_command();
        assert_eq!(program, "xclip");
        assert_eq!(args, &["-selection", "clipboard"]);
        let (_, args) = ClipboardTool::Xclip.read_command();
        assert_eq!(args.last(), Some(&"-o"));
    }

    #[test]
    fn test_backend_name() {
        assert_eq!(CommandClipboard::new(ClipboardTool::WlClipboard).name(), "wl-copy");
        assert_eq!(CommandClipboard::new(ClipboardTool::Pbcopy).name(), "pbcopy");
    }
}
