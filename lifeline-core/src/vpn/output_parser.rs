//! Pattern-based parser for tunnel engine log output
//!
//! Picks error lines out of the engine's stderr so the most recent one
//! can be reported as the engine's last error.

use regex::Regex;

/// Severity of an engine log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    Fatal,
    Error,
    Other,
}

/// A parsed engine log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLogLine {
    pub severity: LogSeverity,
    pub message: String,
}

/// Parser for tunnel engine stderr
pub struct OutputParser {
    /// ANSI color sequences emitted by engines writing to a tty-like pipe
    ansi_pattern: Regex,
    /// "FATAL[0000] start service: ..." / "ERROR[0003] ..." / "level=error msg=..."
    severity_pattern: Regex,
}

impl OutputParser {
    /// Create a new OutputParser with compiled regex patterns
    pub fn new() -> Self {
        Self {
            ansi_pattern: Regex::new(r"\x1b\[[0-9;]*m").expect("Failed to compile ansi pattern"),
            severity_pattern: Regex::new(
                r"(?i)^(?:\S+\s+)?(?:level=)?(fatal|error|panic)(?:\[\d+\])?[:\s]+(?:msg=)?(.*)$",
            )
            .expect("Failed to compile severity pattern"),
        }
    }

    /// Parse a single line of engine output
    pub fn parse_line(&self, line: &str) -> EngineLogLine {
        let clean = self.ansi_pattern.replace_all(line.trim(), "");

        if let Some(caps) = self.severity_pattern.captures(&clean) {
            let severity = match caps[1].to_ascii_lowercase().as_str() {
                "error" => LogSeverity::Error,
                _ => LogSeverity::Fatal,
            };
            let message = caps[2].trim().trim_matches('"').to_string();
            return EngineLogLine { severity, message };
        }

        EngineLogLine {
            severity: LogSeverity::Other,
            message: clean.into_owned(),
        }
    }

    /// Error message carried by `line`, if it is an error line
    pub fn error_message(&self, line: &str) -> Option<String> {
        let parsed = self.parse_line(line);
        match parsed.severity {
            LogSeverity::Fatal | LogSeverity::Error if !parsed.message.is_empty() => {
                Some(parsed.message)
            }
            _ => None,
        }
    }
}

impl Default for OutputParser {
    fn default() -> Self {
        Self::new()
    }
}
