//! Compile-time diagnostics
//!
//! Every compile error flows through [`Diagnostic`], ensuring the same
//! rendering whether it is raised by the scanner or the compiler. Diagnostics
//! serialize to JSON for tooling; the human format is the driver contract:
//! `[line N] Error at 'lexeme': message`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where in the source the error was noticed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorLocation {
    /// At a specific token; holds the offending lexeme
    At(String),
    /// At the end of input
    AtEnd,
    /// No usable lexeme (the token itself was a lexical error)
    None,
}

/// A single compile error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Line number (1-based)
    pub line: u32,
    /// Offending location
    pub location: ErrorLocation,
    /// Main diagnostic message
    pub message: String,
}

impl Diagnostic {
    /// Error at a specific token
    pub fn at_token(line: u32, lexeme: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            line,
            location: ErrorLocation::At(lexeme.into()),
            message: message.into(),
        }
    }

    /// Error at end of input
    pub fn at_end(line: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            location: ErrorLocation::AtEnd,
            message: message.into(),
        }
    }

    /// Error with no location lexeme
    pub fn plain(line: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            location: ErrorLocation::None,
            message: message.into(),
        }
    }

    /// Format as compact JSON
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            ErrorLocation::At(lexeme) => write!(
                f,
                "[line {}] Error at '{}': {}",
                self.line, lexeme, self.message
            ),
            ErrorLocation::AtEnd => {
                write!(f, "[line {}] Error at end: {}", self.line, self.message)
            }
            ErrorLocation::None => write!(f, "[line {}] Error: {}", self.line, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_at_token() {
        let diag = Diagnostic::at_token(3, "=", "Invalid assignment target.");
        assert_eq!(
            diag.to_string(),
            "[line 3] Error at '=': Invalid assignment target."
        );
    }

    #[test]
    fn test_display_at_end() {
        let diag = Diagnostic::at_end(1, "Expect expression.");
        assert_eq!(diag.to_string(), "[line 1] Error at end: Expect expression.");
    }

    #[test]
    fn test_json_round_trip() {
        let diag = Diagnostic::plain(7, "Unterminated string.");
        let json = diag.to_json_string().unwrap();
        let back: Diagnostic = serde_json::from_str(&json).unwrap();
        assert_eq!(diag, back);
    }
}
