//! Wire protocol for server-to-client lines.
//!
//! Clients send raw lines that `matrix_chat_core::parse_line` classifies;
//! every line the server writes is one `ServerMessage` rendered with
//! `Display`.

use std::fmt;

use matrix_chat_core::{MatrixError, Op, Outcome};

/// Usage summary sent in reply to `HELP`.
pub const HELP_TEXT: &str = "commands: ADD|SUB|MUL <a> | <b>, TRANSPOSE|INVERSE|DET <a>, \
     rows separated by ';' (e.g. ADD 1 2;3 4 | 1 1;1 1); NAME <name>, WHO, HELP, QUIT";

/// Message from server to client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Chat text from a session.
    Chat { sender: String, text: String },
    /// Successful matrix operation.
    Computed {
        sender: String,
        op: Op,
        outcome: Outcome,
    },
    /// Failed matrix operation.
    Failed {
        sender: String,
        op: Op,
        error: MatrixError,
    },
    /// Display name change.
    Renamed { old: String, new: String },
    /// A session joined.
    Joined { name: String },
    /// A session left.
    Left { name: String },
    /// Private greeting for a new session.
    Welcome { name: String },
    /// Private list of connected users.
    Who { names: Vec<String> },
    /// Private usage summary.
    Help,
}

impl ServerMessage {
    /// Build the broadcast line for a finished operation.
    #[must_use]
    pub fn from_result(sender: &str, op: Op, result: Result<Outcome, MatrixError>) -> Self {
        let sender = sender.to_owned();
        match result {
            Ok(outcome) => Self::Computed {
                sender,
                op,
                outcome,
            },
            Err(error) => Self::Failed { sender, op, error },
        }
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chat { sender, text } => write!(f, "{sender}: {text}"),
            Self::Computed {
                sender,
                op,
                outcome,
            } => write!(f, "{sender} computed {op}: {outcome}"),
            Self::Failed { sender, op, error } => write!(f, "{sender}'s {op} failed: {error}"),
            Self::Renamed { old, new } => write!(f, "{old} is now known as {new}"),
            Self::Joined { name } => write!(f, "{name} joined"),
            Self::Left { name } => write!(f, "{name} left"),
            Self::Welcome { name } => write!(f, "welcome, {name}"),
            Self::Who { names } => write!(f, "online: {}", names.join(", ")),
            Self::Help => f.write_str(HELP_TEXT),
        }
    }
}

#[cfg(test)]
mod tests {
    use matrix_chat_core::{Matrix, Shape};

    use super::*;

    #[test]
    fn test_chat_line() {
        let msg = ServerMessage::Chat {
            sender: "alice".into(),
            text: "hi all".into(),
        };
        assert_eq!(msg.to_string(), "alice: hi all");
    }

    #[test]
    fn test_computed_line() {
        let result = Matrix::from_rows(vec![vec![2.0, 3.0], vec![4.0, 5.0]]).unwrap();
        let msg = ServerMessage::from_result("alice", Op::Add, Ok(Outcome::Matrix(result)));
        assert_eq!(msg.to_string(), "alice computed ADD: 2 3;4 5");

        let msg = ServerMessage::from_result("bob", Op::Det, Ok(Outcome::Scalar(-2.0)));
        assert_eq!(msg.to_string(), "bob computed DET: -2");
    }

    #[test]
    fn test_failed_line() {
        let msg = ServerMessage::from_result("alice", Op::Det, Err(MatrixError::Singular));
        assert_eq!(msg.to_string(), "alice's DET failed: matrix is singular");

        let msg = ServerMessage::from_result(
            "bob",
            Op::Inverse,
            Err(MatrixError::NotSquare {
                shape: Shape::new(2, 3),
            }),
        );
        assert_eq!(
            msg.to_string(),
            "bob's INVERSE failed: matrix is not square (2x3)"
        );
    }

    #[test]
    fn test_presence_lines() {
        assert_eq!(
            ServerMessage::Joined { name: "a".into() }.to_string(),
            "a joined"
        );
        assert_eq!(ServerMessage::Left { name: "a".into() }.to_string(), "a left");
        assert_eq!(
            ServerMessage::Renamed {
                old: "user-1".into(),
                new: "alice".into()
            }
            .to_string(),
            "user-1 is now known as alice"
        );
        assert_eq!(
            ServerMessage::Who {
                names: vec!["alice".into(), "bob".into()]
            }
            .to_string(),
            "online: alice, bob"
        );
    }
}
