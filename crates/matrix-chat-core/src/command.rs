//! Line grammar for the chat stream.
//!
//! A line is either a matrix command (`ADD 1 2;3 4 | 1 1;1 1`), a control
//! word (`NAME`, `WHO`, `HELP`, `QUIT`) or chat text. A line that starts
//! like a command but does not parse is chat.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    SessionId,
    matrix::{Matrix, Shape, ShapeError},
};

/// Longest display name accepted by `NAME`, in characters.
pub const MAX_NAME_CHARS: usize = 20;

/// Operation flag as written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Op {
    Add,
    Sub,
    Mul,
    Transpose,
    Inverse,
    Det,
}

impl Op {
    /// Look up a flag. Flags are case-sensitive; `DETERMINANT` is an alias of `DET`.
    #[must_use]
    pub fn from_flag(flag: &str) -> Option<Self> {
        Some(match flag {
            "ADD" => Self::Add,
            "SUB" => Self::Sub,
            "MUL" => Self::Mul,
            "TRANSPOSE" => Self::Transpose,
            "INVERSE" => Self::Inverse,
            "DET" | "DETERMINANT" => Self::Det,
            _ => return None,
        })
    }

    /// Canonical flag.
    #[must_use]
    pub const fn flag(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Sub => "SUB",
            Self::Mul => "MUL",
            Self::Transpose => "TRANSPOSE",
            Self::Inverse => "INVERSE",
            Self::Det => "DET",
        }
    }

    /// Number of operands the operation takes.
    #[must_use]
    pub const fn arity(self) -> usize {
        match self {
            Self::Add | Self::Sub | Self::Mul => 2,
            Self::Transpose | Self::Inverse | Self::Det => 1,
        }
    }

    /// Whether two operand shapes suit this binary operation.
    const fn shapes_compatible(self, left: Shape, right: Shape) -> bool {
        match self {
            Self::Add | Self::Sub => left.rows == right.rows && left.cols == right.cols,
            Self::Mul => left.cols == right.rows,
            Self::Transpose | Self::Inverse | Self::Det => false,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flag())
    }
}

/// Operation together with its operands; arity is fixed by the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Add(Matrix, Matrix),
    Sub(Matrix, Matrix),
    Mul(Matrix, Matrix),
    Transpose(Matrix),
    Inverse(Matrix),
    Det(Matrix),
}

impl Operation {
    #[must_use]
    pub const fn op(&self) -> Op {
        match self {
            Self::Add(..) => Op::Add,
            Self::Sub(..) => Op::Sub,
            Self::Mul(..) => Op::Mul,
            Self::Transpose(_) => Op::Transpose,
            Self::Inverse(_) => Op::Inverse,
            Self::Det(_) => Op::Det,
        }
    }
}

/// A parsed matrix request from one session.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub origin: SessionId,
    pub operation: Operation,
}

impl Command {
    /// Pair an operation flag with its operands.
    ///
    /// # Errors
    /// Returns `MalformedCommand` if the operand count does not match the
    /// operation's arity.
    pub fn new(op: Op, operands: Vec<Matrix>, origin: SessionId) -> Result<Self, ParseError> {
        let count = operands.len();
        let mut operands = operands.into_iter();
        let operation = match (op, operands.next(), operands.next(), operands.next()) {
            (Op::Add, Some(a), Some(b), None) => Operation::Add(a, b),
            (Op::Sub, Some(a), Some(b), None) => Operation::Sub(a, b),
            (Op::Mul, Some(a), Some(b), None) => Operation::Mul(a, b),
            (Op::Transpose, Some(a), None, None) => Operation::Transpose(a),
            (Op::Inverse, Some(a), None, None) => Operation::Inverse(a),
            (Op::Det, Some(a), None, None) => Operation::Det(a),
            _ => {
                return Err(ParseError::malformed(format!(
                    "{op} takes {} operand(s), got {count}",
                    op.arity()
                )));
            }
        };
        Ok(Self { origin, operation })
    }

    #[must_use]
    pub const fn op(&self) -> Op {
        self.operation.op()
    }
}

/// Session control words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// Change display name (already trimmed and truncated).
    Name(String),
    /// List connected users.
    Who,
    /// Show usage.
    Help,
    /// Disconnect.
    Quit,
}

/// Classification of one input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    Command(Command),
    Control(Control),
    Chat(String),
}

/// Parse error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed command: {reason}")]
    MalformedCommand { reason: String },
}

impl ParseError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedCommand {
            reason: reason.into(),
        }
    }
}

impl From<ShapeError> for ParseError {
    fn from(err: ShapeError) -> Self {
        Self::malformed(err.to_string())
    }
}

/// Classify a line, degrading anything unparseable to chat.
#[must_use]
pub fn parse_line(line: &str, origin: SessionId) -> Parsed {
    if let Some(control) = parse_control(line) {
        return Parsed::Control(control);
    }
    match parse_command(line, origin) {
        Ok(Some(command)) => Parsed::Command(command),
        Ok(None) => Parsed::Chat(line.to_owned()),
        Err(err) => {
            tracing::debug!(session_id = origin, %err, "treating malformed command as chat");
            Parsed::Chat(line.to_owned())
        }
    }
}

/// Parse a matrix command.
///
/// Returns `Ok(None)` when the line does not start with an operation flag.
///
/// # Errors
/// Returns `MalformedCommand` when the flag is present but the operands
/// are not valid matrix literals for it.
pub fn parse_command(line: &str, origin: SessionId) -> Result<Option<Command>, ParseError> {
    let (head, rest) = split_head(line);
    let Some(op) = Op::from_flag(head) else {
        return Ok(None);
    };
    let operands = parse_operands(op, rest)?;
    Command::new(op, operands, origin).map(Some)
}

fn parse_control(line: &str) -> Option<Control> {
    let (head, rest) = split_head(line);
    let rest = rest.trim();
    match head {
        "NAME" => {
            let name: String = rest.chars().take(MAX_NAME_CHARS).collect();
            let name = name.trim_end();
            (!name.is_empty()).then(|| Control::Name(name.to_owned()))
        }
        "WHO" if rest.is_empty() => Some(Control::Who),
        "HELP" if rest.is_empty() => Some(Control::Help),
        "QUIT" if rest.is_empty() => Some(Control::Quit),
        _ => None,
    }
}

fn split_head(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    text.split_once(char::is_whitespace).unwrap_or((text, ""))
}

fn parse_operands(op: Op, body: &str) -> Result<Vec<Matrix>, ParseError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(ParseError::malformed("missing operand"));
    }

    if body.contains('|') {
        return body
            .split('|')
            .map(|part| parse_matrix(strip_brackets(part.trim())))
            .collect();
    }
    if body.starts_with('[') {
        return split_bracketed(body)?
            .into_iter()
            .map(parse_matrix)
            .collect();
    }
    if op.arity() == 2 {
        let (head, rest) = split_head(body);
        if let Some(declared) = parse_dim(head) {
            return split_dimensioned(declared, rest);
        }
        return infer_split(op, body);
    }
    parse_matrix(body).map(|m| vec![m])
}

fn strip_brackets(part: &str) -> &str {
    part.strip_prefix('[')
        .and_then(|p| p.strip_suffix(']'))
        .unwrap_or(part)
}

fn split_bracketed(body: &str) -> Result<Vec<&str>, ParseError> {
    let mut parts = Vec::new();
    let mut rest = body.trim();
    while !rest.is_empty() {
        let inner = rest
            .strip_prefix('[')
            .ok_or_else(|| ParseError::malformed("expected '[' before operand"))?;
        let end = inner
            .find(']')
            .ok_or_else(|| ParseError::malformed("unclosed '['"))?;
        parts.push(&inner[..end]);
        rest = inner[end + 1..].trim_start();
    }
    Ok(parts)
}

/// One matrix literal, optionally prefixed by an `RxC` dimension token.
fn parse_matrix(text: &str) -> Result<Matrix, ParseError> {
    let text = text.trim();
    let (head, rest) = split_head(text);
    match parse_dim(head) {
        Some(declared) => parse_declared(declared, rest),
        None => Ok(Matrix::from_rows(parse_rows(text)?)?),
    }
}

/// `RxC e..` followed by a second operand: the first takes exactly
/// `R * C` entries and the rest of the line is the second.
fn split_dimensioned(declared: Shape, rest: &str) -> Result<Vec<Matrix>, ParseError> {
    let needed = declared
        .rows
        .checked_mul(declared.cols)
        .ok_or(ShapeError::TooLarge { shape: declared })?;
    let end = entries_end(rest, needed).ok_or_else(|| {
        ParseError::malformed(format!("{declared} operand needs {needed} entries"))
    })?;
    let second = rest[end..].trim_start_matches(|c: char| c.is_whitespace() || c == ';');
    if second.is_empty() {
        return Err(ParseError::malformed("missing second operand"));
    }
    Ok(vec![
        parse_declared(declared, rest[..end].trim())?,
        parse_matrix(second)?,
    ])
}

/// Byte offset just past the `count`-th entry, where entries are split
/// by whitespace or `;`.
fn entries_end(text: &str, count: usize) -> Option<usize> {
    let mut seen = 0;
    let mut in_entry = false;
    for (i, c) in text.char_indices() {
        let separator = c.is_whitespace() || c == ';';
        if in_entry && separator {
            seen += 1;
            if seen == count {
                return Some(i);
            }
        }
        in_entry = !separator;
    }
    (in_entry && seen + 1 == count).then_some(text.len())
}

fn parse_declared(declared: Shape, rest: &str) -> Result<Matrix, ParseError> {
    if rest.contains(';') {
        let matrix = Matrix::from_rows(parse_rows(rest)?)?;
        if matrix.shape() != declared {
            return Err(ParseError::malformed(format!(
                "declared {declared} but rows form {}",
                matrix.shape()
            )));
        }
        Ok(matrix)
    } else {
        let data = rest
            .split_whitespace()
            .map(parse_number)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Matrix::new(declared.rows, declared.cols, data)?)
    }
}

fn parse_dim(token: &str) -> Option<Shape> {
    let (rows, cols) = token.split_once('x')?;
    Some(Shape::new(rows.parse().ok()?, cols.parse().ok()?))
}

fn parse_rows(text: &str) -> Result<Vec<Vec<f64>>, ParseError> {
    text.split(';')
        .map(|row| {
            let values = row
                .split_whitespace()
                .map(parse_number)
                .collect::<Result<Vec<_>, _>>()?;
            if values.is_empty() {
                return Err(ParseError::malformed("empty row"));
            }
            Ok(values)
        })
        .collect()
}

fn parse_number(token: &str) -> Result<f64, ParseError> {
    token
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ParseError::malformed(format!("not a number: {token}")))
}

/// Split `r0;..;rk` into two operands when the boundary is unambiguous.
///
/// One row `rm` must hold the last row of the left operand followed by the
/// first row of the right one. Rows before it share the left width, rows
/// after it share the right width, and the two shapes must suit `op`.
fn infer_split(op: Op, body: &str) -> Result<Vec<Matrix>, ParseError> {
    let rows = parse_rows(body)?;
    let last = rows.len() - 1;
    let mut found: Option<(Matrix, Matrix)> = None;

    for (m, joint) in rows.iter().enumerate() {
        let left_cols = (m > 0).then(|| rows[0].len());
        let right_cols = (m < last).then(|| rows[last].len());
        let split = match (left_cols, right_cols) {
            (Some(left), _) => left,
            (None, Some(right)) => joint.len().saturating_sub(right),
            (None, None) => continue,
        };
        if split == 0 || split >= joint.len() {
            continue;
        }
        let right_width = joint.len() - split;
        if right_cols.is_some_and(|right| right != right_width)
            || rows[..m].iter().any(|r| r.len() != split)
            || rows[m + 1..].iter().any(|r| r.len() != right_width)
        {
            continue;
        }

        let left = Matrix::new(
            m + 1,
            split,
            rows[..m]
                .iter()
                .flatten()
                .chain(&joint[..split])
                .copied()
                .collect(),
        )?;
        let right = Matrix::new(
            last - m + 1,
            right_width,
            joint[split..]
                .iter()
                .chain(rows[m + 1..].iter().flatten())
                .copied()
                .collect(),
        )?;
        if !op.shapes_compatible(left.shape(), right.shape()) {
            continue;
        }
        if found.replace((left, right)).is_some() {
            return Err(ParseError::malformed(
                "ambiguous operands; separate them with '|'",
            ));
        }
    }

    found
        .map(|(left, right)| vec![left, right])
        .ok_or_else(|| ParseError::malformed("cannot split operands; separate them with '|'"))
}
