//! Line codec for the ASCII motion-controller protocol.
//!
//! Commands go out as `/<device> <axis> <body>\n`. Every addressed device
//! answers with one reply line:
//!
//! ```text
//! @01 1 OK IDLE -- 12345
//! ```
//!
//! i.e. device, axis, `OK`/`RJ`, `IDLE`/`BUSY`, a warning flag (`--` when
//! clear) and a data field. Lines starting with `#` are informational and
//! lines starting with `!` are unsolicited alerts; neither answers a command.
//!
//! A command may carry a message id (0-99) after the axis. The device echoes
//! it in the same position of its reply, so a late reply to an earlier
//! command can be told apart:
//!
//! ```text
//! /1 1 07 home
//! @01 1 07 OK BUSY -- 0
//! ```

use stretch_core::AxisAddress;
use thiserror::Error;

/// Default microstep size of a lead-screw stage, in millimetres.
pub const DEFAULT_MICROSTEP_MM: f64 = 0.000_047_625;

/// Message ids wrap after 99.
pub const MAX_MESSAGE_ID: u8 = 99;

/// Native velocity units are microsteps per 1/16384 s, scaled by 1.6384
/// relative to microsteps per second.
pub const VELOCITY_SCALE: f64 = 1.6384;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsciiError {
    #[error("empty line")]
    Empty,
    #[error("unknown message type {0:?}")]
    UnknownKind(char),
    #[error("reply is missing its {0} field")]
    MissingField(&'static str),
    #[error("bad {field} field {value:?}")]
    BadField { field: &'static str, value: String },
}

/// A command addressed to one axis, or to every device when `target` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub target: Option<AxisAddress>,
    pub id: Option<u8>,
    pub body: String,
}

impl Command {
    pub fn to(target: AxisAddress, body: impl Into<String>) -> Self {
        Self {
            target: Some(target),
            id: None,
            body: body.into(),
        }
    }

    /// The bare `/` that every device on the chain answers.
    pub fn broadcast() -> Self {
        Self {
            target: None,
            id: None,
            body: String::new(),
        }
    }

    /// Tags an addressed command with a message id.
    pub fn with_id(mut self, id: u8) -> Self {
        self.id = Some(id);
        self
    }

    pub fn encode(&self) -> String {
        let Some(t) = self.target else {
            return if self.body.is_empty() {
                "/\n".to_string()
            } else {
                format!("/{}\n", self.body)
            };
        };
        let mut line = format!("/{} {}", t.device, t.axis);
        if let Some(id) = self.id {
            line.push_str(&format!(" {id:02}"));
        }
        if !self.body.is_empty() {
            line.push(' ');
            line.push_str(&self.body);
        }
        line.push('\n');
        line
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub device: u8,
    pub axis: u8,
    /// Echo of the command's message id, if it carried one.
    pub id: Option<u8>,
    pub accepted: bool,
    pub busy: bool,
    pub warning: Option<String>,
    pub data: String,
}

impl Reply {
    pub fn data_as_i64(&self) -> Result<i64, AsciiError> {
        self.data.parse().map_err(|_| AsciiError::BadField {
            field: "data",
            value: self.data.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Reply(Reply),
    Info(String),
    Alert(String),
}

pub fn parse_line(line: &str) -> Result<Message, AsciiError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut chars = line.chars();
    let kind = chars.next().ok_or(AsciiError::Empty)?;
    let rest = chars.as_str();
    match kind {
        '@' => parse_reply(rest).map(Message::Reply),
        '#' => Ok(Message::Info(rest.trim().to_string())),
        '!' => Ok(Message::Alert(rest.trim().to_string())),
        other => Err(AsciiError::UnknownKind(other)),
    }
}

fn parse_reply(rest: &str) -> Result<Reply, AsciiError> {
    let mut fields = rest.split_whitespace().peekable();
    let device = number(fields.next(), "device")?;
    let axis = number(fields.next(), "axis")?;
    let id = match fields.peek() {
        Some(field) if field.bytes().all(|b| b.is_ascii_digit()) => {
            Some(number(fields.next(), "message id")?)
        }
        _ => None,
    };

    let accepted = match fields.next() {
        Some("OK") => true,
        Some("RJ") => false,
        Some(other) => return Err(bad("reply flag", other)),
        None => return Err(AsciiError::MissingField("reply flag")),
    };
    let busy = match fields.next() {
        Some("BUSY") => true,
        Some("IDLE") => false,
        Some(other) => return Err(bad("status", other)),
        None => return Err(AsciiError::MissingField("status")),
    };
    let warning = match fields.next() {
        Some("--") => None,
        Some(flag) if flag.len() == 2 => Some(flag.to_string()),
        Some(other) => return Err(bad("warning", other)),
        None => return Err(AsciiError::MissingField("warning")),
    };
    let data = fields.collect::<Vec<_>>().join(" ");

    Ok(Reply {
        device,
        axis,
        id,
        accepted,
        busy,
        warning,
        data,
    })
}

fn number(field: Option<&str>, name: &'static str) -> Result<u8, AsciiError> {
    let value = field.ok_or(AsciiError::MissingField(name))?;
    value.parse().map_err(|_| bad(name, value))
}

fn bad(field: &'static str, value: &str) -> AsciiError {
    AsciiError::BadField {
        field,
        value: value.to_string(),
    }
}

/// Converts between millimetres and the controller's native units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Units {
    pub microstep_mm: f64,
}

impl Default for Units {
    fn default() -> Self {
        Self {
            microstep_mm: DEFAULT_MICROSTEP_MM,
        }
    }
}

impl Units {
    pub fn position_to_native(&self, mm: f64) -> i64 {
        (mm / self.microstep_mm).round() as i64
    }

    pub fn native_to_position(&self, steps: i64) -> f64 {
        steps as f64 * self.microstep_mm
    }

    pub fn speed_to_native(&self, mm_per_s: f64) -> i64 {
        (mm_per_s / self.microstep_mm * VELOCITY_SCALE).round() as i64
    }
}
