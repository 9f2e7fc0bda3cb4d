//! NewFocus 8742 command grammar.
//!
//! User-facing commands are `xxAAnn`: an optional single-digit channel, a
//! two-plus character mnemonic (queries end in `?`), and an optional signed
//! integer parameter. `2AC150000` sets motor 2 acceleration to 150 000
//! steps/s². On the wire the channel becomes controller addressing
//! (`1>2 AC 150000\r`) and the reply comes back addressed the same way
//! (`1>150000`).

use anyhow::{anyhow, Result};
use regex::Regex;

/// Motor type codes reported by `QM?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorType {
    None,
    Unknown,
    Tiny,
    Standard,
}

impl MotorType {
    /// Decode the last character of a `QM?` reply.
    pub fn from_reply(reply: &str) -> Option<Self> {
        match reply.trim_end().chars().last()? {
            '0' => Some(MotorType::None),
            '1' => Some(MotorType::Unknown),
            '2' => Some(MotorType::Tiny),
            '3' => Some(MotorType::Standard),
            _ => None,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            MotorType::None => "No motor connected",
            MotorType::Unknown => "Motor Unknown",
            MotorType::Tiny => "'Tiny' Motor",
            MotorType::Standard => "'Standard' Motor",
        }
    }
}

/// A parsed `xxAAnn` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub channel: Option<u8>,
    /// Mnemonic, including the trailing `?` for queries.
    pub mnemonic: String,
    pub parameter: Option<String>,
}

impl Command {
    /// True when the controller will answer on the IN endpoint.
    pub fn expects_reply(&self) -> bool {
        self.mnemonic.contains('?')
    }

    /// Wire form: addressed, space separated, `\r` terminated.
    pub fn encode(&self) -> String {
        let mut wire = self.mnemonic.clone();
        if let Some(channel) = self.channel {
            wire = format!("1>{channel} {wire}");
        }
        if let Some(parameter) = &self.parameter {
            wire = format!("{wire} {parameter}");
        }
        wire.push('\r');
        wire
    }
}

pub struct CommandParser {
    grammar: Regex,
}

impl Default for CommandParser {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandParser {
    pub fn new() -> Self {
        // Grammar is a constant; the expression is known valid.
        #[allow(clippy::unwrap_used)]
        let grammar = Regex::new("^([0-9]?)([a-zA-Z?]{2,})([0-9+-]*)$").unwrap();
        Self { grammar }
    }

    pub fn parse(&self, text: &str) -> Result<Command> {
        let text = text.trim();
        let captures = self
            .grammar
            .captures(text)
            .ok_or_else(|| anyhow!("'{text}' is not a valid command"))?;

        let channel = match &captures[1] {
            "" => None,
            digit => Some(digit.parse::<u8>()?),
        };
        let parameter = match &captures[3] {
            "" => None,
            param => Some(param.to_string()),
        };
        Ok(Command {
            channel,
            mnemonic: captures[2].to_string(),
            parameter,
        })
    }
}

/// Normalize raw reply bytes: lossy ASCII, trailing whitespace stripped.
pub fn parse_reply(raw: &str) -> String {
    raw.trim_end().to_string()
}

/// Drop controller addressing (`1>value` -> `value`).
pub fn strip_address(reply: &str) -> &str {
    match reply.find('>') {
        Some(pos) => &reply[pos + 1..],
        None => reply,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Command {
        CommandParser::new().parse(text).unwrap()
    }

    #[test]
    fn parses_the_command_families() {
        let cases = [
            ("VE?", None, "VE?", None),
            ("1QM?", Some(1), "QM?", None),
            ("2AC150000", Some(2), "AC", Some("150000")),
            ("1PR+100", Some(1), "PR", Some("+100")),
            ("3PR-250", Some(3), "PR", Some("-250")),
            ("1MV+", Some(1), "MV", Some("+")),
            ("ST", None, "ST", None),
            ("1TP?", Some(1), "TP?", None),
            ("1DH0", Some(1), "DH", Some("0")),
        ];
        for (text, channel, mnemonic, parameter) in cases {
            let cmd = parse(text);
            assert_eq!(cmd.channel, channel, "{text}");
            assert_eq!(cmd.mnemonic, mnemonic, "{text}");
            assert_eq!(cmd.parameter.as_deref(), parameter, "{text}");
        }
    }

    #[test]
    fn rejects_garbage() {
        let parser = CommandParser::new();
        assert!(parser.parse("").is_err());
        assert!(parser.parse("123").is_err());
        assert!(parser.parse("A").is_err());
    }

    #[test]
    fn encodes_addressing_parameter_and_terminator() {
        assert_eq!(parse("VE?").encode(), "VE?\r");
        assert_eq!(parse("2AC150000").encode(), "1>2 AC 150000\r");
        assert_eq!(parse("1PR+100").encode(), "1>1 PR +100\r");
        assert_eq!(parse("ST").encode(), "ST\r");
    }

    #[test]
    fn reply_expectation_follows_question_mark() {
        assert!(parse("1TP?").expects_reply());
        assert!(!parse("1PR+100").expects_reply());
    }

    #[test]
    fn strips_controller_addressing() {
        assert_eq!(strip_address("1>1750"), "1750");
        assert_eq!(strip_address("1750"), "1750");
    }

    #[test]
    fn decodes_motor_types() {
        assert_eq!(MotorType::from_reply("1>3"), Some(MotorType::Standard));
        assert_eq!(MotorType::from_reply("0"), Some(MotorType::None));
        assert_eq!(MotorType::from_reply(""), None);
        assert_eq!(MotorType::Standard.description(), "'Standard' Motor");
    }
}
