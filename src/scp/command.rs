use thiserror::Error;

use super::protocol::Parameters;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("not an scp command: {0:?}")]
    NotScp(String),

    #[error("missing pattern in scp command")]
    MissingPattern,

    #[error("scp command cannot be both sink and source")]
    ConflictingMode,

    #[error("scp command must be either sink or source")]
    MissingMode,
}

impl CommandError {
    /// Whether the error settles the channel. A non-scp exec is rejected on
    /// its own and the peer may still send a proper one.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandError::NotScp(_))
    }
}

/// A validated `scp` invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub parameters: Parameters,
    /// First non-flag argument, usually the destination path
    pub pattern: String,
}

impl TransferRequest {
    pub fn is_sink(&self) -> bool {
        self.parameters.contains(Parameters::SINK)
    }

    pub fn is_source(&self) -> bool {
        self.parameters.contains(Parameters::SOURCE)
    }
}

/// Parse `scp [-<flags>]... <pattern>` as sent in an exec request
pub fn parse_command(command: &str) -> Result<TransferRequest, CommandError> {
    let mut tokens = command.split_whitespace();
    if tokens.next() != Some("scp") {
        return Err(CommandError::NotScp(command.to_string()));
    }

    let mut parameters = Parameters::empty();
    let mut pattern: Option<&str> = None;
    for token in tokens {
        if let Some(flags) = token.strip_prefix('-').filter(|flags| !flags.is_empty()) {
            parameters.parse_flags(flags);
        } else if pattern.is_none() {
            pattern = Some(token);
        }
    }

    let pattern = pattern.ok_or(CommandError::MissingPattern)?;
    if parameters.contains(Parameters::SINK | Parameters::SOURCE) {
        return Err(CommandError::ConflictingMode);
    }
    if !parameters.intersects(Parameters::SINK | Parameters::SOURCE) {
        return Err(CommandError::MissingMode);
    }

    Ok(TransferRequest {
        parameters,
        pattern: pattern.to_string(),
    })
}
