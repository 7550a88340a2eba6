//! Bucket commands and their results.

use serde::{Deserialize, Serialize};

/// A description of one state transition to apply to a bucket.
///
/// Commands are immutable and side-effect-free until applied by the state
/// machine, which lets the backend's atomic execution and local prediction
/// reproduce identical results from identical inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Consume `tokens` if every bandwidth can satisfy the request.
    Consume {
        /// Number of tokens to consume.
        tokens: u64,
    },
    /// Consume `tokens` and report the tokens remaining afterwards.
    TryConsumeAndReturnRemaining {
        /// Number of tokens to consume.
        tokens: u64,
    },
    /// Add `tokens` to every bandwidth, capped at capacity. Never fails.
    AddTokens {
        /// Number of tokens to add.
        tokens: u64,
    },
    /// Restore the bucket to its initial configured state.
    Reset,
    /// Report the currently available tokens without consuming any.
    GetAvailableTokens,
    /// An ordered list of sub-commands applied sequentially.
    Compound {
        /// The sub-commands, in submission order.
        commands: Vec<Command>,
    },
}

impl Command {
    /// Shorthand for a consume command.
    pub fn consume(tokens: u64) -> Self {
        Command::Consume { tokens }
    }

    /// Shorthand for a consume-and-report command.
    pub fn try_consume_remaining(tokens: u64) -> Self {
        Command::TryConsumeAndReturnRemaining { tokens }
    }

    /// Shorthand for an add-tokens command.
    pub fn add_tokens(tokens: u64) -> Self {
        Command::AddTokens { tokens }
    }

    /// Wrap a list of commands into a compound command.
    pub fn compound(commands: Vec<Command>) -> Self {
        Command::Compound { commands }
    }

    /// Tokens this command would consume, if it is a consumption command.
    ///
    /// Used by the delay optimization to decide whether a cached rejection
    /// covers the request. Compound commands always return `None` so they
    /// are never served from a prediction.
    pub fn consumed_tokens(&self) -> Option<u64> {
        match self {
            Command::Consume { tokens } => Some(*tokens),
            Command::TryConsumeAndReturnRemaining { tokens } => Some(*tokens),
            _ => None,
        }
    }

    /// Number of top-level outcomes this command produces.
    pub fn outcome_count(&self) -> usize {
        match self {
            Command::Compound { commands } => commands.len(),
            _ => 1,
        }
    }
}

/// Outcome of applying a single (non-compound) command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    /// Whether the command took effect. Always true for non-consuming
    /// commands.
    pub success: bool,
    /// Tokens remaining after application, where relevant.
    pub remaining_tokens: Option<u64>,
    /// Time until a rejected consumption could be satisfied by refill
    /// alone. Zero when the command was immediately satisfiable;
    /// `u64::MAX` when the request can never be satisfied.
    pub nanos_to_wait: u64,
    /// Whether the persisted state was created by this application.
    pub state_created: bool,
}

impl CommandOutcome {
    /// An immediately successful outcome.
    pub fn success(remaining_tokens: u64) -> Self {
        Self {
            success: true,
            remaining_tokens: Some(remaining_tokens),
            nanos_to_wait: 0,
            state_created: false,
        }
    }

    /// A rejected consumption.
    pub fn rejected(remaining_tokens: u64, nanos_to_wait: u64) -> Self {
        Self {
            success: false,
            remaining_tokens: Some(remaining_tokens),
            nanos_to_wait,
            state_created: false,
        }
    }
}

/// The result of executing a command against a bucket.
///
/// A compound command produces one outcome per sub-command, in submission
/// order; every other command produces exactly one outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Per-command outcomes, in submission order.
    pub outcomes: Vec<CommandOutcome>,
}

impl CommandResult {
    /// Wrap a single outcome.
    pub fn single(outcome: CommandOutcome) -> Self {
        Self {
            outcomes: vec![outcome],
        }
    }

    /// The outcome of a non-compound command.
    ///
    /// # Panics
    ///
    /// Panics if the result is empty, which the state machine never
    /// produces.
    pub fn outcome(&self) -> &CommandOutcome {
        &self.outcomes[0]
    }

    /// Mark every outcome as having created the persisted state.
    pub fn mark_state_created(mut self) -> Self {
        for outcome in &mut self.outcomes {
            outcome.state_created = true;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumed_tokens() {
        assert_eq!(Command::consume(5).consumed_tokens(), Some(5));
        assert_eq!(Command::try_consume_remaining(3).consumed_tokens(), Some(3));
        assert_eq!(Command::add_tokens(2).consumed_tokens(), None);
        assert_eq!(Command::Reset.consumed_tokens(), None);
        assert_eq!(
            Command::compound(vec![Command::consume(1)]).consumed_tokens(),
            None
        );
    }

    #[test]
    fn test_outcome_count() {
        assert_eq!(Command::consume(1).outcome_count(), 1);
        let compound = Command::compound(vec![Command::consume(1), Command::Reset]);
        assert_eq!(compound.outcome_count(), 2);
    }

    #[test]
    fn test_mark_state_created() {
        let result = CommandResult {
            outcomes: vec![CommandOutcome::success(1), CommandOutcome::rejected(0, 10)],
        }
        .mark_state_created();
        assert!(result.outcomes.iter().all(|o| o.state_created));
    }
}
