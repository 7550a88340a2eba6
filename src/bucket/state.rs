//! Bucket state and the pure command application state machine.
//!
//! All refill arithmetic lives here and is computed lazily at the moment a
//! command is applied, never by a background timer. `apply` is pure and
//! deterministic given (config, prior state, now), so the backend's atomic
//! execution and local prediction reproduce identical results from
//! identical inputs.

use serde::{Deserialize, Serialize};

use crate::config::{Bandwidth, BucketConfig};

use super::command::{Command, CommandOutcome, CommandResult};

/// Per-bandwidth mutable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthState {
    /// Tokens currently available in this bandwidth.
    pub available_tokens: u64,
    /// Timestamp up to which refill has been credited, in nanoseconds.
    ///
    /// Advanced only by whole-token boundaries so fractional refill
    /// credit carries forward between applications.
    pub last_refill_nanos: u64,
}

/// The complete mutable state of one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketState {
    /// One entry per configured bandwidth, in configuration order.
    pub bandwidths: Vec<BandwidthState>,
}

impl BucketState {
    /// Create the initial state for a configuration at the given time.
    pub fn initial(config: &BucketConfig, now_nanos: u64) -> Self {
        Self {
            bandwidths: config
                .bandwidths
                .iter()
                .map(|b| BandwidthState {
                    available_tokens: b.initial_tokens,
                    last_refill_nanos: now_nanos,
                })
                .collect(),
        }
    }

    /// Tokens available for consumption: the minimum across all
    /// bandwidths, since every limit must be simultaneously satisfied.
    pub fn available_tokens(&self) -> u64 {
        self.bandwidths
            .iter()
            .map(|b| b.available_tokens)
            .min()
            .unwrap_or(0)
    }
}

/// Apply a command to a bucket state, producing the successor state and
/// the command's result.
pub fn apply(
    config: &BucketConfig,
    state: &BucketState,
    command: &Command,
    now_nanos: u64,
) -> (BucketState, CommandResult) {
    let mut next = state.clone();
    let result = match command {
        Command::Compound { commands } => CommandResult {
            outcomes: commands
                .iter()
                .map(|c| apply_single(config, &mut next, c, now_nanos))
                .collect(),
        },
        other => CommandResult::single(apply_single(config, &mut next, other, now_nanos)),
    };
    (next, result)
}

fn apply_single(
    config: &BucketConfig,
    state: &mut BucketState,
    command: &Command,
    now_nanos: u64,
) -> CommandOutcome {
    refill(config, state, now_nanos);

    match command {
        Command::Consume { tokens } | Command::TryConsumeAndReturnRemaining { tokens } => {
            consume(config, state, *tokens, now_nanos)
        }
        Command::AddTokens { tokens } => {
            for (bandwidth, bw_state) in config.bandwidths.iter().zip(&mut state.bandwidths) {
                bw_state.available_tokens =
                    bw_state.available_tokens.saturating_add(*tokens).min(bandwidth.capacity);
            }
            CommandOutcome::success(state.available_tokens())
        }
        Command::Reset => {
            *state = BucketState::initial(config, now_nanos);
            CommandOutcome::success(state.available_tokens())
        }
        Command::GetAvailableTokens => CommandOutcome::success(state.available_tokens()),
        Command::Compound { commands } => {
            // Nested compounds collapse to a single aggregate outcome so a
            // result always has exactly one entry per top-level command.
            let mut success = true;
            let mut nanos_to_wait = 0;
            for sub in commands {
                let outcome = apply_single(config, state, sub, now_nanos);
                success &= outcome.success;
                nanos_to_wait = nanos_to_wait.max(outcome.nanos_to_wait);
            }
            CommandOutcome {
                success,
                remaining_tokens: Some(state.available_tokens()),
                nanos_to_wait,
                state_created: false,
            }
        }
    }
}

/// Credit each bandwidth with the tokens accrued since its last refill.
fn refill(config: &BucketConfig, state: &mut BucketState, now_nanos: u64) {
    for (bandwidth, bw_state) in config.bandwidths.iter().zip(&mut state.bandwidths) {
        refill_bandwidth(bandwidth, bw_state, now_nanos);
    }
}

fn refill_bandwidth(bandwidth: &Bandwidth, state: &mut BandwidthState, now_nanos: u64) {
    if now_nanos <= state.last_refill_nanos {
        return;
    }
    let elapsed = (now_nanos - state.last_refill_nanos) as u128;
    let period = bandwidth.refill_period_nanos as u128;
    let rate = bandwidth.refill_tokens as u128;

    let added = elapsed * rate / period;
    if added == 0 {
        return;
    }

    let new_tokens = state.available_tokens as u128 + added;
    if new_tokens >= bandwidth.capacity as u128 {
        // Full: any remaining fractional credit is meaningless.
        state.available_tokens = bandwidth.capacity;
        state.last_refill_nanos = now_nanos;
    } else {
        state.available_tokens = new_tokens as u64;
        // Advance only by the time actually converted into whole tokens;
        // the remainder keeps accruing toward the next token.
        let consumed_nanos = div_ceil(added * period, rate);
        state.last_refill_nanos += consumed_nanos as u64;
    }
}

fn consume(
    config: &BucketConfig,
    state: &mut BucketState,
    tokens: u64,
    now_nanos: u64,
) -> CommandOutcome {
    let satisfiable = state
        .bandwidths
        .iter()
        .all(|b| b.available_tokens >= tokens);

    if satisfiable {
        for bw_state in &mut state.bandwidths {
            bw_state.available_tokens -= tokens;
        }
        return CommandOutcome::success(state.available_tokens());
    }

    // The most-constraining bandwidth governs the wait.
    let nanos_to_wait = config
        .bandwidths
        .iter()
        .zip(&state.bandwidths)
        .map(|(bandwidth, bw_state)| wait_for_tokens(bandwidth, bw_state, tokens, now_nanos))
        .max()
        .unwrap_or(u64::MAX);

    CommandOutcome::rejected(state.available_tokens(), nanos_to_wait)
}

/// Time until `tokens` would be available in this bandwidth through refill
/// alone, assuming no further consumption.
fn wait_for_tokens(
    bandwidth: &Bandwidth,
    state: &BandwidthState,
    tokens: u64,
    now_nanos: u64,
) -> u64 {
    if state.available_tokens >= tokens {
        return 0;
    }
    if tokens > bandwidth.capacity {
        // Refill can never push the bucket past capacity.
        return u64::MAX;
    }
    let deficit = (tokens - state.available_tokens) as u128;
    let period = bandwidth.refill_period_nanos as u128;
    let rate = bandwidth.refill_tokens as u128;

    let nanos_for_deficit = div_ceil(deficit * period, rate);
    // Partial-period credit already accrued since the last whole-token
    // boundary counts toward the deficit.
    let partial = now_nanos.saturating_sub(state.last_refill_nanos) as u128;
    let wait = nanos_for_deficit.saturating_sub(partial);
    u64::try_from(wait).unwrap_or(u64::MAX)
}

fn div_ceil(numerator: u128, denominator: u128) -> u128 {
    (numerator + denominator - 1) / denominator
}
