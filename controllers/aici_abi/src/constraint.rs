use crate::{TokenId, TokenSet};

/// Capability consumed by constrained generation. After `append_token(t)`,
/// either `t` was in the set most recently populated by `allow_tokens`, or
/// `t` was the EOS token and `eos_allowed()` held.
pub trait Constraint {
    /// Populate the set of currently permissible next tokens.
    fn allow_tokens(&mut self, ts: &mut TokenSet);

    /// Advance internal state by one accepted token.
    fn append_token(&mut self, t: TokenId);

    fn eos_allowed(&self) -> bool;

    /// True when EOS is the only acceptable next token.
    fn eos_forced(&self) -> bool;

    fn token_allowed(&self, t: TokenId) -> bool;
}

/// Accepts anything and never forces EOS. An empty bias set is the
/// "no constraint" verdict: the host samples from the unbiased distribution.
pub struct TrivialConstraint {}

impl TrivialConstraint {
    pub fn new() -> Self {
        TrivialConstraint {}
    }
}

impl Default for TrivialConstraint {
    fn default() -> Self {
        Self::new()
    }
}

impl Constraint for TrivialConstraint {
    fn allow_tokens(&mut self, _ts: &mut TokenSet) {}

    fn append_token(&mut self, _t: TokenId) {}

    fn eos_allowed(&self) -> bool {
        true
    }

    fn eos_forced(&self) -> bool {
        false
    }

    fn token_allowed(&self, _t: TokenId) -> bool {
        true
    }
}
