//! Execution engine for native controller programs: converts a sequential,
//! suspendable program into the per-step callback protocol of the host
//! runtime, one decoding step at a time.
//!
//! A program is an async function over [`AiciCtx`]. It awaits step
//! primitives ([`NextToken`], [`FixedTokens`], [`StopToken`],
//! [`ConstrainedToken`]) or the helpers built on top of them
//! ([`gen_tokens`], [`fork`], [`wait_vars`]); the [`AiciAsync`] driver
//! resumes it exactly once per host callback round.

pub mod constraint;
pub mod driver;
pub mod helpers;
pub mod step;

pub use aici_abi::{
    AiciCtrl, Constraint, HostEnv, InitPromptArg, MidProcessArg, MidProcessResult, PostProcessArg,
    PostProcessResult, PreProcessArg, PreProcessResult, SeqId, TokenId, TokenSet,
    TrivialConstraint,
};

pub use constraint::{ChooseConstraint, RegexConstraint};
pub use driver::{AiciAsync, AiciCtx};
pub use helpers::{fork, gen_text, gen_tokens, get_prompt, wait_vars, GenArgs, Label};
pub use step::{ConstrainedToken, FixedTokens, GetPrompt, NextToken, StopToken};
