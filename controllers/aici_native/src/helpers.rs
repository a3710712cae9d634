//! Ergonomic wrappers composed from the step primitives.

use aici_abi::{Constraint, TokenId, TrivialConstraint};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::constraint::{ChooseConstraint, RegexConstraint};
use crate::driver::AiciCtx;
use crate::step::{ConstrainedToken, GetPrompt, Step, StepFuture};

/// Snapshot of the token-log length at a program point. Splicing with
/// [`crate::FixedTokens::following`] rewinds the sequence to this point.
#[derive(Clone, Copy, Debug)]
pub struct Label {
    pub(crate) ptr: usize,
}

impl Label {
    pub fn new(ctx: &AiciCtx) -> Self {
        Label {
            ptr: ctx.tokens_len(),
        }
    }

    /// Tokens appended since the label was taken.
    pub fn tokens_since(&self, ctx: &AiciCtx) -> Vec<TokenId> {
        ctx.tokens_since(self.ptr)
    }

    pub fn text_since(&self, ctx: &AiciCtx) -> String {
        ctx.host().detokenize_str(&self.tokens_since(ctx))
    }
}

/// Await the initial prompt. Only valid as the program's first await.
pub async fn get_prompt(ctx: &AiciCtx) -> Vec<TokenId> {
    GetPrompt::new(ctx).await
}

/// Fork the sequence into `num_forks` siblings; each sibling resumes here
/// and gets its own branch index back.
pub async fn fork(ctx: &AiciCtx, num_forks: usize) -> usize {
    let marker = Step::fork_marker(ctx, num_forks);
    StepFuture::new(marker.clone()).await;
    let me = ctx.host().self_seq_id();
    let group = marker.borrow().fork_group.clone();
    group
        .iter()
        .position(|s| *s == me)
        .unwrap_or_else(|| panic!("{:?} is not part of the fork group {:?}", me, group))
}

/// Suspend until every named variable exists in the host store, then
/// return their values in the order the names were given.
pub async fn wait_vars(ctx: &AiciCtx, names: &[&str]) -> Vec<Vec<u8>> {
    let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
    let marker = Step::wait_vars_marker(ctx, names);
    StepFuture::new(marker.clone()).await;
    let values = marker.borrow().wait_values();
    values
}

fn default_max_tokens() -> usize {
    20
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GenArgs {
    /// Constrain output to this regular expression.
    #[serde(default)]
    pub regex: Option<String>,

    /// Constrain output to one of these strings.
    #[serde(default)]
    pub options: Option<Vec<String>>,

    /// Store the detokenized result under this variable name.
    #[serde(default)]
    pub store_var: Option<String>,

    /// Stop once this substring shows up in the decoded output.
    #[serde(default)]
    pub stop_at: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for GenArgs {
    fn default() -> Self {
        GenArgs {
            regex: None,
            options: None,
            store_var: None,
            stop_at: None,
            max_tokens: default_max_tokens(),
        }
    }
}

impl GenArgs {
    pub fn regex(pattern: &str) -> Self {
        GenArgs {
            regex: Some(pattern.to_string()),
            ..GenArgs::default()
        }
    }

    pub fn options(options: &[&str]) -> Self {
        GenArgs {
            options: Some(options.iter().map(|s| s.to_string()).collect()),
            ..GenArgs::default()
        }
    }
}

/// Generate up to `max_tokens` tokens under the configured constraint.
///
/// Stops early when, checked in this order after each round: `stop_at`
/// shows up in the decoded output, the output ends in four newlines
/// (models that never emit EOS), or the constraint finished the sequence.
pub async fn gen_tokens(ctx: &AiciCtx, args: GenArgs) -> Vec<TokenId> {
    let host = ctx.host();
    let next = if let Some(pattern) = args.regex.clone() {
        let h = ctx.host();
        ConstrainedToken::new(ctx, move || {
            Box::new(RegexConstraint::new(&pattern, &*h).expect("invalid regex"))
                as Box<dyn Constraint>
        })
    } else if let Some(options) = args.options.clone() {
        let h = ctx.host();
        ConstrainedToken::new(ctx, move || {
            Box::new(ChooseConstraint::new(&options, &*h)) as Box<dyn Constraint>
        })
    } else {
        ConstrainedToken::new(ctx, || Box::new(TrivialConstraint::new()) as Box<dyn Constraint>)
    };

    let mut res: Vec<TokenId> = Vec::new();
    for _ in 0..args.max_tokens {
        let tokens = next.advance().await;
        res.extend_from_slice(&tokens);
        let text = host.detokenize_str(&res);
        if let Some(stop) = &args.stop_at {
            if !stop.is_empty() && text.contains(stop.as_str()) {
                break;
            }
        }
        if text.ends_with("\n\n\n\n") {
            break;
        }
        if next.finished() {
            break;
        }
    }
    debug!("gen_tokens: {} tokens", res.len());
    if let Some(var) = &args.store_var {
        let bytes = host.detokenize(&res);
        host.set_var(var, &bytes);
    }
    res
}

/// [`gen_tokens`], decoded to a string with U+FFFD for invalid bytes.
pub async fn gen_text(ctx: &AiciCtx, args: GenArgs) -> String {
    let tokens = gen_tokens(ctx, args).await;
    ctx.host().detokenize_str(&tokens)
}
