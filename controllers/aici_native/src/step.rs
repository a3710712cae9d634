//! Step primitives: the suspension points a controller program awaits.
//!
//! Each primitive is a [`Step`] shared between the program (through the
//! future returned by `advance()`) and the driver (which invokes the three
//! per-phase hooks on whatever step is currently awaited). Awaiting a step
//! registers it with the driver and, once the host round completes, returns
//! the tokens that were delivered to it.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use aici_abi::{
    Constraint, MidProcessResult, PostProcessResult, PreProcessResult, SeqId, TokenId, TokenSet,
};

use crate::driver::AiciCtx;
use crate::helpers::Label;

pub(crate) type StepRc = Rc<RefCell<Step>>;
pub(crate) type PromptRc = Rc<RefCell<PromptCell>>;
pub(crate) type MkConstraint = Box<dyn FnOnce() -> Box<dyn Constraint>>;

/// Filler spliced when a step suspends right after a skipped step; the host
/// has committed to a sampling round by then and must receive one token.
pub(crate) const FILLER_TEXT: &str = "\u{2591}";

pub(crate) enum StepKind {
    /// Sample with an empty bias, i.e. from the unconstrained distribution.
    Sample,
    /// Force a splice, optionally rewinding to a label first.
    Fixed {
        tokens: Vec<TokenId>,
        following: Option<usize>,
    },
    /// Keep telling the host to stop; terminal idle state.
    Stop,
    /// Sample under a lazily-built constraint.
    Constrained {
        mk: Option<MkConstraint>,
        constraint: Option<Box<dyn Constraint>>,
    },
    /// Request a fork in pre_process, then step through without sampling.
    Fork { num_forks: usize },
    /// Suspend until all named variables exist, then step through.
    WaitVars {
        names: Vec<String>,
        values: Vec<Vec<u8>>,
    },
}

pub(crate) struct Step {
    pub(crate) kind: StepKind,
    pub(crate) tokens: Option<Vec<TokenId>>,
    pub(crate) fork_group: Vec<SeqId>,
    pub(crate) finished: bool,
    ctx: AiciCtx,
}

impl Step {
    fn new(ctx: &AiciCtx, kind: StepKind) -> StepRc {
        Rc::new(RefCell::new(Step {
            kind,
            tokens: None,
            fork_group: Vec::new(),
            finished: false,
            ctx: ctx.clone(),
        }))
    }

    pub(crate) fn sample(ctx: &AiciCtx) -> StepRc {
        Step::new(ctx, StepKind::Sample)
    }

    pub(crate) fn fixed(ctx: &AiciCtx, text: &str, following: Option<usize>) -> StepRc {
        let tokens = ctx.host().tokenize_str(text);
        Step::new(ctx, StepKind::Fixed { tokens, following })
    }

    pub(crate) fn filler(ctx: &AiciCtx) -> StepRc {
        let tokens = ctx.host().tokenize_str(FILLER_TEXT);
        assert!(tokens.len() == 1, "filler text must be exactly one token");
        Step::new(ctx, StepKind::Fixed {
            tokens,
            following: None,
        })
    }

    pub(crate) fn stop(ctx: &AiciCtx) -> StepRc {
        Step::new(ctx, StepKind::Stop)
    }

    pub(crate) fn constrained(ctx: &AiciCtx, mk: MkConstraint) -> StepRc {
        Step::new(ctx, StepKind::Constrained {
            mk: Some(mk),
            constraint: None,
        })
    }

    pub(crate) fn fork_marker(ctx: &AiciCtx, num_forks: usize) -> StepRc {
        Step::new(ctx, StepKind::Fork { num_forks })
    }

    pub(crate) fn wait_vars_marker(ctx: &AiciCtx, names: Vec<String>) -> StepRc {
        Step::new(ctx, StepKind::WaitVars {
            names,
            values: Vec::new(),
        })
    }

    fn reset(&mut self) {
        self.tokens = None;
        self.fork_group.clear();
    }

    pub(crate) fn pre_process(&mut self) -> PreProcessResult {
        self.reset();
        let host = self.ctx.host();
        match &mut self.kind {
            StepKind::Fork { num_forks } => PreProcessResult::fork(*num_forks),
            StepKind::WaitVars { names, values } => {
                values.clear();
                for name in names.iter() {
                    match host.get_var(name) {
                        Some(v) => values.push(v),
                        None => {
                            values.clear();
                            return PreProcessResult::suspend();
                        }
                    }
                }
                PreProcessResult::continue_()
            }
            _ => PreProcessResult::continue_(),
        }
    }

    pub(crate) fn mid_process(&mut self, fork_group: Vec<SeqId>) -> MidProcessResult {
        self.fork_group = fork_group;
        let n_vocab = self.ctx.n_vocab();
        let tokens_len = self.ctx.tokens_len();
        match &mut self.kind {
            StepKind::Sample => MidProcessResult::sample(TokenSet::new(n_vocab)),
            StepKind::Fixed { tokens, following } => {
                let backtrack = match following {
                    Some(ptr) => {
                        assert!(*ptr <= tokens_len, "label points past the token log");
                        (tokens_len - *ptr) as u32
                    }
                    None => 0,
                };
                MidProcessResult::splice(backtrack, tokens.clone())
            }
            StepKind::Stop => MidProcessResult::stop(),
            StepKind::Constrained { mk, constraint } => {
                // built here and not at construction: mid_process has the
                // long time budget
                let c = constraint
                    .get_or_insert_with(|| mk.take().expect("constraint factory consumed")());
                let mut set = TokenSet::new(n_vocab);
                c.allow_tokens(&mut set);
                MidProcessResult::sample(set)
            }
            StepKind::Fork { .. } | StepKind::WaitVars { .. } => MidProcessResult::skip(),
        }
    }

    pub(crate) fn post_process(
        &mut self,
        _backtrack: u32,
        tokens: Vec<TokenId>,
    ) -> PostProcessResult {
        let eos = self.ctx.eos_token();
        self.finished = tokens.contains(&eos);
        let res = match &mut self.kind {
            StepKind::Stop => {
                // never finished, the next await must keep yelling stop
                self.finished = false;
                PostProcessResult::stop()
            }
            StepKind::Constrained { constraint, .. } => {
                let c = constraint.as_mut().expect("post_process before mid_process");
                for t in tokens.iter() {
                    c.append_token(*t);
                }
                if c.eos_forced() {
                    self.finished = true;
                }
                PostProcessResult::continue_()
            }
            _ => PostProcessResult::continue_(),
        };
        self.tokens = Some(tokens);
        res
    }

    /// Complete the await without a host round (skipped steps).
    pub(crate) fn resolve(&mut self, tokens: Vec<TokenId>) {
        self.tokens = Some(tokens);
    }

    pub(crate) fn wait_values(&self) -> Vec<Vec<u8>> {
        match &self.kind {
            StepKind::WaitVars { values, .. } => values.clone(),
            _ => panic!("not a wait-vars step"),
        }
    }
}

/// Awaits a step: yields it to the driver once, then resolves to the tokens
/// the host round delivered (empty for skipped steps).
pub struct StepFuture {
    step: StepRc,
    ctx: AiciCtx,
    yielded: bool,
}

impl StepFuture {
    pub(crate) fn new(step: StepRc) -> Self {
        let ctx = step.borrow().ctx.clone();
        StepFuture {
            step,
            ctx,
            yielded: false,
        }
    }
}

impl Future for StepFuture {
    type Output = Vec<TokenId>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.yielded {
            this.yielded = true;
            this.ctx.yield_step(this.step.clone());
            return Poll::Pending;
        }
        match &this.step.borrow().tokens {
            // left in place until the next pre_process resets the step, so
            // a re-await racing a driver-substituted StopToken observes the
            // previous round again instead of deadlocking
            Some(tokens) => Poll::Ready(tokens.clone()),
            None => panic!("step resumed without a result"),
        }
    }
}

pub(crate) struct PromptCell {
    pub(crate) prompt: Option<Vec<TokenId>>,
}

/// Awaiting this returns the prompt passed by the host. Must be the first
/// await of the program, if present at all; code before it has the long
/// startup time budget.
pub struct GetPrompt {
    cell: PromptRc,
    ctx: AiciCtx,
    yielded: bool,
}

impl GetPrompt {
    pub fn new(ctx: &AiciCtx) -> Self {
        GetPrompt {
            cell: Rc::new(RefCell::new(PromptCell { prompt: None })),
            ctx: ctx.clone(),
            yielded: false,
        }
    }
}

impl Future for GetPrompt {
    type Output = Vec<TokenId>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.yielded {
            this.yielded = true;
            this.ctx.yield_prompt(this.cell.clone());
            return Poll::Pending;
        }
        match &this.cell.borrow().prompt {
            Some(p) => Poll::Ready(p.clone()),
            None => panic!("prompt await resumed without a prompt"),
        }
    }
}

/// Sample one token from the unconstrained distribution.
pub struct NextToken {
    step: StepRc,
}

impl NextToken {
    pub fn new(ctx: &AiciCtx) -> Self {
        NextToken {
            step: Step::sample(ctx),
        }
    }

    pub fn advance(&self) -> StepFuture {
        StepFuture::new(self.step.clone())
    }

    /// True once EOS was among the delivered tokens.
    pub fn finished(&self) -> bool {
        self.step.borrow().finished
    }
}

/// Interpolate fixed text into the stream via a splice, optionally
/// rewinding to a [`Label`] first.
pub struct FixedTokens {
    step: StepRc,
}

impl FixedTokens {
    pub fn new(ctx: &AiciCtx, text: &str) -> Self {
        FixedTokens {
            step: Step::fixed(ctx, text, None),
        }
    }

    pub fn following(ctx: &AiciCtx, text: &str, label: &Label) -> Self {
        FixedTokens {
            step: Step::fixed(ctx, text, Some(label.ptr)),
        }
    }

    pub fn advance(&self) -> StepFuture {
        StepFuture::new(self.step.clone())
    }
}

/// Tell the host to stop the sequence. Re-awaiting is valid indefinitely.
pub struct StopToken {
    step: StepRc,
}

impl StopToken {
    pub fn new(ctx: &AiciCtx) -> Self {
        StopToken {
            step: Step::stop(ctx),
        }
    }

    pub fn advance(&self) -> StepFuture {
        StepFuture::new(self.step.clone())
    }
}

/// Sample under a constraint built lazily on the first mid_process.
pub struct ConstrainedToken {
    step: StepRc,
}

impl ConstrainedToken {
    pub fn new(
        ctx: &AiciCtx,
        mk_constraint: impl FnOnce() -> Box<dyn Constraint> + 'static,
    ) -> Self {
        ConstrainedToken {
            step: Step::constrained(ctx, Box::new(mk_constraint)),
        }
    }

    pub fn advance(&self) -> StepFuture {
        StepFuture::new(self.step.clone())
    }

    pub fn finished(&self) -> bool {
        self.step.borrow().finished
    }
}
