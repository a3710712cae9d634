//! The controller driver: turns a sequential program into the per-step
//! `pre_process` / `mid_process` / `post_process` callbacks the host
//! invokes, routing each callback to whatever primitive the program is
//! currently awaiting.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, RawWaker, RawWakerVTable, Waker};

use aici_abi::{
    AiciCtrl, HostEnv, InitPromptArg, MidProcessArg, MidProcessResult, PostProcessArg,
    PostProcessResult, PreProcessArg, PreProcessResult, TokenId,
};
use log::{debug, trace};

use crate::step::{PromptRc, Step, StepRc, StopToken};

pub(crate) enum Yielded {
    Prompt(PromptRc),
    Step(StepRc),
}

struct SeqState {
    tokens: Vec<TokenId>,
    prompt_len: usize,
}

struct CtxInner {
    host: Rc<dyn HostEnv>,
    seq: RefCell<SeqState>,
    slot: RefCell<Option<Yielded>>,
}

/// Handle the program and its primitives use to reach the host services and
/// the driver-owned token log. Cheap to clone; single-threaded.
#[derive(Clone)]
pub struct AiciCtx {
    inner: Rc<CtxInner>,
}

impl AiciCtx {
    pub fn host(&self) -> Rc<dyn HostEnv> {
        self.inner.host.clone()
    }

    /// The canonical token log: prompt plus everything appended by
    /// sampling and splices, minus any backtracked suffix.
    pub fn tokens(&self) -> Vec<TokenId> {
        self.inner.seq.borrow().tokens.clone()
    }

    pub fn tokens_len(&self) -> usize {
        self.inner.seq.borrow().tokens.len()
    }

    pub fn prompt_len(&self) -> usize {
        self.inner.seq.borrow().prompt_len
    }

    /// Suffix of the token log starting at `ptr`.
    pub fn tokens_since(&self, ptr: usize) -> Vec<TokenId> {
        let seq = self.inner.seq.borrow();
        assert!(ptr <= seq.tokens.len(), "label points past the token log");
        seq.tokens[ptr..].to_vec()
    }

    pub fn eos_token(&self) -> TokenId {
        self.inner.host.eos_token()
    }

    pub(crate) fn n_vocab(&self) -> usize {
        self.inner.host.n_vocab()
    }

    pub(crate) fn yield_step(&self, step: StepRc) {
        let prev = self.inner.slot.borrow_mut().replace(Yielded::Step(step));
        assert!(prev.is_none(), "two steps awaited at once");
    }

    pub(crate) fn yield_prompt(&self, cell: PromptRc) {
        let prev = self.inner.slot.borrow_mut().replace(Yielded::Prompt(cell));
        assert!(prev.is_none(), "prompt awaited while a step is pending");
    }

    fn take_yielded(&self) -> Option<Yielded> {
        self.inner.slot.borrow_mut().take()
    }
}

fn noop_raw_waker() -> RawWaker {
    fn clone(_: *const ()) -> RawWaker {
        noop_raw_waker()
    }
    fn noop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    RawWaker::new(std::ptr::null(), &VTABLE)
}

fn noop_waker() -> Waker {
    // the driver polls only from host callbacks, wake-ups never happen
    unsafe { Waker::from_raw(noop_raw_waker()) }
}

/// Driver for one controller program; implements the host-facing
/// [`AiciCtrl`] callbacks. One instance per host registration.
pub struct AiciAsync {
    ctx: AiciCtx,
    program: Pin<Box<dyn Future<Output = ()>>>,
    cb: Option<Yielded>,
    pending_cb: Option<StepRc>,
    skip_prompt: bool,
    prompt_inited: bool,
}

impl AiciAsync {
    /// Wraps the program and advances it to its first await. If that await
    /// is a token step rather than [`crate::GetPrompt`], the prompt is
    /// swallowed by the driver when it arrives.
    pub fn new<F, Fut>(host: Rc<dyn HostEnv>, program: F) -> Self
    where
        F: FnOnce(AiciCtx) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        let ctx = AiciCtx {
            inner: Rc::new(CtxInner {
                host,
                seq: RefCell::new(SeqState {
                    tokens: Vec::new(),
                    prompt_len: 0,
                }),
                slot: RefCell::new(None),
            }),
        };
        let fut = Box::pin(program(ctx.clone()));
        let mut drv = AiciAsync {
            ctx,
            program: fut,
            cb: None,
            pending_cb: None,
            skip_prompt: false,
            prompt_inited: false,
        };
        drv.step();
        drv.skip_prompt = matches!(drv.cb, Some(Yielded::Step(_)));
        drv
    }

    pub fn tokens(&self) -> Vec<TokenId> {
        self.ctx.tokens()
    }

    pub fn prompt_len(&self) -> usize {
        self.ctx.prompt_len()
    }

    /// Restore a stashed step, or resume the program until its next await.
    /// A terminated program is replaced with an idle loop awaiting
    /// [`StopToken`], so there is always a valid awaited primitive.
    fn step(&mut self) {
        if let Some(p) = self.pending_cb.take() {
            self.cb = Some(Yielded::Step(p));
            return;
        }
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        if self.program.as_mut().poll(&mut cx).is_ready() {
            debug!("program finished; idling on stop");
            let ctx = self.ctx.clone();
            self.program = Box::pin(async move {
                loop {
                    StopToken::new(&ctx).advance().await;
                }
            });
            let idle = self.program.as_mut().poll(&mut cx);
            assert!(idle.is_pending());
        }
        match self.ctx.take_yielded() {
            Some(y) => self.cb = Some(y),
            None => panic!("program suspended on something that is not a step primitive"),
        }
    }

    fn expect_step(&self, phase: &str) -> StepRc {
        match &self.cb {
            Some(Yielded::Step(s)) => s.clone(),
            _ => panic!("{}: expected the program to await a token step", phase),
        }
    }
}

impl AiciCtrl for AiciAsync {
    fn init_prompt(&mut self, arg: InitPromptArg) {
        assert!(!self.prompt_inited, "init_prompt called twice");
        self.prompt_inited = true;
        debug!("init_prompt: {} tokens", arg.prompt.len());
        {
            let mut seq = self.ctx.inner.seq.borrow_mut();
            seq.tokens.extend_from_slice(&arg.prompt);
            seq.prompt_len = seq.tokens.len();
        }
        if self.skip_prompt {
            self.skip_prompt = false;
            return;
        }
        match &self.cb {
            Some(Yielded::Prompt(cell)) => cell.borrow_mut().prompt = Some(arg.prompt),
            _ => panic!("init_prompt: the program did not await the prompt"),
        }
        self.step();
        assert!(
            matches!(self.cb, Some(Yielded::Step(_))),
            "expected a token step after the prompt"
        );
    }

    fn pre_process(&mut self, _arg: PreProcessArg) -> PreProcessResult {
        let cb = self.expect_step("pre_process");
        if cb.borrow().finished {
            debug!("step finished; substituting stop");
            self.cb = Some(Yielded::Step(Step::stop(&self.ctx)));
        }
        let cb = self.expect_step("pre_process");
        let result = cb.borrow_mut().pre_process();
        result
    }

    fn mid_process(&mut self, arg: MidProcessArg) -> MidProcessResult {
        let cb = self.expect_step("mid_process");
        let mut res = cb.borrow_mut().mid_process(arg.fork_group.clone());
        loop {
            match res {
                MidProcessResult::Skip => {
                    trace!("skipped step; advancing without a sampling round");
                    self.expect_step("mid_process").borrow_mut().resolve(Vec::new());
                    self.step();
                    let next = self.expect_step("mid_process");
                    let pre = next.borrow_mut().pre_process();
                    assert!(pre.num_forks() == 1, "cannot fork right after a skipped step");
                    if pre.suspend {
                        // The host committed to a sampling round before it
                        // could see the suspend, so splice the one-token
                        // filler and retry the stashed step next round.
                        debug!("suspend after skip; splicing filler");
                        self.pending_cb = Some(next);
                        let filler = Step::filler(&self.ctx);
                        res = filler.borrow_mut().mid_process(arg.fork_group.clone());
                        self.cb = Some(Yielded::Step(filler));
                    } else {
                        res = next.borrow_mut().mid_process(arg.fork_group.clone());
                    }
                }
                other => {
                    return other;
                }
            }
        }
    }

    fn post_process(&mut self, arg: PostProcessArg) -> PostProcessResult {
        let backtrack = arg.backtrack as usize;
        {
            let mut seq = self.ctx.inner.seq.borrow_mut();
            if backtrack > 0 {
                assert!(
                    backtrack <= seq.tokens.len() - seq.prompt_len,
                    "backtrack reaches into the prompt"
                );
                let keep = seq.tokens.len() - backtrack;
                seq.tokens.truncate(keep);
            }
            seq.tokens.extend_from_slice(&arg.tokens);
        }
        trace!("post_process: bt={} tokens={:?}", arg.backtrack, arg.tokens);
        let cb = self.expect_step("post_process");
        let res = cb.borrow_mut().post_process(arg.backtrack, arg.tokens);
        self.step();
        assert!(
            matches!(self.cb, Some(Yielded::Step(_))),
            "expected a token step"
        );
        res
    }
}
