use serde::{Deserialize, Serialize};

mod constraint;
mod host;
pub mod tokenset;

pub use constraint::{Constraint, TrivialConstraint};
pub use host::HostEnv;
pub use tokenset::TokenSet;

pub type TokenId = u32;

/// Identifier of a parallel sequence; siblings are created by forking.
#[repr(transparent)]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqId(pub u32);

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InitPromptArg {
    pub prompt: Vec<TokenId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PreProcessArg {}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MidProcessArg {
    /// fork_group.len() == attention_masks.len() of the preceding pre_process.
    /// Use HostEnv::self_seq_id() to find the current sequence in the group.
    pub fork_group: Vec<SeqId>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PostProcessArg {
    /// What was passed as `backtrack` in the mid_process splice, if any.
    pub backtrack: u32,

    /// Tokens appended to the sequence this step: typically one sampled
    /// token, or the fast-forward tokens of a splice.
    pub tokens: Vec<TokenId>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct PreProcessResult {
    /// One attention mask continues the sequence; more than one forks the
    /// generation into that many siblings; an empty list, like `suspend`,
    /// means do not advance this round.
    /// Attention mask of length 0 is equivalent [1.0, ..., 1.0].
    /// Otherwise, length of the mask should be the same as the number of prompt + generated tokens.
    pub attention_masks: Vec<Vec<f32>>,

    pub suspend: bool,
}

impl PreProcessResult {
    pub fn new(attention_masks: Vec<Vec<f32>>) -> Self {
        PreProcessResult {
            attention_masks,
            suspend: false,
        }
    }
    pub fn continue_() -> Self {
        PreProcessResult::new(vec![vec![]])
    }
    pub fn suspend() -> Self {
        PreProcessResult {
            attention_masks: vec![vec![]],
            suspend: true,
        }
    }
    pub fn fork(num_forks: usize) -> Self {
        PreProcessResult::new(vec![vec![]; num_forks])
    }

    pub fn num_forks(&self) -> usize {
        self.attention_masks.len()
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub enum MidProcessResult {
    /// Stop the current sequence.
    /// Similar to strong bias to EOS.
    Stop,

    /// Move to the next step without consuming a sampling round.
    /// Resolved by the driver; a host never observes this variant.
    Skip,

    /// Sample next token in the current sequence
    SampleWithBias {
        #[serde(skip)]
        allowed_tokens: TokenSet,
    },

    /// First pop `backtrack` tokens,
    /// then force next tokens to be generated to be `ff_tokens`.
    /// `backtrack` can be 0, and `ff_tokens` can be empty but not both.
    Splice {
        backtrack: u32,
        ff_tokens: Vec<TokenId>,
    },
}

impl MidProcessResult {
    pub fn stop() -> Self {
        MidProcessResult::Stop
    }

    pub fn skip() -> Self {
        MidProcessResult::Skip
    }

    pub fn sample(set: TokenSet) -> Self {
        MidProcessResult::SampleWithBias {
            allowed_tokens: set,
        }
    }

    pub fn splice(backtrack: u32, ff_tokens: Vec<TokenId>) -> Self {
        assert!(backtrack > 0 || !ff_tokens.is_empty());
        MidProcessResult::Splice {
            backtrack,
            ff_tokens,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct PostProcessResult {
    pub stop_seq: bool,
}

impl PostProcessResult {
    pub fn continue_() -> Self {
        PostProcessResult { stop_seq: false }
    }

    pub fn stop() -> Self {
        PostProcessResult { stop_seq: true }
    }

    pub fn from_tokens(tokens: &[TokenId], eos: TokenId) -> Self {
        PostProcessResult {
            stop_seq: tokens.contains(&eos),
        }
    }
}

/// Per-step callback surface of a controller. The host calls these in
/// strict `pre_process -> mid_process -> post_process` order for every
/// decoding step, after a single `init_prompt`.
pub trait AiciCtrl {
    /// Called with the initial prompt, once, before any other callback.
    /// Has long time limit.
    fn init_prompt(&mut self, _arg: InitPromptArg) {}

    /// Called before sampling, can return attention masks, suspend or fork.
    /// Has short time limit.
    fn pre_process(&mut self, _arg: PreProcessArg) -> PreProcessResult {
        PreProcessResult::continue_()
    }

    /// The main entry point: returns a logit bias for sampling, a splice,
    /// or a stop verdict. Has the longest per-step time limit.
    fn mid_process(&mut self, arg: MidProcessArg) -> MidProcessResult;

    /// Called after tokens are appended to the sequence.
    fn post_process(&mut self, _arg: PostProcessArg) -> PostProcessResult {
        PostProcessResult::continue_()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_process_shapes() {
        assert_eq!(PreProcessResult::continue_().num_forks(), 1);
        assert_eq!(PreProcessResult::fork(3).num_forks(), 3);
        assert!(PreProcessResult::suspend().suspend);
        assert!(!PreProcessResult::fork(2).suspend);
    }

    #[test]
    fn post_process_from_tokens() {
        assert!(PostProcessResult::from_tokens(&[5, 0], 0).stop_seq);
        assert!(!PostProcessResult::from_tokens(&[5, 7], 0).stop_seq);
        assert!(!PostProcessResult::from_tokens(&[], 0).stop_seq);
    }

    #[test]
    #[should_panic]
    fn empty_splice_rejected() {
        let _ = MidProcessResult::splice(0, vec![]);
    }

    #[test]
    fn wire_shape() {
        let r = MidProcessResult::splice(1, vec![66]);
        let s = serde_json::to_string(&r).unwrap();
        assert_eq!(s, r#"{"Splice":{"backtrack":1,"ff_tokens":[66]}}"#);

        let r = MidProcessResult::sample(TokenSet::new(16));
        let s = serde_json::to_string(&r).unwrap();
        // the bias set travels out of band
        assert_eq!(s, r#"{"SampleWithBias":{}}"#);

        let arg: PostProcessArg =
            serde_json::from_str(r#"{"backtrack":0,"tokens":[10,11]}"#).unwrap();
        assert_eq!(arg.tokens, vec![10, 11]);
    }
}
