//! Built-in constraints: choosing among fixed options, and regular
//! expressions compiled to a byte-level DFA walked over token byte strings.

use anyhow::{anyhow, Result};
use log::debug;
use regex_automata::{
    dfa::{dense, Automaton, StartKind},
    util::{primitives::StateID, syntax},
    Anchored,
};

use aici_abi::{Constraint, HostEnv, TokenId, TokenSet};

/// Forces the output to be exactly one of the given options, then EOS.
/// Options sharing a prefix contribute the union of their next tokens;
/// once a token locks in a branch, incompatible options are dropped.
pub struct ChooseConstraint {
    options: Vec<Vec<TokenId>>,
    ptr: usize,
    eos: TokenId,
}

impl ChooseConstraint {
    pub fn new(options: &[String], host: &dyn HostEnv) -> Self {
        ChooseConstraint {
            options: options.iter().map(|o| host.tokenize_str(o)).collect(),
            ptr: 0,
            eos: host.eos_token(),
        }
    }
}

impl Constraint for ChooseConstraint {
    fn allow_tokens(&mut self, ts: &mut TokenSet) {
        for o in self.options.iter() {
            if self.ptr < o.len() {
                ts.allow(o[self.ptr]);
            } else if self.ptr == o.len() {
                ts.allow(self.eos);
            }
        }
    }

    fn append_token(&mut self, t: TokenId) {
        let ptr = self.ptr;
        let eos = self.eos;
        self.options
            .retain(|o| if ptr < o.len() { o[ptr] == t } else { t == eos });
        self.ptr += 1;
    }

    fn eos_allowed(&self) -> bool {
        self.options.iter().any(|o| o.len() == self.ptr)
    }

    fn eos_forced(&self) -> bool {
        self.options.len() == 1 && self.options[0].len() == self.ptr
    }

    fn token_allowed(&self, t: TokenId) -> bool {
        if t == self.eos {
            return self.eos_allowed();
        }
        self.options
            .iter()
            .any(|o| self.ptr < o.len() && o[self.ptr] == t)
    }
}

/// Regular-expression constraint over the token stream: an anchored dense
/// DFA in byte-level mode, advanced over the byte string of every appended
/// token. A token is permissible when walking its bytes does not kill the
/// DFA. Construction precomputes all token byte strings, so callers defer
/// it to mid_process.
pub struct RegexConstraint {
    dfa: dense::DFA<Vec<u32>>,
    state: StateID,
    dead: bool,
    token_bytes: Vec<Vec<u8>>,
    eos: TokenId,
}

impl RegexConstraint {
    pub fn new(pattern: &str, host: &dyn HostEnv) -> Result<Self> {
        let dfa = dense::Builder::new()
            .configure(dense::Config::new().start_kind(StartKind::Anchored))
            .syntax(syntax::Config::new().unicode(false).utf8(false))
            .build(pattern)?;
        debug!("regex {:?}: dfa {} bytes", pattern, dfa.memory_usage());
        let state = dfa
            .universal_start_state(Anchored::Yes)
            .ok_or_else(|| anyhow!("regex {:?} has no universal start state", pattern))?;
        let token_bytes = (0..host.n_vocab() as TokenId)
            .map(|t| host.detokenize(&[t]))
            .collect();
        Ok(RegexConstraint {
            dfa,
            state,
            dead: false,
            token_bytes,
            eos: host.eos_token(),
        })
    }

    fn walk(&self, mut s: StateID, bytes: &[u8]) -> Option<StateID> {
        for b in bytes.iter() {
            s = self.dfa.next_state(s, *b);
            if self.dfa.is_dead_state(s) || self.dfa.is_quit_state(s) {
                return None;
            }
        }
        Some(s)
    }

    fn matches_here(&self) -> bool {
        !self.dead && self.dfa.is_match_state(self.dfa.next_eoi_state(self.state))
    }
}

impl Constraint for RegexConstraint {
    fn allow_tokens(&mut self, ts: &mut TokenSet) {
        if self.dead {
            return;
        }
        for t in 0..self.token_bytes.len() as TokenId {
            if t == self.eos {
                continue;
            }
            let bytes = &self.token_bytes[t as usize];
            if !bytes.is_empty() && self.walk(self.state, bytes).is_some() {
                ts.allow(t);
            }
        }
        if self.eos_allowed() {
            ts.allow(self.eos);
        }
    }

    fn append_token(&mut self, t: TokenId) {
        if self.dead || t == self.eos {
            return;
        }
        match self.walk(self.state, &self.token_bytes[t as usize]) {
            Some(s) => self.state = s,
            None => self.dead = true,
        }
    }

    fn eos_allowed(&self) -> bool {
        self.matches_here()
    }

    /// Conservative: true when the expression matches here and no byte can
    /// extend it at all. A live byte whose every continuation eventually
    /// dies is reported as not forced.
    fn eos_forced(&self) -> bool {
        self.matches_here()
            && (0..=255u8).all(|b| {
                let s = self.dfa.next_state(self.state, b);
                self.dfa.is_dead_state(s) || self.dfa.is_quit_state(s)
            })
    }

    fn token_allowed(&self, t: TokenId) -> bool {
        if self.dead {
            return false;
        }
        if t == self.eos {
            return self.eos_allowed();
        }
        let bytes = &self.token_bytes[t as usize];
        !bytes.is_empty() && self.walk(self.state, bytes).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aici_abi::SeqId;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    struct ByteHost;

    impl HostEnv for ByteHost {
        fn tokenize(&self, bytes: &[u8]) -> Vec<TokenId> {
            bytes.iter().map(|b| *b as TokenId).collect()
        }
        fn detokenize(&self, tokens: &[TokenId]) -> Vec<u8> {
            tokens.iter().map(|t| *t as u8).collect()
        }
        fn eos_token(&self) -> TokenId {
            0
        }
        fn n_vocab(&self) -> usize {
            256
        }
        fn self_seq_id(&self) -> SeqId {
            SeqId(1)
        }
        fn get_var(&self, _name: &str) -> Option<Vec<u8>> {
            None
        }
        fn set_var(&self, _name: &str, _value: &[u8]) {}
        fn append_var(&self, _name: &str, _value: &[u8]) {}
    }

    #[test]
    fn regex_walks_lowercase() {
        let mut c = RegexConstraint::new("[a-z]+", &ByteHost).unwrap();
        let mut ts = TokenSet::new(256);
        c.allow_tokens(&mut ts);
        assert_eq!(ts.num_set(), 26);
        assert!(ts.is_allowed(b'h' as TokenId));
        assert!(!ts.is_allowed(b'1' as TokenId));
        assert!(!c.eos_allowed());

        c.append_token(b'h' as TokenId);
        assert!(c.eos_allowed());
        assert!(!c.eos_forced());
        assert!(c.token_allowed(b'i' as TokenId));
        assert!(!c.token_allowed(b'.' as TokenId));
    }

    #[test]
    fn regex_literal_forces_eos_at_end() {
        let mut c = RegexConstraint::new("ab", &ByteHost).unwrap();
        let mut ts = TokenSet::new(256);
        c.allow_tokens(&mut ts);
        assert_eq!(ts.iter_set().collect::<Vec<_>>(), vec![b'a' as TokenId]);

        c.append_token(b'a' as TokenId);
        let mut ts = TokenSet::new(256);
        c.allow_tokens(&mut ts);
        assert_eq!(ts.iter_set().collect::<Vec<_>>(), vec![b'b' as TokenId]);

        c.append_token(b'b' as TokenId);
        assert!(c.eos_allowed());
        assert!(c.eos_forced());
        let mut ts = TokenSet::new(256);
        c.allow_tokens(&mut ts);
        assert_eq!(ts.iter_set().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn regex_off_track_token_kills_it() {
        let mut c = RegexConstraint::new("[a-z]+", &ByteHost).unwrap();
        c.append_token(b'7' as TokenId);
        assert!(!c.token_allowed(b'a' as TokenId));
        assert!(!c.eos_allowed());
        let mut ts = TokenSet::new(256);
        c.allow_tokens(&mut ts);
        assert_eq!(ts.num_set(), 0);
    }

    fn choose(options: &[&str]) -> ChooseConstraint {
        ChooseConstraint {
            options: options
                .iter()
                .map(|o| o.bytes().map(|b| b as TokenId).collect())
                .collect(),
            ptr: 0,
            eos: 0,
        }
    }

    fn allowed(c: &mut ChooseConstraint) -> Vec<TokenId> {
        let mut ts = TokenSet::new(256);
        c.allow_tokens(&mut ts);
        ts.iter_set().collect()
    }

    #[test]
    fn choose_yes_no() {
        let mut c = choose(&["yes", "no"]);
        assert_eq!(allowed(&mut c), vec![110, 121]);
        assert!(!c.eos_allowed());

        c.append_token(110); // 'n'
        assert_eq!(allowed(&mut c), vec![111]);
        assert!(!c.eos_forced());

        c.append_token(111); // 'o'
        assert_eq!(allowed(&mut c), vec![0]);
        assert!(c.eos_allowed());
        assert!(c.eos_forced());
    }

    #[test]
    fn choose_shared_prefix() {
        let mut c = choose(&["abc", "abd", "x"]);
        assert_eq!(allowed(&mut c), vec![97, 120]);
        c.append_token(97); // 'a'
        c.append_token(98); // 'b'
        assert_eq!(allowed(&mut c), vec![99, 100]);
        assert!(!c.eos_allowed());
        c.append_token(100); // 'd'
        assert!(c.eos_forced());
        assert!(c.token_allowed(0));
        assert!(!c.token_allowed(99));
    }

    #[test]
    fn choose_empty_option_allows_immediate_eos() {
        let mut c = choose(&["", "hi"]);
        assert!(c.eos_allowed());
        assert!(!c.eos_forced());
        assert_eq!(allowed(&mut c), vec![0, 104]);
    }

    proptest! {
        #[test]
        fn choose_tracks_prefixes(
            raw in proptest::collection::btree_set("[a-c]{1,4}", 1..6),
            target_idx in 0usize..6,
        ) {
            let opts: Vec<String> = raw.into_iter().collect();
            let target = opts[target_idx % opts.len()].clone();
            let mut c = choose(&opts.iter().map(|s| s.as_str()).collect::<Vec<_>>());

            for (i, b) in target.bytes().enumerate() {
                prop_assert!(c.token_allowed(b as TokenId));
                c.append_token(b as TokenId);
                let prefix = &target.as_bytes()[..i + 1];
                let surviving: BTreeSet<&String> = opts
                    .iter()
                    .filter(|o| o.as_bytes().starts_with(prefix))
                    .collect();
                prop_assert_eq!(c.options.len(), surviving.len());
                prop_assert_eq!(
                    c.eos_allowed(),
                    surviving.iter().any(|o| o.len() == i + 1)
                );
                prop_assert_eq!(
                    c.eos_forced(),
                    surviving.len() == 1 && surviving.iter().all(|o| o.len() == i + 1)
                );
            }
            prop_assert!(c.eos_allowed());
        }
    }
}
