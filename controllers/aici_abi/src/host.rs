use crate::{SeqId, TokenId};

/// Services the host runtime provides to a controller. The tokenizer pair
/// is treated as pure functions; the variable store is a shared key/value
/// map owned by the host and may legitimately miss a key on read.
pub trait HostEnv {
    fn tokenize(&self, bytes: &[u8]) -> Vec<TokenId>;
    fn detokenize(&self, tokens: &[TokenId]) -> Vec<u8>;

    fn eos_token(&self) -> TokenId;
    fn n_vocab(&self) -> usize;

    /// Id of the current sequence; after a fork, each sibling sees its own.
    fn self_seq_id(&self) -> SeqId;

    fn get_var(&self, name: &str) -> Option<Vec<u8>>;
    fn set_var(&self, name: &str, value: &[u8]);
    fn append_var(&self, name: &str, value: &[u8]);

    fn tokenize_str(&self, text: &str) -> Vec<TokenId> {
        self.tokenize(text.as_bytes())
    }

    /// Lossy decode; invalid byte sequences come back as U+FFFD.
    fn detokenize_str(&self, tokens: &[TokenId]) -> String {
        String::from_utf8_lossy(&self.detokenize(tokens)).into_owned()
    }
}
