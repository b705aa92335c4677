use crate::providers::ChatMessage;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Bounded, ordered turn window for one conversation. Oldest turns are
/// evicted first once the window is full.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    max_turns: usize,
    turns: VecDeque<ChatMessage>,
}

impl ConversationContext {
    pub fn new(max_turns: usize) -> Self {
        let max_turns = max_turns.max(1);
        Self {
            max_turns,
            turns: VecDeque::with_capacity(max_turns),
        }
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn append(&mut self, turn: ChatMessage) {
        self.turns.push_back(turn);
        while self.turns.len() > self.max_turns {
            self.turns.pop_front();
        }
    }

    /// Owned copy of the window, oldest first.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.turns.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

struct TrackedContext {
    context: ConversationContext,
    last_touched: u64,
}

#[derive(Default)]
struct StoreInner {
    contexts: HashMap<String, TrackedContext>,
    clock: u64,
}

impl StoreInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_least_recent(&mut self) {
        let oldest = self
            .contexts
            .iter()
            .min_by_key(|(_, tracked)| tracked.last_touched)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            self.contexts.remove(&id);
            tracing::debug!(conversation = %id, "Evicted least recently used conversation");
        }
    }
}

/// Per-conversation contexts keyed by channel or DM id.
///
/// Contexts are created lazily. At most `max_conversations` are kept; a new
/// conversation beyond that evicts the least recently touched one.
pub struct ConversationStore {
    window: usize,
    max_conversations: usize,
    system_prompt: Option<String>,
    inner: Mutex<StoreInner>,
}

impl ConversationStore {
    pub fn new(window: usize, max_conversations: usize) -> Self {
        Self {
            window: window.max(1),
            max_conversations: max_conversations.max(1),
            system_prompt: None,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Prepend `prompt` to every provider request built by [`Self::snapshot_with`].
    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn window(&self) -> usize {
        self.window
    }

    fn with_context<R>(&self, id: &str, f: impl FnOnce(&mut ConversationContext) -> R) -> R {
        let mut inner = self.inner.lock();
        let now = inner.tick();

        if !inner.contexts.contains_key(id) && inner.contexts.len() >= self.max_conversations {
            inner.evict_least_recent();
        }

        let tracked = inner
            .contexts
            .entry(id.to_string())
            .or_insert_with(|| TrackedContext {
                context: ConversationContext::new(self.window),
                last_touched: now,
            });
        tracked.last_touched = now;
        f(&mut tracked.context)
    }

    pub fn append(&self, id: &str, turn: ChatMessage) {
        self.with_context(id, |ctx| ctx.append(turn));
    }

    /// Append `turn` and return the provider request: the optional system
    /// prompt followed by the updated window. The system prompt is never stored.
    pub fn snapshot_with(&self, id: &str, turn: ChatMessage) -> Vec<ChatMessage> {
        let window = self.with_context(id, |ctx| {
            ctx.append(turn);
            ctx.snapshot()
        });

        match &self.system_prompt {
            Some(prompt) => {
                let mut request = Vec::with_capacity(window.len() + 1);
                request.push(ChatMessage::system(prompt.clone()));
                request.extend(window);
                request
            }
            None => window,
        }
    }

    /// Stored window for `id`; empty if the conversation is unknown.
    pub fn snapshot(&self, id: &str) -> Vec<ChatMessage> {
        self.inner
            .lock()
            .contexts
            .get(id)
            .map(|tracked| tracked.context.snapshot())
            .unwrap_or_default()
    }

    pub fn clear(&self, id: &str) {
        self.inner.lock().contexts.remove(id);
    }

    /// Number of tracked conversations.
    pub fn len(&self) -> usize {
        self.inner.lock().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(i: usize) -> ChatMessage {
        if i % 2 == 0 {
            ChatMessage::user(format!("u{i}"))
        } else {
            ChatMessage::assistant(format!("a{i}"))
        }
    }

    #[test]
    fn window_keeps_last_n_in_order() {
        let mut ctx = ConversationContext::new(4);
        for i in 0..6 {
            ctx.append(turn(i));
        }
        let contents: Vec<String> = ctx.snapshot().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["u2", "a3", "u4", "a5"]);
    }

    #[test]
    fn window_never_exceeds_bound() {
        let mut ctx = ConversationContext::new(3);
        for i in 0..50 {
            ctx.append(turn(i));
            assert!(ctx.len() <= 3);
        }
    }

    #[test]
    fn zero_window_is_clamped_to_one() {
        let mut ctx = ConversationContext::new(0);
        ctx.append(turn(0));
        ctx.append(turn(1));
        assert_eq!(ctx.max_turns(), 1);
        assert_eq!(ctx.snapshot(), vec![turn(1)]);
    }

    #[test]
    fn snapshot_is_an_independent_copy() {
        let mut ctx = ConversationContext::new(4);
        ctx.append(turn(0));
        let snap = ctx.snapshot();
        ctx.append(turn(1));
        assert_eq!(snap.len(), 1);
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn clear_empties_window() {
        let mut ctx = ConversationContext::new(4);
        ctx.append(turn(0));
        ctx.clear();
        assert!(ctx.is_empty());
    }

    #[test]
    fn store_isolates_conversations() {
        let store = ConversationStore::new(8, 10);
        store.append("c1", ChatMessage::user("hello from c1"));
        store.append("c2", ChatMessage::user("hello from c2"));

        assert_eq!(store.snapshot("c1").len(), 1);
        assert_eq!(store.snapshot("c2")[0].content, "hello from c2");
        assert!(store.snapshot("unknown").is_empty());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn snapshot_with_appends_then_snapshots() {
        let store = ConversationStore::new(4, 10);
        store.append("c1", ChatMessage::user("q1"));
        store.append("c1", ChatMessage::assistant("a1"));

        let request = store.snapshot_with("c1", ChatMessage::user("q2"));
        let contents: Vec<&str> = request.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q1", "a1", "q2"]);
    }

    #[test]
    fn system_prompt_is_prepended_but_not_stored() {
        let store = ConversationStore::new(2, 10).with_system_prompt(Some("Be brief".into()));
        store.append("c1", ChatMessage::user("q1"));
        store.append("c1", ChatMessage::assistant("a1"));

        let request = store.snapshot_with("c1", ChatMessage::user("q2"));
        assert_eq!(request[0], ChatMessage::system("Be brief"));
        assert_eq!(request.len(), 3);
        assert_eq!(store.snapshot("c1").len(), 2);
    }

    #[test]
    fn blank_system_prompt_is_ignored() {
        let store = ConversationStore::new(2, 10).with_system_prompt(Some("   ".into()));
        let request = store.snapshot_with("c1", ChatMessage::user("q"));
        assert_eq!(request.len(), 1);
    }

    #[test]
    fn least_recently_used_conversation_is_evicted() {
        let store = ConversationStore::new(4, 2);
        store.append("old", ChatMessage::user("1"));
        store.append("recent", ChatMessage::user("2"));
        // Touch "old" so "recent" becomes the eviction candidate.
        store.append("old", ChatMessage::user("3"));
        store.append("new", ChatMessage::user("4"));

        assert_eq!(store.len(), 2);
        assert!(store.snapshot("recent").is_empty());
        assert_eq!(store.snapshot("old").len(), 2);
        assert_eq!(store.snapshot("new").len(), 1);
    }

    #[test]
    fn clear_forgets_conversation() {
        let store = ConversationStore::new(4, 10);
        store.append("c1", ChatMessage::user("hi"));
        store.clear("c1");
        assert!(store.snapshot("c1").is_empty());
        assert!(store.is_empty());
    }
}
