// =============================================================================
// Quote Board — symbol → top-of-book cache
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::TopOfBook;

/// Latest top-of-book per subscribed symbol.
///
/// Single writer (the streaming dispatch loop), many readers. Readers always
/// receive a consistent full copy; a symbol is either absent or carries a
/// complete top-of-book.
pub struct QuoteBoard {
    books: RwLock<HashMap<String, TopOfBook>>,
}

impl QuoteBoard {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the top-of-book for `symbol`.
    pub fn update(&self, symbol: &str, book: TopOfBook) {
        self.books.write().insert(symbol.to_string(), book);
    }

    /// Atomic copy of the whole board.
    pub fn snapshot(&self) -> HashMap<String, TopOfBook> {
        self.books.read().clone()
    }

    /// Evict every symbol not in `subscribed`. Called on resubscription so the
    /// published books stay a subset of the current subscription.
    pub fn retain_subscribed(&self, subscribed: &[String]) {
        self.books
            .write()
            .retain(|sym, _| subscribed.iter().any(|s| s == sym));
    }

}

impl Default for QuoteBoard {
    fn default() -> Self {
        Self::new()
    }
}
